//! The LLM router.
//!
//! Every LLM call in the process comes through [`LlmRouter::route`]; the
//! selection rule is binary and content-based. `confidential = true`
//! binds the local backend, `confidential = false` binds the cloud
//! backend, and there is no third path. Fail-safety is asymmetric: a
//! public call may quietly fall back to the local backend when the cloud
//! is down, but a confidential call never falls the other way.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::backend::LlmBackend;
use super::{ChatMessage, Completion, GenerateRequest, Generation};
use crate::cache::CacheHandle;
use crate::classify::ConfidentialityDecision;
use crate::config::EngineConfig;
use crate::core::BackendId;
use crate::error::{Error, Result};
use crate::telemetry::Telemetry;

/// Backoff before the single public-cloud timeout retry.
const TIMEOUT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Per-call deadlines copied out of the engine configuration.
#[derive(Debug, Clone, Copy)]
struct Deadlines {
    cloud: Duration,
    cloud_stream: Duration,
    local: Duration,
}

/// Routes generation calls to the correct backend.
pub struct LlmRouter {
    local: Arc<dyn LlmBackend>,
    cloud: Arc<dyn LlmBackend>,
    telemetry: Arc<Telemetry>,
    deadlines: Deadlines,
}

impl LlmRouter {
    /// Creates a router over the two backends.
    pub fn new(
        local: Arc<dyn LlmBackend>,
        cloud: Arc<dyn LlmBackend>,
        telemetry: Arc<Telemetry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            local,
            cloud,
            telemetry,
            deadlines: Deadlines {
                cloud: config.cloud_timeout,
                cloud_stream: config.cloud_stream_timeout,
                local: config.local_timeout,
            },
        }
    }

    /// Hands the caller a client bound to the correct backend.
    ///
    /// A cache handle on a confidential decision is dropped: the local
    /// backend has no cache, and the structural safety argument depends
    /// on confidential prompts never flowing through cache plumbing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfidentialBackendUnavailable`] when the local
    /// backend fails its health probe while the decision is confidential.
    /// An unhealthy cloud backend on a public decision is not an error.
    pub async fn route(
        &self,
        decision: &ConfidentialityDecision,
        streaming: bool,
        cache_handle: Option<CacheHandle>,
    ) -> Result<RoutedClient> {
        let backend = if decision.confidential {
            if !self.local.healthy().await {
                return Err(Error::ConfidentialBackendUnavailable {
                    message: "local backend failed its health probe".to_string(),
                });
            }
            Arc::clone(&self.local)
        } else if self.cloud.healthy().await {
            Arc::clone(&self.cloud)
        } else {
            // Quiet degradation: the caller gets a working client and no
            // signal that would tempt a retry with different routing.
            self.telemetry.record_cloud_fallback();
            tracing::warn!("cloud backend unhealthy, serving public call locally");
            Arc::clone(&self.local)
        };

        self.telemetry.record_route(decision.reason, backend.id());
        tracing::debug!(
            reason = %decision.reason,
            backend = %backend.id(),
            streaming,
            "routed generation call"
        );

        let cache_handle = if decision.confidential {
            if cache_handle.is_some() {
                tracing::debug!("dropping cache handle on confidential route");
            }
            None
        } else {
            cache_handle
        };

        let deadline = match (backend.id(), streaming) {
            (BackendId::Local, _) => self.deadlines.local,
            (BackendId::Cloud, false) => self.deadlines.cloud,
            (BackendId::Cloud, true) => self.deadlines.cloud_stream,
        };

        Ok(RoutedClient {
            retry_on_timeout: !decision.confidential && backend.id() == BackendId::Cloud,
            confidential: decision.confidential,
            backend,
            streaming,
            cache_handle,
            deadline,
            telemetry: Arc::clone(&self.telemetry),
        })
    }
}

impl std::fmt::Debug for LlmRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmRouter")
            .field("deadlines", &self.deadlines)
            .finish_non_exhaustive()
    }
}

/// Call options a stage may set per generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Maximum tokens for this call.
    pub max_tokens: Option<u32>,
    /// Request JSON-formatted output.
    pub json_mode: bool,
}

/// A client bound to one backend for one decision.
pub struct RoutedClient {
    backend: Arc<dyn LlmBackend>,
    confidential: bool,
    streaming: bool,
    cache_handle: Option<CacheHandle>,
    deadline: Duration,
    retry_on_timeout: bool,
    telemetry: Arc<Telemetry>,
}

impl RoutedClient {
    /// The bound backend.
    #[must_use]
    pub fn backend_id(&self) -> BackendId {
        self.backend.id()
    }

    /// Whether this client streams.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Executes one generation through the bound backend.
    ///
    /// Applies the per-call deadline; a timed-out public cloud call is
    /// retried once after a short backoff, any other timeout propagates
    /// as [`Error::BackendTimeout`]. A transport failure on the local
    /// backend under a confidential decision surfaces as
    /// [`Error::ConfidentialBackendUnavailable`] — never as a hint to
    /// reroute.
    ///
    /// # Errors
    ///
    /// See above; provider errors are wrapped, never re-thrown raw.
    pub async fn generate(
        &self,
        messages: Vec<ChatMessage>,
        options: CallOptions,
    ) -> Result<Generation> {
        let request = GenerateRequest {
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            json_mode: options.json_mode,
            cache_handle: self.cache_handle.clone(),
        };

        if self.streaming {
            let stream = match timeout(self.deadline, self.backend.generate_stream(&request)).await
            {
                Ok(result) => result.map_err(|e| self.wrap_backend_error(e))?,
                Err(_) => return Err(self.timeout_error()),
            };
            return Ok(Generation::Stream(stream));
        }

        let completion = self.generate_completion(&request).await?;
        Ok(Generation::Completed(completion))
    }

    async fn generate_completion(&self, request: &GenerateRequest) -> Result<Completion> {
        let mut attempted_retry = false;
        loop {
            match timeout(self.deadline, self.backend.generate(request)).await {
                Ok(Ok(completion)) => return Ok(completion),
                Ok(Err(e)) => return Err(self.wrap_backend_error(e)),
                Err(_) => {
                    self.telemetry.record_backend_timeout();
                    if self.retry_on_timeout && !attempted_retry {
                        attempted_retry = true;
                        tracing::warn!(
                            backend = %self.backend.id(),
                            "backend call timed out, retrying once"
                        );
                        tokio::time::sleep(TIMEOUT_RETRY_BACKOFF).await;
                        continue;
                    }
                    return Err(self.timeout_error());
                }
            }
        }
    }

    fn timeout_error(&self) -> Error {
        Error::BackendTimeout {
            backend: self.backend.id(),
            elapsed: self.deadline,
        }
    }

    fn wrap_backend_error(&self, error: Error) -> Error {
        match error {
            Error::Backend { message, .. }
                if self.confidential && self.backend.id() == BackendId::Local =>
            {
                Error::ConfidentialBackendUnavailable { message }
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for RoutedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedClient")
            .field("backend", &self.backend.id())
            .field("streaming", &self.streaming)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::classify::DecisionReason;
    use crate::llm::backend::BackendStream;
    use crate::llm::{StreamEvent, Usage, user_message};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct MockBackend {
        id: BackendId,
        healthy: AtomicBool,
        calls: AtomicUsize,
        hang: bool,
        fail: bool,
    }

    impl MockBackend {
        fn up(id: BackendId) -> Self {
            Self {
                id,
                healthy: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                hang: false,
                fail: false,
            }
        }

        fn down(id: BackendId) -> Self {
            let mock = Self::up(id);
            mock.healthy.store(false, Ordering::SeqCst);
            mock
        }
    }

    #[async_trait]
    impl LlmBackend for MockBackend {
        fn id(&self) -> BackendId {
            self.id
        }

        async fn healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        async fn generate(&self, request: &GenerateRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail {
                return Err(Error::Backend {
                    message: "connection refused".to_string(),
                    status: None,
                });
            }
            Ok(Completion {
                text: format!("echo: {}", request.messages.len()),
                usage: Usage::default(),
                cache_hit: request.cache_handle.is_some(),
                llm_used: self.id,
            })
        }

        async fn generate_stream(&self, _request: &GenerateRequest) -> Result<BackendStream> {
            let id = self.id;
            let events = vec![
                Ok(StreamEvent::Delta("hi".to_string())),
                Ok(StreamEvent::Done(Completion {
                    text: "hi".to_string(),
                    usage: Usage::default(),
                    cache_hit: false,
                    llm_used: id,
                })),
            ];
            Ok(Box::pin(futures_util::stream::iter(events)))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::builder()
            .cloud_backend_key("test")
            .cloud_timeout(Duration::from_millis(50))
            .local_timeout(Duration::from_millis(50))
            .build()
            .unwrap_or_else(|_| unreachable!())
    }

    fn router(local: MockBackend, cloud: MockBackend) -> LlmRouter {
        LlmRouter::new(
            Arc::new(local),
            Arc::new(cloud),
            Arc::new(Telemetry::new()),
            &config(),
        )
    }

    const fn confidential(reason: DecisionReason) -> ConfidentialityDecision {
        ConfidentialityDecision {
            confidential: true,
            reason,
        }
    }

    #[tokio::test]
    async fn test_confidential_routes_local() {
        let router = router(
            MockBackend::up(BackendId::Local),
            MockBackend::up(BackendId::Cloud),
        );
        let client = router
            .route(
                &confidential(DecisionReason::ChunkFromConfidentialBucket),
                false,
                None,
            )
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(client.backend_id(), BackendId::Local);
    }

    #[tokio::test]
    async fn test_public_routes_cloud() {
        let router = router(
            MockBackend::up(BackendId::Local),
            MockBackend::up(BackendId::Cloud),
        );
        let client = router
            .route(&ConfidentialityDecision::public(), false, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(client.backend_id(), BackendId::Cloud);
    }

    #[tokio::test]
    async fn test_public_falls_back_local_when_cloud_down() {
        let router = router(
            MockBackend::up(BackendId::Local),
            MockBackend::down(BackendId::Cloud),
        );
        let client = router
            .route(&ConfidentialityDecision::public(), false, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(client.backend_id(), BackendId::Local);
    }

    #[tokio::test]
    async fn test_confidential_never_falls_back_to_cloud() {
        let router = router(
            MockBackend::down(BackendId::Local),
            MockBackend::up(BackendId::Cloud),
        );
        let err = router
            .route(&confidential(DecisionReason::QueryPii), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfidentialBackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cache_handle_dropped_on_confidential_route() {
        let telemetry = Arc::new(Telemetry::new());
        let cache =
            crate::cache::ContextCacheManager::new(4, Arc::clone(&telemetry));
        let handle = cache
            .get_or_create("public prefix", crate::core::Bucket::Public, Duration::from_secs(60))
            .await
            .unwrap_or_else(|_| unreachable!());
        let router = router(
            MockBackend::up(BackendId::Local),
            MockBackend::up(BackendId::Cloud),
        );
        let client = router
            .route(
                &confidential(DecisionReason::QueryPii),
                false,
                Some(handle),
            )
            .await
            .unwrap_or_else(|_| unreachable!());
        let generation = client
            .generate(vec![user_message("q")], CallOptions::default())
            .await
            .unwrap_or_else(|_| unreachable!());
        match generation {
            Generation::Completed(c) => assert!(!c.cache_hit),
            Generation::Stream(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_route_counters_keyed_by_reason_and_backend() {
        let telemetry = Arc::new(Telemetry::new());
        let router = LlmRouter::new(
            Arc::new(MockBackend::up(BackendId::Local)),
            Arc::new(MockBackend::up(BackendId::Cloud)),
            Arc::clone(&telemetry),
            &config(),
        );
        let _ = router
            .route(&confidential(DecisionReason::QueryPii), false, None)
            .await;
        let _ = router.route(&ConfidentialityDecision::public(), false, None).await;
        assert_eq!(
            telemetry.route_count(DecisionReason::QueryPii, BackendId::Local),
            1
        );
        assert_eq!(
            telemetry.route_count(DecisionReason::NoSignal, BackendId::Cloud),
            1
        );
        assert_eq!(telemetry.pii_triggered_local_routing(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_cloud_timeout_retries_once() {
        let cloud = MockBackend {
            id: BackendId::Cloud,
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            hang: true,
            fail: false,
        };
        let router = LlmRouter::new(
            Arc::new(MockBackend::up(BackendId::Local)),
            Arc::new(cloud),
            Arc::new(Telemetry::new()),
            &config(),
        );
        let client = router
            .route(&ConfidentialityDecision::public(), false, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        let err = client
            .generate(vec![user_message("q")], CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confidential_timeout_does_not_retry() {
        let local = MockBackend {
            id: BackendId::Local,
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            hang: true,
            fail: false,
        };
        let local = Arc::new(local);
        let router = LlmRouter::new(
            Arc::clone(&local) as Arc<dyn LlmBackend>,
            Arc::new(MockBackend::up(BackendId::Cloud)),
            Arc::new(Telemetry::new()),
            &config(),
        );
        let client = router
            .route(&confidential(DecisionReason::QueryPii), false, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        let err = client
            .generate(vec![user_message("q")], CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendTimeout { .. }));
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_transport_failure_wraps_confidential_unavailable() {
        let local = MockBackend {
            id: BackendId::Local,
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            hang: false,
            fail: true,
        };
        let router = LlmRouter::new(
            Arc::new(local),
            Arc::new(MockBackend::up(BackendId::Cloud)),
            Arc::new(Telemetry::new()),
            &config(),
        );
        let client = router
            .route(&confidential(DecisionReason::QueryPii), false, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        let err = client
            .generate(vec![user_message("q")], CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfidentialBackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_streaming_client_returns_stream() {
        let router = router(
            MockBackend::up(BackendId::Local),
            MockBackend::up(BackendId::Cloud),
        );
        let client = router
            .route(&ConfidentialityDecision::public(), true, None)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(client.is_streaming());
        let generation = client
            .generate(vec![user_message("q")], CallOptions::default())
            .await
            .unwrap_or_else(|_| unreachable!());
        assert!(matches!(generation, Generation::Stream(_)));
    }
}
