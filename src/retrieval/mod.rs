//! Retrieval service contract consumed by the core.
//!
//! The retrieval internals (vector similarity, lexical scoring, index
//! layout) live outside the core; this module pins down the contract the
//! core depends on: role-filtered visibility, total deterministic
//! ordering, and transport-retry semantics. [`memory::MemoryRetriever`]
//! is the executable reference for that contract, used by the test suite.

pub mod memory;
pub mod merge;
pub mod visibility;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{Bucket, Chunk, Principal, RunId};
use crate::error::{Error, Result};

pub use memory::MemoryRetriever;
pub use merge::{combine_score, merge_results};
pub use visibility::visible_buckets;

/// A retrieval query on behalf of a principal.
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    /// Query text.
    pub query_text: String,
    /// Principal whose visibility set filters the result.
    pub principal: Principal,
    /// Maximum number of chunks to return.
    pub limit: usize,
    /// Restrict results to one bucket (within the visibility set).
    pub require_bucket: Option<Bucket>,
}

/// One ranked element of a retrieval result.
///
/// Chunks are shared, read-only references; no component mutates them.
/// The bucket is core-internal: neither this type nor [`RetrievalResult`]
/// serializes toward callers, so the label cannot leak through a response
/// field.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    /// The retrieved chunk.
    pub chunk: Arc<Chunk>,
    /// Combined relevance score.
    pub score: f64,
    /// Parent document id.
    pub document_id: String,
    /// Bucket of the parent document.
    pub bucket: Bucket,
}

/// The ordered, role-filtered list of chunks for one query.
///
/// Invariants: descending score order, no duplicate chunk ids, every
/// element visible to the requesting principal.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    chunks: Vec<ScoredChunk>,
}

impl RetrievalResult {
    /// Wraps an already ordered, deduplicated chunk list.
    #[must_use]
    pub fn new(chunks: Vec<ScoredChunk>) -> Self {
        Self { chunks }
    }

    /// Ranked chunks, best first.
    #[must_use]
    pub fn chunks(&self) -> &[ScoredChunk] {
        &self.chunks
    }

    /// Number of chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the result is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Whether any element came from a confidential document.
    #[must_use]
    pub fn has_confidential(&self) -> bool {
        self.chunks
            .iter()
            .any(|c| c.bucket == Bucket::Confidential)
    }

    /// Deduplicated ids of the confidential documents represented here,
    /// in rank order.
    #[must_use]
    pub fn confidential_document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for chunk in &self.chunks {
            if chunk.bucket == Bucket::Confidential && !ids.contains(&chunk.document_id) {
                ids.push(chunk.document_id.clone());
            }
        }
        ids
    }
}

/// The retrieval service as the core consumes it.
///
/// Implementations must return results already filtered to the
/// principal's visibility set (§ visibility) in a total, deterministic
/// descending-score order, and must not distinguish "absent" from
/// "hidden" in any observable way.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Executes a search.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RetrievalUnavailable`] on transport failure.
    async fn search(&self, request: &RetrievalRequest) -> Result<RetrievalResult>;
}

/// Number of retries after the initial attempt for transport failures.
const RETRIEVAL_RETRIES: u32 = 2;
/// Base backoff before the first retry.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Calls the retriever, retrying transport failures twice with jittered
/// exponential backoff before giving up.
///
/// Jitter derives from the correlation id and attempt number, so retry
/// timing is reproducible under test.
///
/// # Errors
///
/// Returns the final [`Error::RetrievalUnavailable`] when all attempts
/// fail; any other error propagates immediately.
pub async fn search_with_retry(
    retriever: &dyn Retriever,
    request: &RetrievalRequest,
    correlation: RunId,
) -> Result<RetrievalResult> {
    let mut attempt: u32 = 0;
    loop {
        match retriever.search(request).await {
            Ok(result) => return Ok(result),
            Err(Error::RetrievalUnavailable { message }) if attempt < RETRIEVAL_RETRIES => {
                let backoff = RETRY_BASE * 2u32.pow(attempt) + jitter(correlation, attempt);
                tracing::warn!(
                    run_id = %correlation,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %message,
                    "retrieval transport failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Deterministic jitter in 0..50 ms from the correlation id and attempt.
fn jitter(correlation: RunId, attempt: u32) -> Duration {
    let bytes = correlation.0.as_bytes();
    let seed = u64::from(bytes[0]) ^ (u64::from(bytes[15]) << 8) ^ u64::from(attempt);
    Duration::from_millis(seed % 50)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::Role;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk(id: &str, doc: &str, bucket: Bucket, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk: Arc::new(Chunk {
                id: id.to_string(),
                document_id: doc.to_string(),
                text: format!("text of {id}"),
                ordinal: 0,
                embedding: Vec::new(),
            }),
            score,
            document_id: doc.to_string(),
            bucket,
        }
    }

    #[test]
    fn test_has_confidential() {
        let result = RetrievalResult::new(vec![
            chunk("c1", "d1", Bucket::Public, 0.9),
            chunk("c2", "d2", Bucket::Confidential, 0.5),
        ]);
        assert!(result.has_confidential());
        assert_eq!(result.confidential_document_ids(), vec!["d2"]);
    }

    #[test]
    fn test_confidential_document_ids_dedup() {
        let result = RetrievalResult::new(vec![
            chunk("c1", "d2", Bucket::Confidential, 0.9),
            chunk("c2", "d2", Bucket::Confidential, 0.8),
            chunk("c3", "d1", Bucket::Public, 0.7),
        ]);
        assert_eq!(result.confidential_document_ids(), vec!["d2"]);
    }

    struct FlakyRetriever {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Retriever for FlakyRetriever {
        async fn search(&self, _request: &RetrievalRequest) -> Result<RetrievalResult> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(Error::RetrievalUnavailable {
                    message: "connection reset".to_string(),
                })
            } else {
                Ok(RetrievalResult::default())
            }
        }
    }

    fn request() -> RetrievalRequest {
        RetrievalRequest {
            query_text: "q".to_string(),
            principal: Principal::new("p", Role::User),
            limit: 10,
            require_bucket: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_within_budget() {
        let retriever = FlakyRetriever {
            failures: AtomicUsize::new(2),
        };
        let result = search_with_retry(&retriever, &request(), RunId::generate()).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_two_retries() {
        let retriever = FlakyRetriever {
            failures: AtomicUsize::new(10),
        };
        let err = search_with_retry(&retriever, &request(), RunId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetrievalUnavailable { .. }));
        // Initial attempt + 2 retries = 3 calls consumed.
        assert_eq!(retriever.failures.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_jitter_is_deterministic_and_bounded() {
        let id = RunId::generate();
        assert_eq!(jitter(id, 1), jitter(id, 1));
        assert!(jitter(id, 0) < Duration::from_millis(50));
    }
}
