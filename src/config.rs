//! Engine configuration with builder pattern and environment variable support.
//!
//! Configuration is resolved in order: explicit values → environment
//! variables → defaults. The configuration snapshot is immutable after
//! `build()`; live reload is out of scope.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default TTL upper bound for context cache entries.
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
/// Default cap on completion length.
const DEFAULT_MAX_TOKENS_PER_CALL: u32 = 4096;
/// Default orchestrator parallelism.
const DEFAULT_MAX_CONCURRENT_RUNS: usize = 8;
/// Default clarifier re-entry limit.
const DEFAULT_CLARIFY_MAX_ROUNDS: usize = 3;
/// Default synthesis map group size.
const DEFAULT_MAP_GROUP_SIZE: usize = 10;
/// Default hybrid-search semantic weight.
const DEFAULT_RETRIEVAL_WEIGHT_SEMANTIC: f64 = 0.7;
/// Default cap on chunks carried through a run after dedup.
const DEFAULT_MAX_CHUNKS_PER_RUN: usize = 50;
/// Default per-sub-question retrieval depth.
const DEFAULT_RETRIEVAL_LIMIT: usize = 20;
/// Default cloud non-streaming deadline.
const DEFAULT_CLOUD_TIMEOUT_SECS: u64 = 60;
/// Default cloud streaming deadline.
const DEFAULT_CLOUD_STREAM_TIMEOUT_SECS: u64 = 300;
/// Default local deadline.
const DEFAULT_LOCAL_TIMEOUT_SECS: u64 = 600;
/// Default context cache capacity before LRU pressure eviction.
const DEFAULT_CACHE_MAX_ENTRIES: usize = 256;
/// Default local backend URL (loopback, OpenAI-compatible).
const DEFAULT_LOCAL_BACKEND_URL: &str = "http://127.0.0.1:8080/v1";
/// Default local model identifier.
const DEFAULT_LOCAL_MODEL_ID: &str = "llama-3.1-8b-instruct";
/// Default cloud model identifier.
const DEFAULT_CLOUD_MODEL_ID: &str = "gpt-5.2-2025-12-11";

/// Configuration for the routing and synthesis engine.
#[derive(Clone)]
pub struct EngineConfig {
    /// Where to reach the local LLM (OpenAI-compatible, loopback or
    /// private network).
    pub local_backend_url: String,
    /// Model name served by the local backend.
    pub local_model_id: String,
    /// Credential for the cloud LLM.
    pub cloud_backend_key: String,
    /// Model name on the cloud side.
    pub cloud_model_id: String,
    /// Upper bound on context cache entry life.
    pub cache_ttl: Duration,
    /// Context cache capacity before LRU eviction kicks in.
    pub cache_max_entries: usize,
    /// Cap on completion length per call.
    pub max_tokens_per_call: u32,
    /// Orchestrator parallelism (process-wide run semaphore size).
    pub max_concurrent_runs: usize,
    /// Clarifier re-entry limit.
    pub clarify_max_rounds: usize,
    /// Synthesis map group size.
    pub map_group_size: usize,
    /// Hybrid-search semantic weight (lexical gets the complement).
    pub retrieval_weight_semantic: f64,
    /// Cap on chunks carried through a run after dedup.
    pub max_chunks_per_run: usize,
    /// Per-sub-question retrieval depth.
    pub retrieval_limit: usize,
    /// Cloud non-streaming call deadline.
    pub cloud_timeout: Duration,
    /// Cloud streaming call deadline.
    pub cloud_stream_timeout: Duration,
    /// Local call deadline.
    pub local_timeout: Duration,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("local_backend_url", &self.local_backend_url)
            .field("local_model_id", &self.local_model_id)
            .field("cloud_backend_key", &"<redacted>")
            .field("cloud_model_id", &self.cloud_model_id)
            .field("cache_ttl", &self.cache_ttl)
            .field("max_tokens_per_call", &self.max_tokens_per_call)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("clarify_max_rounds", &self.clarify_max_rounds)
            .field("map_group_size", &self.map_group_size)
            .field("retrieval_weight_semantic", &self.retrieval_weight_semantic)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Creates configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `CLOUD_BACKEND_KEY` is absent.
    pub fn from_env() -> Result<Self> {
        Self::builder().from_env().build()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    local_backend_url: Option<String>,
    local_model_id: Option<String>,
    cloud_backend_key: Option<String>,
    cloud_model_id: Option<String>,
    cache_ttl: Option<Duration>,
    cache_max_entries: Option<usize>,
    max_tokens_per_call: Option<u32>,
    max_concurrent_runs: Option<usize>,
    clarify_max_rounds: Option<usize>,
    map_group_size: Option<usize>,
    retrieval_weight_semantic: Option<f64>,
    max_chunks_per_run: Option<usize>,
    retrieval_limit: Option<usize>,
    cloud_timeout: Option<Duration>,
    cloud_stream_timeout: Option<Duration>,
    local_timeout: Option<Duration>,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl EngineConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.local_backend_url.is_none() {
            self.local_backend_url = std::env::var("LOCAL_BACKEND_URL").ok();
        }
        if self.local_model_id.is_none() {
            self.local_model_id = std::env::var("LOCAL_MODEL_ID").ok();
        }
        if self.cloud_backend_key.is_none() {
            self.cloud_backend_key = std::env::var("CLOUD_BACKEND_KEY").ok();
        }
        if self.cloud_model_id.is_none() {
            self.cloud_model_id = std::env::var("CLOUD_MODEL_ID").ok();
        }
        if self.cache_ttl.is_none() {
            self.cache_ttl = env_parse::<u64>("CACHE_TTL_SECONDS").map(Duration::from_secs);
        }
        if self.max_tokens_per_call.is_none() {
            self.max_tokens_per_call = env_parse("MAX_TOKENS_PER_CALL");
        }
        if self.max_concurrent_runs.is_none() {
            self.max_concurrent_runs = env_parse("MAX_CONCURRENT_RUNS");
        }
        if self.clarify_max_rounds.is_none() {
            self.clarify_max_rounds = env_parse("CLARIFY_MAX_ROUNDS");
        }
        if self.map_group_size.is_none() {
            self.map_group_size = env_parse("MAP_GROUP_SIZE");
        }
        if self.retrieval_weight_semantic.is_none() {
            self.retrieval_weight_semantic = env_parse("RETRIEVAL_WEIGHT_SEMANTIC");
        }
        self
    }

    /// Sets the local backend URL.
    #[must_use]
    pub fn local_backend_url(mut self, url: impl Into<String>) -> Self {
        self.local_backend_url = Some(url.into());
        self
    }

    /// Sets the local model identifier.
    #[must_use]
    pub fn local_model_id(mut self, model: impl Into<String>) -> Self {
        self.local_model_id = Some(model.into());
        self
    }

    /// Sets the cloud credential.
    #[must_use]
    pub fn cloud_backend_key(mut self, key: impl Into<String>) -> Self {
        self.cloud_backend_key = Some(key.into());
        self
    }

    /// Sets the cloud model identifier.
    #[must_use]
    pub fn cloud_model_id(mut self, model: impl Into<String>) -> Self {
        self.cloud_model_id = Some(model.into());
        self
    }

    /// Sets the cache TTL upper bound.
    #[must_use]
    pub const fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Sets the cache entry capacity.
    #[must_use]
    pub const fn cache_max_entries(mut self, n: usize) -> Self {
        self.cache_max_entries = Some(n);
        self
    }

    /// Sets the completion-length cap.
    #[must_use]
    pub const fn max_tokens_per_call(mut self, n: u32) -> Self {
        self.max_tokens_per_call = Some(n);
        self
    }

    /// Sets the orchestrator parallelism.
    #[must_use]
    pub const fn max_concurrent_runs(mut self, n: usize) -> Self {
        self.max_concurrent_runs = Some(n);
        self
    }

    /// Sets the clarifier re-entry limit.
    #[must_use]
    pub const fn clarify_max_rounds(mut self, n: usize) -> Self {
        self.clarify_max_rounds = Some(n);
        self
    }

    /// Sets the synthesis map group size.
    #[must_use]
    pub const fn map_group_size(mut self, n: usize) -> Self {
        self.map_group_size = Some(n);
        self
    }

    /// Sets the hybrid-search semantic weight.
    #[must_use]
    pub const fn retrieval_weight_semantic(mut self, w: f64) -> Self {
        self.retrieval_weight_semantic = Some(w);
        self
    }

    /// Sets the per-run chunk cap.
    #[must_use]
    pub const fn max_chunks_per_run(mut self, n: usize) -> Self {
        self.max_chunks_per_run = Some(n);
        self
    }

    /// Sets the per-sub-question retrieval depth.
    #[must_use]
    pub const fn retrieval_limit(mut self, n: usize) -> Self {
        self.retrieval_limit = Some(n);
        self
    }

    /// Sets the cloud non-streaming deadline.
    #[must_use]
    pub const fn cloud_timeout(mut self, d: Duration) -> Self {
        self.cloud_timeout = Some(d);
        self
    }

    /// Sets the cloud streaming deadline.
    #[must_use]
    pub const fn cloud_stream_timeout(mut self, d: Duration) -> Self {
        self.cloud_stream_timeout = Some(d);
        self
    }

    /// Sets the local deadline.
    #[must_use]
    pub const fn local_timeout(mut self, d: Duration) -> Self {
        self.local_timeout = Some(d);
        self
    }

    /// Builds the [`EngineConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no cloud credential was set, or if
    /// the semantic weight is outside `[0, 1]`.
    pub fn build(self) -> Result<EngineConfig> {
        let cloud_backend_key = self.cloud_backend_key.ok_or_else(|| Error::Config {
            message: "CLOUD_BACKEND_KEY is required".to_string(),
        })?;

        let retrieval_weight_semantic = self
            .retrieval_weight_semantic
            .unwrap_or(DEFAULT_RETRIEVAL_WEIGHT_SEMANTIC);
        if !(0.0..=1.0).contains(&retrieval_weight_semantic) {
            return Err(Error::Config {
                message: format!(
                    "RETRIEVAL_WEIGHT_SEMANTIC must be in [0, 1], got {retrieval_weight_semantic}"
                ),
            });
        }

        Ok(EngineConfig {
            local_backend_url: self
                .local_backend_url
                .unwrap_or_else(|| DEFAULT_LOCAL_BACKEND_URL.to_string()),
            local_model_id: self
                .local_model_id
                .unwrap_or_else(|| DEFAULT_LOCAL_MODEL_ID.to_string()),
            cloud_backend_key,
            cloud_model_id: self
                .cloud_model_id
                .unwrap_or_else(|| DEFAULT_CLOUD_MODEL_ID.to_string()),
            cache_ttl: self
                .cache_ttl
                .unwrap_or(Duration::from_secs(DEFAULT_CACHE_TTL_SECS)),
            cache_max_entries: self.cache_max_entries.unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            max_tokens_per_call: self
                .max_tokens_per_call
                .unwrap_or(DEFAULT_MAX_TOKENS_PER_CALL),
            max_concurrent_runs: self
                .max_concurrent_runs
                .unwrap_or(DEFAULT_MAX_CONCURRENT_RUNS)
                .max(1),
            clarify_max_rounds: self.clarify_max_rounds.unwrap_or(DEFAULT_CLARIFY_MAX_ROUNDS),
            map_group_size: self.map_group_size.unwrap_or(DEFAULT_MAP_GROUP_SIZE).max(1),
            retrieval_weight_semantic,
            max_chunks_per_run: self
                .max_chunks_per_run
                .unwrap_or(DEFAULT_MAX_CHUNKS_PER_RUN)
                .max(1),
            retrieval_limit: self.retrieval_limit.unwrap_or(DEFAULT_RETRIEVAL_LIMIT).max(1),
            cloud_timeout: self
                .cloud_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_CLOUD_TIMEOUT_SECS)),
            cloud_stream_timeout: self
                .cloud_stream_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_CLOUD_STREAM_TIMEOUT_SECS)),
            local_timeout: self
                .local_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_LOCAL_TIMEOUT_SECS)),
        })
    }
}
