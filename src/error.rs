//! Error types for the routing and synthesis core.
//!
//! One crate-wide hierarchy using `thiserror`. Every failure a caller can
//! observe maps to a stable kind string via [`Error::kind`], which the API
//! layer renders uniformly. Lower-level collaborator errors are wrapped,
//! never re-thrown raw.

use std::time::Duration;

use thiserror::Error;

use crate::core::BackendId;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for the routing and synthesis core.
#[derive(Error, Debug)]
pub enum Error {
    /// Input was not usable text, or exceeded the accepted length cap.
    #[error("malformed input: {message}")]
    MalformedInput {
        /// What was wrong with the input.
        message: String,
    },

    /// A caller attempted to cache confidential content.
    #[error("cache policy violation: refused to cache confidential content (key {key})")]
    CachePolicyViolation {
        /// Content key of the refused entry.
        key: String,
    },

    /// The local backend is unreachable while the decision is confidential.
    /// There is no fallback path for this case.
    #[error("confidential backend unavailable: {message}")]
    ConfidentialBackendUnavailable {
        /// Transport-level detail.
        message: String,
    },

    /// An LLM call exceeded its per-call deadline.
    #[error("backend timeout: {backend} call exceeded {:.0}s", elapsed.as_secs_f64())]
    BackendTimeout {
        /// Backend that timed out.
        backend: BackendId,
        /// Configured deadline that was exceeded.
        elapsed: Duration,
    },

    /// The retrieval service returned a transport error after retries.
    #[error("retrieval unavailable: {message}")]
    RetrievalUnavailable {
        /// Transport-level detail.
        message: String,
    },

    /// Over half of the synthesis map calls failed.
    #[error("synthesis degraded: {groups_failed} of {groups_total} map groups failed")]
    SynthesisDegraded {
        /// Number of map groups that failed.
        groups_failed: usize,
        /// Total number of map groups.
        groups_total: usize,
        /// Partial result assembled from the successful groups.
        partial: serde_json::Value,
    },

    /// The caller cancelled the run.
    #[error("operation cancelled by caller")]
    Cancelled,

    /// The clarifier produced an unusable payload (empty content with no
    /// finish reason, or structurally impossible output).
    #[error("clarifier internal error: {message}")]
    ClarifierInternal {
        /// What the clarifier returned.
        message: String,
    },

    /// An LLM backend rejected or failed a request.
    #[error("backend request failed: {message}")]
    Backend {
        /// Provider-reported detail.
        message: String,
        /// HTTP status, when the transport surfaced one.
        status: Option<u16>,
    },

    /// A streaming connection failed mid-generation.
    #[error("stream error: {message}")]
    Stream {
        /// Transport-level detail.
        message: String,
    },

    /// A stage agent returned JSON that does not match its schema.
    #[error("response parse error: {message}")]
    ResponseParse {
        /// Parse failure detail.
        message: String,
        /// The raw content that failed to parse.
        content: String,
    },

    /// Configuration errors.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

impl Error {
    /// Stable kind identifier rendered at the API boundary.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::MalformedInput { .. } => "malformed_input",
            Self::CachePolicyViolation { .. } => "cache_policy_violation",
            Self::ConfidentialBackendUnavailable { .. } => "confidential_backend_unavailable",
            Self::BackendTimeout { .. } => "backend_timeout",
            Self::RetrievalUnavailable { .. } => "retrieval_unavailable",
            Self::SynthesisDegraded { .. } => "synthesis_degraded",
            Self::Cancelled => "cancelled",
            Self::ClarifierInternal { .. } => "clarifier_internal",
            Self::Backend { .. } => "backend",
            Self::Stream { .. } => "stream",
            Self::ResponseParse { .. } => "response_parse",
            Self::Config { .. } => "config",
        }
    }

    /// Whether the error terminates the whole run (as opposed to a single
    /// stage-internal attempt that may be retried by policy).
    #[must_use]
    pub const fn is_fatal_to_run(&self) -> bool {
        !matches!(self, Self::Backend { .. } | Self::Stream { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseParse {
            message: err.to_string(),
            content: String::new(),
        }
    }
}
