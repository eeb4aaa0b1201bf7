//! # knowvault
//!
//! Dual-LLM routing and retrieval-augmented synthesis core for a
//! privacy-first knowledge vault.
//!
//! Documents live in two buckets — `public` and `confidential` — and the
//! crate enforces one binary invariant across every generation path: no
//! confidential byte ever leaves the process boundary toward the cloud
//! backend. Routing is strictly content-based: the presence of
//! confidential chunks in retrieved evidence, or PII in the query, is
//! the only trigger — never the caller's role.
//!
//! ## Components
//!
//! - **PII detection** ([`pii`]): deterministic scanner over a fixed
//!   catalogue of regulated identifiers
//! - **Classification** ([`classify`]): content-only confidentiality
//!   decisions
//! - **Routing** ([`llm`]): the single gate to the local and cloud
//!   backends, with asymmetric fail-safety
//! - **Retrieval contract** ([`retrieval`]): role-filtered, ordered,
//!   deterministic results the core consumes
//! - **Context cache** ([`cache`]): content-addressed prompt prefixes
//!   for the cloud backend, public bucket only
//! - **Audit** ([`audit`]): best-effort, hash-chained record of every
//!   confidential access
//! - **Agents** ([`agent`]): clarify → research → verify → answer with
//!   streamed events and cancellation
//! - **Synthesis** ([`synthesis`]): map–reduce over broad queries
//! - **Service** ([`service`]): the ingress facade the API layer calls

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod agent;
pub mod audit;
pub mod cache;
pub mod classify;
pub mod config;
pub mod core;
pub mod error;
pub mod llm;
pub mod pii;
pub mod retrieval;
pub mod service;
pub mod synthesis;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Re-export core domain types
pub use crate::core::{BackendId, Bucket, Chunk, Document, Principal, Role, RunId};

// Re-export classification types
pub use classify::{ConfidentialityDecision, DecisionReason, classify};

// Re-export routing types
pub use llm::{LlmBackend, LlmRouter, RoutedClient};

// Re-export retrieval contract types
pub use retrieval::{RetrievalRequest, RetrievalResult, Retriever, ScoredChunk};

// Re-export cache types
pub use cache::{CacheHandle, CacheStats, ContextCacheManager};

// Re-export audit types
pub use audit::{ACTION_CONFIDENTIAL_ACCESSED, AuditRecord, AuditSink};

// Re-export agent types
pub use agent::{Orchestrator, RunEvent, RunHandle, RunState, Stage};

// Re-export service types
pub use service::{ChatEvent, SynthesisScope, VaultService};

// Re-export configuration
pub use config::EngineConfig;

// Re-export telemetry
pub use telemetry::{Telemetry, TelemetrySnapshot};
