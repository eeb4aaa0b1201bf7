//! Multi-agent query pipeline.
//!
//! A query enters through the [`Orchestrator`], which clarifies it,
//! retrieves evidence, verifies claims, and streams an answer:
//!
//! ```text
//! User query → Orchestrator
//!   ├── Clarifier (disambiguate, plan ≤5 sub-questions)
//!   ├── Researcher (retrieval per sub-question, union + dedup + cap)
//!   ├── Verifier (grade claims against evidence)
//!   └── Answerer (token-streamed answer + citations)
//! ```
//!
//! Backend selection is content-based at every step: the clarifier
//! routes on the query's classification, verification and answering on
//! the classification over the actual retrieved evidence.

pub mod answerer;
pub mod clarifier;
pub mod event;
pub mod orchestrator;
pub mod prompt;
pub mod run;
pub mod traits;
pub mod verifier;

// Re-export key types
pub use answerer::{AnswererAgent, build_citations};
pub use clarifier::{ClarifierAgent, ClarifierOutcome, MAX_SUB_QUESTIONS, ResearchPlan};
pub use event::{Citation, RunEvent, RunSummary, Stage, StagePayload};
pub use orchestrator::{Orchestrator, RunHandle};
pub use run::{AgentRun, RunState};
pub use traits::{StageAgent, execute_stage};
pub use verifier::{Claim, ClaimStatus, VerifierAgent};
