//! Stream events emitted by the orchestrator.
//!
//! Event order is monotonic in (stage index, emission time): deltas of a
//! later stage never interleave with those of an earlier stage, and the
//! final event is always one of `RunCompleted`, `RunFailed`, or
//! `RunCancelled`.

use serde::{Deserialize, Serialize};

use crate::core::{BackendId, RunId};
use crate::llm::Usage;

/// Pipeline stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Query disambiguation and research planning.
    Clarifying,
    /// Retrieval across the research plan's sub-questions.
    Researching,
    /// Claim verification against the retrieved evidence.
    Verifying,
    /// Final answer generation.
    Answering,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clarifying => write!(f, "clarifying"),
            Self::Researching => write!(f, "researching"),
            Self::Verifying => write!(f, "verifying"),
            Self::Answering => write!(f, "answering"),
        }
    }
}

/// A source citation attached to the final answer.
///
/// Exposes ids and a snippet only — no bucket label travels with a
/// citation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    /// Document the snippet came from.
    pub document_id: String,
    /// Chunk the snippet came from.
    pub chunk_id: String,
    /// Short excerpt of the cited chunk.
    pub snippet: String,
}

/// Intermediate payload carried by a [`RunEvent::StageDelta`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StagePayload {
    /// The clarifier needs more information; the caller should reply
    /// through the run handle.
    FollowUpQuestion {
        /// The question to put to the user.
        question: String,
        /// 1-based clarification round.
        round: usize,
    },
    /// The clarifier settled on a research plan.
    ResearchPlan {
        /// Sub-questions to retrieve against.
        sub_questions: Vec<String>,
    },
    /// One sub-question's retrieval finished.
    SubQuestionSearched {
        /// The sub-question text.
        question: String,
        /// Chunks it contributed before merging.
        chunks: usize,
    },
    /// An incremental token of the final answer.
    AnswerDelta {
        /// Text fragment.
        text: String,
    },
}

/// Terminal summary of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier (doubles as the correlation id).
    pub run_id: RunId,
    /// Backend that produced the answer.
    pub llm_used: BackendId,
    /// Final answer text.
    pub answer: String,
    /// Citations into the evidence set.
    pub citations: Vec<Citation>,
    /// Chunks that survived merging and fed verification.
    pub chunks_used: usize,
    /// Verified claims carried into the answer.
    pub claims: usize,
    /// Aggregate token usage across stages.
    pub usage: Usage,
    /// Present when the researcher found nothing and verification was
    /// skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insufficient_evidence: Option<String>,
}

/// One event in a run's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum RunEvent {
    /// A stage began.
    StageStarted {
        /// The stage.
        stage: Stage,
    },
    /// Intermediate progress within a stage.
    StageDelta {
        /// The stage.
        stage: Stage,
        /// Stage-specific payload.
        payload: StagePayload,
    },
    /// A stage finished.
    StageCompleted {
        /// The stage.
        stage: Stage,
        /// Human-readable summary line.
        summary: String,
    },
    /// The run finished successfully. Terminal.
    RunCompleted {
        /// Result summary.
        run: RunSummary,
    },
    /// The run failed. Terminal; partial answer text already streamed
    /// remains visible to the caller.
    RunFailed {
        /// Correlation id.
        run_id: RunId,
        /// Stable error kind.
        kind: String,
        /// Human-readable message (never a raw stack trace).
        message: String,
    },
    /// The caller cancelled the run. Terminal.
    RunCancelled {
        /// Correlation id.
        run_id: RunId,
    },
}

impl RunEvent {
    /// Whether this event closes the stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }

    /// The stage this event belongs to, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::StageStarted { stage }
            | Self::StageDelta { stage, .. }
            | Self::StageCompleted { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_pipeline_order() {
        assert!(Stage::Clarifying < Stage::Researching);
        assert!(Stage::Researching < Stage::Verifying);
        assert!(Stage::Verifying < Stage::Answering);
    }

    #[test]
    fn test_terminal_events() {
        assert!(
            RunEvent::RunCancelled {
                run_id: RunId::generate()
            }
            .is_terminal()
        );
        assert!(
            !RunEvent::StageStarted {
                stage: Stage::Clarifying
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RunEvent::StageDelta {
            stage: Stage::Answering,
            payload: StagePayload::AnswerDelta {
                text: "hello".to_string(),
            },
        };
        let json = serde_json::to_string(&event).unwrap_or_default();
        assert!(json.contains("\"event\":\"stage_delta\""));
        assert!(json.contains("\"type\":\"answer_delta\""));
    }

    #[test]
    fn test_citation_has_no_bucket_field() {
        let citation = Citation {
            document_id: "d1".to_string(),
            chunk_id: "c1".to_string(),
            snippet: "…".to_string(),
        };
        let json = serde_json::to_string(&citation).unwrap_or_default();
        assert!(!json.contains("bucket"));
    }
}
