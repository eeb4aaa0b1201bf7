//! The run record and its state machine.
//!
//! States advance monotonically along the pipeline order; the only
//! permitted skip is researching → answering when retrieval came back
//! empty. Failure and cancellation are sinks reachable from any active
//! state. Re-entering a completed stage is an internal error, caught
//! here rather than debugged downstream.

use serde::{Deserialize, Serialize};

use crate::core::{BackendId, RunId};
use crate::error::{Error, Result};

/// Lifecycle state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Disambiguating the query.
    Clarifying,
    /// Retrieving evidence.
    Researching,
    /// Verifying claims.
    Verifying,
    /// Generating the answer.
    Answering,
    /// Finished successfully. Terminal.
    Done,
    /// Finished with an unrecoverable error. Terminal.
    Failed,
    /// Cancelled by the caller. Terminal.
    Cancelled,
}

impl RunState {
    /// Whether the state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }

    const fn may_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Clarifying, Self::Researching)
                | (Self::Researching, Self::Verifying)
                // Verification is skipped only when retrieval was empty.
                | (Self::Researching, Self::Answering)
                | (Self::Verifying, Self::Answering)
                | (Self::Answering, Self::Done)
        ) || (!self.is_terminal() && matches!(to, Self::Failed | Self::Cancelled))
    }
}

/// One execution of the orchestrator, end to end.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    /// Run identifier.
    pub id: RunId,
    /// The original query.
    pub query: String,
    /// Current lifecycle state.
    pub state: RunState,
    /// Backend bound to this run's evidence-bearing stages.
    pub llm_used: Option<BackendId>,
}

impl AgentRun {
    /// Creates a run in the clarifying state.
    #[must_use]
    pub fn new(id: RunId, query: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
            state: RunState::Clarifying,
            llm_used: None,
        }
    }

    /// Advances the state machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a transition the machine forbids —
    /// an internal sequencing bug, not a user condition.
    pub fn advance(&mut self, to: RunState) -> Result<()> {
        if !self.state.may_transition(to) {
            return Err(Error::Config {
                message: format!(
                    "illegal run transition {:?} -> {to:?} (run {})",
                    self.state, self.id
                ),
            });
        }
        tracing::debug!(run_id = %self.id, from = ?self.state, to = ?to, "run state transition");
        self.state = to;
        Ok(())
    }
}
