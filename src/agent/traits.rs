//! Stage agent trait.
//!
//! Each pipeline stage that talks to an LLM (clarifier, verifier,
//! answerer) implements this trait, which fixes its prompt and sampling
//! configuration. Stages never pick a backend: they execute against
//! whatever client the orchestrator routed for the run's decision.

use crate::error::{Error, Result};
use crate::llm::{CallOptions, Completion, Generation, RoutedClient, system_message, user_message};

/// Configuration surface of one LLM-backed stage.
pub trait StageAgent: Send + Sync {
    /// Stage name for logging.
    fn name(&self) -> &'static str;

    /// System prompt defining the stage's role.
    fn system_prompt(&self) -> &str;

    /// Whether to request JSON-formatted output.
    fn json_mode(&self) -> bool {
        false
    }

    /// Sampling temperature.
    fn temperature(&self) -> f32 {
        0.0
    }

    /// Maximum tokens for the response.
    fn max_tokens(&self) -> u32;
}

/// Executes a non-streaming stage against a routed client.
///
/// # Errors
///
/// Propagates routing and backend errors; returns [`Error::Stream`] if
/// the client unexpectedly streams (an internal sequencing bug).
pub async fn execute_stage(
    agent: &dyn StageAgent,
    client: &RoutedClient,
    user_msg: &str,
) -> Result<Completion> {
    let messages = vec![system_message(agent.system_prompt()), user_message(user_msg)];
    let options = CallOptions {
        temperature: Some(agent.temperature()),
        max_tokens: Some(agent.max_tokens()),
        json_mode: agent.json_mode(),
    };
    tracing::debug!(stage = agent.name(), backend = %client.backend_id(), "executing stage");
    match client.generate(messages, options).await? {
        Generation::Completed(completion) => Ok(completion),
        Generation::Stream(_) => Err(Error::Stream {
            message: format!("stage {} received a streaming client", agent.name()),
        }),
    }
}

/// Strips a surrounding markdown code fence from model output.
pub(crate) fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fence_json() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn test_strip_code_fence_bare() {
        assert_eq!(strip_code_fence("```\n[1]\n```"), "[1]");
    }

    #[test]
    fn test_strip_code_fence_passthrough() {
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }
}
