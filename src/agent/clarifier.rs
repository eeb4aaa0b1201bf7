//! Clarifier stage agent.
//!
//! Disambiguates the query and produces a research plan. Runs before any
//! retrieval, so its routing decision sees only the query: PII in the
//! query pins this stage to the local backend.

use serde::{Deserialize, Serialize};

use super::prompt::CLARIFIER_SYSTEM_PROMPT;
use super::traits::{StageAgent, strip_code_fence};
use crate::error::{Error, Result};

/// Hard cap on research plan size.
pub const MAX_SUB_QUESTIONS: usize = 5;

/// Token budget for clarifier responses.
const CLARIFIER_MAX_TOKENS: u32 = 1024;

/// A research plan of focused sub-questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPlan {
    /// Sub-questions to retrieve against, at most [`MAX_SUB_QUESTIONS`].
    pub sub_questions: Vec<String>,
}

impl ResearchPlan {
    /// Single-question plan used when the clarifier yields nothing
    /// usable or exhausts its follow-up rounds.
    #[must_use]
    pub fn fallback(query: &str) -> Self {
        Self {
            sub_questions: vec![query.to_string()],
        }
    }

    fn sanitized(mut self, query: &str) -> Self {
        self.sub_questions.retain(|q| !q.trim().is_empty());
        self.sub_questions.truncate(MAX_SUB_QUESTIONS);
        if self.sub_questions.is_empty() {
            return Self::fallback(query);
        }
        self
    }
}

/// Outcome of one clarifier round.
#[derive(Debug, Clone)]
pub enum ClarifierOutcome {
    /// Ask the caller and re-enter with the augmented query.
    FollowUp(String),
    /// Proceed to research.
    Plan(ResearchPlan),
}

#[derive(Debug, Deserialize)]
struct ClarifierPayload {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    sub_questions: Vec<String>,
}

/// Agent for the clarifying stage.
#[derive(Debug, Default)]
pub struct ClarifierAgent;

impl ClarifierAgent {
    /// Creates the agent.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parses one clarifier response.
    ///
    /// Empty content is the canonical clarifier-internal failure and is
    /// never guessed around. Parseable-but-wrong JSON falls back
    /// leniently to a single-question plan over the current query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClarifierInternal`] on empty or whitespace-only
    /// content.
    pub fn parse_outcome(content: &str, query: &str) -> Result<ClarifierOutcome> {
        let json_str = strip_code_fence(content);
        if json_str.is_empty() {
            return Err(Error::ClarifierInternal {
                message: "clarifier returned empty content".to_string(),
            });
        }

        let Ok(payload) = serde_json::from_str::<ClarifierPayload>(json_str) else {
            tracing::warn!("clarifier output unparseable, falling back to single-question plan");
            return Ok(ClarifierOutcome::Plan(ResearchPlan::fallback(query)));
        };

        match payload.kind.as_str() {
            "follow_up" => match payload.question {
                Some(question) if !question.trim().is_empty() => {
                    Ok(ClarifierOutcome::FollowUp(question))
                }
                _ => Err(Error::ClarifierInternal {
                    message: "follow_up payload without a question".to_string(),
                }),
            },
            "plan" => Ok(ClarifierOutcome::Plan(
                ResearchPlan {
                    sub_questions: payload.sub_questions,
                }
                .sanitized(query),
            )),
            other => {
                tracing::warn!(kind = other, "unknown clarifier outcome, using fallback plan");
                Ok(ClarifierOutcome::Plan(ResearchPlan::fallback(query)))
            }
        }
    }
}

impl StageAgent for ClarifierAgent {
    fn name(&self) -> &'static str {
        "clarifier"
    }

    fn system_prompt(&self) -> &str {
        CLARIFIER_SYSTEM_PROMPT
    }

    fn json_mode(&self) -> bool {
        true
    }

    fn max_tokens(&self) -> u32 {
        CLARIFIER_MAX_TOKENS
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan() {
        let content = r#"{"type": "plan", "sub_questions": ["a", "b"]}"#;
        let outcome = ClarifierAgent::parse_outcome(content, "q");
        match outcome {
            Ok(ClarifierOutcome::Plan(plan)) => assert_eq!(plan.sub_questions, vec!["a", "b"]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_follow_up() {
        let content = r#"{"type": "follow_up", "question": "which year?"}"#;
        match ClarifierAgent::parse_outcome(content, "q") {
            Ok(ClarifierOutcome::FollowUp(question)) => assert_eq!(question, "which year?"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_plan_in_code_fence() {
        let content = "```json\n{\"type\": \"plan\", \"sub_questions\": [\"a\"]}\n```";
        assert!(matches!(
            ClarifierAgent::parse_outcome(content, "q"),
            Ok(ClarifierOutcome::Plan(_))
        ));
    }

    #[test]
    fn test_empty_content_is_internal_error() {
        let err = ClarifierAgent::parse_outcome("   ", "q").unwrap_err();
        assert!(matches!(err, Error::ClarifierInternal { .. }));
    }

    #[test]
    fn test_follow_up_without_question_is_internal_error() {
        let err = ClarifierAgent::parse_outcome(r#"{"type": "follow_up"}"#, "q").unwrap_err();
        assert!(matches!(err, Error::ClarifierInternal { .. }));
    }

    #[test]
    fn test_garbage_falls_back_to_single_question_plan() {
        match ClarifierAgent::parse_outcome("not json at all", "original query") {
            Ok(ClarifierOutcome::Plan(plan)) => {
                assert_eq!(plan.sub_questions, vec!["original query"]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_plan_truncated_to_cap() {
        let questions: Vec<String> = (0..9).map(|i| format!("\"q{i}\"")).collect();
        let content = format!(
            r#"{{"type": "plan", "sub_questions": [{}]}}"#,
            questions.join(",")
        );
        match ClarifierAgent::parse_outcome(&content, "q") {
            Ok(ClarifierOutcome::Plan(plan)) => {
                assert_eq!(plan.sub_questions.len(), MAX_SUB_QUESTIONS);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_plan_with_blank_questions_falls_back() {
        let content = r#"{"type": "plan", "sub_questions": ["", "  "]}"#;
        match ClarifierAgent::parse_outcome(content, "fallback query") {
            Ok(ClarifierOutcome::Plan(plan)) => {
                assert_eq!(plan.sub_questions, vec!["fallback query"]);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_agent_properties() {
        let agent = ClarifierAgent::new();
        assert_eq!(agent.name(), "clarifier");
        assert!(agent.json_mode());
        assert!((agent.temperature() - 0.0).abs() < f32::EPSILON);
    }
}
