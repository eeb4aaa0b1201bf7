//! Verifier stage agent.
//!
//! Grades the factual claims the retrieved evidence makes about the
//! query. Runs on the backend the run's classification fixed — by the
//! time verification starts, the evidence set is known and the decision
//! is final for the rest of the run.

use serde::{Deserialize, Serialize};

use super::prompt::VERIFIER_SYSTEM_PROMPT;
use super::traits::{StageAgent, strip_code_fence};
use crate::error::{Error, Result};

/// Token budget for verifier responses.
const VERIFIER_MAX_TOKENS: u32 = 2048;
/// Cap on claims carried out of one verification.
const MAX_CLAIMS: usize = 50;
/// Cap on a single claim's text length in bytes.
const MAX_CLAIM_TEXT_LEN: usize = 2_000;

/// Evidence grade of one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// The evidence backs the claim.
    Supported,
    /// The evidence argues against the claim.
    Contradicted,
    /// The evidence does not address the claim.
    Unsupported,
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Supported => write!(f, "supported"),
            Self::Contradicted => write!(f, "contradicted"),
            Self::Unsupported => write!(f, "unsupported"),
        }
    }
}

/// One graded claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// The claim text.
    pub text: String,
    /// Evidence grade.
    pub status: ClaimStatus,
    /// Chunks cited as backing.
    #[serde(default)]
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimsWrapper {
    claims: Vec<Claim>,
}

/// Agent for the verifying stage.
#[derive(Debug, Default)]
pub struct VerifierAgent;

impl VerifierAgent {
    /// Creates the agent.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Parses the verifier's JSON response.
    ///
    /// Accepts the wrapper object or a bare array, with or without a
    /// code fence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResponseParse`] when neither shape matches.
    pub fn parse_claims(content: &str) -> Result<Vec<Claim>> {
        let json_str = strip_code_fence(content);

        let claims = if let Ok(wrapper) = serde_json::from_str::<ClaimsWrapper>(json_str) {
            wrapper.claims
        } else if let Ok(claims) = serde_json::from_str::<Vec<Claim>>(json_str) {
            claims
        } else {
            let preview_len = json_str.len().min(200);
            return Err(Error::ResponseParse {
                message: format!(
                    "verifier output matched neither claims wrapper nor array \
                     (length {} bytes, preview {:?})",
                    json_str.len(),
                    &json_str[..preview_len]
                ),
                content: content.to_string(),
            });
        };

        Ok(Self::sanitize(claims))
    }

    fn sanitize(mut claims: Vec<Claim>) -> Vec<Claim> {
        claims.truncate(MAX_CLAIMS);
        for claim in &mut claims {
            if claim.text.len() > MAX_CLAIM_TEXT_LEN {
                let mut cut = MAX_CLAIM_TEXT_LEN;
                while !claim.text.is_char_boundary(cut) {
                    cut -= 1;
                }
                claim.text.truncate(cut);
            }
        }
        claims
    }

    /// Counts claims by status for stage summaries.
    #[must_use]
    pub fn tally(claims: &[Claim]) -> (usize, usize, usize) {
        let supported = claims
            .iter()
            .filter(|c| c.status == ClaimStatus::Supported)
            .count();
        let contradicted = claims
            .iter()
            .filter(|c| c.status == ClaimStatus::Contradicted)
            .count();
        (supported, contradicted, claims.len() - supported - contradicted)
    }
}

impl StageAgent for VerifierAgent {
    fn name(&self) -> &'static str {
        "verifier"
    }

    fn system_prompt(&self) -> &str {
        VERIFIER_SYSTEM_PROMPT
    }

    fn json_mode(&self) -> bool {
        true
    }

    fn max_tokens(&self) -> u32 {
        VERIFIER_MAX_TOKENS
    }
}
