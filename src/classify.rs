//! Confidentiality classification.
//!
//! A single boolean per interaction: must this run stay on the local
//! backend? Classification is a pure function of *content* — the query
//! text and the retrieved chunks. It never consults the principal:
//! routing on identity instead of content is exactly the class of bug
//! that sends an admin's public question to the local backend while a
//! user's PII-bearing query leaks to the cloud.

use serde::{Deserialize, Serialize};

use crate::pii;
use crate::retrieval::RetrievalResult;

/// Why an interaction was (or was not) classified confidential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// The query text contains a regulated identifier.
    QueryPii,
    /// A retrieved chunk belongs to a confidential document.
    ChunkFromConfidentialBucket,
    /// Neither signal fired.
    NoSignal,
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueryPii => write!(f, "query_pii"),
            Self::ChunkFromConfidentialBucket => write!(f, "chunk_from_confidential_bucket"),
            Self::NoSignal => write!(f, "no_signal"),
        }
    }
}

/// The routing decision for one interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidentialityDecision {
    /// Whether the interaction must be processed locally.
    pub confidential: bool,
    /// The signal that produced the decision.
    pub reason: DecisionReason,
}

impl ConfidentialityDecision {
    /// A non-confidential decision with no signal.
    #[must_use]
    pub const fn public() -> Self {
        Self {
            confidential: false,
            reason: DecisionReason::NoSignal,
        }
    }
}

/// Classifies one interaction.
///
/// Rules apply in order:
///
/// 1. Any retrieved chunk from a confidential bucket ⇒ confidential.
///    Retrieved content is actual evidence and dominates any heuristic
///    over the query — a clean query can retrieve sensitive matter.
/// 2. PII in the query ⇒ confidential.
/// 3. Otherwise public.
#[must_use]
pub fn classify(
    query: &str,
    retrieval_result: Option<&RetrievalResult>,
) -> ConfidentialityDecision {
    if retrieval_result.is_some_and(RetrievalResult::has_confidential) {
        return ConfidentialityDecision {
            confidential: true,
            reason: DecisionReason::ChunkFromConfidentialBucket,
        };
    }
    if pii::detect(query) {
        return ConfidentialityDecision {
            confidential: true,
            reason: DecisionReason::QueryPii,
        };
    }
    ConfidentialityDecision::public()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Bucket, Chunk};
    use crate::retrieval::ScoredChunk;
    use std::sync::Arc;

    fn result_with(buckets: &[Bucket]) -> RetrievalResult {
        let chunks = buckets
            .iter()
            .enumerate()
            .map(|(i, &bucket)| ScoredChunk {
                chunk: Arc::new(Chunk {
                    id: format!("c{i}"),
                    document_id: format!("d{i}"),
                    text: "neutral text".to_string(),
                    ordinal: 0,
                    embedding: Vec::new(),
                }),
                score: 0.5,
                document_id: format!("d{i}"),
                bucket,
            })
            .collect();
        RetrievalResult::new(chunks)
    }

    #[test]
    fn test_clean_query_no_retrieval_is_public() {
        let decision = classify("vacation planning checklist", None);
        assert!(!decision.confidential);
        assert_eq!(decision.reason, DecisionReason::NoSignal);
    }

    #[test]
    fn test_pii_query_is_confidential() {
        let decision = classify("contact me at john.doe@example.com", None);
        assert!(decision.confidential);
        assert_eq!(decision.reason, DecisionReason::QueryPii);
    }

    #[test]
    fn test_confidential_chunk_dominates_clean_query() {
        let result = result_with(&[Bucket::Public, Bucket::Confidential, Bucket::Public]);
        let decision = classify("assets trend", Some(&result));
        assert!(decision.confidential);
        assert_eq!(decision.reason, DecisionReason::ChunkFromConfidentialBucket);
    }

    #[test]
    fn test_chunk_signal_ordered_before_query_signal() {
        // Both signals fire; the retrieval signal must win the reason.
        let result = result_with(&[Bucket::Confidential]);
        let decision = classify("mail me at a@b.example", Some(&result));
        assert_eq!(decision.reason, DecisionReason::ChunkFromConfidentialBucket);
    }

    #[test]
    fn test_fully_public_retrieval_stays_public() {
        let result = result_with(&[Bucket::Public, Bucket::Public]);
        let decision = classify("assets trend", Some(&result));
        assert!(!decision.confidential);
        assert_eq!(decision.reason, DecisionReason::NoSignal);
    }

    #[test]
    fn test_empty_retrieval_falls_through_to_query() {
        let result = result_with(&[]);
        let decision = classify("ssn 521-04-1234", Some(&result));
        assert!(decision.confidential);
        assert_eq!(decision.reason, DecisionReason::QueryPii);
    }
}
