//! Map–reduce synthesis over broad queries.
//!
//! Broad questions that span many documents fan out over groups of
//! retrieved chunks: each group produces a structured partial summary
//! (map), then the partials merge into one coherent answer (reduce).
//! Bucket handling is whole-group: a group containing one confidential
//! chunk is a confidential group for its map call, and a reduction over
//! any confidential evidence runs on the local backend.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::classify::{ConfidentialityDecision, DecisionReason};
use crate::config::EngineConfig;
use crate::core::{BackendId, Bucket};
use crate::error::{Error, Result};
use crate::llm::{CallOptions, Generation, LlmRouter, Usage, system_message, user_message};
use crate::retrieval::{RetrievalResult, ScoredChunk};

/// Concurrent map calls in flight.
const MAP_CONCURRENCY: usize = 4;
/// Token budget for one map call.
const MAP_MAX_TOKENS: u32 = 1024;

/// System prompt for map calls.
const MAP_SYSTEM_PROMPT: &str = r"You are a summarization agent. You receive document sections and research sub-questions. Produce a structured partial summary: for each sub-question, state what these sections say about it, with concrete figures and quotes. If a section says nothing about a sub-question, write 'no signal'. Report only what the sections contain.";

/// System prompt for the reduce call.
const REDUCE_SYSTEM_PROMPT: &str = r"You are a synthesis agent. You receive partial summaries produced from disjoint groups of document sections, keyed by the same research sub-questions. Merge them into one coherent markdown answer to the topic. Resolve agreement and disagreement across partials explicitly. When partial summaries are marked missing, state that coverage is incomplete.";

/// One map output.
#[derive(Debug, Clone, serde::Serialize)]
struct PartialSummary {
    group: usize,
    text: String,
}

/// Result of one synthesis.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SynthesisResult {
    /// Merged answer.
    pub answer: String,
    /// Total map groups.
    pub groups_total: usize,
    /// Map groups that failed; the answer notes the missing coverage.
    pub groups_failed: usize,
    /// Backend that ran the reduction.
    pub llm_used: BackendId,
    /// Aggregate usage across map and reduce calls.
    pub usage: Usage,
}

/// Splits the evidence into groups of at most `group_size` chunks,
/// preserving rank order.
fn partition_groups(evidence: &RetrievalResult, group_size: usize) -> Vec<Vec<ScoredChunk>> {
    evidence
        .chunks()
        .chunks(group_size.max(1))
        .map(<[ScoredChunk]>::to_vec)
        .collect()
}

/// A group is confidential when any member is.
fn group_decision(group: &[ScoredChunk]) -> ConfidentialityDecision {
    if group.iter().any(|c| c.bucket == Bucket::Confidential) {
        ConfidentialityDecision {
            confidential: true,
            reason: DecisionReason::ChunkFromConfidentialBucket,
        }
    } else {
        ConfidentialityDecision::public()
    }
}

fn build_map_prompt(topic: &str, sub_questions: &[String], group: &[ScoredChunk]) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "## Topic\n\n{topic}\n");
    if !sub_questions.is_empty() {
        let _ = writeln!(msg, "## Sub-Questions\n");
        for (i, question) in sub_questions.iter().enumerate() {
            let _ = writeln!(msg, "{}. {question}", i + 1);
        }
    }
    let _ = writeln!(msg, "\n## Sections\n");
    for scored in group {
        let _ = writeln!(
            msg,
            "### Chunk {} (document {})\n\n{}\n",
            scored.chunk.id, scored.document_id, scored.chunk.text
        );
    }
    msg
}

fn build_reduce_prompt(
    topic: &str,
    sub_questions: &[String],
    partials: &[PartialSummary],
    groups_failed: usize,
) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "## Topic\n\n{topic}\n");
    if !sub_questions.is_empty() {
        let _ = writeln!(msg, "## Sub-Questions\n");
        for (i, question) in sub_questions.iter().enumerate() {
            let _ = writeln!(msg, "{}. {question}", i + 1);
        }
    }
    if groups_failed > 0 {
        let _ = writeln!(
            msg,
            "\nNote: {groups_failed} group summar{} missing; coverage is incomplete.",
            if groups_failed == 1 { "y is" } else { "ies are" }
        );
    }
    let _ = writeln!(msg, "\n## Partial Summaries\n");
    for partial in partials {
        let _ = writeln!(msg, "### Group {}\n\n{}\n", partial.group, partial.text);
    }
    msg
}

/// The map–reduce synthesis engine.
pub struct SynthesisEngine {
    router: Arc<LlmRouter>,
    group_size: usize,
    reduce_max_tokens: u32,
}

impl SynthesisEngine {
    /// Creates an engine over the router.
    pub fn new(router: Arc<LlmRouter>, config: &EngineConfig) -> Self {
        Self {
            router,
            group_size: config.map_group_size,
            reduce_max_tokens: config.max_tokens_per_call,
        }
    }

    /// Synthesizes an answer over already retrieved evidence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SynthesisDegraded`] with the partial blob when
    /// fewer than half of the map calls succeed; routing errors
    /// propagate.
    pub async fn synthesize(
        &self,
        topic: &str,
        sub_questions: &[String],
        evidence: &RetrievalResult,
    ) -> Result<SynthesisResult> {
        let groups = partition_groups(evidence, self.group_size);
        let groups_total = groups.len();
        if groups_total == 0 {
            return Err(Error::MalformedInput {
                message: "synthesis requires at least one retrieved chunk".to_string(),
            });
        }

        let (partials, map_usage, map_errors) =
            self.map_phase(topic, sub_questions, groups).await;
        let groups_failed = groups_total - partials.len();
        for error in &map_errors {
            tracing::warn!(error = %error, "synthesis map group failed");
        }

        if partials.len() * 2 < groups_total {
            return Err(Error::SynthesisDegraded {
                groups_failed,
                groups_total,
                partial: serde_json::json!({
                    "partials": partials,
                    "groups_failed": groups_failed,
                    "groups_total": groups_total,
                }),
            });
        }

        // Reduction over any confidential evidence stays local, even
        // when every surviving partial came from a public group.
        let reduce_decision = if evidence.has_confidential() {
            ConfidentialityDecision {
                confidential: true,
                reason: DecisionReason::ChunkFromConfidentialBucket,
            }
        } else {
            ConfidentialityDecision::public()
        };

        let client = self.router.route(&reduce_decision, false, None).await?;
        let messages = vec![
            system_message(REDUCE_SYSTEM_PROMPT),
            user_message(&build_reduce_prompt(
                topic,
                sub_questions,
                &partials,
                groups_failed,
            )),
        ];
        let options = CallOptions {
            temperature: Some(0.1),
            max_tokens: Some(self.reduce_max_tokens),
            json_mode: false,
        };
        let completion = match client.generate(messages, options).await? {
            Generation::Completed(completion) => completion,
            Generation::Stream(_) => {
                return Err(Error::Stream {
                    message: "reduce call received a streaming client".to_string(),
                });
            }
        };

        let mut usage = map_usage;
        usage.accumulate(completion.usage);

        Ok(SynthesisResult {
            answer: completion.text,
            groups_total,
            groups_failed,
            llm_used: completion.llm_used,
            usage,
        })
    }

    /// Fans map calls out under bounded concurrency; failures drop their
    /// group and are reported back for accounting.
    async fn map_phase(
        &self,
        topic: &str,
        sub_questions: &[String],
        groups: Vec<Vec<ScoredChunk>>,
    ) -> (Vec<PartialSummary>, Usage, Vec<Error>) {
        let semaphore = Arc::new(Semaphore::new(MAP_CONCURRENCY));
        let mut handles = Vec::with_capacity(groups.len());

        for (index, group) in groups.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let router = Arc::clone(&self.router);
            let topic = topic.to_string();
            let sub_questions = sub_questions.to_vec();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.map_err(|_| Error::Cancelled)?;
                let decision = group_decision(&group);
                let client = router.route(&decision, false, None).await?;
                let messages = vec![
                    system_message(MAP_SYSTEM_PROMPT),
                    user_message(&build_map_prompt(&topic, &sub_questions, &group)),
                ];
                let options = CallOptions {
                    temperature: Some(0.0),
                    max_tokens: Some(MAP_MAX_TOKENS),
                    json_mode: false,
                };
                match client.generate(messages, options).await? {
                    Generation::Completed(completion) => Ok((index, completion)),
                    Generation::Stream(_) => Err(Error::Stream {
                        message: "map call received a streaming client".to_string(),
                    }),
                }
            }));
        }

        let mut partials = Vec::with_capacity(handles.len());
        let mut usage = Usage::default();
        let mut errors = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Ok((index, completion))) => {
                    usage.accumulate(completion.usage);
                    partials.push(PartialSummary {
                        group: index,
                        text: completion.text,
                    });
                }
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(Error::Backend {
                    message: format!("map task join failed: {e}"),
                    status: None,
                }),
            }
        }
        partials.sort_by_key(|p| p.group);
        (partials, usage, errors)
    }
}

impl std::fmt::Debug for SynthesisEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesisEngine")
            .field("group_size", &self.group_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Chunk;
    use test_case::test_case;

    fn scored(id: &str, bucket: Bucket) -> ScoredChunk {
        ScoredChunk {
            chunk: Arc::new(Chunk {
                id: id.to_string(),
                document_id: format!("doc-{id}"),
                text: format!("text {id}"),
                ordinal: 0,
                embedding: Vec::new(),
            }),
            score: 0.5,
            document_id: format!("doc-{id}"),
            bucket,
        }
    }

    fn evidence(buckets: &[Bucket]) -> RetrievalResult {
        RetrievalResult::new(
            buckets
                .iter()
                .enumerate()
                .map(|(i, &b)| scored(&format!("c{i}"), b))
                .collect(),
        )
    }

    #[test_case(25, 10, &[10, 10, 5]; "uneven tail")]
    #[test_case(10, 10, &[10]; "exact fit")]
    #[test_case(3, 10, &[3]; "single group")]
    fn test_partition_sizes(chunks: usize, group_size: usize, expected: &[usize]) {
        let evidence = evidence(&vec![Bucket::Public; chunks]);
        let groups = partition_groups(&evidence, group_size);
        let sizes: Vec<usize> = groups.iter().map(Vec::len).collect();
        assert_eq!(sizes, expected);
    }

    #[test]
    fn test_partition_preserves_rank_order() {
        let evidence = evidence(&vec![Bucket::Public; 12]);
        let groups = partition_groups(&evidence, 5);
        assert_eq!(groups[0][0].chunk.id, "c0");
        assert_eq!(groups[1][0].chunk.id, "c5");
        assert_eq!(groups[2][0].chunk.id, "c10");
    }

    #[test]
    fn test_one_confidential_chunk_makes_group_confidential() {
        let group = vec![
            scored("a", Bucket::Public),
            scored("b", Bucket::Confidential),
            scored("c", Bucket::Public),
        ];
        let decision = group_decision(&group);
        assert!(decision.confidential);
        assert_eq!(decision.reason, DecisionReason::ChunkFromConfidentialBucket);
    }

    #[test]
    fn test_all_public_group_is_public() {
        let group = vec![scored("a", Bucket::Public)];
        assert!(!group_decision(&group).confidential);
    }

    #[test]
    fn test_reduce_prompt_annotates_missing_groups() {
        let partials = vec![PartialSummary {
            group: 0,
            text: "summary".to_string(),
        }];
        let msg = build_reduce_prompt("topic", &[], &partials, 2);
        assert!(msg.contains("2 group summaries are missing"));
    }

    #[test]
    fn test_map_prompt_lists_sections() {
        let group = vec![scored("a", Bucket::Public)];
        let msg = build_map_prompt("topic", &["q1".to_string()], &group);
        assert!(msg.contains("Chunk a"));
        assert!(msg.contains("1. q1"));
    }
}
