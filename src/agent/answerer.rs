//! Answerer stage agent.
//!
//! Produces the final, token-streamed answer from the verified claims
//! and the evidence set, together with citations into the chunks that
//! fed it.

use super::event::Citation;
use super::prompt::ANSWERER_SYSTEM_PROMPT;
use super::traits::StageAgent;
use crate::retrieval::RetrievalResult;

/// Snippet length cap in bytes (cut at a char boundary).
const SNIPPET_LEN: usize = 160;
/// Citations carried on a run summary.
pub(crate) const MAX_CITATIONS: usize = 10;

/// Agent for the answering stage.
#[derive(Debug)]
pub struct AnswererAgent {
    max_tokens: u32,
}

impl AnswererAgent {
    /// Creates the agent with the configured completion cap.
    #[must_use]
    pub const fn new(max_tokens: u32) -> Self {
        Self { max_tokens }
    }
}

impl StageAgent for AnswererAgent {
    fn name(&self) -> &'static str {
        "answerer"
    }

    fn system_prompt(&self) -> &str {
        ANSWERER_SYSTEM_PROMPT
    }

    fn temperature(&self) -> f32 {
        0.2
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }
}

/// Builds citations for the top-ranked evidence chunks.
///
/// Snippets are short excerpts; no bucket information travels with a
/// citation.
#[must_use]
pub fn build_citations(evidence: &RetrievalResult, max: usize) -> Vec<Citation> {
    evidence
        .chunks()
        .iter()
        .take(max)
        .map(|scored| Citation {
            document_id: scored.document_id.clone(),
            chunk_id: scored.chunk.id.clone(),
            snippet: snippet(&scored.chunk.text),
        })
        .collect()
}

fn snippet(text: &str) -> String {
    if text.len() <= SNIPPET_LEN {
        return text.to_string();
    }
    let mut cut = SNIPPET_LEN;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Bucket, Chunk};
    use crate::retrieval::ScoredChunk;
    use std::sync::Arc;

    fn evidence(n: usize) -> RetrievalResult {
        let chunks = (0..n)
            .map(|i| ScoredChunk {
                chunk: Arc::new(Chunk {
                    id: format!("c{i}"),
                    document_id: format!("d{i}"),
                    text: format!("chunk {i} body text"),
                    ordinal: i,
                    embedding: Vec::new(),
                }),
                score: 1.0 - i as f64 / 100.0,
                document_id: format!("d{i}"),
                bucket: Bucket::Public,
            })
            .collect();
        RetrievalResult::new(chunks)
    }

    #[test]
    fn test_citations_follow_rank_order_and_cap() {
        let citations = build_citations(&evidence(15), 10);
        assert_eq!(citations.len(), 10);
        assert_eq!(citations[0].chunk_id, "c0");
        assert_eq!(citations[0].document_id, "d0");
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let text = "é".repeat(200);
        let s = snippet(&text);
        assert!(s.len() <= SNIPPET_LEN + '…'.len_utf8());
        assert!(s.ends_with('…'));
    }

    #[test]
    fn test_short_text_is_untruncated() {
        assert_eq!(snippet("short"), "short");
    }

    #[test]
    fn test_agent_properties() {
        let agent = AnswererAgent::new(4096);
        assert_eq!(agent.name(), "answerer");
        assert!(!agent.json_mode());
        assert_eq!(agent.max_tokens(), 4096);
    }
}
