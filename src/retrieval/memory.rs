//! In-memory reference retriever.
//!
//! The executable form of the retrieval contract: role-filtered
//! visibility, hybrid convex scoring, total deterministic ordering.
//! Fixtures may pin a score per chunk, which lets tests build corpora
//! with exact rankings; unpinned chunks are scored with a hash-bucket
//! embedding and token-overlap lexical signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::merge::combine_score;
use super::visibility::can_see;
use super::{RetrievalRequest, RetrievalResult, Retriever, ScoredChunk};
use crate::core::{Bucket, Chunk, Document};
use crate::error::{Error, Result};

/// Dimensions of the hash-bucket embedding.
const EMBED_DIMS: usize = 64;

struct CorpusEntry {
    chunk: Arc<Chunk>,
    bucket: Bucket,
    pinned_score: Option<f64>,
}

/// Deterministic in-memory retriever.
pub struct MemoryRetriever {
    weight_semantic: f64,
    entries: RwLock<Vec<CorpusEntry>>,
    unavailable_budget: AtomicUsize,
}

impl MemoryRetriever {
    /// Creates an empty corpus with the given semantic weight.
    #[must_use]
    pub fn new(weight_semantic: f64) -> Self {
        Self {
            weight_semantic,
            entries: RwLock::new(Vec::new()),
            unavailable_budget: AtomicUsize::new(0),
        }
    }

    /// Adds a chunk scored by the hybrid ranker.
    pub fn add_chunk(&self, chunk: Chunk, bucket: Bucket) {
        self.push(chunk, bucket, None);
    }

    /// Indexes a document as paragraph chunks inheriting its bucket.
    pub fn add_document(&self, document: &Document) {
        for (ordinal, paragraph) in document
            .text
            .split("\n\n")
            .filter(|p| !p.trim().is_empty())
            .enumerate()
        {
            self.push(
                Chunk {
                    id: format!("{}-{ordinal}", document.id),
                    document_id: document.id.clone(),
                    text: paragraph.to_string(),
                    ordinal,
                    embedding: Vec::new(),
                },
                document.bucket,
                None,
            );
        }
    }

    /// Adds a chunk with a pinned score, bypassing the ranker.
    pub fn add_pinned_chunk(&self, chunk: Chunk, bucket: Bucket, score: f64) {
        self.push(chunk, bucket, Some(score));
    }

    /// Makes the next `n` searches fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.unavailable_budget.store(n, Ordering::SeqCst);
    }

    fn push(&self, chunk: Chunk, bucket: Bucket, pinned_score: Option<f64>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.push(CorpusEntry {
                chunk: Arc::new(chunk),
                bucket,
                pinned_score,
            });
        }
    }

    fn score(&self, query: &str, entry: &CorpusEntry) -> f64 {
        if let Some(pinned) = entry.pinned_score {
            return pinned;
        }
        let semantic = cosine(
            &hash_embedding(query),
            &if entry.chunk.embedding.is_empty() {
                hash_embedding(&entry.chunk.text)
            } else {
                entry.chunk.embedding.clone()
            },
        );
        let lexical = token_overlap(query, &entry.chunk.text);
        combine_score(semantic, lexical, self.weight_semantic)
    }
}

#[async_trait]
impl Retriever for MemoryRetriever {
    async fn search(&self, request: &RetrievalRequest) -> Result<RetrievalResult> {
        if self
            .unavailable_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::RetrievalUnavailable {
                message: "simulated transport failure".to_string(),
            });
        }

        let entries = self.entries.read().map_err(|_| Error::RetrievalUnavailable {
            message: "corpus lock poisoned".to_string(),
        })?;

        let mut scored: Vec<ScoredChunk> = entries
            .iter()
            .filter(|e| can_see(request.principal.role, e.bucket))
            .filter(|e| {
                request
                    .require_bucket
                    .is_none_or(|required| e.bucket == required)
            })
            .filter_map(|e| {
                let score = self.score(&request.query_text, e);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: Arc::clone(&e.chunk),
                    score,
                    document_id: e.chunk.document_id.clone(),
                    bucket: e.bucket,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        scored.truncate(request.limit);

        Ok(RetrievalResult::new(scored))
    }
}

/// Folds tokens into a fixed number of hash buckets and normalizes.
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut dims = vec![0.0f32; EMBED_DIMS];
    for token in tokens(text) {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in token.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        dims[(hash % EMBED_DIMS as u64) as usize] += 1.0;
    }
    let norm: f32 = dims.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut dims {
            *v /= norm;
        }
    }
    dims
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        f64::from(dot / (norm_a * norm_b))
    }
}

/// Fraction of query tokens present in the chunk text.
fn token_overlap(query: &str, text: &str) -> f64 {
    let query_tokens: Vec<String> = tokens(query).collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens: std::collections::HashSet<String> = tokens(text).collect();
    let shared = query_tokens
        .iter()
        .filter(|t| text_tokens.contains(*t))
        .count();
    shared as f64 / query_tokens.len() as f64
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Principal, Role};

    fn chunk(id: &str, doc: &str, text: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc.to_string(),
            text: text.to_string(),
            ordinal: 0,
            embedding: Vec::new(),
        }
    }

    fn request(role: Role, query: &str) -> RetrievalRequest {
        RetrievalRequest {
            query_text: query.to_string(),
            principal: Principal::new("p", role),
            limit: 10,
            require_bucket: None,
        }
    }

    #[tokio::test]
    async fn test_user_never_sees_confidential() {
        let retriever = MemoryRetriever::new(0.7);
        retriever.add_pinned_chunk(chunk("c1", "d1", "alpha"), Bucket::Public, 0.9);
        retriever.add_pinned_chunk(chunk("c2", "d2", "alpha"), Bucket::Confidential, 0.95);
        let result = retriever
            .search(&request(Role::User, "alpha"))
            .await
            .unwrap_or_default();
        assert_eq!(result.len(), 1);
        assert_eq!(result.chunks()[0].chunk.id, "c1");
    }

    #[tokio::test]
    async fn test_admin_sees_both_buckets_in_score_order() {
        let retriever = MemoryRetriever::new(0.7);
        retriever.add_pinned_chunk(chunk("c1", "d1", "alpha"), Bucket::Public, 0.9);
        retriever.add_pinned_chunk(chunk("c2", "d2", "alpha"), Bucket::Confidential, 0.95);
        let result = retriever
            .search(&request(Role::Admin, "alpha"))
            .await
            .unwrap_or_default();
        assert_eq!(result.len(), 2);
        assert_eq!(result.chunks()[0].chunk.id, "c2");
    }

    #[tokio::test]
    async fn test_search_is_deterministic() {
        let retriever = MemoryRetriever::new(0.7);
        for i in 0..20 {
            retriever.add_chunk(
                chunk(&format!("c{i}"), "d1", "budget planning for the quarter"),
                Bucket::Public,
            );
        }
        let a = retriever
            .search(&request(Role::User, "budget planning"))
            .await
            .unwrap_or_default();
        let b = retriever
            .search(&request(Role::User, "budget planning"))
            .await
            .unwrap_or_default();
        let ids_a: Vec<&str> = a.chunks().iter().map(|c| c.chunk.id.as_str()).collect();
        let ids_b: Vec<&str> = b.chunks().iter().map(|c| c.chunk.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn test_hybrid_scoring_prefers_lexical_match() {
        let retriever = MemoryRetriever::new(0.7);
        retriever.add_chunk(
            chunk("hit", "d1", "vacation planning checklist for summer"),
            Bucket::Public,
        );
        retriever.add_chunk(
            chunk("miss", "d1", "unrelated quarterly revenue figures"),
            Bucket::Public,
        );
        let result = retriever
            .search(&request(Role::User, "vacation planning checklist"))
            .await
            .unwrap_or_default();
        assert!(!result.is_empty());
        assert_eq!(result.chunks()[0].chunk.id, "hit");
    }

    #[tokio::test]
    async fn test_require_bucket_narrows_within_visibility() {
        let retriever = MemoryRetriever::new(0.7);
        retriever.add_pinned_chunk(chunk("c1", "d1", "alpha"), Bucket::Public, 0.9);
        retriever.add_pinned_chunk(chunk("c2", "d2", "alpha"), Bucket::Confidential, 0.95);
        let mut req = request(Role::Admin, "alpha");
        req.require_bucket = Some(Bucket::Confidential);
        let result = retriever.search(&req).await.unwrap_or_default();
        assert_eq!(result.len(), 1);
        assert_eq!(result.chunks()[0].chunk.id, "c2");
    }

    #[tokio::test]
    async fn test_fail_next_simulates_transport_errors() {
        let retriever = MemoryRetriever::new(0.7);
        retriever.add_pinned_chunk(chunk("c1", "d1", "alpha"), Bucket::Public, 0.9);
        retriever.fail_next(1);
        assert!(retriever.search(&request(Role::User, "alpha")).await.is_err());
        assert!(retriever.search(&request(Role::User, "alpha")).await.is_ok());
    }

    #[tokio::test]
    async fn test_add_document_chunks_inherit_bucket() {
        let retriever = MemoryRetriever::new(0.7);
        retriever.add_document(&Document {
            id: "d9".to_string(),
            bucket: Bucket::Confidential,
            filename: "notes.txt".to_string(),
            text: "merger timeline details\n\nescrow account figures".to_string(),
            created_at: chrono::Utc::now(),
        });
        let result = retriever
            .search(&request(Role::Admin, "merger timeline escrow"))
            .await
            .unwrap_or_default();
        assert_eq!(result.len(), 2);
        assert!(result.has_confidential());
        assert_eq!(result.confidential_document_ids(), vec!["d9"]);

        let hidden = retriever
            .search(&request(Role::User, "merger timeline escrow"))
            .await
            .unwrap_or_default();
        assert!(hidden.is_empty());
    }

    #[tokio::test]
    async fn test_limit_is_respected() {
        let retriever = MemoryRetriever::new(0.7);
        for i in 0..30 {
            retriever.add_pinned_chunk(
                chunk(&format!("c{i:02}"), "d1", "alpha"),
                Bucket::Public,
                1.0 - f64::from(i) / 100.0,
            );
        }
        let mut req = request(Role::User, "alpha");
        req.limit = 5;
        let result = retriever.search(&req).await.unwrap_or_default();
        assert_eq!(result.len(), 5);
        assert_eq!(result.chunks()[0].chunk.id, "c00");
    }
}
