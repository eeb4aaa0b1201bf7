//! Context cache for large, stable prompt prefixes.
//!
//! Amortises the cost of re-sending pinned collections and frequently
//! read folders to the cloud backend. Keys are pure content hashes;
//! entries are bound to the public bucket at creation — the cache is
//! structurally unreachable for confidential content, and a caller that
//! presents confidential-labelled content anyway fails closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::audit::{ACTION_CACHE_POLICY_VIOLATION, AuditRecord, AuditSink};
use crate::core::{Bucket, Principal, Role};
use crate::error::{Error, Result};
use crate::telemetry::Telemetry;

/// Bytes-per-token estimate used for `tokens_saved` accounting.
const BYTES_PER_TOKEN: usize = 4;
/// Truncated key length in hex characters.
const KEY_LEN: usize = 32;

/// Opaque handle to a registered prompt prefix.
///
/// Cloneable value snapshot: holders keep a consistent view even after
/// the manager evicts the entry, and the manager owns the authoritative
/// copy.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    key: String,
    prefix: Arc<str>,
    token_count: u32,
}

impl CacheHandle {
    /// Content key: `sha-256(content)` truncated to 32 hex characters.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The registered prefix bytes.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Estimated token count of the prefix.
    #[must_use]
    pub const fn token_count(&self) -> u32 {
        self.token_count
    }
}

/// Computes the cache key for a prefix.
#[must_use]
pub fn content_key(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(KEY_LEN);
    key
}

/// Monotonic cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live entries (built or building).
    pub entries: usize,
    /// Lookups that found a built entry.
    pub hits: u64,
    /// Lookups that created or joined a build.
    pub misses: u64,
    /// Prompt tokens saved by hits.
    pub tokens_saved: u64,
}

struct Slot {
    cell: Arc<OnceCell<CacheHandle>>,
    expires_at: Instant,
    last_used: Instant,
}

/// Content-addressed cache of prompt prefixes for the cloud backend.
pub struct ContextCacheManager {
    max_entries: usize,
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    tokens_saved: AtomicU64,
    telemetry: Arc<Telemetry>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl ContextCacheManager {
    /// Creates a manager with the given capacity.
    #[must_use]
    pub fn new(max_entries: usize, telemetry: Arc<Telemetry>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            tokens_saved: AtomicU64::new(0),
            telemetry,
            audit: None,
        }
    }

    /// Attaches an audit sink for policy-breach records.
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Returns a handle for the prefix, building the entry on first use.
    ///
    /// Safe under concurrent callers: at most one build per key runs at a
    /// time; simultaneous callers for the same key either all witness the
    /// built handle or all observe a miss and elect a single builder. A
    /// builder cancelled mid-flight leaves the cell empty, so the next
    /// caller re-elects — an entry is never half-built.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CachePolicyViolation`] for confidential-labelled
    /// content. The violation is logged at high severity and audited as a
    /// policy breach.
    pub async fn get_or_create(
        &self,
        content: &str,
        bucket: Bucket,
        ttl: Duration,
    ) -> Result<CacheHandle> {
        let key = content_key(content);

        if bucket == Bucket::Confidential {
            tracing::error!(key = %key, "attempt to cache confidential content refused");
            if let Some(audit) = &self.audit {
                audit.record(AuditRecord::new(
                    &Principal::new("process", Role::Admin),
                    ACTION_CACHE_POLICY_VIOLATION,
                    "cache_entry",
                    key.clone(),
                    serde_json::json!({ "action": "get_or_create" }),
                ));
            }
            return Err(Error::CachePolicyViolation { key });
        }

        let now = Instant::now();
        let (cell, was_built) = {
            let mut slots = self.slots.lock().await;
            slots.retain(|_, slot| slot.expires_at > now);

            if let Some(slot) = slots.get_mut(&key) {
                slot.last_used = now;
                (Arc::clone(&slot.cell), slot.cell.initialized())
            } else {
                if slots.len() >= self.max_entries {
                    evict_lru(&mut slots);
                }
                let cell = Arc::new(OnceCell::new());
                slots.insert(
                    key.clone(),
                    Slot {
                        cell: Arc::clone(&cell),
                        expires_at: now + ttl,
                        last_used: now,
                    },
                );
                (cell, false)
            }
        };

        if was_built {
            if let Some(handle) = cell.get() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.tokens_saved
                    .fetch_add(u64::from(handle.token_count), Ordering::Relaxed);
                self.telemetry
                    .record_cache_hit(u64::from(handle.token_count));
                return Ok(handle.clone());
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_cache_miss();

        let handle = cell
            .get_or_init(|| async {
                CacheHandle {
                    key: key.clone(),
                    prefix: Arc::from(content),
                    token_count: u32::try_from(content.len().div_ceil(BYTES_PER_TOKEN))
                        .unwrap_or(u32::MAX),
                }
            })
            .await;

        Ok(handle.clone())
    }

    /// Current statistics.
    pub async fn stats(&self) -> CacheStats {
        let entries = self.slots.lock().await.len();
        CacheStats {
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
        }
    }
}

fn evict_lru(slots: &mut HashMap<String, Slot>) {
    if let Some(oldest) = slots
        .iter()
        .min_by_key(|(_, slot)| slot.last_used)
        .map(|(key, _)| key.clone())
    {
        slots.remove(&oldest);
    }
}

impl std::fmt::Debug for ContextCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCacheManager")
            .field("max_entries", &self.max_entries)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    fn manager() -> ContextCacheManager {
        ContextCacheManager::new(8, Arc::new(Telemetry::new()))
    }

    const TTL: Duration = Duration::from_secs(3600);

    #[test]
    fn test_key_is_pure_and_truncated() {
        let a = content_key("same content");
        let b = content_key("same content");
        let c = content_key("other content");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_second_call_is_a_hit() {
        let cache = manager();
        let first = cache
            .get_or_create("pinned collection text", Bucket::Public, TTL)
            .await
            .unwrap_or_else(|_| unreachable!());
        let second = cache
            .get_or_create("pinned collection text", Bucket::Public, TTL)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(first.key(), second.key());
        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.tokens_saved, u64::from(second.token_count()));
    }

    #[tokio::test]
    async fn test_confidential_content_fails_closed_and_audits() {
        let audit = Arc::new(MemoryAuditSink::new());
        let cache = ContextCacheManager::new(8, Arc::new(Telemetry::new()))
            .with_audit(Arc::clone(&audit) as Arc<dyn AuditSink>);
        let err = cache
            .get_or_create("secret dossier", Bucket::Confidential, TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CachePolicyViolation { .. }));
        assert_eq!(audit.count_action(ACTION_CACHE_POLICY_VIOLATION), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_forces_rebuild() {
        let cache = manager();
        let _ = cache
            .get_or_create("short lived", Bucket::Public, Duration::from_secs(1))
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;
        let _ = cache
            .get_or_create("short lived", Bucket::Public, Duration::from_secs(1))
            .await;
        let stats = cache.stats().await;
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_under_pressure() {
        let cache = ContextCacheManager::new(2, Arc::new(Telemetry::new()));
        let _ = cache.get_or_create("one", Bucket::Public, TTL).await;
        let _ = cache.get_or_create("two", Bucket::Public, TTL).await;
        let _ = cache.get_or_create("three", Bucket::Public, TTL).await;
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_build() {
        let cache = Arc::new(manager());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_create("contended prefix", Bucket::Public, TTL)
                    .await
            }));
        }
        let mut keys = Vec::new();
        for handle in handles {
            let result = handle.await.unwrap_or_else(|_| unreachable!());
            keys.push(result.unwrap_or_else(|_| unreachable!()).key().to_string());
        }
        keys.dedup();
        assert_eq!(keys.len(), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.hits + stats.misses, 16);
        assert!(stats.misses >= 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_token_estimate_tracks_content_size() {
        let cache = manager();
        let content = "x".repeat(160_000);
        let handle = cache
            .get_or_create(&content, Bucket::Public, TTL)
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(handle.token_count(), 40_000);
    }
}
