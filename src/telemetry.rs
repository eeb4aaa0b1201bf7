//! Process-wide telemetry counters.
//!
//! All counters are atomic and monotonic for the process lifetime; no
//! external synchronisation is required to increment them. The snapshot
//! is the only read surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::classify::DecisionReason;
use crate::core::BackendId;

const REASONS: usize = 3;
const BACKENDS: usize = 2;

const fn reason_index(reason: DecisionReason) -> usize {
    match reason {
        DecisionReason::QueryPii => 0,
        DecisionReason::ChunkFromConfidentialBucket => 1,
        DecisionReason::NoSignal => 2,
    }
}

const fn backend_index(backend: BackendId) -> usize {
    match backend {
        BackendId::Local => 0,
        BackendId::Cloud => 1,
    }
}

/// Process-wide counters.
#[derive(Debug, Default)]
pub struct Telemetry {
    route_decisions: [[AtomicU64; BACKENDS]; REASONS],
    pii_triggered_local_routing: AtomicU64,
    cloud_fallbacks_to_local: AtomicU64,
    backend_timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_tokens_saved: AtomicU64,
    audit_write_failures: AtomicU64,
    audit_records_dropped: AtomicU64,
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    runs_cancelled: AtomicU64,
}

impl Telemetry {
    /// Creates a zeroed counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one routing decision.
    pub fn record_route(&self, reason: DecisionReason, backend: BackendId) {
        self.route_decisions[reason_index(reason)][backend_index(backend)]
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records a run whose query-borne PII pinned it to the local
    /// backend. Run-level: incremented once per run, not per call.
    pub fn record_pii_triggered_local_routing(&self) {
        self.pii_triggered_local_routing
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records a public call served locally because the cloud was down.
    pub fn record_cloud_fallback(&self) {
        self.cloud_fallbacks_to_local.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a backend call deadline expiry.
    pub fn record_backend_timeout(&self) {
        self.backend_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a context cache hit and the tokens it saved.
    pub fn record_cache_hit(&self, tokens_saved: u64) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.cache_tokens_saved
            .fetch_add(tokens_saved, Ordering::Relaxed);
    }

    /// Records a context cache miss.
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an audit write that failed after leaving the queue.
    pub fn record_audit_write_failure(&self) {
        self.audit_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an audit record dropped on queue overflow.
    pub fn record_audit_record_dropped(&self) {
        self.audit_records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an orchestrator run starting.
    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an orchestrator run completing.
    pub fn record_run_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an orchestrator run failing.
    pub fn record_run_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an orchestrator run cancelled by the caller.
    pub fn record_run_cancelled(&self) {
        self.runs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads one routing counter.
    #[must_use]
    pub fn route_count(&self, reason: DecisionReason, backend: BackendId) -> u64 {
        self.route_decisions[reason_index(reason)][backend_index(backend)].load(Ordering::Relaxed)
    }

    /// Reads the PII-triggered local routing counter.
    #[must_use]
    pub fn pii_triggered_local_routing(&self) -> u64 {
        self.pii_triggered_local_routing.load(Ordering::Relaxed)
    }

    /// Takes a consistent-enough snapshot of every counter.
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut route_decisions = [[0u64; BACKENDS]; REASONS];
        for (r, row) in self.route_decisions.iter().enumerate() {
            for (b, cell) in row.iter().enumerate() {
                route_decisions[r][b] = cell.load(Ordering::Relaxed);
            }
        }
        TelemetrySnapshot {
            route_decisions,
            pii_triggered_local_routing: self.pii_triggered_local_routing.load(Ordering::Relaxed),
            cloud_fallbacks_to_local: self.cloud_fallbacks_to_local.load(Ordering::Relaxed),
            backend_timeouts: self.backend_timeouts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_tokens_saved: self.cache_tokens_saved.load(Ordering::Relaxed),
            audit_write_failures: self.audit_write_failures.load(Ordering::Relaxed),
            audit_records_dropped: self.audit_records_dropped.load(Ordering::Relaxed),
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Serializable read of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Routing decisions indexed `[reason][backend]` in declaration order
    /// (`query_pii`, `chunk_from_confidential_bucket`, `no_signal`) ×
    /// (`local`, `cloud`).
    pub route_decisions: [[u64; BACKENDS]; REASONS],
    /// Runs routed locally because the query carried PII.
    pub pii_triggered_local_routing: u64,
    /// Public calls served locally because the cloud was unhealthy.
    pub cloud_fallbacks_to_local: u64,
    /// Backend calls that exceeded their deadline.
    pub backend_timeouts: u64,
    /// Context cache hits.
    pub cache_hits: u64,
    /// Context cache misses.
    pub cache_misses: u64,
    /// Prompt tokens saved by cache hits.
    pub cache_tokens_saved: u64,
    /// Audit writes that failed after dequeue.
    pub audit_write_failures: u64,
    /// Audit records dropped on queue overflow.
    pub audit_records_dropped: u64,
    /// Runs started.
    pub runs_started: u64,
    /// Runs completed.
    pub runs_completed: u64,
    /// Runs failed.
    pub runs_failed: u64,
    /// Runs cancelled.
    pub runs_cancelled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_counters_are_keyed_by_reason_and_backend() {
        let telemetry = Telemetry::new();
        telemetry.record_route(DecisionReason::NoSignal, BackendId::Cloud);
        telemetry.record_route(DecisionReason::NoSignal, BackendId::Cloud);
        telemetry.record_route(DecisionReason::QueryPii, BackendId::Local);
        assert_eq!(
            telemetry.route_count(DecisionReason::NoSignal, BackendId::Cloud),
            2
        );
        assert_eq!(
            telemetry.route_count(DecisionReason::QueryPii, BackendId::Local),
            1
        );
        assert_eq!(
            telemetry.route_count(DecisionReason::ChunkFromConfidentialBucket, BackendId::Local),
            0
        );
    }

    #[test]
    fn test_pii_routing_counter_is_run_level() {
        let telemetry = Telemetry::new();
        // Several route calls within one run, one run-level increment.
        telemetry.record_route(DecisionReason::QueryPii, BackendId::Local);
        telemetry.record_route(DecisionReason::QueryPii, BackendId::Local);
        telemetry.record_pii_triggered_local_routing();
        assert_eq!(telemetry.pii_triggered_local_routing(), 1);
    }

    #[test]
    fn test_cache_counters_accumulate() {
        let telemetry = Telemetry::new();
        telemetry.record_cache_miss();
        telemetry.record_cache_hit(40_000);
        telemetry.record_cache_hit(10_000);
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.cache_misses, 1);
        assert_eq!(snapshot.cache_tokens_saved, 50_000);
    }

    #[test]
    fn test_snapshot_serializes() {
        let telemetry = Telemetry::new();
        telemetry.record_run_started();
        let json = serde_json::to_string(&telemetry.snapshot()).unwrap_or_default();
        assert!(json.contains("\"runs_started\":1"));
    }

    #[test]
    fn test_concurrent_increments_sum() {
        let telemetry = std::sync::Arc::new(Telemetry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = std::sync::Arc::clone(&telemetry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    t.record_backend_timeout();
                }
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }
        assert_eq!(telemetry.snapshot().backend_timeouts, 8000);
    }
}
