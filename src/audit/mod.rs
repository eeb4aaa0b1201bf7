//! Audit trail for confidential access.
//!
//! The sink is best-effort in latency but must-complete in reachability:
//! a failure to record never propagates to the user-facing operation, but
//! every failure is observable through counters and logs, and an
//! unreachable sink fails the service health check.

pub mod jsonl;

use std::sync::Mutex;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{BackendId, Principal};

pub use jsonl::{JsonlAuditSink, verify_log};

/// Action recorded when a response's evidence set includes confidential
/// content.
pub const ACTION_CONFIDENTIAL_ACCESSED: &str = "CONFIDENTIAL_ACCESSED";
/// Action recorded when a caller attempts to cache confidential content.
pub const ACTION_CACHE_POLICY_VIOLATION: &str = "CACHE_POLICY_VIOLATION";

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Record identifier (time-ordered).
    pub id: Uuid,
    /// Wall-clock time, truncated to millisecond precision — concurrent
    /// writers linearise on this field.
    pub timestamp: DateTime<Utc>,
    /// Acting principal.
    pub principal_id: String,
    /// Action name, e.g. [`ACTION_CONFIDENTIAL_ACCESSED`].
    pub action: String,
    /// Kind of resource touched.
    pub resource_type: String,
    /// Primary resource id.
    pub resource_id: String,
    /// Structured detail blob.
    pub detail: serde_json::Value,
}

impl AuditRecord {
    /// Creates a record stamped now.
    pub fn new(
        principal: &Principal,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now().trunc_subsecs(3),
            principal_id: principal.id.clone(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            detail,
        }
    }

    /// The mandated record for an operation whose evidence included
    /// confidential resources.
    ///
    /// The detail blob names every involved confidential resource, the
    /// triggering action, and — when an LLM processed the content — which
    /// backend did.
    pub fn confidential_access(
        principal: &Principal,
        operation: &str,
        confidential_resource_ids: &[String],
        llm_used: Option<BackendId>,
    ) -> Self {
        let resource_id = confidential_resource_ids
            .first()
            .cloned()
            .unwrap_or_default();
        Self::new(
            principal,
            ACTION_CONFIDENTIAL_ACCESSED,
            "document",
            resource_id,
            serde_json::json!({
                "action": operation,
                "confidential_resource_ids": confidential_resource_ids,
                "llm_used": llm_used,
            }),
        )
    }
}

/// Append-only audit sink.
///
/// `record` is fire-and-forget: implementations must absorb their own
/// failures (counting and logging them) so a slow or broken sink never
/// denies a user response.
pub trait AuditSink: Send + Sync {
    /// Appends one record, best-effort.
    fn record(&self, record: AuditRecord);

    /// Whether the sink can currently accept records. A false answer
    /// should gate startup.
    fn healthy(&self) -> bool {
        true
    }
}

/// In-memory sink for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record in append order.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of records carrying the given action.
    #[must_use]
    pub fn count_action(&self, action: &str) -> usize {
        self.records
            .lock()
            .map(|r| r.iter().filter(|rec| rec.action == action).count())
            .unwrap_or(0)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;

    fn principal() -> Principal {
        Principal::new("p1", Role::Admin)
    }

    #[test]
    fn test_confidential_access_record_shape() {
        let record = AuditRecord::confidential_access(
            &principal(),
            "multi_agent_search",
            &["doc-9".to_string(), "doc-4".to_string()],
            Some(BackendId::Local),
        );
        assert_eq!(record.action, ACTION_CONFIDENTIAL_ACCESSED);
        assert_eq!(record.resource_type, "document");
        assert_eq!(record.resource_id, "doc-9");
        assert_eq!(record.detail["action"], "multi_agent_search");
        assert_eq!(record.detail["llm_used"], "local");
        assert_eq!(
            record.detail["confidential_resource_ids"]
                .as_array()
                .map(Vec::len),
            Some(2)
        );
    }

    #[test]
    fn test_timestamp_is_millisecond_truncated() {
        let record = AuditRecord::new(
            &principal(),
            "X",
            "document",
            "d1",
            serde_json::Value::Null,
        );
        assert_eq!(record.timestamp.timestamp_subsec_micros() % 1000, 0);
    }

    #[test]
    fn test_memory_sink_counts_actions() {
        let sink = MemoryAuditSink::new();
        sink.record(AuditRecord::confidential_access(
            &principal(),
            "search",
            &["d1".to_string()],
            None,
        ));
        sink.record(AuditRecord::new(
            &principal(),
            "OTHER",
            "cache",
            "k",
            serde_json::Value::Null,
        ));
        assert_eq!(sink.count_action(ACTION_CONFIDENTIAL_ACCESSED), 1);
        assert_eq!(sink.count_action("OTHER"), 1);
        assert!(sink.healthy());
    }

    #[test]
    fn test_record_ids_are_time_ordered() {
        let a = AuditRecord::new(&principal(), "A", "t", "r", serde_json::Value::Null);
        let b = AuditRecord::new(&principal(), "B", "t", "r", serde_json::Value::Null);
        assert!(a.id < b.id);
    }
}
