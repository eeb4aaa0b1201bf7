//! Write-behind JSONL audit sink with hash chaining.
//!
//! Each line embeds `prev_hash` and `hash`, where the hash covers the
//! previous hash plus the serialized record; [`verify_log`] replays the
//! chain end-to-end. Records flow through a bounded queue to a single
//! writer task, so a slow disk never blocks the caller; overflow drops
//! the record, counts it, and logs at error severity.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{AuditRecord, AuditSink};
use crate::error::{Error, Result};
use crate::telemetry::Telemetry;

/// Queue depth before overflow drops records.
const QUEUE_DEPTH: usize = 1024;

/// Hash of the empty chain.
#[must_use]
pub fn genesis_hash() -> String {
    format!("sha256:{}", "0".repeat(64))
}

fn record_hash(prev_hash: &str, record_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(record_json.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ChainedLine {
    prev_hash: String,
    hash: String,
    record: AuditRecord,
}

/// Durable JSONL sink.
pub struct JsonlAuditSink {
    tx: mpsc::Sender<AuditRecord>,
    telemetry: Arc<Telemetry>,
    writer_alive: Arc<AtomicBool>,
    writer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JsonlAuditSink {
    /// Opens (or creates) the log file and starts the writer task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file cannot be opened — the
    /// caller should treat that as a startup gate.
    pub fn create(path: impl AsRef<Path>, telemetry: Arc<Telemetry>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| Error::Config {
                message: format!("cannot open audit log {}: {e}", path.as_ref().display()),
            })?;

        let (tx, mut rx) = mpsc::channel::<AuditRecord>(QUEUE_DEPTH);
        let writer_alive = Arc::new(AtomicBool::new(true));
        let alive = Arc::clone(&writer_alive);
        let writer_telemetry = Arc::clone(&telemetry);

        let writer = tokio::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);
            let mut last_hash = genesis_hash();
            while let Some(record) = rx.recv().await {
                let Ok(record_json) = serde_json::to_string(&record) else {
                    writer_telemetry.record_audit_write_failure();
                    continue;
                };
                let hash = record_hash(&last_hash, &record_json);
                let line = ChainedLine {
                    prev_hash: last_hash.clone(),
                    hash: hash.clone(),
                    record,
                };
                let Ok(mut bytes) = serde_json::to_vec(&line) else {
                    writer_telemetry.record_audit_write_failure();
                    continue;
                };
                bytes.push(b'\n');
                if let Err(e) = file.write_all(&bytes).await {
                    writer_telemetry.record_audit_write_failure();
                    tracing::error!(error = %e, "audit log write failed");
                    continue;
                }
                if file.flush().await.is_err() {
                    writer_telemetry.record_audit_write_failure();
                    continue;
                }
                last_hash = hash;
            }
            alive.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            tx,
            telemetry,
            writer_alive,
            writer: std::sync::Mutex::new(Some(writer)),
        })
    }

    /// Drains the queue and stops the writer.
    ///
    /// Dropping the last sender closes the channel; the writer finishes
    /// whatever is queued before exiting, so nothing enqueued before this
    /// call is lost.
    pub async fn shutdown(self) {
        let Self { tx, writer, .. } = self;
        drop(tx);
        let handle = writer.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.tx.try_send(record) {
            self.telemetry.record_audit_record_dropped();
            tracing::error!(error = %e, "audit queue overflow, record dropped");
        }
    }

    fn healthy(&self) -> bool {
        self.writer_alive.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Replays a log file and checks the hash chain end-to-end.
///
/// Returns the final hash of an intact chain.
///
/// # Errors
///
/// Returns [`Error::Config`] when the file cannot be read or a link in
/// the chain does not verify.
pub fn verify_log(path: impl AsRef<Path>) -> Result<String> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Config {
        message: format!("cannot read audit log: {e}"),
    })?;
    let mut expected_prev = genesis_hash();
    for (idx, raw) in content.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let line: ChainedLine = serde_json::from_str(raw).map_err(|e| Error::Config {
            message: format!("audit log line {} unparseable: {e}", idx + 1),
        })?;
        if line.prev_hash != expected_prev {
            return Err(Error::Config {
                message: format!(
                    "audit chain broken at line {}: expected prev {expected_prev}, got {}",
                    idx + 1,
                    line.prev_hash
                ),
            });
        }
        let record_json = serde_json::to_string(&line.record).map_err(|e| Error::Config {
            message: format!("audit log line {} re-serialization failed: {e}", idx + 1),
        })?;
        let computed = record_hash(&line.prev_hash, &record_json);
        if computed != line.hash {
            return Err(Error::Config {
                message: format!("audit chain hash mismatch at line {}", idx + 1),
            });
        }
        expected_prev = line.hash;
    }
    Ok(expected_prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Principal, Role};

    fn record(action: &str) -> AuditRecord {
        AuditRecord::new(
            &Principal::new("p1", Role::Admin),
            action,
            "document",
            "d1",
            serde_json::json!({"k": "v"}),
        )
    }

    #[tokio::test]
    async fn test_chain_verifies_after_writes() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("audit.jsonl");
        let telemetry = Arc::new(Telemetry::new());
        let sink = JsonlAuditSink::create(&path, Arc::clone(&telemetry))
            .unwrap_or_else(|_| unreachable!());

        sink.record(record("A"));
        sink.record(record("B"));
        sink.record(record("C"));
        sink.shutdown().await;

        let last = verify_log(&path).unwrap_or_else(|_| unreachable!());
        assert!(last.starts_with("sha256:"));
        assert_ne!(last, genesis_hash());
        assert_eq!(telemetry.snapshot().audit_write_failures, 0);
    }

    #[tokio::test]
    async fn test_tampered_log_fails_verification() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("audit.jsonl");
        let telemetry = Arc::new(Telemetry::new());
        let sink = JsonlAuditSink::create(&path, telemetry).unwrap_or_else(|_| unreachable!());
        sink.record(record("A"));
        sink.record(record("B"));
        sink.shutdown().await;

        let content = std::fs::read_to_string(&path).unwrap_or_default();
        let tampered = content.replace("\"d1\"", "\"d2\"");
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap_or_else(|_| unreachable!());

        assert!(verify_log(&path).is_err());
    }

    #[tokio::test]
    async fn test_empty_log_verifies_to_genesis() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "").unwrap_or_else(|_| unreachable!());
        let last = verify_log(&path).unwrap_or_else(|_| unreachable!());
        assert_eq!(last, genesis_hash());
    }

    #[tokio::test]
    async fn test_sink_reports_healthy_while_writer_runs() {
        let dir = tempfile::tempdir().unwrap_or_else(|_| unreachable!());
        let path = dir.path().join("audit.jsonl");
        let telemetry = Arc::new(Telemetry::new());
        let sink = JsonlAuditSink::create(&path, telemetry).unwrap_or_else(|_| unreachable!());
        assert!(sink.healthy());
        sink.shutdown().await;
    }
}
