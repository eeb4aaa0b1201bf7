//! Core domain types shared across the routing and synthesis engine.
//!
//! These types mirror the entities the surrounding vault system owns
//! (documents, chunks, principals) in the exact shape the core reads them.
//! The core never mutates a document or chunk; both are ingested upstream
//! and arrive here as read-only references.

pub mod conversation;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use conversation::{Conversation, ConversationStore, MessageRole, StoredMessage};

/// Coarse confidentiality label attached to a document at ingestion.
///
/// A chunk inherits the bucket of its parent document. The bucket is
/// immutable after creation and is the single content-side input to
/// routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Freely shareable content; eligible for the cloud backend and the
    /// context cache.
    Public,
    /// Regulated content; never leaves the process boundary toward the
    /// cloud backend.
    Confidential,
}

impl Bucket {
    /// Whether content in this bucket may be sent to the cloud backend.
    #[must_use]
    pub const fn cloud_eligible(self) -> bool {
        matches!(self, Self::Public)
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::Confidential => write!(f, "confidential"),
        }
    }
}

/// A specific LLM endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    /// On-premises backend; privacy-preserving, offline-capable.
    Local,
    /// External provider; context-cache-capable.
    Cloud,
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
        }
    }
}

/// Role of an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Sees public documents only.
    User,
    /// Sees public and confidential documents, read-only.
    Superuser,
    /// Sees public and confidential documents.
    Admin,
}

impl Role {
    /// Whether this role may read confidential documents.
    ///
    /// Visibility is the only role-sensitive decision in the crate.
    /// Confidentiality classification and backend routing never consult
    /// the role.
    #[must_use]
    pub const fn confidential_access(self) -> bool {
        matches!(self, Self::Superuser | Self::Admin)
    }
}

/// The authenticated actor on whose behalf an operation executes.
///
/// Owned by the auth subsystem; the core only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal identifier.
    pub id: String,
    /// Access role.
    pub role: Role,
}

impl Principal {
    /// Creates a principal with the given id and role.
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// A document as the core sees it: identity, bucket, and text.
///
/// Created by ingestion; the core never mutates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable document identifier.
    pub id: String,
    /// Confidentiality bucket, immutable after creation.
    pub bucket: Bucket,
    /// Original filename.
    pub filename: String,
    /// Extracted full text.
    pub text: String,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A bounded fragment of a document's text, with its embedding.
///
/// A chunk's bucket is always its document's bucket; chunks are created
/// with their document and never independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable chunk identifier.
    pub id: String,
    /// Parent document.
    pub document_id: String,
    /// Chunk text.
    pub text: String,
    /// Sequential position within the document (0-based).
    pub ordinal: usize,
    /// Embedding vector computed at ingestion.
    pub embedding: Vec<f32>,
}

/// Identifier of a single orchestrator run.
///
/// Doubles as the correlation id: every log line, audit record, and
/// user-visible failure produced by a run carries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generates a fresh, time-ordered run id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_cloud_eligibility() {
        assert!(Bucket::Public.cloud_eligible());
        assert!(!Bucket::Confidential.cloud_eligible());
    }

    #[test]
    fn test_role_confidential_access() {
        assert!(!Role::User.confidential_access());
        assert!(Role::Superuser.confidential_access());
        assert!(Role::Admin.confidential_access());
    }

    #[test]
    fn test_bucket_serialization() {
        let json = serde_json::to_string(&Bucket::Confidential).unwrap_or_default();
        assert_eq!(json, "\"confidential\"");
    }

    #[test]
    fn test_backend_id_display() {
        assert_eq!(BackendId::Local.to_string(), "local");
        assert_eq!(BackendId::Cloud.to_string(), "cloud");
    }

    #[test]
    fn test_run_id_is_unique_and_displayable() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }
}
