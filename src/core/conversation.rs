//! In-memory conversation store.
//!
//! Conversations are append-only message logs. Each assistant message
//! records which backend produced it and whether the context cache was
//! hit, so the outer API can surface both without re-deriving them.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::BackendId;

/// Role of a stored conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Message authored by the principal.
    User,
    /// Message produced by a backend through the router.
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Who authored the message.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// Backend that produced an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_used: Option<BackendId>,
    /// Whether the context cache was hit for an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    /// When the message was appended.
    pub created_at: DateTime<Utc>,
}

/// An ordered, append-only conversation.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    /// Conversation identifier.
    pub id: Uuid,
    /// Owning principal.
    pub principal_id: String,
    /// Ordered messages, oldest first.
    pub messages: Vec<StoredMessage>,
    /// Archived conversations accept no further messages.
    pub archived: bool,
}

/// Process-wide conversation store.
///
/// The core is stateless across restarts; this store is explicitly
/// allowed to be cold-start.
#[derive(Debug, Default)]
pub struct ConversationStore {
    inner: Mutex<HashMap<Uuid, Conversation>>,
}

impl ConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation for the principal and returns its id.
    pub fn create(&self, principal_id: &str) -> Uuid {
        let id = Uuid::now_v7();
        let conversation = Conversation {
            id,
            principal_id: principal_id.to_string(),
            messages: Vec::new(),
            archived: false,
        };
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id, conversation);
        }
        id
    }

    /// Appends a user message, creating the conversation when the id is
    /// unknown (first message creates the conversation).
    pub fn append_user(&self, id: Uuid, principal_id: &str, content: &str) {
        if let Ok(mut map) = self.inner.lock() {
            let conversation = map.entry(id).or_insert_with(|| Conversation {
                id,
                principal_id: principal_id.to_string(),
                messages: Vec::new(),
                archived: false,
            });
            if conversation.archived {
                return;
            }
            conversation.messages.push(StoredMessage {
                role: MessageRole::User,
                content: content.to_string(),
                llm_used: None,
                cache_hit: None,
                created_at: Utc::now(),
            });
        }
    }

    /// Appends an assistant message stamped with its backend and cache
    /// outcome.
    pub fn append_assistant(&self, id: Uuid, content: &str, llm_used: BackendId, cache_hit: bool) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(conversation) = map.get_mut(&id) {
                if conversation.archived {
                    return;
                }
                conversation.messages.push(StoredMessage {
                    role: MessageRole::Assistant,
                    content: content.to_string(),
                    llm_used: Some(llm_used),
                    cache_hit: Some(cache_hit),
                    created_at: Utc::now(),
                });
            }
        }
    }

    /// Marks a conversation archived; further appends are ignored.
    pub fn archive(&self, id: Uuid) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(conversation) = map.get_mut(&id) {
                conversation.archived = true;
            }
        }
    }

    /// Returns a snapshot of a conversation.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Conversation> {
        self.inner.lock().ok().and_then(|map| map.get(&id).cloned())
    }
}
