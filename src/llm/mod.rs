//! LLM egress layer.
//!
//! Provider-agnostic message types, the [`LlmBackend`] trait, the two
//! concrete backends (local and cloud, both speaking the OpenAI
//! chat-completion dialect), and the [`router::LlmRouter`] — the single
//! gate every LLM call in the process goes through. There is no other
//! way to reach a backend: new callers route or they do not generate.

pub mod backend;
pub mod cloud;
pub mod local;
pub mod openai;
pub mod router;

use serde::{Deserialize, Serialize};

use crate::cache::CacheHandle;
use crate::core::BackendId;

pub use backend::{BackendStream, LlmBackend};
pub use cloud::CloudBackend;
pub use local::LocalBackend;
pub use router::{CallOptions, LlmRouter, RoutedClient};

/// Role of a chat message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message sender.
    pub role: Role,
    /// Message content.
    pub content: String,
}

/// Creates a system message.
#[must_use]
pub fn system_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::System,
        content: content.to_string(),
    }
}

/// Creates a user message.
#[must_use]
pub fn user_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: content.to_string(),
    }
}

/// Creates an assistant message.
#[must_use]
pub fn assistant_message(content: &str) -> ChatMessage {
    ChatMessage {
        role: Role::Assistant,
        content: content.to_string(),
    }
}

/// A generation request (backend-agnostic).
///
/// The model identifier is a backend concern: each backend serves the
/// model its configuration names, so callers cannot steer a request to
/// an unrouted endpoint.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Ordered conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Request JSON-formatted output.
    pub json_mode: bool,
    /// Registered prompt prefix to attach (cloud cache mechanism; the
    /// local backend inlines the prefix bytes without cache semantics).
    pub cache_handle: Option<CacheHandle>,
}

impl GenerateRequest {
    /// A plain request over the given messages.
    #[must_use]
    pub const fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
            json_mode: false,
            cache_handle: None,
        }
    }
}

/// Token usage for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u32,
    /// Prompt tokens served from the backend's prefix cache.
    pub cached_tokens: u32,
    /// Tokens generated in the completion.
    pub completion_tokens: u32,
}

impl Usage {
    /// Folds another call's usage into this one.
    pub const fn accumulate(&mut self, other: Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }
}

/// A finished generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Token usage.
    pub usage: Usage,
    /// Whether the backend served part of the prompt from its cache.
    pub cache_hit: bool,
    /// Backend that produced the text.
    pub llm_used: BackendId,
}

/// One element of a generation stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// An incremental text delta.
    Delta(String),
    /// Terminal event carrying the assembled completion.
    Done(Completion),
}

/// Either a finished completion or a token stream, depending on how the
/// client was routed.
pub enum Generation {
    /// Non-streaming result.
    Completed(Completion),
    /// Streaming result; deltas arrive in FIFO order per call.
    Stream(BackendStream),
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed(c) => f.debug_tuple("Completed").field(c).finish(),
            Self::Stream(_) => f.debug_tuple("Stream").field(&"<stream>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = system_message("You are concise.");
        assert_eq!(msg.role, Role::System);
        let msg = user_message("hello");
        assert_eq!(msg.role, Role::User);
        let msg = assistant_message("hi");
        assert_eq!(msg.role, Role::Assistant);
    }

    #[test]
    fn test_role_serialization() {
        let json = serde_json::to_string(&Role::System).unwrap_or_default();
        assert_eq!(json, "\"system\"");
    }

    #[test]
    fn test_generate_request_defaults() {
        let request = GenerateRequest::new(vec![user_message("q")]);
        assert!(request.temperature.is_none());
        assert!(request.cache_handle.is_none());
        assert!(!request.json_mode);
    }

    #[test]
    fn test_completion_serializes_backend() {
        let completion = Completion {
            text: "answer".to_string(),
            usage: Usage::default(),
            cache_hit: false,
            llm_used: BackendId::Local,
        };
        let json = serde_json::to_string(&completion).unwrap_or_default();
        assert!(json.contains("\"llm_used\":\"local\""));
    }
}
