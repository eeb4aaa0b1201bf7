//! Cloud backend: external provider with prefix caching.
//!
//! The only consumer of the context cache. A request carrying a
//! [`crate::cache::CacheHandle`] sends its registered prefix byte-stable
//! at the front of the prompt; the provider reports how much of the
//! prompt it served from cache, and the hit/miss ratio is computed from
//! `cached_tokens` versus `prompt_tokens`.

use async_trait::async_trait;
use futures_util::StreamExt;

use super::backend::{BackendStream, LlmBackend};
use super::openai::{OpenAiTransport, RawCompletion, RawEvent};
use super::{Completion, GenerateRequest, StreamEvent, Usage};
use crate::config::EngineConfig;
use crate::core::BackendId;
use crate::error::Result;

/// The external provider backend.
#[derive(Debug)]
pub struct CloudBackend {
    transport: OpenAiTransport,
}

impl CloudBackend {
    /// Creates the backend from engine configuration.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            transport: OpenAiTransport::new(&config.cloud_backend_key, None, &config.cloud_model_id),
        }
    }

    fn completion(raw: RawCompletion) -> Completion {
        Completion {
            cache_hit: raw.cached_tokens > 0,
            text: raw.text,
            usage: Usage {
                prompt_tokens: raw.prompt_tokens,
                cached_tokens: raw.cached_tokens,
                completion_tokens: raw.completion_tokens,
            },
            llm_used: BackendId::Cloud,
        }
    }
}

#[async_trait]
impl LlmBackend for CloudBackend {
    fn id(&self) -> BackendId {
        BackendId::Cloud
    }

    async fn healthy(&self) -> bool {
        self.transport.healthy().await
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Completion> {
        let raw = self.transport.chat(request).await?;
        Ok(Self::completion(raw))
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<BackendStream> {
        let stream = self.transport.chat_stream(request).await?;
        let mapped = stream.map(|item| {
            item.map(|event| match event {
                RawEvent::Delta(delta) => StreamEvent::Delta(delta),
                RawEvent::Done(raw) => StreamEvent::Done(Self::completion(raw)),
            })
        });
        Ok(Box::pin(mapped))
    }
}
