//! Local backend: on-premises, offline-capable, privacy-preserving.
//!
//! Reached over loopback or a private network. Has no prefix cache; a
//! registered prefix attached to a request is inlined as plain prompt
//! bytes and never reported as a cache hit.

use async_trait::async_trait;
use futures_util::StreamExt;

use super::backend::{BackendStream, LlmBackend};
use super::openai::{OpenAiTransport, RawEvent};
use super::{Completion, GenerateRequest, StreamEvent, Usage};
use crate::config::EngineConfig;
use crate::core::BackendId;
use crate::error::Result;

/// The on-premises backend.
#[derive(Debug)]
pub struct LocalBackend {
    transport: OpenAiTransport,
}

impl LocalBackend {
    /// Creates the backend from engine configuration.
    ///
    /// Local servers ignore credentials; a fixed placeholder satisfies
    /// the client's constructor.
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            transport: OpenAiTransport::new(
                "local",
                Some(&config.local_backend_url),
                &config.local_model_id,
            ),
        }
    }

    fn completion(text: String, prompt_tokens: u32, completion_tokens: u32) -> Completion {
        Completion {
            text,
            usage: Usage {
                prompt_tokens,
                cached_tokens: 0,
                completion_tokens,
            },
            cache_hit: false,
            llm_used: BackendId::Local,
        }
    }
}

#[async_trait]
impl LlmBackend for LocalBackend {
    fn id(&self) -> BackendId {
        BackendId::Local
    }

    async fn healthy(&self) -> bool {
        self.transport.healthy().await
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<Completion> {
        let raw = self.transport.chat(request).await?;
        Ok(Self::completion(
            raw.text,
            raw.prompt_tokens,
            raw.completion_tokens,
        ))
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<BackendStream> {
        let stream = self.transport.chat_stream(request).await?;
        let mapped = stream.map(|item| {
            item.map(|event| match event {
                RawEvent::Delta(delta) => StreamEvent::Delta(delta),
                RawEvent::Done(raw) => StreamEvent::Done(Self::completion(
                    raw.text,
                    raw.prompt_tokens,
                    raw.completion_tokens,
                )),
            })
        });
        Ok(Box::pin(mapped))
    }
}
