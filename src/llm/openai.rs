//! Shared transport over OpenAI-compatible chat-completion endpoints.
//!
//! Both backends ride the same dialect: the cloud provider natively, the
//! local server through llama.cpp/vLLM-style compatibility. This module
//! owns request building, message conversion, and stream plumbing; the
//! backends own identity and cache semantics.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    ChatCompletionStreamOptions, CreateChatCompletionRequest, ResponseFormat,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ChatMessage, GenerateRequest, Role};
use crate::error::{Error, Result};

/// Backend-agnostic completion payload.
#[derive(Debug, Clone, Default)]
pub(crate) struct RawCompletion {
    pub text: String,
    pub prompt_tokens: u32,
    pub cached_tokens: u32,
    pub completion_tokens: u32,
}

/// One raw element of a provider stream.
#[derive(Debug, Clone)]
pub(crate) enum RawEvent {
    Delta(String),
    Done(RawCompletion),
}

/// A configured client bound to one endpoint and model.
pub(crate) struct OpenAiTransport {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiTransport {
    pub(crate) fn new(api_key: &str, base_url: Option<&str>, model: &str) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = base_url {
            config = config.with_api_base(base);
        }
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    fn convert_message(msg: &ChatMessage) -> ChatCompletionRequestMessage {
        match msg.role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: async_openai::types::ChatCompletionRequestSystemMessageContent::Text(
                        msg.content.clone(),
                    ),
                    name: None,
                })
            }
            Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: async_openai::types::ChatCompletionRequestUserMessageContent::Text(
                    msg.content.clone(),
                ),
                name: None,
            }),
            Role::Assistant => {
                #[allow(deprecated)]
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(
                        async_openai::types::ChatCompletionRequestAssistantMessageContent::Text(
                            msg.content.clone(),
                        ),
                    ),
                    name: None,
                    tool_calls: None,
                    refusal: None,
                    audio: None,
                    function_call: None,
                })
            }
        }
    }

    /// Materializes the message list, inlining a registered prefix as the
    /// leading system message. The prefix bytes are stable across calls,
    /// which is what lets a prefix-caching provider key on them.
    fn effective_messages(request: &GenerateRequest) -> Vec<ChatCompletionRequestMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(handle) = &request.cache_handle {
            messages.push(Self::convert_message(&super::system_message(
                handle.prefix(),
            )));
        }
        messages.extend(request.messages.iter().map(Self::convert_message));
        messages
    }

    fn build_request(&self, request: &GenerateRequest, stream: bool) -> CreateChatCompletionRequest {
        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages: Self::effective_messages(request),
            temperature: request.temperature.filter(|&t| t != 0.0),
            max_completion_tokens: request.max_tokens,
            stream: if stream { Some(true) } else { None },
            stream_options: stream.then_some(ChatCompletionStreamOptions {
                include_usage: true,
            }),
            response_format: request.json_mode.then_some(ResponseFormat::JsonObject),
            ..Default::default()
        }
    }

    /// Cheap reachability probe.
    pub(crate) async fn healthy(&self) -> bool {
        self.client.models().list().await.is_ok()
    }

    pub(crate) async fn chat(&self, request: &GenerateRequest) -> Result<RawCompletion> {
        let response = self
            .client
            .chat()
            .create(self.build_request(request, false))
            .await
            .map_err(|e| Error::Backend {
                message: e.to_string(),
                status: None,
            })?;

        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.as_ref())
            .cloned()
            .unwrap_or_default();

        let (prompt_tokens, cached_tokens, completion_tokens) =
            response.usage.map_or((0, 0, 0), |u| {
                (
                    u.prompt_tokens,
                    u.prompt_tokens_details
                        .and_then(|d| d.cached_tokens)
                        .unwrap_or(0),
                    u.completion_tokens,
                )
            });

        Ok(RawCompletion {
            text,
            prompt_tokens,
            cached_tokens,
            completion_tokens,
        })
    }

    /// Opens a streaming generation and forwards it through a channel.
    ///
    /// Dropping the receiver aborts the forwarding task, which closes the
    /// provider connection — that is the cancellation path.
    pub(crate) async fn chat_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<ReceiverStream<Result<RawEvent>>> {
        let mut stream = self
            .client
            .chat()
            .create_stream(self.build_request(request, true))
            .await
            .map_err(|e| Error::Backend {
                message: e.to_string(),
                status: None,
            })?;

        let (tx, rx) = mpsc::channel::<Result<RawEvent>>(32);
        tokio::spawn(async move {
            let mut text = String::new();
            let mut usage = RawCompletion::default();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        if let Some(u) = chunk.usage {
                            usage.prompt_tokens = u.prompt_tokens;
                            usage.cached_tokens = u
                                .prompt_tokens_details
                                .and_then(|d| d.cached_tokens)
                                .unwrap_or(0);
                            usage.completion_tokens = u.completion_tokens;
                        }
                        let delta = chunk
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.clone())
                            .unwrap_or_default();
                        if !delta.is_empty() {
                            text.push_str(&delta);
                            if tx.send(Ok(RawEvent::Delta(delta))).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(Error::Stream {
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                }
            }
            usage.text = text;
            let _ = tx.send(Ok(RawEvent::Done(usage))).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}

impl std::fmt::Debug for OpenAiTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiTransport")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
