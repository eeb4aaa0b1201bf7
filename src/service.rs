//! Service facade: the core's ingress surface.
//!
//! The thin API layer above this crate calls exactly these operations.
//! Every LLM egress below them flows through the router — auto-tagging,
//! smart folders, reports, or any future caller gets a backend by
//! routing a classification, not by holding a client.

use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::agent::{Orchestrator, RunHandle};
use crate::audit::{AuditRecord, AuditSink};
use crate::cache::{CacheStats, ContextCacheManager};
use crate::classify::classify;
use crate::config::EngineConfig;
use crate::core::conversation::ConversationStore;
use crate::core::{BackendId, Bucket, Principal, RunId};
use crate::error::{Error, Result};
use crate::llm::{
    CallOptions, CloudBackend, Generation, LlmBackend, LlmRouter, LocalBackend, StreamEvent, Usage,
    system_message, user_message,
};
use crate::pii;
use crate::retrieval::{RetrievalRequest, RetrievalResult, Retriever, search_with_retry};
use crate::synthesis::{SynthesisEngine, SynthesisResult};
use crate::telemetry::Telemetry;

/// Upper bound on accepted message length in bytes.
const MAX_MESSAGE_LEN: usize = 10_000;
/// Chunks retrieved as context for one chat turn.
const CHAT_CONTEXT_LIMIT: usize = 8;

/// System prompt for single-turn vault chat.
const CHAT_SYSTEM_PROMPT: &str = r"You are the assistant of a private document vault. Answer from the provided context sections when they are relevant; say so plainly when they are not. Be direct and concrete.";

/// Result of a pure content classification.
#[derive(Debug, Clone, Serialize)]
pub struct ContentClassification {
    /// Whether any regulated identifier was found.
    pub has_pii: bool,
    /// The kinds found.
    pub kinds: Vec<pii::Kind>,
}

/// One event of a chat stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ChatEvent {
    /// Incremental answer text.
    Delta {
        /// Text fragment.
        text: String,
    },
    /// Terminal event; the assistant message has been appended.
    Completed {
        /// Conversation the turn belongs to.
        conversation_id: Uuid,
        /// Backend that produced the reply.
        llm_used: BackendId,
        /// Whether the context cache was hit.
        cache_hit: bool,
        /// Token usage for the turn.
        usage: Usage,
    },
}

/// A pinned stream of chat events.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// Scope of one synthesis request.
#[derive(Debug, Clone)]
pub struct SynthesisScope {
    /// Research sub-questions keying the partial summaries.
    pub sub_questions: Vec<String>,
    /// Retrieval depth over the topic.
    pub limit: usize,
}

impl Default for SynthesisScope {
    fn default() -> Self {
        Self {
            sub_questions: Vec::new(),
            limit: 50,
        }
    }
}

/// The core's ingress surface.
pub struct VaultService {
    config: EngineConfig,
    router: Arc<LlmRouter>,
    retriever: Arc<dyn Retriever>,
    cache: Arc<ContextCacheManager>,
    audit: Arc<dyn AuditSink>,
    telemetry: Arc<Telemetry>,
    conversations: Arc<ConversationStore>,
    orchestrator: Orchestrator,
    synthesis: SynthesisEngine,
}

impl VaultService {
    /// Wires the service against the real local and cloud backends named
    /// by the configuration.
    pub fn new(
        config: EngineConfig,
        retriever: Arc<dyn Retriever>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let local: Arc<dyn LlmBackend> = Arc::new(LocalBackend::new(&config));
        let cloud: Arc<dyn LlmBackend> = Arc::new(CloudBackend::new(&config));
        Self::with_backends(config, retriever, audit, local, cloud)
    }

    /// Wires the service over explicit backends. This is the seam test
    /// harnesses and embedded deployments use.
    pub fn with_backends(
        config: EngineConfig,
        retriever: Arc<dyn Retriever>,
        audit: Arc<dyn AuditSink>,
        local: Arc<dyn LlmBackend>,
        cloud: Arc<dyn LlmBackend>,
    ) -> Self {
        let telemetry = Arc::new(Telemetry::new());
        let router = Arc::new(LlmRouter::new(
            local,
            cloud,
            Arc::clone(&telemetry),
            &config,
        ));
        let cache = Arc::new(
            ContextCacheManager::new(config.cache_max_entries, Arc::clone(&telemetry))
                .with_audit(Arc::clone(&audit)),
        );
        let orchestrator = Orchestrator::new(
            Arc::clone(&router),
            Arc::clone(&retriever),
            Arc::clone(&audit),
            Arc::clone(&telemetry),
            config.clone(),
        );
        let synthesis = SynthesisEngine::new(Arc::clone(&router), &config);

        Self {
            config,
            router,
            retriever,
            cache,
            audit,
            telemetry,
            conversations: Arc::new(ConversationStore::new()),
            orchestrator,
            synthesis,
        }
    }

    /// Aggregate health: an unreachable audit sink gates startup.
    #[must_use]
    pub fn healthy(&self) -> bool {
        self.audit.healthy()
    }

    /// Process-wide telemetry counters.
    #[must_use]
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Context cache statistics.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Reads a conversation snapshot.
    #[must_use]
    pub fn conversation(&self, id: Uuid) -> Option<crate::core::Conversation> {
        self.conversations.get(id)
    }

    /// Role-filtered hybrid search, with the mandated audit side effect
    /// when confidential content appears in the result set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for unusable queries and
    /// [`Error::RetrievalUnavailable`] after transport retries.
    pub async fn search(
        &self,
        principal: &Principal,
        query: &str,
        limit: usize,
    ) -> Result<RetrievalResult> {
        validate_text(query)?;
        let request = RetrievalRequest {
            query_text: query.to_string(),
            principal: principal.clone(),
            limit,
            require_bucket: None,
        };
        let result = search_with_retry(&*self.retriever, &request, RunId::generate()).await?;

        if result.has_confidential() {
            self.audit.record(AuditRecord::confidential_access(
                principal,
                "search",
                &result.confidential_document_ids(),
                None,
            ));
        }
        Ok(result)
    }

    /// One retrieval-augmented chat turn, token-streamed.
    ///
    /// Appends the user message immediately and the assistant message on
    /// completion, stamped with `llm_used` and `cache_hit`. A pinned
    /// context (a collection's rendered text) flows through the context
    /// cache when — and only when — the turn is public.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedInput`] for unusable messages; routing
    /// and retrieval errors propagate.
    pub async fn chat(
        &self,
        principal: &Principal,
        conversation_id: Option<Uuid>,
        message: &str,
        pinned_context: Option<&str>,
    ) -> Result<ChatStream> {
        validate_text(message)?;
        let conversation_id = conversation_id.unwrap_or_else(|| {
            self.conversations.create(&principal.id)
        });
        self.conversations
            .append_user(conversation_id, &principal.id, message);

        let request = RetrievalRequest {
            query_text: message.to_string(),
            principal: principal.clone(),
            limit: CHAT_CONTEXT_LIMIT,
            require_bucket: None,
        };
        let context = search_with_retry(&*self.retriever, &request, RunId::generate()).await?;
        let decision = classify(message, Some(&context));

        let cache_handle = match pinned_context {
            Some(prefix) if !decision.confidential => Some(
                self.cache
                    .get_or_create(prefix, Bucket::Public, self.config.cache_ttl)
                    .await?,
            ),
            _ => None,
        };

        let client = self.router.route(&decision, true, cache_handle).await?;

        if context.has_confidential() {
            self.audit.record(AuditRecord::confidential_access(
                principal,
                "collection_chat",
                &context.confidential_document_ids(),
                Some(client.backend_id()),
            ));
        }

        let mut prompt = String::new();
        if !context.is_empty() {
            prompt.push_str("## Context Sections\n\n");
            for scored in context.chunks() {
                prompt.push_str(&format!(
                    "### Chunk {} (document {})\n\n{}\n\n",
                    scored.chunk.id, scored.document_id, scored.chunk.text
                ));
            }
        }
        prompt.push_str(&format!("## Message\n\n{message}"));

        let messages = vec![system_message(CHAT_SYSTEM_PROMPT), user_message(&prompt)];
        let options = CallOptions {
            temperature: Some(0.2),
            max_tokens: Some(self.config.max_tokens_per_call),
            json_mode: false,
        };

        let generation = client.generate(messages, options).await?;
        let (tx, rx) = mpsc::channel::<Result<ChatEvent>>(32);
        let conversations = Arc::clone(&self.conversations);

        tokio::spawn(async move {
            use futures_util::StreamExt;
            match generation {
                Generation::Completed(completion) => {
                    conversations.append_assistant(
                        conversation_id,
                        &completion.text,
                        completion.llm_used,
                        completion.cache_hit,
                    );
                    let _ = tx
                        .send(Ok(ChatEvent::Completed {
                            conversation_id,
                            llm_used: completion.llm_used,
                            cache_hit: completion.cache_hit,
                            usage: completion.usage,
                        }))
                        .await;
                }
                Generation::Stream(mut stream) => {
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(StreamEvent::Delta(text)) => {
                                if tx.send(Ok(ChatEvent::Delta { text })).await.is_err() {
                                    return;
                                }
                            }
                            Ok(StreamEvent::Done(completion)) => {
                                conversations.append_assistant(
                                    conversation_id,
                                    &completion.text,
                                    completion.llm_used,
                                    completion.cache_hit,
                                );
                                let _ = tx
                                    .send(Ok(ChatEvent::Completed {
                                        conversation_id,
                                        llm_used: completion.llm_used,
                                        cache_hit: completion.cache_hit,
                                        usage: completion.usage,
                                    }))
                                    .await;
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    /// Starts a multi-agent run; events stream through the returned
    /// handle.
    pub fn run_agentic(&self, principal: &Principal, query: &str) -> RunHandle {
        self.orchestrator.start(principal.clone(), query)
    }

    /// Map–reduce synthesis over a broad topic.
    ///
    /// The audit record is written whenever confidential content was
    /// retrieved, whether or not the synthesis that followed succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SynthesisDegraded`] when over half the map phase
    /// failed; retrieval and routing errors propagate.
    pub async fn synthesize(
        &self,
        principal: &Principal,
        topic: &str,
        scope: SynthesisScope,
    ) -> Result<SynthesisResult> {
        validate_text(topic)?;
        let request = RetrievalRequest {
            query_text: topic.to_string(),
            principal: principal.clone(),
            limit: scope.limit,
            require_bucket: None,
        };
        let evidence = search_with_retry(&*self.retriever, &request, RunId::generate()).await?;

        let outcome = self
            .synthesis
            .synthesize(topic, &scope.sub_questions, &evidence)
            .await;

        if evidence.has_confidential() {
            let llm_used = outcome.as_ref().ok().map(|r| r.llm_used);
            self.audit.record(AuditRecord::confidential_access(
                principal,
                "synthesis",
                &evidence.confidential_document_ids(),
                llm_used,
            ));
        }
        outcome
    }

    /// Pure PII classification of arbitrary text. No audit side effect.
    #[must_use]
    pub fn classify_content(&self, text: &str) -> ContentClassification {
        let kinds: Vec<pii::Kind> = pii::detect_detail(text).into_iter().collect();
        ContentClassification {
            has_pii: !kinds.is_empty(),
            kinds,
        }
    }
}

impl std::fmt::Debug for VaultService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultService")
            .field("config", &self.config)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(Error::MalformedInput {
            message: "text cannot be empty".to_string(),
        });
    }
    if text.len() > MAX_MESSAGE_LEN {
        return Err(Error::MalformedInput {
            message: format!(
                "text exceeds maximum length ({} bytes, max {MAX_MESSAGE_LEN})",
                text.len()
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_text_rejects_empty() {
        assert!(validate_text("").is_err());
        assert!(validate_text("   ").is_err());
    }

    #[test]
    fn test_validate_text_rejects_oversized() {
        let big = "x".repeat(MAX_MESSAGE_LEN + 1);
        let err = validate_text(&big).unwrap_err();
        assert!(matches!(err, Error::MalformedInput { .. }));
    }

    #[test]
    fn test_validate_text_accepts_normal() {
        assert!(validate_text("where is the quarterly report?").is_ok());
    }

    #[test]
    fn test_synthesis_scope_defaults() {
        let scope = SynthesisScope::default();
        assert_eq!(scope.limit, 50);
        assert!(scope.sub_questions.is_empty());
    }
}
