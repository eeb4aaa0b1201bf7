//! Orchestrator for multi-agent runs.
//!
//! Drives one query through the pipeline as a state machine with
//! streamed events:
//!
//! ```text
//!   start ──► clarifying ──► researching ──► verifying ──► answering ──► done
//!                │               │                │              │
//!                └──────────────►├◄───────────────┴──────────────┘
//!                                ▼
//!                      failed | cancelled
//! ```
//!
//! Stages are sequential within a run; independent runs execute in
//! parallel under a process-wide semaphore. Every suspension point —
//! retrieval, generation, event emission, reply waits — accepts
//! cancellation.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::answerer::{AnswererAgent, MAX_CITATIONS, build_citations};
use super::clarifier::{ClarifierAgent, ClarifierOutcome, ResearchPlan};
use super::event::{RunEvent, RunSummary, Stage, StagePayload};
use super::prompt::{build_answerer_prompt, build_clarifier_prompt, build_verifier_prompt};
use super::run::{AgentRun, RunState};
use super::traits::{StageAgent, execute_stage};
use super::verifier::{Claim, VerifierAgent};
use crate::audit::{AuditRecord, AuditSink};
use crate::classify::classify;
use crate::config::EngineConfig;
use crate::core::{BackendId, Principal, RunId};
use crate::error::{Error, Result};
use crate::llm::{
    CallOptions, Completion, Generation, LlmRouter, StreamEvent, Usage, system_message,
    user_message,
};
use crate::retrieval::{RetrievalRequest, Retriever, merge_results, search_with_retry};
use crate::telemetry::Telemetry;

/// Upper bound on accepted query length in bytes.
const MAX_QUERY_LEN: usize = 10_000;
/// Event channel depth per run.
const EVENT_CHANNEL_DEPTH: usize = 64;
/// Reply channel depth per run.
const REPLY_CHANNEL_DEPTH: usize = 4;

/// Races a future against the run's cancellation token.
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

/// Caller-side handle to a running agent pipeline.
pub struct RunHandle {
    run_id: RunId,
    events: mpsc::Receiver<RunEvent>,
    replies: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl RunHandle {
    /// The run's correlation id.
    #[must_use]
    pub const fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Receives the next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Answers a pending follow-up question. Returns `false` when the
    /// run is no longer listening.
    pub async fn reply(&self, answer: &str) -> bool {
        self.replies.send(answer.to_string()).await.is_ok()
    }

    /// Cancels the run. The orchestrator aborts in-flight work, emits
    /// `RunCancelled`, and releases its retrieval references.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream to completion and returns every event.
    pub async fn collect(mut self) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Runs multi-agent conversations.
pub struct Orchestrator {
    router: Arc<LlmRouter>,
    retriever: Arc<dyn Retriever>,
    audit: Arc<dyn AuditSink>,
    telemetry: Arc<Telemetry>,
    config: EngineConfig,
    run_slots: Arc<Semaphore>,
}

impl Orchestrator {
    /// Creates an orchestrator; parallelism comes from
    /// `config.max_concurrent_runs`.
    pub fn new(
        router: Arc<LlmRouter>,
        retriever: Arc<dyn Retriever>,
        audit: Arc<dyn AuditSink>,
        telemetry: Arc<Telemetry>,
        config: EngineConfig,
    ) -> Self {
        let run_slots = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Self {
            router,
            retriever,
            audit,
            telemetry,
            config,
            run_slots,
        }
    }

    /// Starts a run and returns its handle. The pipeline executes on the
    /// runtime; the handle streams events and accepts replies and
    /// cancellation.
    pub fn start(&self, principal: Principal, query: impl Into<String>) -> RunHandle {
        let run_id = RunId::generate();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (replies_tx, replies_rx) = mpsc::channel(REPLY_CHANNEL_DEPTH);
        let cancel = CancellationToken::new();

        let driver = RunDriver {
            router: Arc::clone(&self.router),
            retriever: Arc::clone(&self.retriever),
            audit: Arc::clone(&self.audit),
            telemetry: Arc::clone(&self.telemetry),
            config: self.config.clone(),
            run_slots: Arc::clone(&self.run_slots),
            principal,
            query: query.into(),
            run_id,
            events: events_tx,
            replies: replies_rx,
            cancel: cancel.clone(),
            confidential_ids: Vec::new(),
            llm_used: None,
        };

        let span = tracing::info_span!("agent_run", run_id = %run_id);
        tokio::spawn(driver.drive().instrument(span));

        RunHandle {
            run_id,
            events: events_rx,
            replies: replies_tx,
            cancel,
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct RunDriver {
    router: Arc<LlmRouter>,
    retriever: Arc<dyn Retriever>,
    audit: Arc<dyn AuditSink>,
    telemetry: Arc<Telemetry>,
    config: EngineConfig,
    run_slots: Arc<Semaphore>,
    principal: Principal,
    query: String,
    run_id: RunId,
    events: mpsc::Sender<RunEvent>,
    replies: mpsc::Receiver<String>,
    cancel: CancellationToken,
    confidential_ids: Vec<String>,
    llm_used: Option<BackendId>,
}

impl RunDriver {
    async fn drive(mut self) {
        self.telemetry.record_run_started();

        if let Err(e) = self.validate_query() {
            let _ = self
                .events
                .send(RunEvent::RunFailed {
                    run_id: self.run_id,
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                })
                .await;
            self.telemetry.record_run_failed();
            return;
        }

        let permit = tokio::select! {
            () = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.run_slots).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            let _ = self
                .events
                .send(RunEvent::RunCancelled {
                    run_id: self.run_id,
                })
                .await;
            self.telemetry.record_run_cancelled();
            return;
        };

        let outcome = self.execute().await;

        // The access happened at retrieval time; the record is written
        // whether or not the synthesis that followed succeeded.
        if !self.confidential_ids.is_empty() {
            self.audit.record(AuditRecord::confidential_access(
                &self.principal,
                "multi_agent_search",
                &self.confidential_ids,
                self.llm_used,
            ));
        }

        match outcome {
            Ok(summary) => {
                let _ = self
                    .events
                    .send(RunEvent::RunCompleted { run: summary })
                    .await;
                self.telemetry.record_run_completed();
            }
            Err(Error::Cancelled) => {
                let _ = self
                    .events
                    .send(RunEvent::RunCancelled {
                        run_id: self.run_id,
                    })
                    .await;
                self.telemetry.record_run_cancelled();
            }
            Err(e) => {
                tracing::error!(run_id = %self.run_id, kind = e.kind(), error = %e, "run failed");
                let _ = self
                    .events
                    .send(RunEvent::RunFailed {
                        run_id: self.run_id,
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    })
                    .await;
                self.telemetry.record_run_failed();
            }
        }
    }

    fn validate_query(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(Error::MalformedInput {
                message: "query cannot be empty".to_string(),
            });
        }
        if self.query.len() > MAX_QUERY_LEN {
            return Err(Error::MalformedInput {
                message: format!(
                    "query exceeds maximum length ({} bytes, max {MAX_QUERY_LEN})",
                    self.query.len()
                ),
            });
        }
        Ok(())
    }

    async fn emit(&self, event: RunEvent) -> Result<()> {
        // A dropped handle means nobody is listening; treat it as
        // cancellation so resources are released promptly.
        self.events.send(event).await.map_err(|_| Error::Cancelled)
    }

    async fn execute(&mut self) -> Result<RunSummary> {
        let cancel = self.cancel.clone();
        let mut run = AgentRun::new(self.run_id, &self.query);
        let mut usage = Usage::default();

        // ---- clarifying ----
        self.emit(RunEvent::StageStarted {
            stage: Stage::Clarifying,
        })
        .await?;

        let (plan, query) = self.clarify(&cancel, &mut usage).await?;

        self.emit(RunEvent::StageDelta {
            stage: Stage::Clarifying,
            payload: StagePayload::ResearchPlan {
                sub_questions: plan.sub_questions.clone(),
            },
        })
        .await?;
        self.emit(RunEvent::StageCompleted {
            stage: Stage::Clarifying,
            summary: format!("research plan with {} sub-question(s)", plan.sub_questions.len()),
        })
        .await?;

        // ---- researching ----
        run.advance(RunState::Researching)?;
        self.emit(RunEvent::StageStarted {
            stage: Stage::Researching,
        })
        .await?;

        let evidence = self.research(&cancel, &plan).await?;
        self.confidential_ids = evidence.confidential_document_ids();

        self.emit(RunEvent::StageCompleted {
            stage: Stage::Researching,
            summary: format!("{} chunk(s) after dedup", evidence.len()),
        })
        .await?;

        // The decision over actual evidence fixes the backend for the
        // rest of the run.
        let decision = classify(&query, Some(&evidence));
        if decision.confidential {
            self.llm_used = Some(BackendId::Local);
        }

        // ---- verifying ----
        let mut claims: Vec<Claim> = Vec::new();
        let mut insufficient: Option<String> = None;

        if evidence.is_empty() {
            // The only permitted skip: nothing to verify.
            run.advance(RunState::Answering)?;
            insufficient = Some("the researcher returned zero chunks".to_string());
        } else {
            run.advance(RunState::Verifying)?;
            self.emit(RunEvent::StageStarted {
                stage: Stage::Verifying,
            })
            .await?;

            let client = self.router.route(&decision, false, None).await?;
            self.llm_used = Some(client.backend_id());
            let verifier = VerifierAgent::new();
            let user_msg = build_verifier_prompt(&query, &plan.sub_questions, &evidence);
            let completion =
                cancellable(&cancel, execute_stage(&verifier, &client, &user_msg)).await?;
            usage.accumulate(completion.usage);
            claims = VerifierAgent::parse_claims(&completion.text)?;
            let (supported, contradicted, unsupported) = VerifierAgent::tally(&claims);

            self.emit(RunEvent::StageCompleted {
                stage: Stage::Verifying,
                summary: format!(
                    "{supported} supported, {contradicted} contradicted, {unsupported} unsupported"
                ),
            })
            .await?;
            run.advance(RunState::Answering)?;
        }

        // ---- answering ----
        self.emit(RunEvent::StageStarted {
            stage: Stage::Answering,
        })
        .await?;

        let client = self.router.route(&decision, true, None).await?;
        self.llm_used = Some(client.backend_id());
        let answerer = AnswererAgent::new(self.config.max_tokens_per_call);
        let user_msg = build_answerer_prompt(&query, &claims, &evidence, insufficient.as_deref());
        let messages = vec![
            system_message(answerer.system_prompt()),
            user_message(&user_msg),
        ];
        let options = CallOptions {
            temperature: Some(answerer.temperature()),
            max_tokens: Some(answerer.max_tokens()),
            json_mode: false,
        };

        let generation = cancellable(&cancel, client.generate(messages, options)).await?;
        let completion = match generation {
            Generation::Stream(mut stream) => {
                let mut assembled: Option<Completion> = None;
                loop {
                    let item = tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        item = stream.next() => item,
                    };
                    match item {
                        None => break,
                        Some(Err(e)) => return Err(e),
                        Some(Ok(StreamEvent::Delta(text))) => {
                            self.emit(RunEvent::StageDelta {
                                stage: Stage::Answering,
                                payload: StagePayload::AnswerDelta { text },
                            })
                            .await?;
                        }
                        Some(Ok(StreamEvent::Done(completion))) => {
                            assembled = Some(completion);
                        }
                    }
                }
                assembled.ok_or_else(|| Error::Stream {
                    message: "stream closed without a terminal completion".to_string(),
                })?
            }
            Generation::Completed(completion) => completion,
        };
        usage.accumulate(completion.usage);
        self.llm_used = Some(completion.llm_used);

        let citations = build_citations(&evidence, MAX_CITATIONS);
        self.emit(RunEvent::StageCompleted {
            stage: Stage::Answering,
            summary: format!("{} citation(s)", citations.len()),
        })
        .await?;

        run.advance(RunState::Done)?;
        run.llm_used = Some(completion.llm_used);

        Ok(RunSummary {
            run_id: self.run_id,
            llm_used: completion.llm_used,
            answer: completion.text,
            citations,
            chunks_used: evidence.len(),
            claims: claims.len(),
            usage,
            insufficient_evidence: insufficient,
        })
    }

    /// Runs the clarifier loop: at most `clarify_max_rounds` follow-up
    /// questions, after which the transition to researching is forced.
    async fn clarify(
        &mut self,
        cancel: &CancellationToken,
        usage: &mut Usage,
    ) -> Result<(ResearchPlan, String)> {
        let decision = classify(&self.query, None);
        let client = self.router.route(&decision, false, None).await?;
        self.llm_used = Some(client.backend_id());
        if decision.reason == crate::classify::DecisionReason::QueryPii
            && client.backend_id() == BackendId::Local
        {
            self.telemetry.record_pii_triggered_local_routing();
        }

        let clarifier = ClarifierAgent::new();
        let max_rounds = self.config.clarify_max_rounds;
        let mut query = self.query.clone();

        for round in 0..=max_rounds {
            let user_msg = build_clarifier_prompt(&query, round, max_rounds);
            let completion =
                cancellable(cancel, execute_stage(&clarifier, &client, &user_msg)).await?;
            usage.accumulate(completion.usage);

            match ClarifierAgent::parse_outcome(&completion.text, &query)? {
                ClarifierOutcome::Plan(plan) => return Ok((plan, query)),
                ClarifierOutcome::FollowUp(question) => {
                    if round == max_rounds {
                        // Round budget exhausted: research regardless.
                        break;
                    }
                    self.emit(RunEvent::StageDelta {
                        stage: Stage::Clarifying,
                        payload: StagePayload::FollowUpQuestion {
                            question,
                            round: round + 1,
                        },
                    })
                    .await?;

                    let answer = tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        answer = self.replies.recv() => answer.ok_or(Error::Cancelled)?,
                    };
                    query = format!("{query}\n\nClarification: {answer}");
                }
            }
        }

        Ok((ResearchPlan::fallback(&query), query))
    }

    /// Retrieves evidence for every sub-question, then unions, dedups,
    /// and caps the results.
    async fn research(
        &self,
        cancel: &CancellationToken,
        plan: &ResearchPlan,
    ) -> Result<crate::retrieval::RetrievalResult> {
        let mut partials = Vec::with_capacity(plan.sub_questions.len());
        for question in &plan.sub_questions {
            let request = RetrievalRequest {
                query_text: question.clone(),
                principal: self.principal.clone(),
                limit: self.config.retrieval_limit,
                require_bucket: None,
            };
            let result = cancellable(
                cancel,
                search_with_retry(&*self.retriever, &request, self.run_id),
            )
            .await?;

            self.emit(RunEvent::StageDelta {
                stage: Stage::Researching,
                payload: StagePayload::SubQuestionSearched {
                    question: question.clone(),
                    chunks: result.len(),
                },
            })
            .await?;
            partials.push(result);
        }
        Ok(merge_results(partials, self.config.max_chunks_per_run))
    }
}
