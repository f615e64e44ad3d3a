//! Round orchestration: one user turn becomes one traced round.
//!
//! [`RoundOrchestrator::handle_turn`] holds the conversation's exclusive
//! section for the whole round. It opens the round, records every decision as
//! an event, and closes the round before the response is returned. The
//! conversation's auth state is written in the same close, so a response is
//! never delivered for a turn whose trace was not persisted.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use roundkeeper_core::auth::{
    Authorizable, ConfirmationOutcome, MemberCheck, PendingAuthorization, ReversibleAction,
};
use roundkeeper_core::chrono::Utc;
use roundkeeper_core::config::AppConfig;
use roundkeeper_core::errors::failure_codes;
use roundkeeper_core::trace::payloads::{
    CommandExecuted, CommandReversed, ConfirmReceived, ConfirmRequested, InputNormalized,
    InputReceived, JobEnqueued, LlmRequest, LlmResponse, OutputEmitted, RoundFailed,
    RouteSelected, ToolRequest, ToolResponse, TracePayload, ValidatorRan,
};
use roundkeeper_core::trace::PromptDigest;
use roundkeeper_core::validators::{run_validators, should_retry, CoherenceValidator, OutputValidator};
use roundkeeper_core::{
    AuthGate, AuthLevel, AuthTarget, BucketLocks, CallId, CollaboratorError,
    CollaboratorErrorKind, Command, CommandCatalog, CommandChain, ConfirmationRecord,
    ConfirmationScope, ConversationAuthState, ConversationId, EventDraft, EventStatus,
    FailureClass, GateDecision, GuardState, HeaderDraft, RetryDecision, RetryEngine, RetryPolicy,
    RoundFailure, RoundId, RoundRecord, RoundStatus, StepKind, Validator, ValidatorResult,
};
use roundkeeper_db::{DecisionTraceLog, RoundHandle, TraceError};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::confirm::{prompt_text, ConfirmationPrompt, ConfirmationReply, Confirmer};
use crate::jobs::{JobQueue, JobRequest};
use crate::llm::LlmClient;
use crate::memory::BucketMemory;
use crate::prompt::build_prompt;
use crate::routing::{Route, RouteDecision, Router, RoutingInput};
use crate::secrets::SecretScanner;
use crate::tools::ToolRegistry;

const DEFAULT_CHANNEL: &str = "voice";
const STATE_TRANSITION_COMMAND: &str = "state.transition";

const CLARIFY_INCOHERENT: &str = "Sorry, I didn't catch that. Could you say it again?";
const CLARIFY_GENERATION: &str =
    "I'm having trouble answering right now. Could you ask again in a moment?";
const NOTHING_PENDING: &str = "There's nothing waiting for your confirmation.";
const NOTHING_TO_UNDO: &str = "There's nothing I can undo right now.";
const DECLINED: &str = "Okay, I won't do that.";
const TIMED_OUT: &str = "That took too long, so I stopped. Nothing else will run for it.";
const RETRY_OFFER: &str = "That action did not complete. Say yes if you want me to try it again.";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Wall-clock budget for one round, collaborator calls included.
    pub round_budget: Duration,
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub prompt_excerpt_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            round_budget: config.rounds.budget(),
            llm_timeout: config.llm.timeout(),
            tool_timeout: config.tools.timeout(),
            confirmation_timeout: config.rounds.confirmation_timeout(),
            prompt_excerpt_chars: config.rounds.prompt_excerpt_chars,
            retry: RetryPolicy::from_config(&config.llm, &config.tools),
        }
    }
}

/// External services a round may call.
#[derive(Clone)]
pub struct Collaborators {
    pub router: Arc<dyn Router>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: ToolRegistry,
    pub jobs: Arc<dyn JobQueue>,
    pub memory: Arc<dyn BucketMemory>,
    pub confirmer: Arc<dyn Confirmer>,
    pub scanner: Arc<dyn SecretScanner>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnInput {
    pub conversation_id: Option<String>,
    pub text: String,
    pub channel: String,
    pub audio_id: Option<String>,
}

impl TurnInput {
    pub fn new(conversation_id: Option<&str>, text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.map(str::to_string),
            text: text.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            audio_id: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_audio(mut self, audio_id: impl Into<String>) -> Self {
        self.audio_id = Some(audio_id.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Clarification,
    AwaitingConfirmation,
    Failed,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Clarification => "clarification",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Failed => "failed",
        }
    }
}

/// What the caller may say back. Only produced after the round is durable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TurnResponse {
    pub round_id: RoundId,
    pub round_seq: u64,
    pub conversation_id: ConversationId,
    pub outcome: TurnOutcome,
    pub status: RoundStatus,
    pub text: String,
    pub failure_code: Option<String>,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The round could not be opened or closed durably. Nothing was delivered.
    #[error("round was not recorded: {0}")]
    Durability(#[from] TraceError),
}

impl OrchestratorError {
    pub fn user_message(&self) -> &'static str {
        RoundFailure::durability("").user_message()
    }
}

struct ActiveRound {
    handle: RoundHandle,
    state: ConversationAuthState,
    channel: String,
    output_emitted: bool,
}

impl ActiveRound {
    fn round_id(&self) -> RoundId {
        self.handle.round_id().clone()
    }
}

enum Closing {
    Commit { outcome: TurnOutcome, text: String },
    Abort { status: RoundStatus, failure: RoundFailure, outcome: TurnOutcome, text: String },
}

impl Closing {
    fn completed(text: impl Into<String>) -> Self {
        Self::Commit { outcome: TurnOutcome::Completed, text: text.into() }
    }

    fn clarification(text: impl Into<String>) -> Self {
        Self::Commit { outcome: TurnOutcome::Clarification, text: text.into() }
    }

    fn abort(
        status: RoundStatus,
        failure: RoundFailure,
        outcome: TurnOutcome,
        text: impl Into<String>,
    ) -> Self {
        Self::Abort { status, failure, outcome, text: text.into() }
    }

    /// Classification and authorization failures: nothing ran.
    fn refused(failure: RoundFailure) -> Self {
        let text = failure.user_message();
        Self::abort(RoundStatus::Failed, failure, TurnOutcome::Failed, text)
    }
}

enum Authorization {
    Granted { level: AuthLevel, target: AuthTarget },
    Stopped(Closing),
}

enum Execution {
    Finished(Closing),
    /// A new pending authorization was set and must be gathered first.
    NeedsConfirmation,
}

enum StepResult {
    Done,
    Stopped(Closing),
}

#[derive(Clone, Copy)]
struct ChainPosition<'a> {
    chain: &'a CommandChain,
    index: usize,
}

pub struct RoundOrchestrator {
    log: Arc<DecisionTraceLog>,
    gate: AuthGate,
    retry: RetryEngine,
    collaborators: Collaborators,
    settings: OrchestratorSettings,
    input_validators: Vec<Box<dyn Validator>>,
    output_validator: OutputValidator,
    bucket_locks: BucketLocks,
    queued_transitions: Mutex<HashMap<String, GuardState>>,
}

impl RoundOrchestrator {
    pub fn new(
        log: Arc<DecisionTraceLog>,
        catalog: CommandCatalog,
        collaborators: Collaborators,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            log,
            gate: AuthGate::new(catalog),
            retry: RetryEngine::new(settings.retry.clone()),
            collaborators,
            settings,
            input_validators: vec![Box::new(CoherenceValidator)],
            output_validator: OutputValidator::default(),
            bucket_locks: BucketLocks::new(),
            queued_transitions: Mutex::new(HashMap::new()),
        }
    }

    pub fn trace_log(&self) -> &Arc<DecisionTraceLog> {
        &self.log
    }

    /// Queues a guard-state change requested outside a round. It is applied
    /// when the conversation's next round starts, never to one in flight.
    pub fn request_state_transition(&self, conversation_id: &ConversationId, target: GuardState) {
        self.transitions().insert(conversation_id.0.clone(), target);
        info!(
            event_name = "state.transition_queued",
            correlation_id = "bootstrap",
            conversation_id = %conversation_id,
            guard_state = target.as_str(),
            "state transition queued for next round"
        );
    }

    fn transitions(&self) -> MutexGuard<'_, HashMap<String, GuardState>> {
        match self.queued_transitions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn handle_turn(&self, input: TurnInput) -> Result<TurnResponse, OrchestratorError> {
        let conversation_id = ConversationId::normalize(input.conversation_id.as_deref());
        let lease = self.log.acquire(&conversation_id).await;

        let mut state = self.log.load_auth_state(&conversation_id).await?;
        let queued = self.transitions().remove(&conversation_id.0);
        if let Some(target) = queued {
            state.queue_transition(target);
        }
        let state_in = state.begin_round();
        let prior_round_id =
            state.pending.as_ref().and_then(|pending| pending.requested_in.clone());

        let draft = HeaderDraft::new(conversation_id.clone(), state_in)
            .with_audio(input.audio_id.clone())
            .following(prior_round_id);
        let handle = match self.log.begin_round(lease, draft).await {
            Ok(handle) => handle,
            Err(error) => {
                if let Some(target) = queued {
                    self.transitions().entry(conversation_id.0.clone()).or_insert(target);
                }
                return Err(error.into());
            }
        };

        let mut round =
            ActiveRound { handle, state, channel: input.channel.clone(), output_emitted: false };

        let budget = self.settings.round_budget;
        let driven = tokio::time::timeout(budget, self.drive(&mut round, &input)).await;
        let closing = match driven {
            Ok(Ok(closing)) => closing,
            Ok(Err(failure)) => {
                let text = failure.user_message();
                Closing::abort(RoundStatus::Failed, failure, TurnOutcome::Failed, text)
            }
            Err(_) => {
                warn!(
                    event_name = "round.timeout",
                    correlation_id = %round.handle.round_id(),
                    conversation_id = %conversation_id,
                    budget_ms = duration_ms(budget),
                    "round exceeded its budget"
                );
                Closing::abort(
                    RoundStatus::Partial,
                    RoundFailure::new(
                        FailureClass::Transient,
                        failure_codes::ROUND_TIMEOUT,
                        "round exceeded its time budget",
                    ),
                    TurnOutcome::Failed,
                    TIMED_OUT,
                )
            }
        };

        self.finish(round, closing).await
    }

    async fn finish(&self, round: ActiveRound, closing: Closing) -> Result<TurnResponse, OrchestratorError> {
        let (record, outcome, text) = match closing {
            Closing::Commit { outcome, text } => {
                let ActiveRound { handle, state, channel, output_emitted } = round;
                let state_out = state.state_out();
                match self.log.commit(handle, RoundStatus::Ok, state_out, Some(state.clone())).await {
                    Ok(record) => (record, outcome, text),
                    Err(TraceError::Unresolved { steps, handle, .. }) => {
                        let failure = if steps.iter().any(|step| step.starts_with("confirm:")) {
                            RoundFailure::authorization(
                                failure_codes::AWAITING_CONFIRMATION,
                                "round ended while a confirmation was outstanding",
                            )
                        } else {
                            RoundFailure::new(
                                FailureClass::Transient,
                                failure_codes::ROUND_INCOMPLETE,
                                "round ended with a step still unanswered",
                            )
                        };
                        let round = ActiveRound { handle: *handle, state, channel, output_emitted };
                        let record =
                            self.abort_round(round, RoundStatus::Partial, &failure, &text).await?;
                        (record, outcome, text)
                    }
                    Err(TraceError::CloseFailed { handle, source, .. }) => {
                        warn!(
                            event_name = "round.commit_failed",
                            correlation_id = %handle.round_id(),
                            conversation_id = %handle.conversation_id(),
                            error = %source,
                            "commit did not reach storage, closing the round as failed"
                        );
                        let failure = RoundFailure::durability("round commit did not reach storage");
                        let text = failure.user_message();
                        // The committed answer was never delivered; record the one that is.
                        let round =
                            ActiveRound { handle: *handle, state, channel, output_emitted: false };
                        let record = self.abort_round(round, RoundStatus::Failed, &failure, text).await?;
                        (record, TurnOutcome::Failed, text.to_string())
                    }
                    Err(error) => return Err(error.into()),
                }
            }
            Closing::Abort { status, failure, outcome, text } => {
                let record = self.abort_round(round, status, &failure, &text).await?;
                (record, outcome, text)
            }
        };

        let header = record.header;
        {
            let _bucket = self.bucket_locks.acquire(&header.bucket_id).await;
            let invalidated = bounded(
                self.settings.tool_timeout,
                "memory.timeout",
                self.collaborators.memory.invalidate(&header.bucket_id, &header.round_id),
            )
            .await;
            if let Err(error) = invalidated {
                warn!(
                    event_name = "memory.invalidate_failed",
                    correlation_id = %header.round_id,
                    conversation_id = %header.conversation_id,
                    error_code = %error.code,
                    "bucket memory invalidation failed"
                );
            }
        }

        info!(
            event_name = "round.turn_answered",
            correlation_id = %header.round_id,
            conversation_id = %header.conversation_id,
            outcome = outcome.as_str(),
            status = header.status.as_str(),
            "turn answered"
        );

        Ok(TurnResponse {
            round_id: header.round_id,
            round_seq: header.round_seq,
            conversation_id: header.conversation_id,
            outcome,
            status: header.status,
            text,
            failure_code: header.failure_code,
        })
    }

    /// Records `round.failed`, and the spoken text if none was recorded yet,
    /// then closes the round with the failure.
    async fn abort_round(
        &self,
        mut round: ActiveRound,
        status: RoundStatus,
        failure: &RoundFailure,
        text: &str,
    ) -> Result<RoundRecord, OrchestratorError> {
        let failed = RoundFailed {
            failure_code: failure.code.clone(),
            failure_reason: failure.reason.clone(),
            failure_class: failure.class,
        };
        if let Err(error) = self.record_payload(&mut round, &failed) {
            warn!(
                event_name = "round.failed_not_recorded",
                correlation_id = %round.handle.round_id(),
                error = %error,
                "round.failed event could not be appended"
            );
        }
        if !round.output_emitted {
            if let Err(error) = self.emit_output(&mut round, text, false, None, Some(&failure.code)) {
                debug!(correlation_id = %round.handle.round_id(), error = %error, "failure output not recorded");
            }
        }

        let ActiveRound { handle, state, .. } = round;
        match self.log.abort(handle, status, &failure.code, &failure.reason, Some(state.clone())).await {
            Err(TraceError::CloseFailed { handle, source, .. }) => {
                warn!(
                    event_name = "round.close_retry",
                    correlation_id = %handle.round_id(),
                    conversation_id = %handle.conversation_id(),
                    error = %source,
                    "round close failed, retrying once"
                );
                Ok(self.log.abort(*handle, status, &failure.code, &failure.reason, Some(state)).await?)
            }
            closed => Ok(closed?),
        }
    }

    async fn drive(&self, round: &mut ActiveRound, input: &TurnInput) -> Result<Closing, RoundFailure> {
        let scrubbed = self.collaborators.scanner.scrub(&input.text);
        self.record_payload(
            round,
            &InputReceived {
                raw_text: scrubbed.text.clone(),
                channel: round.channel.clone(),
                audio_id: input.audio_id.clone(),
            },
        )?;

        let normalized = normalize_text(&scrubbed.text);
        self.record_payload(
            round,
            &InputNormalized { normalized_text: normalized.clone(), secret_refs: scrubbed.refs },
        )?;

        let results = run_validators(&self.input_validators, &normalized);
        for result in &results {
            self.record_validator(round, result, "input")?;
        }
        if let Some(blocking) = RetryEngine::input_short_circuit(&results) {
            debug!(
                correlation_id = %round.handle.round_id(),
                validator_code = %blocking.code,
                "input answered with clarification"
            );
            self.emit_output(round, CLARIFY_INCOHERENT, false, None, Some(failure_codes::INPUT_INCOHERENT))?;
            return Ok(Closing::clarification(CLARIFY_INCOHERENT));
        }

        let conversation_id = round.handle.conversation_id().clone();
        let routing_input = RoutingInput {
            conversation_id: &conversation_id,
            text: &normalized,
            state: round.handle.state_in(),
            awaiting_confirmation: round.state.pending.is_some(),
        };
        let routed = bounded(
            self.settings.tool_timeout,
            "route.timeout",
            self.collaborators.router.route(&routing_input),
        )
        .await;
        let decision = match routed {
            Ok(decision) => decision,
            Err(error) => {
                warn!(
                    event_name = "route.failed",
                    correlation_id = %round.handle.round_id(),
                    conversation_id = %conversation_id,
                    error_code = %error.code,
                    "router did not return a route"
                );
                return Ok(Closing::refused(RoundFailure::classification(
                    failure_codes::ROUTER_FAILED,
                    format!("router error `{}`", error.code),
                )));
            }
        };

        debug!(
            event_name = "route.decided",
            correlation_id = %round.handle.round_id(),
            route_code = decision.route.code(),
            source_rule = %decision.source_rule,
            "route decided"
        );

        match decision.route.clone() {
            Route::Chat => {
                self.record_route(round, &decision, AuthLevel::Immediate, |_| {})?;
                self.generate(round, &normalized).await
            }
            Route::Research { query } => {
                self.record_route(round, &decision, AuthLevel::Immediate, |_| {})?;
                self.enqueue_job(round, decision.topic.clone(), query, None).await
            }
            Route::Command(command) => self.run_command_route(round, &decision, command).await,
            Route::Chain(chain) => self.run_chain_route(round, &decision, chain).await,
            Route::Confirm { accepted } => self.resume_pending(round, &decision, accepted).await,
            Route::Undo { command_id } => self.undo(round, &decision, command_id).await,
            Route::StateTransition { target } => {
                self.record_route(round, &decision, AuthLevel::Immediate, |_| {})?;
                round.state.queue_transition(target);
                let mut executed = CommandExecuted::new(STATE_TRANSITION_COMMAND, EventStatus::Ok);
                executed.auth_level = Some(AuthLevel::Immediate);
                executed.result = Some(json!({ "target": target.as_str() }));
                executed.effective = Some("next_round");
                self.record_payload(round, &executed)?;
                let text = format!("Switching to {} mode from your next request.", target.as_str());
                self.emit_output(round, &text, false, None, None)?;
                Ok(Closing::completed(text))
            }
            Route::Ambiguous { candidates } => {
                self.record_route(round, &decision, AuthLevel::Immediate, |selected| {
                    selected.candidates = candidates.clone();
                })?;
                Ok(Closing::refused(RoundFailure::classification(
                    failure_codes::AMBIGUOUS_ROUTE,
                    format!("{} candidate routes", candidates.len()),
                )))
            }
        }
    }

    async fn generate(&self, round: &mut ActiveRound, text: &str) -> Result<Closing, RoundFailure> {
        let state = round.handle.state_in();
        let bucket_id = round.handle.header().bucket_id.clone();
        let context = match bounded(
            self.settings.tool_timeout,
            "memory.timeout",
            self.collaborators.memory.context(&bucket_id),
        )
        .await
        {
            Ok(lines) => lines,
            Err(error) => {
                warn!(
                    event_name = "memory.context_failed",
                    correlation_id = %round.handle.round_id(),
                    error_code = %error.code,
                    "bucket memory unavailable, generating without context"
                );
                Vec::new()
            }
        };

        let prompt = build_prompt(state, &context, text);
        let digest = PromptDigest::of(&prompt, self.settings.prompt_excerpt_chars);
        let model = self.collaborators.llm.model().to_string();

        loop {
            let attempt = RetryEngine::generation_attempts(round.handle.events()) + 1;
            let call_id = CallId::generate();
            let request = LlmRequest {
                model: model.clone(),
                prompt_hash: digest.hash.clone(),
                prompt_head: digest.head.clone(),
                prompt_tail: digest.tail.clone(),
                truncated: digest.truncated,
                attempt,
            };
            self.record(round, draft_of(&request)?.with_call_id(call_id.clone()))?;

            let started = Instant::now();
            let generated = bounded(
                self.settings.llm_timeout,
                "llm.timeout",
                self.collaborators.llm.generate(&prompt),
            )
            .await;
            let latency_ms = elapsed_ms(started);

            let error = match generated {
                Ok(output) => {
                    let response = LlmResponse {
                        model: model.clone(),
                        latency_ms,
                        text: output.text.clone(),
                        usage: output.usage.filter(Value::is_object),
                        truncated: None,
                        attempt,
                        error_code: None,
                    };
                    self.record(round, draft_of(&response)?.with_call_id(call_id))?;

                    match self.check_output(round, state, &output.text)? {
                        None => {
                            let retry_count = (attempt > 1).then(|| attempt - 1);
                            self.emit_output(round, &output.text, false, retry_count, None)?;
                            return Ok(Closing::completed(output.text));
                        }
                        Some(error) => error,
                    }
                }
                Err(error) => {
                    let response = LlmResponse {
                        model: model.clone(),
                        latency_ms,
                        text: String::new(),
                        usage: None,
                        truncated: None,
                        attempt,
                        error_code: Some(error.code.clone()),
                    };
                    self.record(
                        round,
                        draft_of(&response)?
                            .with_call_id(call_id)
                            .failed(error.code.clone(), error.kind.as_str()),
                    )?;
                    error
                }
            };

            match self.retry.decide(StepKind::Generation, &error, attempt, state) {
                RetryDecision::Retry { next_attempt, backoff } => {
                    debug!(
                        event_name = "llm.retry_scheduled",
                        correlation_id = %round.handle.round_id(),
                        next_attempt,
                        backoff_ms = duration_ms(backoff),
                        error_code = %error.code,
                        "retrying generation"
                    );
                    tokio::time::sleep(backoff).await;
                }
                RetryDecision::Clarify { reason_code, attempts } => {
                    self.emit_output(round, CLARIFY_GENERATION, true, Some(attempts), Some(reason_code))?;
                    return Ok(Closing::abort(
                        RoundStatus::Partial,
                        RoundFailure::new(
                            FailureClass::Transient,
                            reason_code,
                            format!("generation stopped after {attempts} attempt(s)"),
                        ),
                        TurnOutcome::Clarification,
                        CLARIFY_GENERATION,
                    ));
                }
                RetryDecision::EscalateToJob { reason_code } => {
                    return self.enqueue_job(round, None, text.to_string(), Some(reason_code)).await;
                }
                RetryDecision::RequireConfirmation { reason_code }
                | RetryDecision::Fail { failure_code: reason_code, .. } => {
                    let failure = RoundFailure::new(FailureClass::Transient, reason_code, "generation failed");
                    let text = failure.user_message();
                    return Ok(Closing::abort(RoundStatus::Partial, failure, TurnOutcome::Failed, text));
                }
            }
        }
    }

    /// Output checks apply in the action state only. A retry verdict is
    /// treated like malformed output.
    fn check_output(
        &self,
        round: &mut ActiveRound,
        state: GuardState,
        text: &str,
    ) -> Result<Option<CollaboratorError>, RoundFailure> {
        if state != GuardState::Action {
            return Ok(None);
        }
        let result = self.output_validator.validate(text);
        self.record_validator(round, &result, "llm.response")?;
        if should_retry(std::slice::from_ref(&result)) {
            return Ok(Some(CollaboratorError::new(
                CollaboratorErrorKind::MalformedOutput,
                result.code,
                "generated output failed validation",
            )));
        }
        Ok(None)
    }

    async fn enqueue_job(
        &self,
        round: &mut ActiveRound,
        topic: Option<String>,
        query: String,
        escalated_by: Option<&'static str>,
    ) -> Result<Closing, RoundFailure> {
        let request = JobRequest {
            round_id: round.round_id(),
            conversation_id: round.handle.conversation_id().clone(),
            topic: topic.clone(),
            query: query.clone(),
        };
        let state = round.handle.state_in();

        let mut attempts = 0;
        loop {
            attempts += 1;
            let enqueued = bounded(
                self.settings.tool_timeout,
                "job.timeout",
                self.collaborators.jobs.enqueue(request.clone()),
            )
            .await;

            match enqueued {
                Ok(job_id) => {
                    self.record_payload(
                        round,
                        &JobEnqueued { job_id: job_id.clone(), topic, query: Some(query) },
                    )?;
                    info!(
                        event_name = "job.enqueued",
                        correlation_id = %round.handle.round_id(),
                        job_id = %job_id,
                        escalated = escalated_by.is_some(),
                        "background job enqueued"
                    );
                    let text = if escalated_by.is_some() {
                        "That needs more digging. I've started a background job and will report back."
                    } else {
                        "I've started looking into that and will report back."
                    };
                    self.emit_output(round, text, escalated_by.is_some(), None, escalated_by)?;
                    return Ok(Closing::completed(text));
                }
                Err(error) => match self.retry.decide(StepKind::Job, &error, attempts, state) {
                    RetryDecision::Retry { backoff, .. } => tokio::time::sleep(backoff).await,
                    _ => {
                        let failure = RoundFailure::new(
                            FailureClass::Transient,
                            failure_codes::JOB_FAILED,
                            format!("job queue error `{}`", error.code),
                        );
                        let text = failure.user_message();
                        return Ok(Closing::abort(RoundStatus::Partial, failure, TurnOutcome::Failed, text));
                    }
                },
            }
        }
    }

    async fn run_command_route(
        &self,
        round: &mut ActiveRound,
        decision: &RouteDecision,
        command: Command,
    ) -> Result<Closing, RoundFailure> {
        let level = self.gate.required_level(Authorizable::Command(&command));
        let recorded_level = level.as_ref().copied().unwrap_or(command.auth_level);
        self.record_route(round, decision, recorded_level, |selected| {
            selected.command_id = Some(command.command_id.clone());
        })?;

        let level = match level {
            Ok(level) => level,
            Err(error) => {
                return Ok(Closing::refused(RoundFailure::classification(
                    error.failure_code(),
                    error.to_string(),
                )))
            }
        };

        let scope = ConfirmationScope::Command(command.command_id.clone());
        self.start_authorization(round, scope, level, AuthTarget::Command { command }).await
    }

    async fn run_chain_route(
        &self,
        round: &mut ActiveRound,
        decision: &RouteDecision,
        chain: CommandChain,
    ) -> Result<Closing, RoundFailure> {
        let level = self.gate.required_level(Authorizable::Chain(&chain));
        let recorded_level = level.as_ref().copied().unwrap_or_else(|_| chain.chain_level());
        self.record_route(round, decision, recorded_level, |selected| {
            selected.chain_id = Some(chain.chain_id.clone());
            selected.macro_id = chain.macro_id.clone();
        })?;

        let level = match level {
            Ok(level) => level,
            Err(error) => {
                return Ok(Closing::refused(RoundFailure::classification(
                    error.failure_code(),
                    error.to_string(),
                )))
            }
        };

        let scope = ConfirmationScope::Chain(chain.chain_id.clone());
        self.start_authorization(round, scope, level, AuthTarget::Chain { chain, next_member: 0 })
            .await
    }

    async fn resume_pending(
        &self,
        round: &mut ActiveRound,
        decision: &RouteDecision,
        accepted: bool,
    ) -> Result<Closing, RoundFailure> {
        let Some(pending) = round.state.pending.clone() else {
            self.record_route(round, decision, AuthLevel::Immediate, |_| {})?;
            self.emit_output(round, NOTHING_PENDING, false, None, None)?;
            return Ok(Closing::clarification(NOTHING_PENDING));
        };

        self.record_route(round, decision, pending.level, |selected| match &pending.scope {
            ConfirmationScope::Command(id) => selected.command_id = Some(id.clone()),
            ConfirmationScope::Chain(id) => selected.chain_id = Some(id.clone()),
        })?;

        let step = pending.accepted_count() + 1;
        let confirmation_id = format!("{}:{step}", round.handle.round_id());
        let channel = round.channel.clone();
        if let Some(closing) =
            self.apply_confirmation(round, &pending, step, confirmation_id, channel, accepted)?
        {
            return Ok(closing);
        }
        self.authorize_loop(round).await
    }

    async fn undo(
        &self,
        round: &mut ActiveRound,
        decision: &RouteDecision,
        command_id: Option<String>,
    ) -> Result<Closing, RoundFailure> {
        let reversible = round.state.last_reversible.clone().filter(|last| {
            command_id.as_deref().map_or(true, |requested| requested == last.command_id)
        });
        let Some(last) = reversible else {
            self.record_route(round, decision, AuthLevel::Immediate, |selected| {
                selected.command_id = command_id.clone();
            })?;
            self.emit_output(round, NOTHING_TO_UNDO, false, None, None)?;
            return Ok(Closing::clarification(NOTHING_TO_UNDO));
        };

        // An objection turns the reversal into a confirm-gated action.
        self.record_route(round, decision, AuthLevel::Confirmed, |selected| {
            selected.command_id = Some(last.command_id.clone());
        })?;
        let scope = ConfirmationScope::Command(last.command_id.clone());
        let target = AuthTarget::Reversal { command_id: last.command_id, inputs: last.inputs };
        self.start_authorization(round, scope, AuthLevel::Confirmed, target).await
    }

    async fn start_authorization(
        &self,
        round: &mut ActiveRound,
        scope: ConfirmationScope,
        level: AuthLevel,
        target: AuthTarget,
    ) -> Result<Closing, RoundFailure> {
        if self.gate.gate(level, &[]) == GateDecision::Proceed {
            match self.execute_target(round, level, target).await? {
                Execution::Finished(closing) => return Ok(closing),
                Execution::NeedsConfirmation => {}
            }
        } else {
            let pending = PendingAuthorization::new(scope, level, target, round.round_id());
            round.state.pending = Some(pending);
        }
        self.authorize_loop(round).await
    }

    async fn authorize_loop(&self, round: &mut ActiveRound) -> Result<Closing, RoundFailure> {
        loop {
            match self.await_authorization(round).await? {
                Authorization::Stopped(closing) => return Ok(closing),
                Authorization::Granted { level, target } => {
                    match self.execute_target(round, level, target).await? {
                        Execution::Finished(closing) => return Ok(closing),
                        Execution::NeedsConfirmation => continue,
                    }
                }
            }
        }
    }

    /// Gathers confirmations for the pending authorization until it is
    /// granted, declined, or has to wait for a later turn.
    async fn await_authorization(&self, round: &mut ActiveRound) -> Result<Authorization, RoundFailure> {
        loop {
            let Some(pending) = round.state.pending.clone() else {
                self.emit_output(round, NOTHING_PENDING, false, None, None)?;
                return Ok(Authorization::Stopped(Closing::clarification(NOTHING_PENDING)));
            };

            match self.gate.gate(pending.level, &pending.confirmations) {
                GateDecision::Proceed => {
                    round.state.pending = None;
                    return Ok(Authorization::Granted { level: pending.level, target: pending.target });
                }
                GateDecision::Blocked { reason_code } => {
                    round.state.pending = None;
                    self.record_declined(round, &pending, reason_code)?;
                    self.emit_output(round, DECLINED, false, None, Some(reason_code))?;
                    return Ok(Authorization::Stopped(Closing::completed(DECLINED)));
                }
                GateDecision::AwaitConfirmation { next_step, .. } => {
                    if let Some(closing) = self.request_confirmation(round, &pending, next_step).await? {
                        return Ok(Authorization::Stopped(closing));
                    }
                }
            }
        }
    }

    async fn request_confirmation(
        &self,
        round: &mut ActiveRound,
        pending: &PendingAuthorization,
        step: u8,
    ) -> Result<Option<Closing>, RoundFailure> {
        let round_id = round.round_id();
        let mut requested = ConfirmRequested::new(&pending.scope, pending.level, step);
        requested.target = Some(pending.target.code().to_string());
        requested.prior_round_id = pending
            .requested_in
            .as_ref()
            .filter(|requested_in| **requested_in != round_id)
            .map(|requested_in| requested_in.0.clone());
        let steps_required = requested.steps_required;
        self.record_payload(round, &requested)?;

        let prompt = ConfirmationPrompt {
            round_id,
            conversation_id: round.handle.conversation_id().clone(),
            scope: pending.scope.clone(),
            auth_level: pending.level,
            step,
            steps_required,
            text: prompt_text(pending.scope.id(), step, steps_required),
        };
        let reply = bounded(
            self.settings.confirmation_timeout,
            "confirm.timeout",
            self.collaborators.confirmer.confirm(&prompt),
        )
        .await;

        match reply {
            Ok(ConfirmationReply::Accepted { confirmation_id, channel }) => {
                self.apply_confirmation(round, pending, step, confirmation_id, channel, true)
            }
            Ok(ConfirmationReply::Rejected { confirmation_id, channel }) => {
                self.apply_confirmation(round, pending, step, confirmation_id, channel, false)
            }
            Ok(ConfirmationReply::Deferred) => {
                self.emit_output(round, &prompt.text, false, None, Some(failure_codes::AWAITING_CONFIRMATION))?;
                Ok(Some(Closing::abort(
                    RoundStatus::Partial,
                    RoundFailure::authorization(
                        failure_codes::AWAITING_CONFIRMATION,
                        "confirmation deferred to a later turn",
                    ),
                    TurnOutcome::AwaitingConfirmation,
                    prompt.text,
                )))
            }
            Err(error) => {
                warn!(
                    event_name = "confirm.unavailable",
                    correlation_id = %round.handle.round_id(),
                    error_code = %error.code,
                    "confirmation channel unavailable, authorization stays pending"
                );
                self.emit_output(
                    round,
                    &prompt.text,
                    false,
                    None,
                    Some(failure_codes::CONFIRMATION_UNAVAILABLE),
                )?;
                Ok(Some(Closing::abort(
                    RoundStatus::Partial,
                    RoundFailure::authorization(
                        failure_codes::CONFIRMATION_UNAVAILABLE,
                        format!("confirmer error `{}`", error.code),
                    ),
                    TurnOutcome::AwaitingConfirmation,
                    prompt.text,
                )))
            }
        }
    }

    /// Adds one confirmation to the pending authorization. Anything that does
    /// not match it clears the authorization and ends the round.
    fn apply_confirmation(
        &self,
        round: &mut ActiveRound,
        pending: &PendingAuthorization,
        step: u8,
        confirmation_id: String,
        channel: String,
        accepted: bool,
    ) -> Result<Option<Closing>, RoundFailure> {
        let round_id = round.round_id();
        let record = ConfirmationRecord {
            confirmation_id: confirmation_id.clone(),
            scope: pending.scope.clone(),
            auth_level: pending.level,
            step,
            confirmed: accepted,
            channel: channel.clone(),
            round_id: round_id.clone(),
            received_at: Utc::now(),
        };

        let mismatch = match self.gate.record_confirmation(&mut round.state, record) {
            Ok(ConfirmationOutcome::Recorded) => {
                let mut received = ConfirmReceived::new(
                    &pending.scope,
                    pending.level,
                    step,
                    confirmation_id,
                    accepted,
                    channel,
                );
                received.prior_round_id = pending
                    .requested_in
                    .as_ref()
                    .filter(|requested_in| **requested_in != round_id)
                    .map(|requested_in| requested_in.0.clone());
                self.record_payload(round, &received)?;
                return Ok(None);
            }
            Ok(ConfirmationOutcome::Duplicate) => RoundFailure::authorization(
                failure_codes::CONFIRMATION_MISMATCH,
                "confirmation was already used",
            ),
            Err(error) => RoundFailure::authorization(error.failure_code(), error.to_string()),
        };

        warn!(
            event_name = "auth.confirmation_rejected",
            correlation_id = %round_id,
            conversation_id = %round.handle.conversation_id(),
            failure_code = %mismatch.code,
            "confirmation did not match the pending authorization"
        );
        round.state.pending = None;
        Ok(Some(Closing::refused(mismatch)))
    }

    fn record_declined(
        &self,
        round: &mut ActiveRound,
        pending: &PendingAuthorization,
        reason_code: &str,
    ) -> Result<(), RoundFailure> {
        match &pending.target {
            AuthTarget::Reversal { command_id, .. } => self.record_payload(
                round,
                &CommandReversed {
                    command_id: command_id.clone(),
                    status: EventStatus::Skipped,
                    reason_code: Some(reason_code.to_string()),
                },
            ),
            AuthTarget::Command { command } | AuthTarget::ReExecution { command, .. } => {
                let mut skipped = CommandExecuted::new(&command.command_id, EventStatus::Skipped);
                skipped.auth_level = Some(pending.level);
                self.record_payload(round, &skipped)
            }
            AuthTarget::Chain { chain, next_member } => {
                let command_id = chain
                    .members
                    .get(*next_member)
                    .map_or_else(|| chain.chain_id.clone(), |member| member.command_id.clone());
                let mut skipped = CommandExecuted::new(command_id, EventStatus::Skipped);
                skipped.auth_level = Some(pending.level);
                skipped.chain_id = Some(chain.chain_id.clone());
                self.record_payload(round, &skipped)
            }
        }
    }

    async fn execute_target(
        &self,
        round: &mut ActiveRound,
        level: AuthLevel,
        target: AuthTarget,
    ) -> Result<Execution, RoundFailure> {
        match target {
            AuthTarget::Command { command } => {
                match self.execute_command(round, &command, level, None, None).await? {
                    StepResult::Done => Ok(Execution::Finished(self.done(round, &command.command_id)?)),
                    StepResult::Stopped(closing) => Ok(Execution::Finished(closing)),
                }
            }
            AuthTarget::ReExecution { command, lineage } => {
                match self.execute_command(round, &command, level, None, Some(lineage)).await? {
                    StepResult::Done => Ok(Execution::Finished(self.done(round, &command.command_id)?)),
                    StepResult::Stopped(closing) => Ok(Execution::Finished(closing)),
                }
            }
            AuthTarget::Chain { chain, next_member } => {
                self.run_chain(round, &chain, level, next_member).await
            }
            AuthTarget::Reversal { command_id, inputs } => {
                self.reverse(round, &command_id, inputs).await.map(Execution::Finished)
            }
        }
    }

    fn done(&self, round: &mut ActiveRound, label: &str) -> Result<Closing, RoundFailure> {
        let text = format!("Done: {label}.");
        self.emit_output(round, &text, false, None, None)?;
        Ok(Closing::completed(text))
    }

    /// Runs chain members from `start`. Every member after the first one run
    /// here is re-checked; a member that needs more than was authorized turns
    /// the rest of the chain into a new pending authorization.
    async fn run_chain(
        &self,
        round: &mut ActiveRound,
        chain: &CommandChain,
        authorized: AuthLevel,
        start: usize,
    ) -> Result<Execution, RoundFailure> {
        for index in start..chain.members.len() {
            let member = &chain.members[index];

            if index > start {
                match self.gate.check_member(authorized, member) {
                    Ok(MemberCheck::Proceed) => {}
                    Ok(MemberCheck::Reconfirm { reason_code }) => {
                        let member_level = self
                            .gate
                            .required_level(Authorizable::Command(member))
                            .unwrap_or(authorized);
                        let level = authorized.max(member_level).max(AuthLevel::Confirmed);
                        info!(
                            event_name = "chain.reconfirm",
                            correlation_id = %round.handle.round_id(),
                            chain_id = %chain.chain_id,
                            member = index,
                            reason_code,
                            "chain member needs a fresh confirmation"
                        );
                        round.state.pending = Some(PendingAuthorization::new(
                            ConfirmationScope::Chain(chain.chain_id.clone()),
                            level,
                            AuthTarget::Chain { chain: chain.clone(), next_member: index },
                            round.round_id(),
                        ));
                        return Ok(Execution::NeedsConfirmation);
                    }
                    Err(error) => {
                        return Ok(Execution::Finished(Closing::refused(RoundFailure::classification(
                            error.failure_code(),
                            error.to_string(),
                        ))))
                    }
                }
            }

            let position = ChainPosition { chain, index };
            let member_level = self
                .gate
                .required_level(Authorizable::Command(member))
                .unwrap_or(authorized);
            match self.execute_command(round, member, member_level, Some(position), None).await? {
                StepResult::Done => {}
                StepResult::Stopped(closing) => return Ok(Execution::Finished(closing)),
            }
        }

        let label = chain.macro_id.as_deref().unwrap_or(&chain.chain_id);
        self.done(round, label).map(Execution::Finished)
    }

    async fn execute_command(
        &self,
        round: &mut ActiveRound,
        command: &Command,
        level: AuthLevel,
        position: Option<ChainPosition<'_>>,
        lineage: Option<String>,
    ) -> Result<StepResult, RoundFailure> {
        let spec = match self.gate.spec(&command.command_id) {
            Ok(spec) => spec.clone(),
            Err(error) => {
                return Ok(StepResult::Stopped(Closing::refused(RoundFailure::classification(
                    error.failure_code(),
                    error.to_string(),
                ))))
            }
        };
        let Some(tool) = self.collaborators.tools.get(&command.command_id) else {
            return Ok(StepResult::Stopped(Closing::refused(RoundFailure::classification(
                failure_codes::UNKNOWN_COMMAND,
                format!("no tool serves `{}`", command.command_id),
            ))));
        };

        let lineage = lineage.unwrap_or_else(|| CallId::generate().0);
        let inputs = object_or_empty(command.inputs.clone());
        let state = round.handle.state_in();
        let chain_id = position.map(|position| position.chain.chain_id.clone());

        loop {
            if !RetryEngine::may_reissue(round.handle.events(), &lineage) {
                let failure = RoundFailure::new(
                    FailureClass::SideEffect,
                    failure_codes::TOOL_SIDE_EFFECT_FAILED,
                    "lineage cannot be reissued without a fresh confirmation",
                );
                let text = failure.user_message();
                return Ok(StepResult::Stopped(Closing::abort(
                    RoundStatus::Partial,
                    failure,
                    TurnOutcome::Failed,
                    text,
                )));
            }

            let attempt = RetryEngine::tool_attempts(round.handle.events(), &lineage) + 1;
            let call_id = CallId::generate();
            self.record_payload(
                round,
                &ToolRequest {
                    tool_id: command.command_id.clone(),
                    call_id: call_id.0.clone(),
                    inputs: inputs.clone(),
                    attempt,
                    lineage: lineage.clone(),
                    side_effecting: spec.side_effecting,
                },
            )?;

            let started = Instant::now();
            let executed =
                bounded(self.settings.tool_timeout, "tool.timeout", tool.execute(inputs.clone())).await;
            let latency_ms = elapsed_ms(started);

            let error = match executed {
                Ok(result) => {
                    let result = object_or_empty(result);
                    self.record_payload(
                        round,
                        &ToolResponse {
                            tool_id: command.command_id.clone(),
                            call_id: call_id.0.clone(),
                            latency_ms,
                            result: result.clone(),
                            status: EventStatus::Ok,
                            attempt,
                            lineage: lineage.clone(),
                            error_code: None,
                        },
                    )?;

                    let mut outcome = CommandExecuted::new(&command.command_id, EventStatus::Ok);
                    outcome.auth_level = Some(level);
                    outcome.chain_id = chain_id.clone();
                    outcome.result = Some(result);
                    outcome.reversible = level.is_reversible();
                    outcome.effective = Some("this_round");
                    self.record_payload(round, &outcome)?;

                    if level.is_reversible() {
                        round.state.last_reversible = Some(ReversibleAction {
                            command_id: command.command_id.clone(),
                            inputs: inputs.clone(),
                            round_id: round.round_id(),
                            executed_at: Utc::now(),
                        });
                    }
                    return Ok(StepResult::Done);
                }
                Err(error) => error,
            };

            let response = ToolResponse {
                tool_id: command.command_id.clone(),
                call_id: call_id.0.clone(),
                latency_ms,
                result: json!({}),
                status: EventStatus::Failed,
                attempt,
                lineage: lineage.clone(),
                error_code: Some(error.code.clone()),
            };
            self.record(round, draft_of(&response)?.failed(error.code.clone(), error.kind.as_str()))?;

            let decision = self.retry.decide(
                StepKind::Tool { side_effecting: spec.side_effecting },
                &error,
                attempt,
                state,
            );
            match decision {
                RetryDecision::Retry { next_attempt, backoff } => {
                    debug!(
                        event_name = "tool.retry_scheduled",
                        correlation_id = %round.handle.round_id(),
                        tool_id = %command.command_id,
                        next_attempt,
                        backoff_ms = duration_ms(backoff),
                        "retrying tool"
                    );
                    tokio::time::sleep(backoff).await;
                }
                RetryDecision::RequireConfirmation { reason_code } => {
                    self.record_failed_command(round, command, level, chain_id.clone())?;
                    let level = level.max(AuthLevel::Confirmed);
                    let (scope, target) = match position {
                        Some(position) => (
                            ConfirmationScope::Chain(position.chain.chain_id.clone()),
                            AuthTarget::Chain { chain: position.chain.clone(), next_member: position.index },
                        ),
                        None => (
                            ConfirmationScope::Command(command.command_id.clone()),
                            AuthTarget::ReExecution { command: command.clone(), lineage: lineage.clone() },
                        ),
                    };
                    round.state.pending =
                        Some(PendingAuthorization::new(scope, level, target, round.round_id()));
                    warn!(
                        event_name = "tool.side_effect_failed",
                        correlation_id = %round.handle.round_id(),
                        tool_id = %command.command_id,
                        error_code = %error.code,
                        "side-effecting tool failed, re-execution needs confirmation"
                    );
                    self.emit_output(round, RETRY_OFFER, false, None, Some(reason_code))?;
                    return Ok(StepResult::Stopped(Closing::abort(
                        RoundStatus::Partial,
                        RoundFailure::new(FailureClass::SideEffect, reason_code, "side-effecting tool failed"),
                        TurnOutcome::AwaitingConfirmation,
                        RETRY_OFFER,
                    )));
                }
                RetryDecision::Fail { class, failure_code } => {
                    self.record_failed_command(round, command, level, chain_id.clone())?;
                    let failure =
                        RoundFailure::new(class, failure_code, format!("tool error `{}`", error.code));
                    let text = failure.user_message();
                    return Ok(StepResult::Stopped(Closing::abort(
                        RoundStatus::Partial,
                        failure,
                        TurnOutcome::Failed,
                        text,
                    )));
                }
                RetryDecision::Clarify { reason_code, .. } | RetryDecision::EscalateToJob { reason_code } => {
                    self.record_failed_command(round, command, level, chain_id.clone())?;
                    let failure = RoundFailure::new(FailureClass::Transient, reason_code, "tool failed");
                    let text = failure.user_message();
                    return Ok(StepResult::Stopped(Closing::abort(
                        RoundStatus::Partial,
                        failure,
                        TurnOutcome::Failed,
                        text,
                    )));
                }
            }
        }
    }

    fn record_failed_command(
        &self,
        round: &mut ActiveRound,
        command: &Command,
        level: AuthLevel,
        chain_id: Option<String>,
    ) -> Result<(), RoundFailure> {
        let mut failed = CommandExecuted::new(&command.command_id, EventStatus::Failed);
        failed.auth_level = Some(level);
        failed.chain_id = chain_id;
        self.record_payload(round, &failed)
    }

    /// Reversals have side effects of their own and are never retried.
    async fn reverse(
        &self,
        round: &mut ActiveRound,
        command_id: &str,
        inputs: Value,
    ) -> Result<Closing, RoundFailure> {
        let Some(tool) = self.collaborators.tools.get(command_id) else {
            return Ok(Closing::refused(RoundFailure::classification(
                failure_codes::UNKNOWN_COMMAND,
                format!("no tool serves `{command_id}`"),
            )));
        };

        let inputs = object_or_empty(inputs);
        let call_id = CallId::generate();
        self.record_payload(
            round,
            &ToolRequest {
                tool_id: command_id.to_string(),
                call_id: call_id.0.clone(),
                inputs: inputs.clone(),
                attempt: 1,
                lineage: call_id.0.clone(),
                side_effecting: true,
            },
        )?;

        let started = Instant::now();
        let reversed = bounded(self.settings.tool_timeout, "tool.timeout", tool.reverse(inputs)).await;
        let latency_ms = elapsed_ms(started);

        match reversed {
            Ok(result) => {
                self.record_payload(
                    round,
                    &ToolResponse {
                        tool_id: command_id.to_string(),
                        call_id: call_id.0.clone(),
                        latency_ms,
                        result: object_or_empty(result),
                        status: EventStatus::Ok,
                        attempt: 1,
                        lineage: call_id.0.clone(),
                        error_code: None,
                    },
                )?;
                self.record_payload(
                    round,
                    &CommandReversed {
                        command_id: command_id.to_string(),
                        status: EventStatus::Ok,
                        reason_code: None,
                    },
                )?;
                round.state.last_reversible = None;
                let text = format!("Undone: {command_id}.");
                self.emit_output(round, &text, false, None, None)?;
                Ok(Closing::completed(text))
            }
            Err(error) => {
                let response = ToolResponse {
                    tool_id: command_id.to_string(),
                    call_id: call_id.0.clone(),
                    latency_ms,
                    result: json!({}),
                    status: EventStatus::Failed,
                    attempt: 1,
                    lineage: call_id.0.clone(),
                    error_code: Some(error.code.clone()),
                };
                self.record(round, draft_of(&response)?.failed(error.code.clone(), error.kind.as_str()))?;
                self.record_payload(
                    round,
                    &CommandReversed {
                        command_id: command_id.to_string(),
                        status: EventStatus::Failed,
                        reason_code: Some(error.code.clone()),
                    },
                )?;
                let failure = RoundFailure::new(
                    FailureClass::SideEffect,
                    failure_codes::TOOL_SIDE_EFFECT_FAILED,
                    format!("reversal error `{}`", error.code),
                );
                let text = failure.user_message();
                Ok(Closing::abort(RoundStatus::Partial, failure, TurnOutcome::Failed, text))
            }
        }
    }

    fn record_route(
        &self,
        round: &mut ActiveRound,
        decision: &RouteDecision,
        auth_level: AuthLevel,
        fill: impl FnOnce(&mut RouteSelected),
    ) -> Result<(), RoundFailure> {
        let mut selected = RouteSelected::new(decision.route.code(), decision.source_rule.clone(), auth_level);
        selected.topic = decision.topic.clone();
        fill(&mut selected);
        self.record_payload(round, &selected)
    }

    fn record_validator(
        &self,
        round: &mut ActiveRound,
        result: &ValidatorResult,
        target: &str,
    ) -> Result<(), RoundFailure> {
        self.record_payload(
            round,
            &ValidatorRan {
                validator_id: result.validator_id.clone(),
                code: result.code.clone(),
                status: result.status,
                message: result.message.clone(),
                target: Some(target.to_string()),
            },
        )
    }

    fn emit_output(
        &self,
        round: &mut ActiveRound,
        text: &str,
        was_escalated: bool,
        retry_count: Option<u32>,
        reason_code: Option<&str>,
    ) -> Result<(), RoundFailure> {
        let emitted = OutputEmitted {
            text: text.to_string(),
            channel: round.channel.clone(),
            was_escalated,
            retry_count,
            reason_code: reason_code.map(str::to_string),
        };
        self.record_payload(round, &emitted)?;
        round.output_emitted = true;
        Ok(())
    }

    fn record_payload<P: TracePayload>(&self, round: &mut ActiveRound, payload: &P) -> Result<(), RoundFailure> {
        self.record(round, draft_of(payload)?)
    }

    fn record(&self, round: &mut ActiveRound, draft: EventDraft) -> Result<(), RoundFailure> {
        self.log
            .append_event(&mut round.handle, draft)
            .map(|_| ())
            .map_err(|error| RoundFailure::durability(error.to_string()))
    }
}

fn draft_of<P: TracePayload>(payload: &P) -> Result<EventDraft, RoundFailure> {
    EventDraft::from_payload(payload).map_err(|error| RoundFailure::durability(error.to_string()))
}

/// Runs a collaborator call under its own timeout.
async fn bounded<T, F>(limit: Duration, timeout_code: &str, call: F) -> Result<T, CollaboratorError>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::timeout(timeout_code)),
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn object_or_empty(value: Value) -> Value {
    if value.is_null() {
        json!({})
    } else {
        value
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
