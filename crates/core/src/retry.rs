//! Retry and escalation decisions for failed round steps.
//!
//! The engine keeps no state of its own. Attempt counts are read back from the
//! events the round has already recorded, so a decision can always be
//! reproduced from the trace.

use std::time::Duration;

use serde_json::Value;

use crate::auth::GuardState;
use crate::config::{LlmConfig, ToolsConfig};
use crate::errors::{failure_codes, CollaboratorError, FailureClass};
use crate::trace::{EventStatus, EventType, RoundEvent};
use crate::validators::{is_blocked, ValidatorResult, ValidatorStatus};

/// Bounds for automatic retries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total generation attempts per round, first try included.
    pub max_generation_attempts: u32,
    /// Total attempts per tool lineage, only for tools that signal transient.
    pub max_tool_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied per additional retry
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_generation_attempts: 2,
            max_tool_attempts: 2,
            base_delay: Duration::from_millis(250),
            backoff_multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(llm: &LlmConfig, tools: &ToolsConfig) -> Self {
        Self {
            max_generation_attempts: llm.max_attempts,
            max_tool_attempts: tools.max_attempts,
            ..Self::default()
        }
    }

    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        self.base_delay.saturating_mul(self.backoff_multiplier.saturating_pow(exponent))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Generation,
    Tool { side_effecting: bool },
    Job,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, backoff: Duration },
    /// Stop and ask the user for clarification.
    Clarify { reason_code: &'static str, attempts: u32 },
    /// Hand the work to a long-running job instead of retrying inline.
    EscalateToJob { reason_code: &'static str },
    /// A side effect may have happened; only a fresh confirmation may re-run it.
    RequireConfirmation { reason_code: &'static str },
    Fail { class: FailureClass, failure_code: &'static str },
}

#[derive(Clone, Debug, Default)]
pub struct RetryEngine {
    policy: RetryPolicy,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn decide(
        &self,
        step: StepKind,
        error: &CollaboratorError,
        attempts_made: u32,
        state: GuardState,
    ) -> RetryDecision {
        match step {
            StepKind::Generation => self.decide_generation(error, attempts_made, state),
            StepKind::Tool { side_effecting: true } => RetryDecision::RequireConfirmation {
                reason_code: failure_codes::TOOL_SIDE_EFFECT_FAILED,
            },
            StepKind::Tool { side_effecting: false } => {
                if error.is_transient() && attempts_made < self.policy.max_tool_attempts {
                    self.retry(attempts_made)
                } else {
                    RetryDecision::Fail {
                        class: FailureClass::Transient,
                        failure_code: failure_codes::TOOL_FAILED,
                    }
                }
            }
            StepKind::Job => {
                if error.is_transient() && attempts_made < self.policy.max_tool_attempts {
                    self.retry(attempts_made)
                } else {
                    RetryDecision::Fail {
                        class: FailureClass::Transient,
                        failure_code: failure_codes::JOB_FAILED,
                    }
                }
            }
        }
    }

    fn decide_generation(
        &self,
        error: &CollaboratorError,
        attempts_made: u32,
        state: GuardState,
    ) -> RetryDecision {
        if !error.is_transient() {
            return RetryDecision::Clarify {
                reason_code: failure_codes::LLM_REJECTED,
                attempts: attempts_made,
            };
        }
        if state == GuardState::Research {
            return RetryDecision::EscalateToJob { reason_code: failure_codes::RESEARCH_ESCALATED };
        }
        if attempts_made < self.policy.max_generation_attempts {
            return self.retry(attempts_made);
        }
        RetryDecision::Clarify { reason_code: failure_codes::LLM_RETRY_EXHAUSTED, attempts: attempts_made }
    }

    fn retry(&self, attempts_made: u32) -> RetryDecision {
        RetryDecision::Retry {
            next_attempt: attempts_made + 1,
            backoff: self.policy.backoff(attempts_made),
        }
    }

    /// Incoherent input is answered with a clarification before any
    /// generation, leaving the retry budget untouched.
    pub fn input_short_circuit<'a>(results: &'a [ValidatorResult]) -> Option<&'a ValidatorResult> {
        if !is_blocked(results) {
            return None;
        }
        results
            .iter()
            .find(|result| matches!(result.status, ValidatorStatus::Error | ValidatorStatus::Escalate))
    }

    pub fn generation_attempts(events: &[RoundEvent]) -> u32 {
        count(events.iter().filter(|event| event.event_type == EventType::LlmRequest))
    }

    pub fn tool_attempts(events: &[RoundEvent], lineage: &str) -> u32 {
        count(events.iter().filter(|event| {
            event.event_type == EventType::ToolRequest && payload_str(event, "lineage") == Some(lineage)
        }))
    }

    /// A lineage whose last side-effecting response failed may only be issued
    /// again after a `confirm.received` recorded later in the round.
    pub fn may_reissue(events: &[RoundEvent], lineage: &str) -> bool {
        let last_failure = events.iter().rposition(|event| {
            event.event_type == EventType::ToolResponse
                && event.status == EventStatus::Failed
                && payload_str(event, "lineage") == Some(lineage)
        });
        match last_failure {
            None => true,
            Some(index) => events[index + 1..].iter().any(|event| {
                event.event_type == EventType::ConfirmReceived
                    && event.payload.get("accepted").and_then(Value::as_bool) == Some(true)
            }),
        }
    }
}

fn payload_str<'a>(event: &'a RoundEvent, field: &str) -> Option<&'a str> {
    event.payload.get(field).and_then(Value::as_str)
}

fn count<'a>(events: impl Iterator<Item = &'a RoundEvent>) -> u32 {
    u32::try_from(events.count()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::{RetryDecision, RetryEngine, RetryPolicy, StepKind};
    use crate::auth::GuardState;
    use crate::errors::{CollaboratorError, CollaboratorErrorKind, FailureClass};
    use crate::ids::RoundId;
    use crate::trace::{EventDraft, EventType, RoundEvent};
    use crate::validators::{CoherenceValidator, Validator};

    fn engine() -> RetryEngine {
        RetryEngine::new(RetryPolicy { base_delay: Duration::ZERO, ..RetryPolicy::default() })
    }

    fn rate_limited() -> CollaboratorError {
        CollaboratorError::new(CollaboratorErrorKind::RateLimited, "llm.429", "slow down")
    }

    fn events(drafts: Vec<EventDraft>) -> Vec<RoundEvent> {
        let round_id = RoundId::generate();
        drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| draft.into_event(round_id.clone(), index as u64 + 1, Utc::now()))
            .collect()
    }

    fn tool_request(lineage: &str) -> EventDraft {
        EventDraft::new(
            EventType::ToolRequest,
            json!({"tool_id": "ops.restart_agent", "call_id": "c", "inputs": {}, "lineage": lineage}),
        )
    }

    fn failed_tool_response(lineage: &str) -> EventDraft {
        EventDraft::new(
            EventType::ToolResponse,
            json!({
                "tool_id": "ops.restart_agent", "call_id": "c", "latency_ms": 5,
                "result": {}, "status": "failed", "lineage": lineage,
            }),
        )
        .failed("tool.unavailable", "agent did not answer")
    }

    #[test]
    fn generation_stops_after_two_attempts() {
        let engine = engine();
        assert!(matches!(
            engine.decide(StepKind::Generation, &rate_limited(), 1, GuardState::Default),
            RetryDecision::Retry { next_attempt: 2, .. }
        ));
        assert_eq!(
            engine.decide(StepKind::Generation, &rate_limited(), 2, GuardState::Default),
            RetryDecision::Clarify { reason_code: "llm.retry_exhausted", attempts: 2 }
        );
    }

    #[test]
    fn rejected_generation_is_not_retried() {
        let rejected = CollaboratorError::rejected("llm.policy", "refused");
        assert_eq!(
            engine().decide(StepKind::Generation, &rejected, 1, GuardState::Default),
            RetryDecision::Clarify { reason_code: "llm.rejected", attempts: 1 }
        );
    }

    #[test]
    fn research_state_escalates_to_a_job() {
        assert_eq!(
            engine().decide(StepKind::Generation, &rate_limited(), 1, GuardState::Research),
            RetryDecision::EscalateToJob { reason_code: "research.escalated" }
        );
    }

    #[test]
    fn side_effecting_tools_are_never_retried() {
        let timeout = CollaboratorError::timeout("tool.timeout");
        assert_eq!(
            engine().decide(StepKind::Tool { side_effecting: true }, &timeout, 1, GuardState::Action),
            RetryDecision::RequireConfirmation { reason_code: "tool.side_effect_failed" }
        );
    }

    #[test]
    fn plain_tools_retry_only_when_transient() {
        let engine = engine();
        let step = StepKind::Tool { side_effecting: false };
        assert!(matches!(
            engine.decide(step, &CollaboratorError::unavailable("tool.busy", "busy"), 1, GuardState::Default),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            engine.decide(step, &CollaboratorError::rejected("tool.bad_input", "no"), 1, GuardState::Default),
            RetryDecision::Fail { class: FailureClass::Transient, failure_code: "tool.failed" }
        );
    }

    #[test]
    fn backoff_grows_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
    }

    #[test]
    fn attempts_are_counted_from_history() {
        let history = events(vec![
            EventDraft::new(
                EventType::LlmRequest,
                json!({"model": "m", "prompt_hash": "h", "prompt_head": "", "prompt_tail": ""}),
            ),
            tool_request("lineage-a"),
            tool_request("lineage-b"),
            tool_request("lineage-a"),
        ]);
        assert_eq!(RetryEngine::generation_attempts(&history), 1);
        assert_eq!(RetryEngine::tool_attempts(&history, "lineage-a"), 2);
    }

    #[test]
    fn failed_side_effect_needs_a_later_confirmation() {
        let mut drafts = vec![tool_request("l-1"), failed_tool_response("l-1")];
        assert!(!RetryEngine::may_reissue(&events(drafts.clone()), "l-1"));
        assert!(RetryEngine::may_reissue(&events(drafts.clone()), "l-2"));

        drafts.push(EventDraft::new(
            EventType::ConfirmReceived,
            json!({"auth_level": 3, "command_id": "ops.restart_agent", "confirmation_id": "x", "accepted": true}),
        ));
        assert!(RetryEngine::may_reissue(&events(drafts), "l-1"));
    }

    #[test]
    fn incoherent_input_short_circuits() {
        let results = vec![CoherenceValidator.validate("uh um")];
        let blocking = RetryEngine::input_short_circuit(&results).expect("blocked");
        assert_eq!(blocking.code, "validator.filler_only");

        let results = vec![CoherenceValidator.validate("what's the weather")];
        assert!(RetryEngine::input_short_circuit(&results).is_none());
    }
}
