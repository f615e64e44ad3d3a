use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::GuardState;
use crate::ids::{BucketId, CallId, ConversationId, LibraryId, RoundId};
use crate::trace::payloads::TracePayload;
use crate::trace::schema::{validate_payload, SchemaError};
use crate::trace::taxonomy::EventType;

pub const TRACE_ROUND_VERSION: u32 = 1;
pub const TRACE_EVENT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Durably opened, not yet closed. Never a final result.
    Open,
    Ok,
    Partial,
    Failed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" => Some(Self::Open),
            "ok" => Some(Self::Ok),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Ok,
    Failed,
    Skipped,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundHeader {
    pub schema_version: u32,
    pub library_id: LibraryId,
    pub bucket_id: BucketId,
    pub conversation_id: ConversationId,
    pub round_id: RoundId,
    pub round_seq: u64,
    pub prior_round_id: Option<RoundId>,
    pub state_in: GuardState,
    pub state_out: Option<GuardState>,
    pub audio_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub status: RoundStatus,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundEvent {
    pub schema_version: u32,
    pub round_id: RoundId,
    pub event_seq: u64,
    pub event_type: EventType,
    pub call_id: Option<CallId>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub status: EventStatus,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
}

/// What the orchestrator knows about a round before it is opened.
#[derive(Clone, Debug, PartialEq)]
pub struct HeaderDraft {
    pub conversation_id: ConversationId,
    pub state_in: GuardState,
    pub audio_id: Option<String>,
    pub prior_round_id: Option<RoundId>,
}

impl HeaderDraft {
    pub fn new(conversation_id: ConversationId, state_in: GuardState) -> Self {
        Self { conversation_id, state_in, audio_id: None, prior_round_id: None }
    }

    pub fn with_audio(mut self, audio_id: Option<String>) -> Self {
        self.audio_id = audio_id;
        self
    }

    pub fn following(mut self, prior_round_id: Option<RoundId>) -> Self {
        self.prior_round_id = prior_round_id;
        self
    }
}

/// An event before it has been validated and numbered.
#[derive(Clone, Debug, PartialEq)]
pub struct EventDraft {
    pub event_type: EventType,
    pub call_id: Option<CallId>,
    pub payload: Value,
    pub status: EventStatus,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
}

impl EventDraft {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            call_id: None,
            payload,
            status: EventStatus::Ok,
            failure_code: None,
            failure_reason: None,
        }
    }

    pub fn from_payload<P: TracePayload>(payload: &P) -> Result<Self, SchemaError> {
        let value = serde_json::to_value(payload).map_err(|error| SchemaError::Encode {
            event_type: P::EVENT_TYPE,
            message: error.to_string(),
        })?;
        Ok(Self::new(P::EVENT_TYPE, value))
    }

    pub fn with_call_id(mut self, call_id: CallId) -> Self {
        self.call_id = Some(call_id);
        self
    }

    pub fn failed(mut self, code: impl Into<String>, reason: impl Into<String>) -> Self {
        self.status = EventStatus::Failed;
        self.failure_code = Some(code.into());
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn skipped(mut self) -> Self {
        self.status = EventStatus::Skipped;
        self
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        validate_payload(self.event_type, &self.payload)
    }

    pub fn into_event(self, round_id: RoundId, event_seq: u64, timestamp: DateTime<Utc>) -> RoundEvent {
        RoundEvent {
            schema_version: TRACE_EVENT_VERSION,
            round_id,
            event_seq,
            event_type: self.event_type,
            call_id: self.call_id,
            timestamp,
            payload: self.payload,
            status: self.status,
            failure_code: self.failure_code,
            failure_reason: self.failure_reason,
        }
    }
}

/// A closed round with its events in append order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub header: RoundHeader,
    pub events: Vec<RoundEvent>,
}

/// Resume point for exports. Rounds before `round_seq` are skipped, and
/// within `round_seq` only events after `event_seq` are returned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub round_seq: u64,
    pub event_seq: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportScope {
    Conversation(ConversationId),
    Round(RoundId),
}

/// Keys of request events that have no matching response yet.
pub fn unresolved_steps(events: &[RoundEvent]) -> Vec<String> {
    let mut open = BTreeSet::new();
    for event in events {
        let Some(key) = step_key(event) else {
            continue;
        };
        if event.event_type.opens_step() {
            open.insert(key);
        } else {
            open.remove(&key);
        }
    }
    open.into_iter().collect()
}

fn step_key(event: &RoundEvent) -> Option<String> {
    match event.event_type {
        EventType::LlmRequest | EventType::LlmResponse => {
            event.call_id.as_ref().map(|call_id| format!("llm:{call_id}"))
        }
        EventType::ToolRequest | EventType::ToolResponse => {
            let call_id = event.payload.get("call_id").and_then(Value::as_str)?;
            Some(format!("tool:{call_id}"))
        }
        EventType::ConfirmRequested | EventType::ConfirmReceived => {
            let scope = event
                .payload
                .get("chain_id")
                .and_then(Value::as_str)
                .or_else(|| event.payload.get("command_id").and_then(Value::as_str))?;
            let step = event.payload.get("step").and_then(Value::as_u64).unwrap_or(1);
            Some(format!("confirm:{scope}:{step}"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::{unresolved_steps, EventDraft, EventStatus, RoundStatus};
    use crate::ids::{CallId, RoundId};
    use crate::trace::taxonomy::EventType;

    fn numbered(drafts: Vec<EventDraft>) -> Vec<super::RoundEvent> {
        let round_id = RoundId::generate();
        drafts
            .into_iter()
            .enumerate()
            .map(|(index, draft)| draft.into_event(round_id.clone(), index as u64 + 1, Utc::now()))
            .collect()
    }

    #[test]
    fn open_status_is_not_terminal() {
        assert!(!RoundStatus::Open.is_terminal());
        assert!(RoundStatus::Partial.is_terminal());
        assert_eq!(RoundStatus::parse(" FAILED "), Some(RoundStatus::Failed));
        assert_eq!(EventStatus::parse("skipped"), Some(EventStatus::Skipped));
    }

    #[test]
    fn failed_draft_carries_code_and_reason() {
        let draft = EventDraft::new(EventType::JobResult, json!({"job_id": "job-1"}))
            .failed("job.failed", "queue rejected the topic");
        assert_eq!(draft.status, EventStatus::Failed);
        assert_eq!(draft.failure_code.as_deref(), Some("job.failed"));
        draft.validate().expect("payload is still valid");
    }

    #[test]
    fn request_without_response_is_unresolved() {
        let llm_call = CallId::generate();
        let events = numbered(vec![
            EventDraft::new(
                EventType::LlmRequest,
                json!({"model": "m", "prompt_hash": "h", "prompt_head": "", "prompt_tail": ""}),
            )
            .with_call_id(llm_call.clone()),
            EventDraft::new(
                EventType::LlmResponse,
                json!({"model": "m", "latency_ms": 12, "text": "hello"}),
            )
            .with_call_id(llm_call),
            EventDraft::new(
                EventType::ConfirmRequested,
                json!({"auth_level": 4, "chain_id": "chain-1", "step": 1}),
            ),
            EventDraft::new(
                EventType::ToolRequest,
                json!({"tool_id": "lights.on", "call_id": "t-1", "inputs": {}}),
            ),
        ]);

        assert_eq!(unresolved_steps(&events), vec!["confirm:chain-1:1", "tool:t-1"]);
    }

    #[test]
    fn paired_confirmations_resolve_by_step() {
        let events = numbered(vec![
            EventDraft::new(EventType::ConfirmRequested, json!({"auth_level": 4, "chain_id": "c", "step": 1})),
            EventDraft::new(
                EventType::ConfirmReceived,
                json!({"auth_level": 4, "chain_id": "c", "step": 1, "confirmation_id": "x", "accepted": true}),
            ),
        ]);
        assert!(unresolved_steps(&events).is_empty());
    }
}
