//! Typed builders for event payloads.
//!
//! Each struct serializes to exactly the JSON shape its event type accepts.

use serde::Serialize;
use serde_json::Value;

use crate::auth::{AuthLevel, ConfirmationScope};
use crate::errors::FailureClass;
use crate::trace::record::EventStatus;
use crate::trace::taxonomy::EventType;
use crate::validators::ValidatorStatus;

pub trait TracePayload: Serialize {
    const EVENT_TYPE: EventType;
}

macro_rules! trace_payload {
    ($ty:ty => $event_type:expr) => {
        impl TracePayload for $ty {
            const EVENT_TYPE: EventType = $event_type;
        }
    };
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InputReceived {
    pub raw_text: String,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct InputNormalized {
    pub normalized_text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secret_refs: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RouteSelected {
    pub route_code: String,
    pub source_rule: String,
    pub auth_level: AuthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(rename = "macro", skip_serializing_if = "Option::is_none")]
    pub macro_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

impl RouteSelected {
    pub fn new(route_code: &str, source_rule: impl Into<String>, auth_level: AuthLevel) -> Self {
        Self {
            route_code: route_code.to_string(),
            source_rule: source_rule.into(),
            auth_level,
            topic: None,
            macro_id: None,
            command_id: None,
            chain_id: None,
            candidates: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ValidatorRan {
    pub validator_id: String,
    pub code: String,
    pub status: ValidatorStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LlmRequest {
    pub model: String,
    pub prompt_hash: String,
    pub prompt_head: String,
    pub prompt_tail: String,
    pub truncated: bool,
    pub attempt: u32,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct LlmResponse {
    pub model: String,
    pub latency_ms: u64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ToolRequest {
    pub tool_id: String,
    pub call_id: String,
    pub inputs: Value,
    pub attempt: u32,
    pub lineage: String,
    pub side_effecting: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct ToolResponse {
    pub tool_id: String,
    pub call_id: String,
    pub latency_ms: u64,
    pub result: Value,
    pub status: EventStatus,
    pub attempt: u32,
    pub lineage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct JobEnqueued {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct JobResult {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfirmRequested {
    pub auth_level: AuthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub step: u8,
    pub steps_required: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_round_id: Option<String>,
}

impl ConfirmRequested {
    pub fn new(scope: &ConfirmationScope, auth_level: AuthLevel, step: u8) -> Self {
        let (chain_id, command_id) = split_scope(scope);
        Self {
            auth_level,
            chain_id,
            command_id,
            step,
            steps_required: auth_level.required_confirmations().max(1),
            target: None,
            prior_round_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfirmReceived {
    pub auth_level: AuthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub confirmation_id: String,
    pub accepted: bool,
    pub channel: String,
    pub step: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_round_id: Option<String>,
}

impl ConfirmReceived {
    pub fn new(
        scope: &ConfirmationScope,
        auth_level: AuthLevel,
        step: u8,
        confirmation_id: impl Into<String>,
        accepted: bool,
        channel: impl Into<String>,
    ) -> Self {
        let (chain_id, command_id) = split_scope(scope);
        Self {
            auth_level,
            chain_id,
            command_id,
            confirmation_id: confirmation_id.into(),
            accepted,
            channel: channel.into(),
            step,
            prior_round_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CommandExecuted {
    pub command_id: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_level: Option<AuthLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub reversible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective: Option<&'static str>,
}

impl CommandExecuted {
    pub fn new(command_id: impl Into<String>, status: EventStatus) -> Self {
        Self {
            command_id: command_id.into(),
            status,
            auth_level: None,
            chain_id: None,
            result: None,
            reversible: false,
            effective: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CommandReversed {
    pub command_id: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct OutputEmitted {
    pub text: String,
    pub channel: String,
    pub was_escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundFailed {
    pub failure_code: String,
    pub failure_reason: String,
    pub failure_class: FailureClass,
}

fn split_scope(scope: &ConfirmationScope) -> (Option<String>, Option<String>) {
    match scope {
        ConfirmationScope::Chain(id) => (Some(id.clone()), None),
        ConfirmationScope::Command(id) => (None, Some(id.clone())),
    }
}

trace_payload!(InputReceived => EventType::InputReceived);
trace_payload!(InputNormalized => EventType::InputNormalized);
trace_payload!(RouteSelected => EventType::RouteSelected);
trace_payload!(ValidatorRan => EventType::ValidatorRan);
trace_payload!(LlmRequest => EventType::LlmRequest);
trace_payload!(LlmResponse => EventType::LlmResponse);
trace_payload!(ToolRequest => EventType::ToolRequest);
trace_payload!(ToolResponse => EventType::ToolResponse);
trace_payload!(JobEnqueued => EventType::JobEnqueued);
trace_payload!(JobProgress => EventType::JobProgress);
trace_payload!(JobResult => EventType::JobResult);
trace_payload!(ConfirmRequested => EventType::ConfirmRequested);
trace_payload!(ConfirmReceived => EventType::ConfirmReceived);
trace_payload!(CommandExecuted => EventType::CommandExecuted);
trace_payload!(CommandReversed => EventType::CommandReversed);
trace_payload!(OutputEmitted => EventType::OutputEmitted);
trace_payload!(RoundFailed => EventType::RoundFailed);
