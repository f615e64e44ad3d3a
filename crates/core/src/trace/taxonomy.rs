use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of event types a round may record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "input.received")]
    InputReceived,
    #[serde(rename = "input.normalized")]
    InputNormalized,
    #[serde(rename = "route.selected")]
    RouteSelected,
    #[serde(rename = "validator.ran")]
    ValidatorRan,
    #[serde(rename = "llm.request")]
    LlmRequest,
    #[serde(rename = "llm.response")]
    LlmResponse,
    #[serde(rename = "tool.request")]
    ToolRequest,
    #[serde(rename = "tool.response")]
    ToolResponse,
    #[serde(rename = "job.enqueued")]
    JobEnqueued,
    #[serde(rename = "job.progress")]
    JobProgress,
    #[serde(rename = "job.result")]
    JobResult,
    #[serde(rename = "confirm.requested")]
    ConfirmRequested,
    #[serde(rename = "confirm.received")]
    ConfirmReceived,
    #[serde(rename = "command.executed")]
    CommandExecuted,
    #[serde(rename = "command.reversed")]
    CommandReversed,
    #[serde(rename = "output.emitted")]
    OutputEmitted,
    #[serde(rename = "round.failed")]
    RoundFailed,
}

impl EventType {
    pub const ALL: [EventType; 17] = [
        Self::InputReceived,
        Self::InputNormalized,
        Self::RouteSelected,
        Self::ValidatorRan,
        Self::LlmRequest,
        Self::LlmResponse,
        Self::ToolRequest,
        Self::ToolResponse,
        Self::JobEnqueued,
        Self::JobProgress,
        Self::JobResult,
        Self::ConfirmRequested,
        Self::ConfirmReceived,
        Self::CommandExecuted,
        Self::CommandReversed,
        Self::OutputEmitted,
        Self::RoundFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InputReceived => "input.received",
            Self::InputNormalized => "input.normalized",
            Self::RouteSelected => "route.selected",
            Self::ValidatorRan => "validator.ran",
            Self::LlmRequest => "llm.request",
            Self::LlmResponse => "llm.response",
            Self::ToolRequest => "tool.request",
            Self::ToolResponse => "tool.response",
            Self::JobEnqueued => "job.enqueued",
            Self::JobProgress => "job.progress",
            Self::JobResult => "job.result",
            Self::ConfirmRequested => "confirm.requested",
            Self::ConfirmReceived => "confirm.received",
            Self::CommandExecuted => "command.executed",
            Self::CommandReversed => "command.reversed",
            Self::OutputEmitted => "output.emitted",
            Self::RoundFailed => "round.failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|event_type| event_type.as_str() == value)
    }

    /// Request side of a paired step; the round cannot commit until the
    /// matching closing event is recorded.
    pub fn opens_step(&self) -> bool {
        matches!(self, Self::LlmRequest | Self::ToolRequest | Self::ConfirmRequested)
    }

    pub fn closing_type(&self) -> Option<EventType> {
        match self {
            Self::LlmRequest => Some(Self::LlmResponse),
            Self::ToolRequest => Some(Self::ToolResponse),
            Self::ConfirmRequested => Some(Self::ConfirmReceived),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::EventType;

    #[test]
    fn parse_accepts_every_wire_name() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
            let encoded = serde_json::to_string(&event_type).expect("encode");
            assert_eq!(encoded, format!("\"{}\"", event_type.as_str()));
        }
        assert_eq!(EventType::parse("llm.thought"), None);
    }

    #[test]
    fn only_request_events_open_steps() {
        let openers: Vec<_> = EventType::ALL.into_iter().filter(EventType::opens_step).collect();
        assert_eq!(
            openers,
            vec![EventType::LlmRequest, EventType::ToolRequest, EventType::ConfirmRequested]
        );
        assert_eq!(EventType::ToolRequest.closing_type(), Some(EventType::ToolResponse));
    }
}
