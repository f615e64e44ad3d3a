//! Payload shapes for every event type.
//!
//! Schemas are closed: a field that is neither required nor optional is
//! rejected, which keeps free-form rationale out of the durable log.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::trace::taxonomy::EventType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Integer => value.is_u64() || value.is_i64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

type Field = (&'static str, FieldKind);

#[derive(Debug)]
pub struct EventSchema {
    pub required: &'static [Field],
    pub optional: &'static [Field],
    /// At least one of these must be present and non-null.
    pub one_of: &'static [&'static str],
    /// Fields whose string value must come from a fixed vocabulary.
    pub vocab: &'static [(&'static str, &'static [&'static str])],
}

use FieldKind::{Any, Array, Boolean, Integer, Number, Object, Text};

const STEP_STATUS: &[&str] = &["ok", "failed", "skipped"];
const VALIDATOR_STATUS: &[&str] = &["ok", "warn", "error", "escalate", "retry"];
const EFFECTIVE: &[&str] = &["this_round", "next_round"];
const FAILURE_CLASSES: &[&str] =
    &["classification", "authorization", "transient", "side_effect", "durability"];

static INPUT_RECEIVED: EventSchema = EventSchema {
    required: &[("raw_text", Text), ("channel", Text)],
    optional: &[("audio_id", Text)],
    one_of: &[],
    vocab: &[],
};
static INPUT_NORMALIZED: EventSchema = EventSchema {
    required: &[("normalized_text", Text)],
    optional: &[("secret_refs", Array)],
    one_of: &[],
    vocab: &[],
};
static ROUTE_SELECTED: EventSchema = EventSchema {
    required: &[("route_code", Text), ("source_rule", Text), ("auth_level", Integer)],
    optional: &[
        ("topic", Text),
        ("macro", Text),
        ("command_id", Text),
        ("chain_id", Text),
        ("candidates", Array),
    ],
    one_of: &[],
    vocab: &[],
};
static VALIDATOR_RAN: EventSchema = EventSchema {
    required: &[("validator_id", Text), ("code", Text), ("status", Text), ("message", Text)],
    optional: &[("target", Text)],
    one_of: &[],
    vocab: &[("status", VALIDATOR_STATUS)],
};
static LLM_REQUEST: EventSchema = EventSchema {
    required: &[
        ("model", Text),
        ("prompt_hash", Text),
        ("prompt_head", Text),
        ("prompt_tail", Text),
    ],
    optional: &[("truncated", Boolean), ("attempt", Integer)],
    one_of: &[],
    vocab: &[],
};
static LLM_RESPONSE: EventSchema = EventSchema {
    required: &[("model", Text), ("latency_ms", Integer), ("text", Text)],
    optional: &[
        ("usage", Object),
        ("truncated", Boolean),
        ("attempt", Integer),
        ("error_code", Text),
    ],
    one_of: &[],
    vocab: &[],
};
static TOOL_REQUEST: EventSchema = EventSchema {
    required: &[("tool_id", Text), ("call_id", Text), ("inputs", Any)],
    optional: &[("attempt", Integer), ("lineage", Text), ("side_effecting", Boolean)],
    one_of: &[],
    vocab: &[],
};
static TOOL_RESPONSE: EventSchema = EventSchema {
    required: &[
        ("tool_id", Text),
        ("call_id", Text),
        ("latency_ms", Integer),
        ("result", Any),
        ("status", Text),
    ],
    optional: &[("attempt", Integer), ("lineage", Text), ("error_code", Text)],
    one_of: &[],
    vocab: &[("status", STEP_STATUS)],
};
static JOB_ENQUEUED: EventSchema = EventSchema {
    required: &[("job_id", Text)],
    optional: &[("topic", Text), ("query", Text)],
    one_of: &[],
    vocab: &[],
};
static JOB_PROGRESS: EventSchema = EventSchema {
    required: &[("job_id", Text)],
    optional: &[("progress", Number), ("status", Text)],
    one_of: &[],
    vocab: &[],
};
static JOB_RESULT: EventSchema = EventSchema {
    required: &[("job_id", Text)],
    optional: &[("status", Text), ("result", Any)],
    one_of: &[],
    vocab: &[],
};
static CONFIRM_REQUESTED: EventSchema = EventSchema {
    required: &[("auth_level", Integer)],
    optional: &[
        ("chain_id", Text),
        ("command_id", Text),
        ("step", Integer),
        ("steps_required", Integer),
        ("target", Text),
        ("prior_round_id", Text),
    ],
    one_of: &["chain_id", "command_id"],
    vocab: &[],
};
static CONFIRM_RECEIVED: EventSchema = EventSchema {
    required: &[("auth_level", Integer), ("confirmation_id", Text), ("accepted", Boolean)],
    optional: &[
        ("chain_id", Text),
        ("command_id", Text),
        ("channel", Text),
        ("step", Integer),
        ("prior_round_id", Text),
    ],
    one_of: &["chain_id", "command_id"],
    vocab: &[],
};
static COMMAND_EXECUTED: EventSchema = EventSchema {
    required: &[("command_id", Text), ("status", Text)],
    optional: &[
        ("auth_level", Integer),
        ("chain_id", Text),
        ("result", Any),
        ("reversible", Boolean),
        ("effective", Text),
    ],
    one_of: &[],
    vocab: &[("status", STEP_STATUS), ("effective", EFFECTIVE)],
};
static COMMAND_REVERSED: EventSchema = EventSchema {
    required: &[("command_id", Text), ("status", Text)],
    optional: &[("reason_code", Text)],
    one_of: &[],
    vocab: &[("status", STEP_STATUS)],
};
static OUTPUT_EMITTED: EventSchema = EventSchema {
    required: &[("text", Text), ("channel", Text)],
    optional: &[("was_escalated", Boolean), ("retry_count", Integer), ("reason_code", Text)],
    one_of: &[],
    vocab: &[],
};
static ROUND_FAILED: EventSchema = EventSchema {
    required: &[("failure_code", Text), ("failure_reason", Text)],
    optional: &[("failure_class", Text)],
    one_of: &[],
    vocab: &[("failure_class", FAILURE_CLASSES)],
};

pub fn schema_for(event_type: EventType) -> &'static EventSchema {
    match event_type {
        EventType::InputReceived => &INPUT_RECEIVED,
        EventType::InputNormalized => &INPUT_NORMALIZED,
        EventType::RouteSelected => &ROUTE_SELECTED,
        EventType::ValidatorRan => &VALIDATOR_RAN,
        EventType::LlmRequest => &LLM_REQUEST,
        EventType::LlmResponse => &LLM_RESPONSE,
        EventType::ToolRequest => &TOOL_REQUEST,
        EventType::ToolResponse => &TOOL_RESPONSE,
        EventType::JobEnqueued => &JOB_ENQUEUED,
        EventType::JobProgress => &JOB_PROGRESS,
        EventType::JobResult => &JOB_RESULT,
        EventType::ConfirmRequested => &CONFIRM_REQUESTED,
        EventType::ConfirmReceived => &CONFIRM_RECEIVED,
        EventType::CommandExecuted => &COMMAND_EXECUTED,
        EventType::CommandReversed => &COMMAND_REVERSED,
        EventType::OutputEmitted => &OUTPUT_EMITTED,
        EventType::RoundFailed => &ROUND_FAILED,
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown event type `{0}`")]
    UnknownEventType(String),
    #[error("{event_type} payload must be a JSON object")]
    NotAnObject { event_type: EventType },
    #[error("{event_type} payload is missing required field `{field}`")]
    MissingField { event_type: EventType, field: &'static str },
    #[error("{event_type} field `{field}` must be a {expected}")]
    WrongType { event_type: EventType, field: String, expected: &'static str },
    #[error("{event_type} payload has unexpected field `{field}`")]
    UnknownField { event_type: EventType, field: String },
    #[error("{event_type} payload needs one of {fields:?}")]
    MissingScope { event_type: EventType, fields: &'static [&'static str] },
    #[error("{event_type} field `{field}` has unsupported value `{value}`")]
    InvalidValue { event_type: EventType, field: String, value: String },
    #[error("could not encode {event_type} payload: {message}")]
    Encode { event_type: EventType, message: String },
}

pub fn validate_payload(event_type: EventType, payload: &Value) -> Result<(), SchemaError> {
    let object = payload.as_object().ok_or(SchemaError::NotAnObject { event_type })?;
    let schema = schema_for(event_type);

    for (field, kind) in schema.required {
        match object.get(*field) {
            None | Some(Value::Null) => {
                return Err(SchemaError::MissingField { event_type, field: *field });
            }
            Some(value) => check_kind(event_type, field, *kind, value)?,
        }
    }

    for (field, value) in object {
        if schema.required.iter().any(|(name, _)| *name == field.as_str()) {
            continue;
        }
        let Some((_, kind)) = schema.optional.iter().find(|(name, _)| *name == field.as_str()) else {
            return Err(SchemaError::UnknownField { event_type, field: field.clone() });
        };
        if !value.is_null() {
            check_kind(event_type, field, *kind, value)?;
        }
    }

    if !schema.one_of.is_empty() && !schema.one_of.iter().any(|field| present(object, field)) {
        return Err(SchemaError::MissingScope { event_type, fields: schema.one_of });
    }

    for (field, allowed) in schema.vocab {
        if let Some(value) = object.get(*field).and_then(Value::as_str) {
            if !allowed.contains(&value) {
                return Err(SchemaError::InvalidValue {
                    event_type,
                    field: (*field).to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    if let Some(level) = object.get("auth_level").filter(|value| !value.is_null()) {
        if !level.as_i64().is_some_and(|level| (1..=4).contains(&level)) {
            return Err(SchemaError::InvalidValue {
                event_type,
                field: "auth_level".to_string(),
                value: level.to_string(),
            });
        }
    }

    Ok(())
}

fn present(object: &Map<String, Value>, field: &str) -> bool {
    object.get(field).is_some_and(|value| !value.is_null())
}

fn check_kind(
    event_type: EventType,
    field: &str,
    kind: FieldKind,
    value: &Value,
) -> Result<(), SchemaError> {
    if kind.accepts(value) {
        Ok(())
    } else {
        Err(SchemaError::WrongType { event_type, field: field.to_string(), expected: kind.name() })
    }
}
