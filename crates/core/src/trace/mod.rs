//! Decision-trace vocabulary: round headers, events, payload schemas.

pub mod payloads;
pub mod prompt;
pub mod record;
pub mod schema;
pub mod taxonomy;

pub use prompt::PromptDigest;
pub use record::{
    unresolved_steps, EventDraft, EventStatus, ExportScope, HeaderDraft, RoundEvent, RoundHeader,
    RoundRecord, RoundStatus, Watermark, TRACE_EVENT_VERSION, TRACE_ROUND_VERSION,
};
pub use schema::{validate_payload, SchemaError};
pub use taxonomy::EventType;
pub use payloads::TracePayload;
