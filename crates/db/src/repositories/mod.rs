use async_trait::async_trait;
use thiserror::Error;

use roundkeeper_core::chrono::{DateTime, SecondsFormat, Utc};
use roundkeeper_core::trace::{RoundEvent, RoundHeader, RoundStatus};
use roundkeeper_core::{
    ConversationAuthState, ConversationId, GuardState, LibraryId, RoundId,
};

pub mod library;
pub mod memory;
pub mod trace;

pub use library::{resolve_library_id, SqlLibraryRepository};
pub use memory::{InMemoryLibraryRepository, InMemoryTraceRepository};
pub use trace::SqlTraceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Everything needed to durably open a round. `round_seq` is allocated by the
/// repository in the same transaction that inserts the header.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundOpening {
    pub round_id: RoundId,
    pub library_id: LibraryId,
    pub conversation_id: ConversationId,
    pub prior_round_id: Option<RoundId>,
    pub state_in: GuardState,
    pub audio_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The single write that closes a round: header status, every buffered
/// event, and optionally the conversation's auth state record.
#[derive(Clone, Debug, PartialEq)]
pub struct RoundClosure {
    pub round_id: RoundId,
    pub status: RoundStatus,
    pub state_out: Option<GuardState>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub events: Vec<RoundEvent>,
    pub auth_state: Option<ConversationAuthState>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoundQuery {
    pub conversation_id: Option<ConversationId>,
    /// Only rounds with `round_seq >= since_round_seq`.
    pub since_round_seq: u64,
    pub include_open: bool,
    pub limit: Option<u32>,
}

#[async_trait]
pub trait TraceRepository: Send + Sync {
    async fn open_round(&self, opening: RoundOpening) -> Result<RoundHeader, RepositoryError>;

    /// Fails with `Conflict` when the round is unknown or already closed.
    async fn close_round(&self, closure: RoundClosure) -> Result<RoundHeader, RepositoryError>;

    async fn find_round(&self, round_id: &RoundId) -> Result<Option<RoundHeader>, RepositoryError>;

    /// Events of a round in append order, starting after `after_event_seq`.
    async fn list_events(
        &self,
        round_id: &RoundId,
        after_event_seq: u64,
    ) -> Result<Vec<RoundEvent>, RepositoryError>;

    /// Rounds ordered by conversation then `round_seq`.
    async fn list_rounds(&self, query: &RoundQuery) -> Result<Vec<RoundHeader>, RepositoryError>;

    /// Closed rounds across all conversations in close order.
    async fn list_closed_rounds(
        &self,
        closed_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoundHeader>, RepositoryError>;

    async fn last_round_seq(&self, conversation_id: &ConversationId) -> Result<u64, RepositoryError>;

    /// Loads the conversation's auth state record, migrating older layouts.
    async fn load_auth_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationAuthState>, RepositoryError>;
}

#[async_trait]
pub trait LibraryRepository: Send + Sync {
    /// Returns the stored identifier, storing `candidate` first if none exists.
    async fn get_or_create(&self, candidate: LibraryId) -> Result<LibraryId, RepositoryError>;
}

pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn to_i64(column: &str, value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!("value for `{column}` does not fit in storage: {value}"))
    })
}

/// Decodes a stored auth state record through the versioned migration path.
pub(crate) fn decode_auth_state(
    conversation_id: &ConversationId,
    raw: &str,
) -> Result<ConversationAuthState, RepositoryError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|error| {
        RepositoryError::Decode(format!(
            "conversation state record for `{conversation_id}` is not JSON: {error}"
        ))
    })?;
    let (state, migrated) = ConversationAuthState::migrate(value, conversation_id)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;
    if migrated {
        tracing::info!(
            event_name = "auth_state.migrated",
            correlation_id = "bootstrap",
            conversation_id = %conversation_id,
            schema_version = state.schema_version,
            "migrated legacy conversation state record"
        );
    }
    Ok(state)
}
