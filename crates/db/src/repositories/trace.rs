use roundkeeper_core::chrono::{DateTime, Utc};
use roundkeeper_core::trace::{
    EventStatus, EventType, RoundEvent, RoundHeader, RoundStatus, TRACE_ROUND_VERSION,
};
use roundkeeper_core::{
    BucketId, CallId, ConversationAuthState, ConversationId, GuardState, LibraryId, RoundId,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{
    decode_auth_state, format_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32,
    parse_u64, to_i64, RepositoryError, RoundClosure, RoundOpening, RoundQuery, TraceRepository,
};
use crate::DbPool;

const HEADER_COLUMNS: &str = "round_id,
    schema_version,
    library_id,
    bucket_id,
    conversation_id,
    round_seq,
    prior_round_id,
    state_in,
    state_out,
    audio_id,
    created_at,
    closed_at,
    status,
    failure_code,
    failure_reason";

const EVENT_COLUMNS: &str = "round_id,
    event_seq,
    schema_version,
    event_type,
    call_id,
    timestamp,
    payload_json,
    status,
    failure_code,
    failure_reason";

#[derive(Clone)]
pub struct SqlTraceRepository {
    pool: DbPool,
}

impl SqlTraceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl TraceRepository for SqlTraceRepository {
    async fn open_round(&self, opening: RoundOpening) -> Result<RoundHeader, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let round_seq = next_round_seq(&mut tx, &opening.conversation_id, &opening.created_at).await?;

        let header = RoundHeader {
            schema_version: TRACE_ROUND_VERSION,
            library_id: opening.library_id,
            bucket_id: opening.conversation_id.bucket(),
            conversation_id: opening.conversation_id,
            round_id: opening.round_id,
            round_seq,
            prior_round_id: opening.prior_round_id,
            state_in: opening.state_in,
            state_out: None,
            audio_id: opening.audio_id,
            created_at: opening.created_at,
            closed_at: None,
            status: RoundStatus::Open,
            failure_code: None,
            failure_reason: None,
        };

        sqlx::query(
            "INSERT INTO rounds (
                round_id,
                schema_version,
                library_id,
                bucket_id,
                conversation_id,
                round_seq,
                prior_round_id,
                state_in,
                state_out,
                audio_id,
                created_at,
                closed_at,
                status,
                failure_code,
                failure_reason
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?, NULL, 'open', NULL, NULL)",
        )
        .bind(&header.round_id.0)
        .bind(i64::from(header.schema_version))
        .bind(&header.library_id.0)
        .bind(&header.bucket_id.0)
        .bind(&header.conversation_id.0)
        .bind(to_i64("round_seq", header.round_seq)?)
        .bind(header.prior_round_id.as_ref().map(|id| id.0.clone()))
        .bind(header.state_in.as_str())
        .bind(header.audio_id.as_deref())
        .bind(format_timestamp(&header.created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(header)
    }

    async fn close_round(&self, closure: RoundClosure) -> Result<RoundHeader, RepositoryError> {
        if !closure.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "round `{}` cannot be closed with status `open`",
                closure.round_id
            )));
        }

        let mut tx = self.pool.begin().await?;

        for event in &closure.events {
            if event.round_id != closure.round_id {
                return Err(RepositoryError::Conflict(format!(
                    "event {} belongs to round `{}`, not `{}`",
                    event.event_seq, event.round_id, closure.round_id
                )));
            }
            insert_event(&mut tx, event).await?;
        }

        let result = sqlx::query(
            "UPDATE rounds
             SET status = ?,
                 state_out = ?,
                 closed_at = ?,
                 failure_code = ?,
                 failure_reason = ?
             WHERE round_id = ? AND status = 'open'",
        )
        .bind(closure.status.as_str())
        .bind(closure.state_out.map(|state| state.as_str()))
        .bind(format_timestamp(&closure.closed_at))
        .bind(closure.failure_code.as_deref())
        .bind(closure.failure_reason.as_deref())
        .bind(&closure.round_id.0)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "round `{}` is not open",
                closure.round_id
            )));
        }

        if let Some(state) = &closure.auth_state {
            save_auth_state(&mut tx, state).await?;
        }

        let row = sqlx::query(&format!("SELECT {HEADER_COLUMNS} FROM rounds WHERE round_id = ?"))
            .bind(&closure.round_id.0)
            .fetch_one(&mut *tx)
            .await?;
        let header = header_from_row(row)?;

        tx.commit().await?;
        Ok(header)
    }

    async fn find_round(&self, round_id: &RoundId) -> Result<Option<RoundHeader>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {HEADER_COLUMNS} FROM rounds WHERE round_id = ?"))
            .bind(&round_id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(header_from_row).transpose()
    }

    async fn list_events(
        &self,
        round_id: &RoundId,
        after_event_seq: u64,
    ) -> Result<Vec<RoundEvent>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM events
             WHERE round_id = ? AND event_seq > ?
             ORDER BY event_seq ASC"
        ))
        .bind(&round_id.0)
        .bind(to_i64("event_seq", after_event_seq)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(event_from_row).collect()
    }

    async fn list_rounds(&self, query: &RoundQuery) -> Result<Vec<RoundHeader>, RepositoryError> {
        let limit = query.limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS}
             FROM rounds
             WHERE (? IS NULL OR conversation_id = ?)
               AND round_seq >= ?
               AND (? OR status <> 'open')
             ORDER BY conversation_id ASC, round_seq ASC
             LIMIT ?"
        ))
        .bind(query.conversation_id.as_ref().map(|id| id.0.clone()))
        .bind(query.conversation_id.as_ref().map(|id| id.0.clone()))
        .bind(to_i64("round_seq", query.since_round_seq)?)
        .bind(query.include_open)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(header_from_row).collect()
    }

    async fn list_closed_rounds(
        &self,
        closed_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoundHeader>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {HEADER_COLUMNS}
             FROM rounds
             WHERE status <> 'open'
               AND (? IS NULL OR closed_at > ?)
             ORDER BY closed_at ASC, round_id ASC"
        ))
        .bind(closed_after.as_ref().map(format_timestamp))
        .bind(closed_after.as_ref().map(format_timestamp))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(header_from_row).collect()
    }

    async fn last_round_seq(&self, conversation_id: &ConversationId) -> Result<u64, RepositoryError> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT last_round_seq FROM conversation_sequence WHERE conversation_id = ?",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        value.map(|seq| parse_u64("last_round_seq", seq)).transpose().map(Option::unwrap_or_default)
    }

    async fn load_auth_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationAuthState>, RepositoryError> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT record_json FROM conversation_auth_state WHERE conversation_id = ?",
        )
        .bind(&conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|raw| decode_auth_state(conversation_id, &raw)).transpose()
    }
}

/// Allocates the next `round_seq` for a conversation inside the caller's
/// transaction, so the counter and the header commit or roll back together.
async fn next_round_seq(
    conn: &mut SqliteConnection,
    conversation_id: &ConversationId,
    now: &DateTime<Utc>,
) -> Result<u64, RepositoryError> {
    let seq = sqlx::query_scalar::<_, i64>(
        "INSERT INTO conversation_sequence (conversation_id, last_round_seq, updated_at)
         VALUES (?, 1, ?)
         ON CONFLICT(conversation_id) DO UPDATE SET
            last_round_seq = conversation_sequence.last_round_seq + 1,
            updated_at = excluded.updated_at
         RETURNING last_round_seq",
    )
    .bind(&conversation_id.0)
    .bind(format_timestamp(now))
    .fetch_one(&mut *conn)
    .await?;

    parse_u64("last_round_seq", seq)
}

async fn insert_event(conn: &mut SqliteConnection, event: &RoundEvent) -> Result<(), RepositoryError> {
    let payload_json = serde_json::to_string(&event.payload).map_err(|error| {
        RepositoryError::Decode(format!(
            "payload of event {} in round `{}` is not serializable: {error}",
            event.event_seq, event.round_id
        ))
    })?;

    sqlx::query(
        "INSERT INTO events (
            round_id,
            event_seq,
            schema_version,
            event_type,
            call_id,
            timestamp,
            payload_json,
            status,
            failure_code,
            failure_reason
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.round_id.0)
    .bind(to_i64("event_seq", event.event_seq)?)
    .bind(i64::from(event.schema_version))
    .bind(event.event_type.as_str())
    .bind(event.call_id.as_ref().map(|id| id.0.clone()))
    .bind(format_timestamp(&event.timestamp))
    .bind(payload_json)
    .bind(event.status.as_str())
    .bind(event.failure_code.as_deref())
    .bind(event.failure_reason.as_deref())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn save_auth_state(
    conn: &mut SqliteConnection,
    state: &ConversationAuthState,
) -> Result<(), RepositoryError> {
    let record_json = serde_json::to_string(state).map_err(|error| {
        RepositoryError::Decode(format!(
            "conversation state record for `{}` is not serializable: {error}",
            state.conversation_id
        ))
    })?;

    sqlx::query(
        "INSERT INTO conversation_auth_state (conversation_id, schema_version, record_json, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(conversation_id) DO UPDATE SET
            schema_version = excluded.schema_version,
            record_json = excluded.record_json,
            updated_at = excluded.updated_at",
    )
    .bind(&state.conversation_id.0)
    .bind(i64::from(state.schema_version))
    .bind(record_json)
    .bind(format_timestamp(&state.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

fn header_from_row(row: SqliteRow) -> Result<RoundHeader, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = RoundStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown round status `{status_raw}`")))?;

    let state_in_raw = row.try_get::<String, _>("state_in")?;
    let state_in = parse_state("state_in", &state_in_raw)?;
    let state_out = row
        .try_get::<Option<String>, _>("state_out")?
        .map(|value| parse_state("state_out", &value))
        .transpose()?;

    Ok(RoundHeader {
        schema_version: parse_u32("schema_version", row.try_get("schema_version")?)?,
        library_id: LibraryId(row.try_get("library_id")?),
        bucket_id: BucketId(row.try_get("bucket_id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        round_id: RoundId(row.try_get("round_id")?),
        round_seq: parse_u64("round_seq", row.try_get("round_seq")?)?,
        prior_round_id: row.try_get::<Option<String>, _>("prior_round_id")?.map(RoundId),
        state_in,
        state_out,
        audio_id: row.try_get("audio_id")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        closed_at: parse_optional_timestamp("closed_at", row.try_get("closed_at")?)?,
        status,
        failure_code: row.try_get("failure_code")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn event_from_row(row: SqliteRow) -> Result<RoundEvent, RepositoryError> {
    let event_type_raw = row.try_get::<String, _>("event_type")?;
    let event_type = EventType::parse(&event_type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event type `{event_type_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown event status `{status_raw}`")))?;

    let payload_raw = row.try_get::<String, _>("payload_json")?;
    let payload = serde_json::from_str(&payload_raw).map_err(|error| {
        RepositoryError::Decode(format!("invalid payload_json for `{event_type_raw}`: {error}"))
    })?;

    Ok(RoundEvent {
        schema_version: parse_u32("schema_version", row.try_get("schema_version")?)?,
        round_id: RoundId(row.try_get("round_id")?),
        event_seq: parse_u64("event_seq", row.try_get("event_seq")?)?,
        event_type,
        call_id: row.try_get::<Option<String>, _>("call_id")?.map(CallId),
        timestamp: parse_timestamp("timestamp", row.try_get("timestamp")?)?,
        payload,
        status,
        failure_code: row.try_get("failure_code")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn parse_state(column: &str, value: &str) -> Result<GuardState, RepositoryError> {
    GuardState::parse(value)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown guard state in `{column}`: `{value}`")))
}

#[cfg(test)]
mod tests {
    use roundkeeper_core::chrono::{Duration, Utc};
    use roundkeeper_core::trace::{EventDraft, EventType, RoundStatus};
    use roundkeeper_core::{
        ConversationAuthState, ConversationId, GuardState, LibraryId, RoundId,
    };
    use serde_json::json;

    use super::SqlTraceRepository;
    use crate::repositories::{RoundClosure, RoundOpening, RoundQuery, TraceRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn opening(conversation: &str) -> RoundOpening {
        RoundOpening {
            round_id: RoundId::generate(),
            library_id: LibraryId("library:test:1".to_string()),
            conversation_id: ConversationId::normalize(Some(conversation)),
            prior_round_id: None,
            state_in: GuardState::Default,
            audio_id: Some("audio-7".to_string()),
            created_at: Utc::now(),
        }
    }

    fn closure(round_id: &RoundId, status: RoundStatus) -> RoundClosure {
        RoundClosure {
            round_id: round_id.clone(),
            status,
            state_out: Some(GuardState::Default),
            failure_code: None,
            failure_reason: None,
            closed_at: Utc::now(),
            events: Vec::new(),
            auth_state: None,
        }
    }

    #[tokio::test]
    async fn round_seq_is_gap_free_per_conversation() {
        let repo = SqlTraceRepository::new(setup_pool().await);

        let first = repo.open_round(opening("abc")).await.expect("open");
        let other = repo.open_round(opening("xyz")).await.expect("open");
        let second = repo.open_round(opening("abc")).await.expect("open");

        assert_eq!(first.round_seq, 1);
        assert_eq!(other.round_seq, 1);
        assert_eq!(second.round_seq, 2);
        assert_eq!(first.bucket_id.as_str(), "bucket:abc");
        assert_eq!(first.status, RoundStatus::Open);
        assert_eq!(repo.last_round_seq(&ConversationId::normalize(Some("abc"))).await.expect("seq"), 2);
    }

    #[tokio::test]
    async fn close_writes_header_events_and_state_together() {
        let repo = SqlTraceRepository::new(setup_pool().await);
        let header = repo.open_round(opening("abc")).await.expect("open");

        let event = EventDraft::new(EventType::InputReceived, json!({"raw_text": "hi", "channel": "voice"}))
            .into_event(header.round_id.clone(), 1, Utc::now());
        let mut state = ConversationAuthState::new(header.conversation_id.clone());
        state.queue_transition(GuardState::Research);

        let mut close = closure(&header.round_id, RoundStatus::Ok);
        close.events = vec![event.clone()];
        close.auth_state = Some(state.clone());
        let closed = repo.close_round(close).await.expect("close");

        assert_eq!(closed.status, RoundStatus::Ok);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.audio_id.as_deref(), Some("audio-7"));
        assert_eq!(repo.list_events(&header.round_id, 0).await.expect("events"), vec![event]);

        let loaded = repo
            .load_auth_state(&header.conversation_id)
            .await
            .expect("load")
            .expect("state stored");
        assert_eq!(loaded.next_state, Some(GuardState::Research));
    }

    #[tokio::test]
    async fn closed_rounds_cannot_be_closed_again() {
        let repo = SqlTraceRepository::new(setup_pool().await);
        let header = repo.open_round(opening("abc")).await.expect("open");
        repo.close_round(closure(&header.round_id, RoundStatus::Ok)).await.expect("close");

        let error = repo
            .close_round(closure(&header.round_id, RoundStatus::Failed))
            .await
            .expect_err("second close");
        assert!(error.to_string().contains("conflict"), "{error}");
    }

    #[tokio::test]
    async fn failed_close_leaves_round_open() {
        let repo = SqlTraceRepository::new(setup_pool().await);
        let header = repo.open_round(opening("abc")).await.expect("open");

        let foreign = EventDraft::new(EventType::JobEnqueued, json!({"job_id": "j"}))
            .into_event(RoundId::generate(), 1, Utc::now());
        let mut close = closure(&header.round_id, RoundStatus::Ok);
        close.events = vec![foreign];
        repo.close_round(close).await.expect_err("foreign event rejected");

        let stored = repo.find_round(&header.round_id).await.expect("find").expect("exists");
        assert_eq!(stored.status, RoundStatus::Open);
        assert!(repo.list_events(&header.round_id, 0).await.expect("events").is_empty());
    }

    #[tokio::test]
    async fn listing_filters_open_rounds_and_orders_by_close() {
        let repo = SqlTraceRepository::new(setup_pool().await);
        let first = repo.open_round(opening("abc")).await.expect("open");
        let second = repo.open_round(opening("abc")).await.expect("open");
        let _still_open = repo.open_round(opening("abc")).await.expect("open");

        let mut late = closure(&first.round_id, RoundStatus::Ok);
        late.closed_at = Utc::now() + Duration::seconds(5);
        repo.close_round(late).await.expect("close first");
        repo.close_round(closure(&second.round_id, RoundStatus::Partial)).await.expect("close second");

        let query = RoundQuery {
            conversation_id: Some(ConversationId::normalize(Some("abc"))),
            ..RoundQuery::default()
        };
        let closed = repo.list_rounds(&query).await.expect("list");
        assert_eq!(closed.iter().map(|header| header.round_seq).collect::<Vec<_>>(), vec![1, 2]);

        let all = repo.list_rounds(&RoundQuery { include_open: true, ..query }).await.expect("list");
        assert_eq!(all.len(), 3);

        let by_close = repo.list_closed_rounds(None).await.expect("closed");
        assert_eq!(by_close[0].round_id, second.round_id);
        assert_eq!(by_close[1].round_id, first.round_id);
    }
}
