use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, RwLock};

use roundkeeper_core::chrono::{DateTime, Utc};
use roundkeeper_core::trace::{RoundEvent, RoundHeader, RoundStatus, TRACE_ROUND_VERSION};
use roundkeeper_core::{ConversationAuthState, ConversationId, LibraryId, RoundId};

use super::{
    decode_auth_state, LibraryRepository, RepositoryError, RoundClosure, RoundOpening, RoundQuery,
    TraceRepository,
};

#[derive(Default)]
struct TraceTables {
    sequences: HashMap<String, u64>,
    rounds: HashMap<String, RoundHeader>,
    events: HashMap<String, Vec<RoundEvent>>,
    auth_states: HashMap<String, String>,
}

/// Same contract as the SQL repository, held in process memory.
#[derive(Default)]
pub struct InMemoryTraceRepository {
    tables: Mutex<TraceTables>,
    failing_closes: AtomicUsize,
}

impl InMemoryTraceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw state record as-is, e.g. one written by an older release.
    pub async fn seed_auth_state(&self, conversation_id: &ConversationId, record_json: String) {
        let mut tables = self.tables.lock().await;
        tables.auth_states.insert(conversation_id.0.clone(), record_json);
    }

    /// Makes the next `count` calls to `close_round` fail as a storage outage
    /// would, without touching any table.
    pub fn fail_next_closes(&self, count: usize) {
        self.failing_closes.store(count, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TraceRepository for InMemoryTraceRepository {
    async fn open_round(&self, opening: RoundOpening) -> Result<RoundHeader, RepositoryError> {
        let mut tables = self.tables.lock().await;
        if tables.rounds.contains_key(&opening.round_id.0) {
            return Err(RepositoryError::Conflict(format!(
                "round `{}` already exists",
                opening.round_id
            )));
        }

        let seq = tables.sequences.entry(opening.conversation_id.0.clone()).or_insert(0);
        *seq += 1;
        let round_seq = *seq;

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
        tables.rounds.insert(header.round_id.0.clone(), header.clone());
        Ok(header)
    }

    async fn close_round(&self, closure: RoundClosure) -> Result<RoundHeader, RepositoryError> {
        let injected = self
            .failing_closes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut tables = self.tables.lock().await;

        let Some(current) = tables.rounds.get(&closure.round_id.0) else {
            return Err(RepositoryError::Conflict(format!("round `{}` is not open", closure.round_id)));
        };
        if current.status != RoundStatus::Open || !closure.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!("round `{}` is not open", closure.round_id)));
        }
        if let Some(event) = closure.events.iter().find(|event| event.round_id != closure.round_id) {
            return Err(RepositoryError::Conflict(format!(
                "event {} belongs to round `{}`, not `{}`",
                event.event_seq, event.round_id, closure.round_id
            )));
        }

        let record_json = closure
            .auth_state
            .as_ref()
            .map(|state| {
                serde_json::to_string(state).map_err(|error| {
                    RepositoryError::Decode(format!(
                        "conversation state record for `{}` is not serializable: {error}",
                        state.conversation_id
                    ))
                })
            })
            .transpose()?;

        let mut header = current.clone();
        header.status = closure.status;
        header.state_out = closure.state_out;
        header.closed_at = Some(closure.closed_at);
        header.failure_code = closure.failure_code;
        header.failure_reason = closure.failure_reason;

        tables.rounds.insert(header.round_id.0.clone(), header.clone());
        tables.events.insert(header.round_id.0.clone(), closure.events);
        if let Some(record_json) = record_json {
            tables.auth_states.insert(header.conversation_id.0.clone(), record_json);
        }
        Ok(header)
    }

    async fn find_round(&self, round_id: &RoundId) -> Result<Option<RoundHeader>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.rounds.get(&round_id.0).cloned())
    }

    async fn list_events(
        &self,
        round_id: &RoundId,
        after_event_seq: u64,
    ) -> Result<Vec<RoundEvent>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .events
            .get(&round_id.0)
            .map(|events| {
                events.iter().filter(|event| event.event_seq > after_event_seq).cloned().collect()
            })
            .unwrap_or_default())
    }

    async fn list_rounds(&self, query: &RoundQuery) -> Result<Vec<RoundHeader>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut rounds: Vec<RoundHeader> = tables
            .rounds
            .values()
            .filter(|header| {
                query.conversation_id.as_ref().map_or(true, |id| &header.conversation_id == id)
            })
            .filter(|header| header.round_seq >= query.since_round_seq)
            .filter(|header| query.include_open || header.status.is_terminal())
            .cloned()
            .collect();
        rounds.sort_by(|left, right| {
            (&left.conversation_id, left.round_seq).cmp(&(&right.conversation_id, right.round_seq))
        });
        if let Some(limit) = query.limit {
            rounds.truncate(limit as usize);
        }
        Ok(rounds)
    }

    async fn list_closed_rounds(
        &self,
        closed_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoundHeader>, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut rounds: Vec<RoundHeader> = tables
            .rounds
            .values()
            .filter(|header| match (header.closed_at, closed_after) {
                (Some(closed_at), Some(after)) => closed_at > after,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .cloned()
            .collect();
        rounds.sort_by(|left, right| {
            (left.closed_at, &left.round_id).cmp(&(right.closed_at, &right.round_id))
        });
        Ok(rounds)
    }

    async fn last_round_seq(&self, conversation_id: &ConversationId) -> Result<u64, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables.sequences.get(&conversation_id.0).copied().unwrap_or_default())
    }

    async fn load_auth_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationAuthState>, RepositoryError> {
        let tables = self.tables.lock().await;
        tables
            .auth_states
            .get(&conversation_id.0)
            .map(|raw| decode_auth_state(conversation_id, raw))
            .transpose()
    }
}

#[derive(Default)]
pub struct InMemoryLibraryRepository {
    library_id: RwLock<Option<LibraryId>>,
}

#[async_trait::async_trait]
impl LibraryRepository for InMemoryLibraryRepository {
    async fn get_or_create(&self, candidate: LibraryId) -> Result<LibraryId, RepositoryError> {
        let mut stored = self.library_id.write().await;
        Ok(stored.get_or_insert(candidate).clone())
    }
}

#[cfg(test)]
mod tests {
    use roundkeeper_core::chrono::Utc;
    use roundkeeper_core::trace::RoundStatus;
    use roundkeeper_core::{ConversationId, GuardState, LibraryId, RoundId};
    use serde_json::json;

    use crate::repositories::{
        InMemoryLibraryRepository, InMemoryTraceRepository, LibraryRepository, RoundClosure,
        RoundOpening, TraceRepository,
    };

    fn opening(conversation: &str) -> RoundOpening {
        RoundOpening {
            round_id: RoundId::generate(),
            library_id: LibraryId("library:test:1".to_string()),
            conversation_id: ConversationId::normalize(Some(conversation)),
            prior_round_id: None,
            state_in: GuardState::Default,
            audio_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_memory_trace_repo_mirrors_close_rules() {
        let repo = InMemoryTraceRepository::new();
        let header = repo.open_round(opening("abc")).await.expect("open");
        assert_eq!(header.round_seq, 1);

        let close = RoundClosure {
            round_id: header.round_id.clone(),
            status: RoundStatus::Partial,
            state_out: Some(GuardState::Default),
            failure_code: Some("round.timeout".to_string()),
            failure_reason: Some("budget exceeded".to_string()),
            closed_at: Utc::now(),
            events: Vec::new(),
            auth_state: None,
        };
        let closed = repo.close_round(close.clone()).await.expect("close");
        assert_eq!(closed.failure_code.as_deref(), Some("round.timeout"));
        assert!(repo.close_round(close).await.is_err());
    }

    #[tokio::test]
    async fn legacy_state_records_are_migrated_on_load() {
        let repo = InMemoryTraceRepository::new();
        let conversation = ConversationId::normalize(Some("abc"));
        let legacy = json!({
            "version": 1,
            "current_state": "COMMAND_LOCK",
            "pending": {"command_id": "ops.restart_agent", "authority_level": 3},
        });
        repo.seed_auth_state(&conversation, legacy.to_string()).await;

        let state = repo.load_auth_state(&conversation).await.expect("load").expect("present");
        assert_eq!(state.current_state, GuardState::Action);
        assert_eq!(state.pending.expect("pending").scope.id(), "ops.restart_agent");
    }

    #[tokio::test]
    async fn in_memory_library_repo_keeps_first_identifier() {
        let repo = InMemoryLibraryRepository::default();
        let first = repo.get_or_create(LibraryId("library:a:1".to_string())).await.expect("create");
        let second = repo.get_or_create(LibraryId("library:b:2".to_string())).await.expect("get");
        assert_eq!(first, second);
    }
}
