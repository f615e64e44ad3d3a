//! The decision-trace log: the only writer of round headers and events.
//!
//! A round is opened durably as `open` while the conversation's exclusive
//! section is held. Events are validated and numbered as they are appended,
//! buffered in the [`RoundHandle`], and written in one transaction together
//! with the closing header and the conversation's auth state record.

use std::sync::Arc;

use roundkeeper_core::chrono::{DateTime, Utc};
use roundkeeper_core::errors::failure_codes;
use roundkeeper_core::trace::{
    unresolved_steps, EventDraft, ExportScope, HeaderDraft, RoundEvent, RoundHeader, RoundRecord,
    RoundStatus, SchemaError, Watermark,
};
use roundkeeper_core::{
    ConversationAuthState, ConversationId, ConversationLease, ConversationLocks, EventSequencer,
    GuardState, LibraryId, RoundId,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::repositories::{
    RepositoryError, RoundClosure, RoundOpening, RoundQuery, TraceRepository,
};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("event rejected: {0}")]
    Schema(#[from] SchemaError),
    #[error("trace storage failed: {0}")]
    Storage(#[from] RepositoryError),
    #[error("lease for conversation `{held}` cannot open a round for `{requested}`")]
    LeaseMismatch { held: ConversationId, requested: ConversationId },
    #[error("round status `{0}` cannot be used to close a round this way")]
    InvalidStatus(&'static str),
    #[error("round `{round_id}` has unresolved steps: {steps:?}")]
    Unresolved { round_id: RoundId, steps: Vec<String>, handle: Box<RoundHandle> },
    #[error("round `{round_id}` could not be closed: {source}")]
    CloseFailed {
        round_id: RoundId,
        #[source]
        source: RepositoryError,
        handle: Box<RoundHandle>,
    },
    #[error("round `{0}` was not found")]
    NotFound(RoundId),
    #[error("round `{0}` is still open")]
    StillOpen(RoundId),
}

impl TraceError {
    /// Gives back a round that was not closed, with its events, so it can be
    /// aborted or closed again.
    pub fn into_handle(self) -> Option<RoundHandle> {
        match self {
            Self::Unresolved { handle, .. } | Self::CloseFailed { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}

/// Write scope of one in-flight round. Holding it keeps the conversation's
/// exclusive section; dropping it without closing leaves the round `open`
/// until [`DecisionTraceLog::recover_abandoned`] runs.
#[derive(Debug)]
pub struct RoundHandle {
    header: RoundHeader,
    events: Vec<RoundEvent>,
    sequencer: EventSequencer,
    _lease: ConversationLease,
}

impl RoundHandle {
    pub fn header(&self) -> &RoundHeader {
        &self.header
    }

    pub fn round_id(&self) -> &RoundId {
        &self.header.round_id
    }

    pub fn round_seq(&self) -> u64 {
        self.header.round_seq
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.header.conversation_id
    }

    pub fn state_in(&self) -> GuardState {
        self.header.state_in
    }

    pub fn events(&self) -> &[RoundEvent] {
        &self.events
    }

    pub fn unresolved_steps(&self) -> Vec<String> {
        unresolved_steps(&self.events)
    }
}

pub struct DecisionTraceLog {
    repository: Arc<dyn TraceRepository>,
    locks: ConversationLocks,
    library_id: LibraryId,
}

impl DecisionTraceLog {
    pub fn new(repository: Arc<dyn TraceRepository>, library_id: LibraryId) -> Self {
        Self { repository, locks: ConversationLocks::new(), library_id }
    }

    pub fn library_id(&self) -> &LibraryId {
        &self.library_id
    }

    /// Waits for the conversation's exclusive section.
    pub async fn acquire(&self, conversation_id: &ConversationId) -> ConversationLease {
        self.locks.acquire(conversation_id).await
    }

    /// Reads the conversation's auth state; callers should hold its lease.
    pub async fn load_auth_state(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<ConversationAuthState, TraceError> {
        Ok(self
            .repository
            .load_auth_state(conversation_id)
            .await?
            .unwrap_or_else(|| ConversationAuthState::new(conversation_id.clone())))
    }

    pub async fn begin_round(
        &self,
        lease: ConversationLease,
        draft: HeaderDraft,
    ) -> Result<RoundHandle, TraceError> {
        if lease.conversation_id() != &draft.conversation_id {
            return Err(TraceError::LeaseMismatch {
                held: lease.conversation_id().clone(),
                requested: draft.conversation_id,
            });
        }

        self.close_stale_round(&draft.conversation_id).await?;

        let header = self
            .repository
            .open_round(RoundOpening {
                round_id: RoundId::generate(),
                library_id: self.library_id.clone(),
                conversation_id: draft.conversation_id,
                prior_round_id: draft.prior_round_id,
                state_in: draft.state_in,
                audio_id: draft.audio_id,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            event_name = "round.opened",
            correlation_id = %header.round_id,
            conversation_id = %header.conversation_id,
            round_seq = header.round_seq,
            state_in = header.state_in.as_str(),
            "round opened"
        );

        Ok(RoundHandle {
            header,
            events: Vec::new(),
            sequencer: EventSequencer::new(),
            _lease: lease,
        })
    }

    /// Validates and numbers an event. A rejected event consumes no sequence number.
    pub fn append_event(&self, handle: &mut RoundHandle, draft: EventDraft) -> Result<u64, TraceError> {
        if let Err(error) = draft.validate() {
            warn!(
                event_name = "trace.event_rejected",
                correlation_id = %handle.header.round_id,
                conversation_id = %handle.header.conversation_id,
                event_type = draft.event_type.as_str(),
                error = %error,
                "event rejected by schema"
            );
            return Err(error.into());
        }

        let event_seq = handle.sequencer.next_event_seq();
        let event = draft.into_event(handle.header.round_id.clone(), event_seq, Utc::now());
        handle.events.push(event);
        Ok(event_seq)
    }

    /// Closes a round whose steps have all reached a final status.
    ///
    /// While a request lacks its response the handle is returned inside
    /// [`TraceError::Unresolved`] and nothing is written.
    pub async fn commit(
        &self,
        handle: RoundHandle,
        status: RoundStatus,
        state_out: GuardState,
        auth_state: Option<ConversationAuthState>,
    ) -> Result<RoundRecord, TraceError> {
        if status == RoundStatus::Open {
            return Err(TraceError::InvalidStatus(status.as_str()));
        }
        let steps = handle.unresolved_steps();
        if !steps.is_empty() {
            return Err(TraceError::Unresolved {
                round_id: handle.header.round_id.clone(),
                steps,
                handle: Box::new(handle),
            });
        }
        self.close(handle, status, Some(state_out), None, auth_state).await
    }

    /// Closes a round as `partial` or `failed`, keeping every appended event.
    pub async fn abort(
        &self,
        handle: RoundHandle,
        status: RoundStatus,
        failure_code: &str,
        failure_reason: &str,
        auth_state: Option<ConversationAuthState>,
    ) -> Result<RoundRecord, TraceError> {
        if !matches!(status, RoundStatus::Partial | RoundStatus::Failed) {
            return Err(TraceError::InvalidStatus(status.as_str()));
        }
        let state_out = auth_state.as_ref().map(ConversationAuthState::state_out);
        self.close(
            handle,
            status,
            state_out,
            Some((failure_code.to_string(), failure_reason.to_string())),
            auth_state,
        )
        .await
    }

    async fn close(
        &self,
        handle: RoundHandle,
        status: RoundStatus,
        state_out: Option<GuardState>,
        failure: Option<(String, String)>,
        auth_state: Option<ConversationAuthState>,
    ) -> Result<RoundRecord, TraceError> {
        let (failure_code, failure_reason) = failure.unzip();
        let closed_at = Utc::now();

        let auth_state = auth_state.map(|mut state| {
            state.touch(closed_at);
            state
        });

        let result = self
            .repository
            .close_round(RoundClosure {
                round_id: handle.header.round_id.clone(),
                status,
                state_out,
                failure_code,
                failure_reason,
                closed_at,
                events: handle.events.clone(),
                auth_state,
            })
            .await;

        let closed = match result {
            Ok(closed) => closed,
            Err(error) => {
                warn!(
                    event_name = "round.close_failed",
                    correlation_id = %handle.header.round_id,
                    conversation_id = %handle.header.conversation_id,
                    event_count = handle.events.len(),
                    error = %error,
                    "round close failed, round handed back open"
                );
                return Err(TraceError::CloseFailed {
                    round_id: handle.header.round_id.clone(),
                    source: error,
                    handle: Box::new(handle),
                });
            }
        };
        let RoundHandle { events, .. } = handle;

        info!(
            event_name = "round.closed",
            correlation_id = %closed.round_id,
            conversation_id = %closed.conversation_id,
            round_seq = closed.round_seq,
            status = closed.status.as_str(),
            failure_code = closed.failure_code.as_deref().unwrap_or(""),
            event_count = events.len(),
            "round closed"
        );

        Ok(RoundRecord { header: closed, events })
    }

    /// Closed rounds in append order, resumable from a watermark.
    pub async fn export(
        &self,
        scope: &ExportScope,
        since: Option<Watermark>,
    ) -> Result<Vec<RoundRecord>, TraceError> {
        let since = since.unwrap_or_default();
        match scope {
            ExportScope::Round(round_id) => {
                let header = self
                    .repository
                    .find_round(round_id)
                    .await?
                    .ok_or_else(|| TraceError::NotFound(round_id.clone()))?;
                if !header.status.is_terminal() {
                    return Err(TraceError::StillOpen(round_id.clone()));
                }
                let events = self.repository.list_events(round_id, since.event_seq).await?;
                Ok(vec![RoundRecord { header, events }])
            }
            ExportScope::Conversation(conversation_id) => {
                let headers = self
                    .repository
                    .list_rounds(&RoundQuery {
                        conversation_id: Some(conversation_id.clone()),
                        since_round_seq: since.round_seq,
                        include_open: false,
                        limit: None,
                    })
                    .await?;

                let mut records = Vec::with_capacity(headers.len());
                for header in headers {
                    let resumed = header.round_seq == since.round_seq;
                    let after = if resumed { since.event_seq } else { 0 };
                    let events = self.repository.list_events(&header.round_id, after).await?;
                    if resumed && after > 0 && events.is_empty() {
                        continue;
                    }
                    records.push(RoundRecord { header, events });
                }
                Ok(records)
            }
        }
    }

    /// Every closed round across conversations, in close order.
    pub async fn export_all(
        &self,
        closed_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<RoundRecord>, TraceError> {
        let headers = self.repository.list_closed_rounds(closed_after).await?;
        let mut records = Vec::with_capacity(headers.len());
        for header in headers {
            let events = self.repository.list_events(&header.round_id, 0).await?;
            records.push(RoundRecord { header, events });
        }
        Ok(records)
    }

    /// Closes rounds left `open` by a process that stopped mid-round.
    ///
    /// Rounds whose conversation is currently held in this process are in
    /// flight and left alone. No events are written for recovered rounds.
    pub async fn recover_abandoned(&self) -> Result<Vec<RoundHeader>, TraceError> {
        let open = self
            .repository
            .list_rounds(&RoundQuery { include_open: true, ..RoundQuery::default() })
            .await?
            .into_iter()
            .filter(|header| header.status == RoundStatus::Open);

        let mut recovered = Vec::new();
        for header in open {
            let Some(_lease) = self.locks.try_acquire(&header.conversation_id) else {
                continue;
            };
            recovered.push(self.close_abandoned(&header, "round was still open at recovery").await?);
        }
        Ok(recovered)
    }

    /// Closes the conversation's latest round if it is still `open`. The
    /// caller holds the conversation's lease, so that round has no writer left.
    async fn close_stale_round(&self, conversation_id: &ConversationId) -> Result<(), TraceError> {
        let last_round_seq = self.repository.last_round_seq(conversation_id).await?;
        if last_round_seq == 0 {
            return Ok(());
        }
        let latest = self
            .repository
            .list_rounds(&RoundQuery {
                conversation_id: Some(conversation_id.clone()),
                since_round_seq: last_round_seq,
                include_open: true,
                limit: None,
            })
            .await?;
        for header in latest.iter().filter(|header| header.status == RoundStatus::Open) {
            self.close_abandoned(header, "round was still open when the next round began").await?;
        }
        Ok(())
    }

    async fn close_abandoned(
        &self,
        header: &RoundHeader,
        reason: &str,
    ) -> Result<RoundHeader, TraceError> {
        let closed = self
            .repository
            .close_round(RoundClosure {
                round_id: header.round_id.clone(),
                status: RoundStatus::Partial,
                state_out: None,
                failure_code: Some(failure_codes::ROUND_ABANDONED.to_string()),
                failure_reason: Some(reason.to_string()),
                closed_at: Utc::now(),
                events: Vec::new(),
                auth_state: None,
            })
            .await?;

        warn!(
            event_name = "round.recovered",
            correlation_id = %closed.round_id,
            conversation_id = %closed.conversation_id,
            round_seq = closed.round_seq,
            "abandoned round closed as partial"
        );
        Ok(closed)
    }
}
