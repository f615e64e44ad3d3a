use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::levels::{AuthLevel, Command, CommandChain};
use crate::errors::DomainError;
use crate::ids::{ConversationId, RoundId};

pub const AUTH_STATE_SCHEMA_VERSION: u32 = 2;

/// Confirmation ids remembered per conversation for replay detection.
pub const SEEN_CONFIRMATION_LIMIT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardState {
    Default,
    Conversation,
    Action,
    Research,
}

impl GuardState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Conversation => "conversation",
            Self::Action => "action",
            Self::Research => "research",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "conversation" => Some(Self::Conversation),
            "action" => Some(Self::Action),
            "research" => Some(Self::Research),
            _ => None,
        }
    }
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a confirmation is bound to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConfirmationScope {
    Command(String),
    Chain(String),
}

impl ConfirmationScope {
    pub fn id(&self) -> &str {
        match self {
            Self::Command(id) | Self::Chain(id) => id,
        }
    }

    /// Payload field under which the scope id is written in trace events.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Command(_) => "command_id",
            Self::Chain(_) => "chain_id",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRecord {
    pub confirmation_id: String,
    pub scope: ConfirmationScope,
    pub auth_level: AuthLevel,
    pub step: u8,
    pub confirmed: bool,
    pub channel: String,
    pub round_id: RoundId,
    pub received_at: DateTime<Utc>,
}

/// The action an authorization unlocks once its confirmations are complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthTarget {
    Command { command: Command },
    Chain { chain: CommandChain, next_member: usize },
    Reversal { command_id: String, inputs: Value },
    ReExecution { command: Command, lineage: String },
}

impl AuthTarget {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::Chain { .. } => "chain",
            Self::Reversal { .. } => "reversal",
            Self::ReExecution { .. } => "re_execution",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub scope: ConfirmationScope,
    pub level: AuthLevel,
    pub target: AuthTarget,
    pub requested_in: Option<RoundId>,
    #[serde(default)]
    pub confirmations: Vec<ConfirmationRecord>,
}

impl PendingAuthorization {
    pub fn new(
        scope: ConfirmationScope,
        level: AuthLevel,
        target: AuthTarget,
        requested_in: RoundId,
    ) -> Self {
        Self { scope, level, target, requested_in: Some(requested_in), confirmations: Vec::new() }
    }

    pub fn accepted_count(&self) -> u8 {
        let accepted = self.confirmations.iter().filter(|record| record.confirmed).count();
        u8::try_from(accepted).unwrap_or(u8::MAX)
    }
}

/// Last level-2 action, kept so that an objection can reverse it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReversibleAction {
    pub command_id: String,
    pub inputs: Value,
    pub round_id: RoundId,
    pub executed_at: DateTime<Utc>,
}

/// Durable per-conversation gate state. Only mutated under the conversation's
/// exclusive section and persisted together with the round close.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationAuthState {
    pub schema_version: u32,
    pub conversation_id: ConversationId,
    pub current_state: GuardState,
    pub next_state: Option<GuardState>,
    pub pending: Option<PendingAuthorization>,
    pub last_reversible: Option<ReversibleAction>,
    /// Most recent confirmation ids, oldest first, at most
    /// [`SEEN_CONFIRMATION_LIMIT`] of them.
    #[serde(default)]
    pub seen_confirmation_ids: VecDeque<String>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationAuthState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            schema_version: AUTH_STATE_SCHEMA_VERSION,
            conversation_id,
            current_state: GuardState::Default,
            next_state: None,
            pending: None,
            last_reversible: None,
            seen_confirmation_ids: VecDeque::new(),
            updated_at: Utc::now(),
        }
    }

    /// Applies any transition queued by the previous round and returns the
    /// state this round runs in.
    pub fn begin_round(&mut self) -> GuardState {
        if let Some(next) = self.next_state.take() {
            if next != self.current_state {
                // Pending authorizations do not survive a state change.
                self.pending = None;
            }
            self.current_state = next;
        }
        self.current_state
    }

    pub fn queue_transition(&mut self, target: GuardState) {
        self.next_state = Some(target);
    }

    pub fn state_out(&self) -> GuardState {
        self.next_state.unwrap_or(self.current_state)
    }

    pub fn has_seen_confirmation(&self, confirmation_id: &str) -> bool {
        self.seen_confirmation_ids.iter().any(|seen| seen == confirmation_id)
    }

    /// Remembers a confirmation id, forgetting the oldest past the limit.
    pub fn remember_confirmation(&mut self, confirmation_id: &str) {
        if self.has_seen_confirmation(confirmation_id) {
            return;
        }
        self.seen_confirmation_ids.push_back(confirmation_id.to_string());
        while self.seen_confirmation_ids.len() > SEEN_CONFIRMATION_LIMIT {
            self.seen_confirmation_ids.pop_front();
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    /// Decodes a persisted record of any known version into the current layout.
    pub fn migrate(
        raw: Value,
        conversation_id: &ConversationId,
    ) -> Result<(Self, bool), DomainError> {
        let version = raw
            .get("schema_version")
            .or_else(|| raw.get("version"))
            .and_then(Value::as_u64)
            .unwrap_or(1);

        match version {
            2 => serde_json::from_value::<Self>(raw)
                .map(|state| (state, false))
                .map_err(|error| DomainError::InvariantViolation(format!(
                    "conversation state record for `{conversation_id}` is malformed: {error}"
                ))),
            1 => migrate_v1(&raw, conversation_id).map(|state| (state, true)),
            other => Err(DomainError::UnsupportedStateVersion(
                u32::try_from(other).unwrap_or(u32::MAX),
            )),
        }
    }
}

fn migrate_v1(raw: &Value, conversation_id: &ConversationId) -> Result<ConversationAuthState, DomainError> {
    let mut state = ConversationAuthState::new(conversation_id.clone());

    if let Some(name) = raw.get("current_state").and_then(Value::as_str) {
        // v1 also had planning/command_lock; both collapse into the action state.
        state.current_state = match GuardState::parse(name) {
            Some(parsed) => parsed,
            None if matches!(name.to_ascii_lowercase().as_str(), "planning" | "command_lock") => {
                GuardState::Action
            }
            None => {
                return Err(DomainError::InvariantViolation(format!(
                    "unknown legacy guard state `{name}` for `{conversation_id}`"
                )))
            }
        };
    }

    if let Some(pending) = raw.get("pending").filter(|value| !value.is_null()) {
        let (command, chain_id) = legacy_command(pending, conversation_id)?;
        let level = command.auth_level;
        let (scope, target) = match chain_id {
            Some(chain_id) => (
                ConfirmationScope::Chain(chain_id.clone()),
                AuthTarget::Chain { chain: CommandChain::new(chain_id, vec![command]), next_member: 0 },
            ),
            None => (
                ConfirmationScope::Command(command.command_id.clone()),
                AuthTarget::Command { command },
            ),
        };
        state.pending = Some(PendingAuthorization {
            scope,
            level,
            target,
            requested_in: None,
            confirmations: Vec::new(),
        });
    }

    if let Some(last) = raw.get("last_level2").filter(|value| !value.is_null()) {
        let (command, _) = legacy_command(last, conversation_id)?;
        state.last_reversible = Some(ReversibleAction {
            command_id: command.command_id,
            inputs: Value::Null,
            round_id: RoundId("legacy".to_string()),
            executed_at: state.updated_at,
        });
    }

    Ok(state)
}

fn legacy_command(
    value: &Value,
    conversation_id: &ConversationId,
) -> Result<(Command, Option<String>), DomainError> {
    let command_id = value.get("command_id").and_then(Value::as_str).ok_or_else(|| {
        DomainError::InvariantViolation(format!(
            "legacy command entry for `{conversation_id}` has no command_id"
        ))
    })?;
    let level = value
        .get("authority_level")
        .and_then(Value::as_u64)
        .and_then(|level| u8::try_from(level).ok())
        .and_then(AuthLevel::from_u8)
        .ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "legacy command `{command_id}` has no valid authority_level"
            ))
        })?;
    let chain_id = value.get("chain_id").and_then(Value::as_str).map(str::to_string);
    Ok((Command::new(command_id, level), chain_id))
}
