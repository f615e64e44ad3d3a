use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::levels::{AuthLevel, Command, CommandChain};
use crate::auth::state::{ConfirmationRecord, ConfirmationScope, ConversationAuthState};
use crate::errors::failure_codes;

/// Authoritative metadata for a command the assistant knows how to execute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command_id: String,
    pub auth_level: AuthLevel,
    pub side_effecting: bool,
}

impl CommandSpec {
    pub fn new(command_id: impl Into<String>, auth_level: AuthLevel) -> Self {
        Self { command_id: command_id.into(), auth_level, side_effecting: false }
    }

    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommandCatalog {
    specs: HashMap<String, CommandSpec>,
}

impl CommandCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: CommandSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn insert(&mut self, spec: CommandSpec) {
        self.specs.insert(spec.command_id.clone(), spec);
    }

    pub fn get(&self, command_id: &str) -> Option<&CommandSpec> {
        self.specs.get(command_id)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Authorizable<'a> {
    Command(&'a Command),
    Chain(&'a CommandChain),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    AwaitConfirmation { needed: u8, next_step: u8 },
    Blocked { reason_code: &'static str },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Recorded,
    Duplicate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberCheck {
    Proceed,
    Reconfirm { reason_code: &'static str },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("command `{command_id}` is not in the catalog")]
    UnknownCommand { command_id: String },
    #[error("chain `{chain_id}` has no members")]
    EmptyChain { chain_id: String },
    #[error("confirmation for `{received}` does not match pending `{expected}`")]
    ConfirmationMismatch { expected: String, received: String },
    #[error("confirmation step {received} is out of order (expected step {expected})")]
    StepOutOfOrder { expected: u8, received: u8 },
    #[error("no authorization is pending for this conversation")]
    NothingPending,
}

impl GateError {
    pub fn failure_code(&self) -> &'static str {
        match self {
            Self::UnknownCommand { .. } | Self::EmptyChain { .. } => failure_codes::UNKNOWN_COMMAND,
            Self::ConfirmationMismatch { .. } | Self::StepOutOfOrder { .. } => {
                failure_codes::CONFIRMATION_MISMATCH
            }
            Self::NothingPending => failure_codes::UNRESOLVED_LEVEL,
        }
    }
}

/// Decides how much authorization a command or chain needs and whether the
/// confirmations gathered so far are enough.
#[derive(Clone, Debug)]
pub struct AuthGate {
    catalog: CommandCatalog,
}

impl AuthGate {
    pub fn new(catalog: CommandCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &CommandCatalog {
        &self.catalog
    }

    pub fn spec(&self, command_id: &str) -> Result<&CommandSpec, GateError> {
        self.catalog
            .get(command_id)
            .ok_or_else(|| GateError::UnknownCommand { command_id: command_id.to_string() })
    }

    /// Effective level is the higher of what the command declares and what the
    /// catalog says. Unknown commands fail closed.
    pub fn required_level(&self, target: Authorizable<'_>) -> Result<AuthLevel, GateError> {
        match target {
            Authorizable::Command(command) => self.command_level(command),
            Authorizable::Chain(chain) => {
                if chain.members.is_empty() {
                    return Err(GateError::EmptyChain { chain_id: chain.chain_id.clone() });
                }
                let mut level = AuthLevel::Immediate;
                for member in &chain.members {
                    level = level.max(self.command_level(member)?);
                }
                Ok(level)
            }
        }
    }

    fn command_level(&self, command: &Command) -> Result<AuthLevel, GateError> {
        let spec = self.spec(&command.command_id)?;
        Ok(command.auth_level.max(spec.auth_level))
    }

    pub fn gate(&self, level: AuthLevel, confirmations: &[ConfirmationRecord]) -> GateDecision {
        if confirmations.iter().any(|record| !record.confirmed) {
            return GateDecision::Blocked { reason_code: failure_codes::CONFIRMATION_DECLINED };
        }

        let required = level.required_confirmations();
        let accepted = u8::try_from(confirmations.len()).unwrap_or(u8::MAX);
        if accepted >= required {
            GateDecision::Proceed
        } else {
            GateDecision::AwaitConfirmation { needed: required - accepted, next_step: accepted + 1 }
        }
    }

    /// Adds a confirmation to the conversation's pending authorization.
    /// A confirmation id that was already seen is acknowledged without effect.
    pub fn record_confirmation(
        &self,
        state: &mut ConversationAuthState,
        record: ConfirmationRecord,
    ) -> Result<ConfirmationOutcome, GateError> {
        if state.has_seen_confirmation(&record.confirmation_id) {
            return Ok(ConfirmationOutcome::Duplicate);
        }

        let pending = state.pending.as_mut().ok_or(GateError::NothingPending)?;
        if pending.scope != record.scope {
            return Err(GateError::ConfirmationMismatch {
                expected: scope_label(&pending.scope),
                received: scope_label(&record.scope),
            });
        }

        let expected_step = pending.accepted_count() + 1;
        if record.confirmed && record.step != expected_step {
            return Err(GateError::StepOutOfOrder { expected: expected_step, received: record.step });
        }

        let confirmation_id = record.confirmation_id.clone();
        pending.confirmations.push(record);
        state.remember_confirmation(&confirmation_id);
        Ok(ConfirmationOutcome::Recorded)
    }

    /// Re-examines a chain member right before it executes.
    pub fn check_member(
        &self,
        authorized: AuthLevel,
        member: &Command,
    ) -> Result<MemberCheck, GateError> {
        if member.ambiguous {
            return Ok(MemberCheck::Reconfirm { reason_code: "chain.member_ambiguous" });
        }
        if self.command_level(member)? > authorized {
            return Ok(MemberCheck::Reconfirm { reason_code: "chain.risk_increased" });
        }
        Ok(MemberCheck::Proceed)
    }
}

fn scope_label(scope: &ConfirmationScope) -> String {
    format!("{}:{}", scope.field_name(), scope.id())
}
