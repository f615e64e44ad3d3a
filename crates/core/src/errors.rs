use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::GateError;
use crate::trace::SchemaError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("unsupported conversation state record version {0}")]
    UnsupportedStateVersion(u32),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

/// Stable failure codes written to `round.failed` events and round headers.
pub mod failure_codes {
    pub const UNKNOWN_COMMAND: &str = "route.unknown_command";
    pub const AMBIGUOUS_ROUTE: &str = "route.ambiguous";
    pub const ROUTER_FAILED: &str = "route.unavailable";
    pub const UNRESOLVED_LEVEL: &str = "auth.unresolved_level";
    pub const CONFIRMATION_MISMATCH: &str = "auth.confirmation_mismatch";
    pub const CONFIRMATION_UNAVAILABLE: &str = "auth.confirmation_unavailable";
    pub const AWAITING_CONFIRMATION: &str = "auth.awaiting_confirmation";
    pub const CONFIRMATION_DECLINED: &str = "auth.declined";
    pub const INPUT_INCOHERENT: &str = "input.incoherent";
    pub const LLM_RETRY_EXHAUSTED: &str = "llm.retry_exhausted";
    pub const LLM_REJECTED: &str = "llm.rejected";
    pub const TOOL_FAILED: &str = "tool.failed";
    pub const TOOL_SIDE_EFFECT_FAILED: &str = "tool.side_effect_failed";
    pub const JOB_FAILED: &str = "job.failed";
    pub const ROUND_TIMEOUT: &str = "round.timeout";
    pub const ROUND_DURABILITY: &str = "round.durability";
    pub const ROUND_ABANDONED: &str = "round.abandoned";
    pub const ROUND_INCOMPLETE: &str = "round.incomplete";
    pub const RESEARCH_ESCALATED: &str = "research.escalated";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Classification,
    Authorization,
    Transient,
    SideEffect,
    Durability,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::Authorization => "authorization",
            Self::Transient => "transient",
            Self::SideEffect => "side_effect",
            Self::Durability => "durability",
        }
    }

    /// Classification and authorization failures never execute anything.
    pub fn fails_closed(&self) -> bool {
        matches!(self, Self::Classification | Self::Authorization)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, terminal reason for a round not completing normally.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{class} failure `{code}`: {reason}")]
pub struct RoundFailure {
    pub class: FailureClass,
    pub code: String,
    pub reason: String,
}

impl RoundFailure {
    pub fn new(class: FailureClass, code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { class, code: code.into(), reason: reason.into() }
    }

    pub fn classification(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Classification, code, reason)
    }

    pub fn authorization(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Authorization, code, reason)
    }

    pub fn durability(reason: impl Into<String>) -> Self {
        Self::new(FailureClass::Durability, failure_codes::ROUND_DURABILITY, reason)
    }

    pub fn user_message(&self) -> &'static str {
        match self.class {
            FailureClass::Classification => {
                "I couldn't match that to something I can do. Could you rephrase it?"
            }
            FailureClass::Authorization => {
                "That action needs an authorization I couldn't confirm, so nothing was changed."
            }
            FailureClass::Transient => "Something I depend on is not responding right now.",
            FailureClass::SideEffect => {
                "That action did not complete. Say it again to confirm a fresh attempt."
            }
            FailureClass::Durability => {
                "I couldn't record this turn safely, so nothing was carried out."
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorErrorKind {
    Timeout,
    RateLimited,
    MalformedOutput,
    /// The collaborator reported a temporary condition.
    Unavailable,
    /// The collaborator refused; retrying cannot help.
    Rejected,
}

impl CollaboratorErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::MalformedOutput => "malformed_output",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
        }
    }
}

/// Failure reported by an external collaborator (router, model, tool, job queue, ...).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?} ({code}): {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorErrorKind,
    pub code: String,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: CollaboratorErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, code: code.into(), message: message.into() }
    }

    pub fn timeout(code: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::Timeout, code, "collaborator call exceeded its timeout")
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::Unavailable, code, message)
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(CollaboratorErrorKind::Rejected, code, message)
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self.kind, CollaboratorErrorKind::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{
        failure_codes, ApplicationError, CollaboratorError, CollaboratorErrorKind, DomainError,
        FailureClass, RoundFailure,
    };

    #[test]
    fn classification_and_authorization_fail_closed() {
        assert!(FailureClass::Classification.fails_closed());
        assert!(FailureClass::Authorization.fails_closed());
        assert!(!FailureClass::Transient.fails_closed());
        assert!(!FailureClass::Durability.fails_closed());
    }

    #[test]
    fn round_failure_renders_class_and_code() {
        let failure = RoundFailure::classification(
            failure_codes::UNKNOWN_COMMAND,
            "command `ops.reboot_moon` is not in the catalog",
        );

        assert_eq!(
            failure.to_string(),
            "classification failure `route.unknown_command`: command `ops.reboot_moon` is not in the catalog"
        );
        assert!(failure.user_message().contains("rephrase"));
    }

    #[test]
    fn only_rejections_are_permanent() {
        assert!(CollaboratorError::timeout("llm.timeout").is_transient());
        assert!(CollaboratorError::new(CollaboratorErrorKind::RateLimited, "llm.429", "slow down")
            .is_transient());
        assert!(!CollaboratorError::rejected("tool.denied", "no such device").is_transient());
    }

    #[test]
    fn domain_errors_lift_into_application_errors() {
        let error = ApplicationError::from(DomainError::InvariantViolation(
            "state_in changed mid-round".to_owned(),
        ));

        assert!(matches!(error, ApplicationError::Domain(DomainError::InvariantViolation(_))));
    }
}
