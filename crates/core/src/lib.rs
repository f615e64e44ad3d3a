pub mod auth;
pub mod config;
pub mod errors;
pub mod ids;
pub mod retry;
pub mod sequencer;
pub mod trace;
pub mod validators;

pub use chrono;

pub use auth::{
    AuthGate, AuthLevel, AuthTarget, Command, CommandCatalog, CommandChain, CommandSpec,
    ConfirmationRecord, ConfirmationScope, ConversationAuthState, GateDecision, GuardState,
};
pub use errors::{
    ApplicationError, CollaboratorError, CollaboratorErrorKind, DomainError, FailureClass,
    RoundFailure,
};
pub use ids::{BucketId, CallId, ConversationId, LibraryId, RoundId};
pub use retry::{RetryDecision, RetryEngine, RetryPolicy, StepKind};
pub use sequencer::{BucketLocks, ConversationLease, ConversationLocks, EventSequencer};
pub use trace::{
    EventDraft, EventStatus, EventType, ExportScope, HeaderDraft, RoundEvent, RoundHeader,
    RoundRecord, RoundStatus, Watermark,
};
pub use validators::{Validator, ValidatorResult, ValidatorStatus};
