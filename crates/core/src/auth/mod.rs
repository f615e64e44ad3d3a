//! Authorization levels, confirmations and the per-conversation guard state.

pub mod gate;
pub mod levels;
pub mod state;

pub use gate::{
    AuthGate, Authorizable, CommandCatalog, CommandSpec, ConfirmationOutcome, GateDecision,
    GateError, MemberCheck,
};
pub use levels::{AuthLevel, Command, CommandChain};
pub use state::{
    AuthTarget, ConfirmationRecord, ConfirmationScope, ConversationAuthState, GuardState,
    PendingAuthorization, ReversibleAction, AUTH_STATE_SCHEMA_VERSION, SEEN_CONFIRMATION_LIMIT,
};
