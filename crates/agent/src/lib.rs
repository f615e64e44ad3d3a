//! Agent runtime: turns one user utterance into one traced round.
//!
//! The runtime owns the order of operations inside a round and nothing else.
//! Routing, generation, tools, background jobs, bucket memory and the
//! confirmation channel are collaborators behind traits, so hosts can plug in
//! their own implementations.
//!
//! # Round shape
//!
//! 1. **Intake** - scrub secrets, normalize, run input validators
//! 2. **Routing** (`routing`) - chat, research, command, chain, confirm, undo
//! 3. **Authorization** - levels 1 to 4 gate commands and chains before anything runs
//! 4. **Execution** (`llm`, `tools`, `jobs`) - bounded retries, side effects never retried
//! 5. **Close** - events, header and auth state are written together
//!
//! # Key Types
//!
//! - `RoundOrchestrator` - main entry point (see `runtime` module)
//! - `Router`, `LlmClient`, `Tool`, `JobQueue`, `BucketMemory`, `Confirmer` - collaborator seams
//!
//! # Safety Principle
//!
//! The model only produces text. Whether a command may run is decided by the
//! authorization gate from the command catalog, never by generated output.

pub mod confirm;
pub mod jobs;
pub mod llm;
pub mod memory;
pub mod prompt;
pub mod routing;
pub mod runtime;
pub mod secrets;
pub mod tools;

pub use confirm::{ConfirmationPrompt, ConfirmationReply, Confirmer, NextTurnConfirmer};
pub use jobs::{JobQueue, JobRequest};
pub use llm::{LlmClient, LlmOutput};
pub use memory::BucketMemory;
pub use routing::{Route, RouteDecision, Router, RoutingInput};
pub use runtime::{
    Collaborators, OrchestratorError, OrchestratorSettings, RoundOrchestrator, TurnInput,
    TurnOutcome, TurnResponse,
};
pub use secrets::{HeuristicSecretScanner, Scrubbed, SecretScanner};
pub use tools::{Tool, ToolRegistry};
