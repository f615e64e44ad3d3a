use async_trait::async_trait;
use roundkeeper_core::{CollaboratorError, Command, CommandChain, ConversationId, GuardState};

/// What the router sees of a turn: scrubbed, normalized text only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingInput<'a> {
    pub conversation_id: &'a ConversationId,
    pub text: &'a str,
    pub state: GuardState,
    /// True while an authorization waits for the user's answer.
    pub awaiting_confirmation: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    Chat,
    Research { query: String },
    Command(Command),
    Chain(CommandChain),
    /// The user's answer to a pending confirmation.
    Confirm { accepted: bool },
    /// An objection to the last reversible action.
    Undo { command_id: Option<String> },
    StateTransition { target: GuardState },
    Ambiguous { candidates: Vec<String> },
}

impl Route {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Research { .. } => "research",
            Self::Command(_) => "command",
            Self::Chain(_) => "chain",
            Self::Confirm { .. } => "confirm",
            Self::Undo { .. } => "undo",
            Self::StateTransition { .. } => "state_transition",
            Self::Ambiguous { .. } => "ambiguous",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RouteDecision {
    pub route: Route,
    /// Identifier of the rule or classifier that produced the route.
    pub source_rule: String,
    pub topic: Option<String>,
}

impl RouteDecision {
    pub fn new(route: Route, source_rule: impl Into<String>) -> Self {
        Self { route, source_rule: source_rule.into(), topic: None }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, input: &RoutingInput<'_>) -> Result<RouteDecision, CollaboratorError>;
}
