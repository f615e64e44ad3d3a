use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Authorization levels, ordered by risk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AuthLevel {
    /// Executes immediately.
    Immediate = 1,
    /// Executes immediately and is recorded as reversible.
    Reversible = 2,
    /// One confirmation before execution.
    Confirmed = 3,
    /// Two sequential confirmations before execution.
    DoubleConfirmed = 4,
}

impl AuthLevel {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Immediate),
            2 => Some(Self::Reversible),
            3 => Some(Self::Confirmed),
            4 => Some(Self::DoubleConfirmed),
            _ => None,
        }
    }

    pub fn required_confirmations(self) -> u8 {
        match self {
            Self::Immediate | Self::Reversible => 0,
            Self::Confirmed => 1,
            Self::DoubleConfirmed => 2,
        }
    }

    pub fn is_reversible(self) -> bool {
        matches!(self, Self::Reversible)
    }
}

impl TryFrom<u8> for AuthLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or_else(|| format!("auth level must be 1..=4, got {value}"))
    }
}

impl From<AuthLevel> for u8 {
    fn from(value: AuthLevel) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.as_u8())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: String,
    /// Level anticipated by whoever produced the command (router rule or macro).
    pub auth_level: AuthLevel,
    #[serde(default)]
    pub inputs: Value,
    /// Set when the router could not fully resolve the command's arguments.
    #[serde(default)]
    pub ambiguous: bool,
}

impl Command {
    pub fn new(command_id: impl Into<String>, auth_level: AuthLevel) -> Self {
        Self { command_id: command_id.into(), auth_level, inputs: Value::Null, ambiguous: false }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn marked_ambiguous(mut self) -> Self {
        self.ambiguous = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandChain {
    pub chain_id: String,
    pub macro_id: Option<String>,
    pub members: Vec<Command>,
}

impl CommandChain {
    pub fn new(chain_id: impl Into<String>, members: Vec<Command>) -> Self {
        Self { chain_id: chain_id.into(), macro_id: None, members }
    }

    /// The highest level among members; an empty chain needs no authorization.
    pub fn chain_level(&self) -> AuthLevel {
        self.members.iter().map(|member| member.auth_level).max().unwrap_or(AuthLevel::Immediate)
    }
}
