use async_trait::async_trait;
use roundkeeper_core::{AuthLevel, CollaboratorError, ConfirmationScope, ConversationId, RoundId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfirmationPrompt {
    pub round_id: RoundId,
    pub conversation_id: ConversationId,
    pub scope: ConfirmationScope,
    pub auth_level: AuthLevel,
    pub step: u8,
    pub steps_required: u8,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmationReply {
    Accepted { confirmation_id: String, channel: String },
    Rejected { confirmation_id: String, channel: String },
    /// No answer within this turn; the authorization stays pending.
    Deferred,
}

/// Asks the user to confirm within the current turn.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, prompt: &ConfirmationPrompt) -> Result<ConfirmationReply, CollaboratorError>;
}

/// Turn-based channels answer on the next turn, so every prompt is deferred.
#[derive(Clone, Copy, Debug, Default)]
pub struct NextTurnConfirmer;

#[async_trait]
impl Confirmer for NextTurnConfirmer {
    async fn confirm(&self, _prompt: &ConfirmationPrompt) -> Result<ConfirmationReply, CollaboratorError> {
        Ok(ConfirmationReply::Deferred)
    }
}

pub fn prompt_text(command_label: &str, step: u8, steps_required: u8) -> String {
    if steps_required > 1 {
        format!("Please confirm {command_label} ({step} of {steps_required}). Say yes to continue.")
    } else {
        format!("Please confirm {command_label}. Say yes to continue.")
    }
}
