use async_trait::async_trait;
use roundkeeper_core::{CollaboratorError, ConversationId, RoundId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRequest {
    pub round_id: RoundId,
    pub conversation_id: ConversationId,
    pub topic: Option<String>,
    pub query: String,
}

/// Long-running work handed off from a round. Results arrive outside the round.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns the queue's job id.
    async fn enqueue(&self, request: JobRequest) -> Result<String, CollaboratorError>;
}
