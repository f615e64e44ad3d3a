use async_trait::async_trait;
use roundkeeper_core::{BucketId, CollaboratorError, RoundId};

/// Conversation memory, one bucket per conversation.
#[async_trait]
pub trait BucketMemory: Send + Sync {
    /// Context lines to include in prompts, most relevant first.
    async fn context(&self, bucket_id: &BucketId) -> Result<Vec<String>, CollaboratorError>;

    /// Signals that `round_id` closed and cached context for the bucket is stale.
    async fn invalidate(&self, bucket_id: &BucketId, round_id: &RoundId) -> Result<(), CollaboratorError>;
}
