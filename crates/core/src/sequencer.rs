use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::ids::{BucketId, ConversationId};

/// Async exclusive sections keyed by string, created on first use.
///
/// Holding a section for one key never blocks callers using another key.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    sections: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let section = {
            let mut sections = match self.sections.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sections.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        section.lock_owned().await
    }

    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let section = {
            let mut sections = match self.sections.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sections.entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        section.try_lock_owned().ok()
    }
}

/// Exclusive hold on a conversation from intake until its round is terminal.
#[derive(Debug)]
pub struct ConversationLease {
    conversation_id: ConversationId,
    _guard: OwnedMutexGuard<()>,
}

impl ConversationLease {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }
}

#[derive(Debug, Default)]
pub struct ConversationLocks {
    inner: KeyedLocks,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: &ConversationId) -> ConversationLease {
        let guard = self.inner.acquire(conversation_id.as_str()).await;
        ConversationLease { conversation_id: conversation_id.clone(), _guard: guard }
    }

    /// Returns `None` while a round for the conversation is in flight.
    pub fn try_acquire(&self, conversation_id: &ConversationId) -> Option<ConversationLease> {
        self.inner
            .try_acquire(conversation_id.as_str())
            .map(|guard| ConversationLease { conversation_id: conversation_id.clone(), _guard: guard })
    }
}

#[derive(Debug, Default)]
pub struct BucketLocks {
    inner: KeyedLocks,
}

impl BucketLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, bucket_id: &BucketId) -> OwnedMutexGuard<()> {
        self.inner.acquire(bucket_id.as_str()).await
    }
}

/// Per-round event counter. Values start at 1 and are never reused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventSequencer {
    last: u64,
}

impl Default for EventSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSequencer {
    pub fn new() -> Self {
        Self { last: 0 }
    }

    pub fn next_event_seq(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last_issued(&self) -> u64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ConversationLocks, EventSequencer};
    use crate::ids::ConversationId;

    #[test]
    fn event_sequence_starts_at_one() {
        let mut sequencer = EventSequencer::new();
        assert_eq!(sequencer.next_event_seq(), 1);
        assert_eq!(sequencer.next_event_seq(), 2);
        assert_eq!(sequencer.last_issued(), 2);
    }

    #[tokio::test]
    async fn same_conversation_is_exclusive() {
        let locks = ConversationLocks::new();
        let conversation = ConversationId::normalize(Some("abc"));

        let lease = locks.acquire(&conversation).await;
        assert!(locks.try_acquire(&conversation).is_none());
        drop(lease);
        assert!(locks.try_acquire(&conversation).is_some());
    }

    #[tokio::test]
    async fn other_conversations_are_not_blocked() {
        let locks = Arc::new(ConversationLocks::new());
        let _held = locks.acquire(&ConversationId::normalize(Some("abc"))).await;

        let other = tokio::time::timeout(
            Duration::from_millis(200),
            locks.acquire(&ConversationId::normalize(Some("xyz"))),
        )
        .await;
        assert!(other.is_ok());
    }
}
