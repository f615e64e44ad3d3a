//! Identifiers that give a round and everything inside it a causal order.
//!
//! Round and call ids are UUIDv7, so their lexical order follows creation time.
//! Conversation ids are normalized before use and every conversation maps to
//! exactly one memory bucket.

use std::env;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_CONVERSATION_ID: &str = "default";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LibraryId(pub String);

impl RoundId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CallId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ConversationId {
    /// Trims surrounding whitespace; a blank or missing id becomes `default`.
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if !value.is_empty() => Self(value.to_string()),
            _ => Self(DEFAULT_CONVERSATION_ID.to_string()),
        }
    }

    pub fn bucket(&self) -> BucketId {
        BucketId(format!("bucket:{}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl BucketId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl LibraryId {
    /// Builds a fresh deployment identifier of the form `library:<host>:<uuid>`.
    pub fn generate() -> Self {
        let host = env::var("HOSTNAME")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self(format!("library:{host}:{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! display_as_inner {
    ($($ty:ty),+) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        })+
    };
}

display_as_inner!(RoundId, CallId, ConversationId, BucketId, LibraryId);

#[cfg(test)]
mod tests {
    use super::{CallId, ConversationId, LibraryId, RoundId};

    #[test]
    fn blank_conversation_ids_fall_back_to_default() {
        assert_eq!(ConversationId::normalize(None).as_str(), "default");
        assert_eq!(ConversationId::normalize(Some("   ")).as_str(), "default");
        assert_eq!(ConversationId::normalize(Some(" abc ")).as_str(), "abc");
    }

    #[test]
    fn bucket_is_derived_from_conversation() {
        let conversation = ConversationId::normalize(Some("abc"));
        assert_eq!(conversation.bucket().as_str(), "bucket:abc");
    }

    #[test]
    fn round_ids_sort_by_creation_time() {
        let first = RoundId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = RoundId::generate();

        assert!(first < second);
        assert_ne!(CallId::generate(), CallId::generate());
    }

    #[test]
    fn library_ids_carry_prefix() {
        let id = LibraryId::generate();
        assert!(id.as_str().starts_with("library:"));
        assert_eq!(id.as_str().matches(':').count(), 2);
    }
}
