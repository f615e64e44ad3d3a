use sha2::{Digest, Sha256};

/// What the trace keeps of a prompt: its hash and bounded excerpts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptDigest {
    pub hash: String,
    pub head: String,
    pub tail: String,
    pub truncated: bool,
}

impl PromptDigest {
    /// Keeps at most `max_chars` characters, split evenly between head and tail.
    pub fn of(prompt: &str, max_chars: usize) -> Self {
        let hash = format!("{:x}", Sha256::digest(prompt.as_bytes()));
        let total = prompt.chars().count();

        if total <= max_chars {
            return Self { hash, head: prompt.to_string(), tail: String::new(), truncated: false };
        }

        let half = max_chars / 2;
        let head = prompt.chars().take(half).collect();
        let tail = prompt.chars().skip(total - half).collect();
        Self { hash, head, tail, truncated: true }
    }
}
