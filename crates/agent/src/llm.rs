use async_trait::async_trait;
use roundkeeper_core::CollaboratorError;
use serde_json::Value;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmOutput {
    pub text: String,
    /// Provider token accounting, recorded as-is when it is a JSON object.
    pub usage: Option<Value>,
}

impl LlmOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), usage: None }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn model(&self) -> &str;
    async fn generate(&self, prompt: &str) -> Result<LlmOutput, CollaboratorError>;
}
