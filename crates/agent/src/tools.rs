use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use roundkeeper_core::CollaboratorError;
use serde_json::Value;

/// Executes one command. Tools are registered under the command id they serve.
#[async_trait]
pub trait Tool: Send + Sync {
    fn tool_id(&self) -> &'static str;

    async fn execute(&self, inputs: Value) -> Result<Value, CollaboratorError>;

    /// Undoes a previous `execute` with the same inputs.
    async fn reverse(&self, _inputs: Value) -> Result<Value, CollaboratorError> {
        Err(CollaboratorError::rejected("tool.not_reversible", "tool has no reverse operation"))
    }
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.tool_id().to_string(), Arc::new(tool));
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.tool_id().to_string(), tool);
    }

    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use roundkeeper_core::{CollaboratorError, CollaboratorErrorKind};
    use serde_json::{json, Value};

    use super::{Tool, ToolRegistry};

    struct Lights;

    #[async_trait]
    impl Tool for Lights {
        fn tool_id(&self) -> &'static str {
            "lights.on"
        }

        async fn execute(&self, inputs: Value) -> Result<Value, CollaboratorError> {
            Ok(json!({"room": inputs["room"], "on": true}))
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_tool_id() {
        let mut registry = ToolRegistry::default();
        registry.register(Lights);
        assert_eq!(registry.len(), 1);

        let tool = registry.get("lights.on").expect("registered");
        let result = tool.execute(json!({"room": "kitchen"})).await.expect("execute");
        assert_eq!(result["on"], json!(true));
        assert!(registry.get("lights.off").is_none());
    }

    #[tokio::test]
    async fn tools_are_not_reversible_by_default() {
        let error = Lights.reverse(json!({})).await.expect_err("no reverse");
        assert_eq!(error.kind, CollaboratorErrorKind::Rejected);
    }
}
