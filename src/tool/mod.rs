use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{SoulError, SoulResult};
use crate::types::Capability;

/// A tool the model can call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declared contract; read once at registration
    fn capability(&self) -> Capability;

    /// Run the tool. Progress increments go to `progress`.
    ///
    /// The returned future may be dropped at any await point when the call
    /// times out or the turn is cancelled.
    async fn invoke(
        &self,
        input: serde_json::Value,
        progress: mpsc::UnboundedSender<String>,
    ) -> SoulResult<ToolOutput>;
}

/// Output from a tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

struct Registered {
    capability: Capability,
    tool: Arc<dyn Tool>,
}

/// Tools available to a loop, keyed by capability name
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names are unique; the capability is frozen here.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> SoulResult<()> {
        let capability = tool.capability();
        if self.get(&capability.name).is_some() {
            return Err(SoulError::Config(format!(
                "tool already registered: {}",
                capability.name
            )));
        }
        tracing::debug!(tool = %capability.name, mutates = capability.mutates_state, "Registered tool");
        self.tools.push(Registered { capability, tool });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<(&Capability, Arc<dyn Tool>)> {
        self.tools
            .iter()
            .find(|r| r.capability.name == name)
            .map(|r| (&r.capability, r.tool.clone()))
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.tools
            .iter()
            .find(|r| r.capability.name == name)
            .map(|r| &r.capability)
    }

    /// Capabilities in registration order, as advertised to the model
    pub fn capabilities(&self) -> Vec<Capability> {
        self.tools.iter().map(|r| r.capability.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|r| r.capability.name.as_str()).collect()
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
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn capability(&self) -> Capability {
            Capability::read_only(
                "echo",
                json!({
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }),
            )
            .with_description("Echo back the input")
        }

        async fn invoke(
            &self,
            input: serde_json::Value,
            progress: mpsc::UnboundedSender<String>,
        ) -> SoulResult<ToolOutput> {
            let message = input
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("no message");
            let _ = progress.send("echoing".into());
            Ok(ToolOutput::success(message))
        }
    }

    #[test]
    fn tool_output_constructors() {
        let ok = ToolOutput::success("result");
        assert!(!ok.is_error);
        assert_eq!(ok.content, "result");
        assert!(ToolOutput::error("failed").is_error);
    }

    #[test]
    fn registry_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(EchoTool)).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["echo"]);

        let (cap, _tool) = registry.get("echo").unwrap();
        assert_eq!(cap.description, "Echo back the input");
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.capabilities()[0].name, "echo");
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, SoulError::Config(msg) if msg.contains("echo")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn tool_invoke_reports_progress() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = EchoTool
            .invoke(json!({"message": "hello"}), tx)
            .await
            .unwrap();
        assert_eq!(output.content, "hello");
        assert_eq!(rx.recv().await.as_deref(), Some("echoing"));
    }

    #[test]
    fn tool_is_object_safe() {
        fn _assert_object_safe(_: &dyn Tool) {}
    }
}
