// Locally executed tool catalog

use super::{ProviderError, ProviderKind, ToolProvider};
use crate::handler::RequestContext;
use crate::protocol::{CallToolResult, ToolDescriptor};
use std::collections::HashMap;
use std::sync::Arc;

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool descriptor for MCP
    fn descriptor(&self) -> ToolDescriptor;

    /// Execute the tool with given arguments
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ProviderError>;
}

/// Tool registry for managing available tools. Listing keeps registration order.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a tool, replacing any earlier tool of the same name
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.descriptor().name;
        match self.by_name.get(&name) {
            Some(&index) => self.tools[index] = tool,
            None => {
                self.by_name.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&index| self.tools[index].clone())
    }

    /// List all tool descriptors
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.descriptor()).collect()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ToolProvider for ToolRegistry {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn list_tools(
        &self,
        _ctx: &RequestContext,
    ) -> Result<Vec<ToolDescriptor>, ProviderError> {
        Ok(self.descriptors())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ProviderError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ProviderError::UnknownTool(name.to_string()))?;
        tool.execute(arguments, ctx).await
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: serde_json::Value, required: Vec<&str>) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_number(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "number",
        "description": description
    })
}

pub fn json_schema_boolean(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "boolean",
        "description": description
    })
}

pub fn json_schema_array(items: serde_json::Value, description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "array",
        "items": items,
        "description": description
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::{json, Value};

    /// Echoes its arguments back as text.
    pub(crate) struct EchoTool {
        pub name: &'static str,
        pub required: Vec<&'static str>,
    }

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: self.name.to_string(),
                description: "Echo the arguments".to_string(),
                input_schema: json_schema_object(
                    json!({"message": json_schema_string("Text to echo")}),
                    self.required.clone(),
                ),
            }
        }

        async fn execute(
            &self,
            arguments: Value,
            _ctx: &RequestContext,
        ) -> Result<CallToolResult, ProviderError> {
            Ok(CallToolResult::text(arguments.to_string()))
        }
    }

    fn echo(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(EchoTool {
            name,
            required: vec![],
        })
    }

    #[test]
    fn test_listing_keeps_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("zeta"));
        registry.register(echo("alpha"));
        registry.register(echo("zeta"));

        let names: Vec<_> = registry.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("alpha"));
    }

    #[tokio::test]
    async fn test_call_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry
            .call_tool("missing", json!({}), &RequestContext::detached())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::UnknownTool("missing".into()));
    }

    #[tokio::test]
    async fn test_call_dispatches_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("echo"));
        let result = registry
            .call_tool("echo", json!({"message": "hi"}), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(result.joined_text(), r#"{"message":"hi"}"#);
    }

    #[test]
    fn test_schema_helpers() {
        let schema = json_schema_object(
            json!({
                "tags": json_schema_array(json_schema_string("Tag"), "Tags to apply"),
                "limit": json_schema_number("Max results"),
                "archived": json_schema_boolean("Include archived")
            }),
            vec!["tags"],
        );
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["tags"]));
        assert_eq!(schema["properties"]["tags"]["items"]["type"], "string");
    }
}
