//! Local handling of the MCP methods over a provider registry.
//!
//! `initialize`, `ping`, `tools/list` and `tools/call` are answered here. Any
//! other method goes to the fallback forwarder when one is configured.

use crate::forward::Forwarder;
use crate::handler::{MessageHandler, RequestContext};
use crate::protocol::{
    methods, CallToolResult, Implementation, InitializeResult, ListToolsResult,
    ServerCapabilities, ToolsCapability, PROTOCOL_VERSION,
};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::session::Attachment;
use relay_core::normalize::{from_error, normalize_response};
use relay_core::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RelayError, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with an `initialize` on an already initialized connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinitializePolicy {
    #[default]
    Allow,
    Reject,
}

/// What `tools/list` answers when providers fail to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListFailurePolicy {
    /// Reply with `{"tools": []}`.
    #[default]
    EmptyList,
    Propagate,
}

/// How failed tool calls are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorPolicy {
    /// A successful result flagged `isError`, readable by the model.
    #[default]
    Content,
    JsonRpc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub server_name: String,
    pub server_version: String,
    pub instructions: Option<String>,
    pub reinitialize: ReinitializePolicy,
    pub list_failure: ListFailurePolicy,
    pub tool_errors: ToolErrorPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            server_name: "mcp-relay".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
            reinitialize: ReinitializePolicy::default(),
            list_failure: ListFailurePolicy::default(),
            tool_errors: ToolErrorPolicy::default(),
        }
    }
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    config: DispatcherConfig,
    fallback: Option<Arc<dyn Forwarder>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProviderRegistry>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            config,
            fallback: None,
        }
    }

    /// Forward methods this dispatcher does not implement.
    pub fn with_fallback(mut self, fallback: Arc<dyn Forwarder>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    fn initialize(&self, id: RequestId, ctx: &RequestContext) -> JsonRpcResponse {
        let already = ctx.connection.mark_initialized();
        if already && self.config.reinitialize == ReinitializePolicy::Reject {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Server already initialized"),
            );
        }
        info!(connection = %ctx.connection.id(), repeat = already, "Client initialized");

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: Implementation {
                name: self.config.server_name.clone(),
                version: self.config.server_version.clone(),
            },
            instructions: self.config.instructions.clone(),
        };
        JsonRpcResponse::from_result(id, &result)
    }

    async fn list_tools(&self, id: RequestId, ctx: &RequestContext) -> JsonRpcResponse {
        let tools = match self.registry.list_tools(ctx).await {
            Ok(tools) => tools,
            Err(e) => match self.config.list_failure {
                ListFailurePolicy::EmptyList => {
                    warn!(error = %e, "Listing tools failed, answering with an empty list");
                    Vec::new()
                }
                ListFailurePolicy::Propagate => {
                    return JsonRpcResponse::error(id, e.to_jsonrpc());
                }
            },
        };
        JsonRpcResponse::from_result(id, &ListToolsResult { tools })
    }

    async fn call_tool(
        &self,
        id: RequestId,
        params: Option<&Value>,
        ctx: &RequestContext,
    ) -> JsonRpcResponse {
        let (name, arguments) = match parse_call(params) {
            Ok(call) => call,
            Err(message) => {
                return JsonRpcResponse::error(id, JsonRpcError::invalid_params(message));
            }
        };

        match self.registry.call_tool(&name, arguments, ctx).await {
            Ok(result) => JsonRpcResponse::from_result(id, &result),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                match self.config.tool_errors {
                    ToolErrorPolicy::Content => {
                        JsonRpcResponse::from_result(id, &tool_error_content(&e))
                    }
                    ToolErrorPolicy::JsonRpc => JsonRpcResponse::error(id, e.to_jsonrpc()),
                }
            }
        }
    }

    async fn forward(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let method = request.method.clone();

        let Some(fallback) = &self.fallback else {
            return id.map(|id| JsonRpcResponse::error(id, JsonRpcError::method_not_found(&method)));
        };

        debug!(%method, "Forwarding unhandled method");
        match (fallback.forward(request, ctx).await, id) {
            (Ok(Some(reply)), Some(id)) => Some(normalize_response(id, reply)),
            (Ok(None), Some(id)) => Some(from_error(
                id,
                &RelayError::Internal("No response from upstream".to_string()),
            )),
            (Err(e), Some(id)) => {
                warn!(%method, error = %e, "Forwarding failed");
                Some(from_error(id, &e))
            }
            (Ok(_), None) => None,
            (Err(e), None) => {
                warn!(%method, error = %e, "Forwarding notification failed");
                None
            }
        }
    }
}

fn parse_call(params: Option<&Value>) -> Result<(String, Value), String> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| "Tool name is required".to_string())?;

    let arguments = match params.and_then(|p| p.get("arguments")) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(args @ Value::Object(_)) => args.clone(),
        Some(_) => return Err("Tool arguments must be an object".to_string()),
    };
    Ok((name.to_string(), arguments))
}

fn tool_error_content(error: &ProviderError) -> CallToolResult {
    CallToolResult::error(format!("Tool error: {}", error))
}

#[async_trait::async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        let Some(id) = request.id.clone() else {
            // Notifications never get a reply.
            if request.method == methods::INITIALIZED {
                debug!(connection = %ctx.connection.id(), "Client sent initialized notification");
            } else if self.fallback.is_some() {
                self.forward(request, ctx).await;
            } else {
                debug!(method = %request.method, "Ignoring notification");
            }
            return None;
        };

        let reply = match request.method.as_str() {
            methods::INITIALIZE => self.initialize(id, ctx),
            methods::PING => JsonRpcResponse::success(id, serde_json::json!({})),
            methods::TOOLS_LIST => self.list_tools(id, ctx).await,
            methods::TOOLS_CALL => self.call_tool(id, request.params.as_ref(), ctx).await,
            _ => return self.forward(request, ctx).await,
        };
        Some(reply)
    }

    fn attachments(&self) -> Vec<Attachment> {
        let mut attachments = self.registry.attachments();
        if let Some(attachment) = self.fallback.as_ref().and_then(|f| f.attach()) {
            attachments.push(attachment);
        }
        attachments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::tests::StubForwarder;
    use crate::protocol::ToolDescriptor;
    use crate::provider::tests::EchoTool;
    use crate::provider::{ProviderKind, ToolProvider, ToolRegistry, Visibility};
    use serde_json::json;

    struct DownProvider;

    #[async_trait::async_trait]
    impl ToolProvider for DownProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Remote
        }

        async fn list_tools(
            &self,
            _ctx: &RequestContext,
        ) -> Result<Vec<ToolDescriptor>, ProviderError> {
            Err(ProviderError::Relay(RelayError::Upstream("connection refused".into())))
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            _ctx: &RequestContext,
        ) -> Result<CallToolResult, ProviderError> {
            Err(ProviderError::UnknownTool(name.to_string()))
        }
    }

    fn echo_registry() -> Arc<ProviderRegistry> {
        let mut catalog = ToolRegistry::new();
        catalog.register(Arc::new(EchoTool {
            name: "echo",
            required: vec!["message"],
        }));
        let mut registry = ProviderRegistry::new();
        registry.register("local", Visibility::Public, Arc::new(catalog));
        Arc::new(registry)
    }

    fn dispatcher(config: DispatcherConfig) -> Dispatcher {
        Dispatcher::new(echo_registry(), config)
    }

    async fn call(
        handler: &Dispatcher,
        ctx: &RequestContext,
        id: i64,
        method: &str,
        params: Value,
    ) -> JsonRpcResponse {
        handler
            .handle(JsonRpcRequest::new(id, method, Some(params)), ctx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();
        let reply = call(&handler, &ctx, 1, "initialize", json!({})).await;

        let result = reply.result().unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(result["serverInfo"]["name"], "mcp-relay");
        assert!(ctx.connection.is_initialized());

        // Allowed again by default.
        let again = call(&handler, &ctx, 2, "initialize", json!({})).await;
        assert!(!again.is_error());
    }

    #[tokio::test]
    async fn test_reinitialize_can_be_rejected() {
        let handler = dispatcher(DispatcherConfig {
            reinitialize: ReinitializePolicy::Reject,
            ..Default::default()
        });
        let ctx = RequestContext::detached();
        call(&handler, &ctx, 1, "initialize", json!({})).await;
        let again = call(&handler, &ctx, 2, "initialize", json!({})).await;

        let error = again.error_object().unwrap();
        assert_eq!(error.code, -32600);
        assert_eq!(error.message, "Server already initialized");
        assert_eq!(again.id, RequestId::Number(2));
    }

    #[tokio::test]
    async fn test_ping_is_idempotent() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();
        let first = call(&handler, &ctx, 7, "ping", json!({})).await;
        let second = call(&handler, &ctx, 7, "ping", json!({})).await;
        assert_eq!(first, second);
        assert_eq!(first.result(), Some(&json!({})));
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();
        for method in ["notifications/initialized", "ping", "tools/list", "whatever"] {
            let reply = handler
                .handle(JsonRpcRequest::notification(method, None), &ctx)
                .await;
            assert!(reply.is_none(), "{} produced a reply", method);
        }
    }

    #[tokio::test]
    async fn test_list_then_call_round_trip() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();

        let listing = call(&handler, &ctx, 1, "tools/list", json!({})).await;
        let tools = listing.result().unwrap()["tools"].as_array().unwrap().clone();
        assert_eq!(tools.len(), 1);
        let name = tools[0]["name"].as_str().unwrap();

        let reply = call(
            &handler,
            &ctx,
            2,
            "tools/call",
            json!({"name": name, "arguments": {"message": "hi"}}),
        )
        .await;
        let result: CallToolResult =
            serde_json::from_value(reply.result().unwrap().clone()).unwrap();
        assert_eq!(result.is_error, None);
        assert_eq!(result.joined_text(), r#"{"message":"hi"}"#);
    }

    #[tokio::test]
    async fn test_missing_required_argument_is_content_error() {
        let handler = dispatcher(DispatcherConfig::default());
        let reply = call(
            &handler,
            &RequestContext::detached(),
            3,
            "tools/call",
            json!({"name": "echo", "arguments": {}}),
        )
        .await;

        let result: CallToolResult =
            serde_json::from_value(reply.result().unwrap().clone()).unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(result.joined_text(), "Tool error: Missing required arguments: message");
    }

    #[tokio::test]
    async fn test_unknown_tool_as_jsonrpc_error() {
        let handler = dispatcher(DispatcherConfig {
            tool_errors: ToolErrorPolicy::JsonRpc,
            ..Default::default()
        });
        let reply = call(
            &handler,
            &RequestContext::detached(),
            4,
            "tools/call",
            json!({"name": "nope"}),
        )
        .await;
        let error = reply.error_object().unwrap();
        assert_eq!(error.code, -32602);
        assert_eq!(error.message, "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_unknown_tool_as_content() {
        let handler = dispatcher(DispatcherConfig::default());
        let reply = call(
            &handler,
            &RequestContext::detached(),
            4,
            "tools/call",
            json!({"name": "nope", "arguments": {}}),
        )
        .await;
        let result: CallToolResult =
            serde_json::from_value(reply.result().unwrap().clone()).unwrap();
        assert_eq!(result.is_error, Some(true));
        assert!(result.joined_text().contains("Unknown tool: nope"));
    }

    #[tokio::test]
    async fn test_call_param_validation() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();

        let no_name = call(&handler, &ctx, 1, "tools/call", json!({"arguments": {}})).await;
        assert_eq!(no_name.error_object().unwrap().code, -32602);
        assert_eq!(no_name.error_object().unwrap().message, "Tool name is required");

        let numeric = call(&handler, &ctx, 2, "tools/call", json!({"name": 5})).await;
        assert_eq!(numeric.error_object().unwrap().code, -32602);

        let params = json!({"name": "echo", "arguments": [1]});
        let bad_args = call(&handler, &ctx, 3, "tools/call", params).await;
        assert_eq!(bad_args.error_object().unwrap().code, -32602);

        let no_params = handler
            .handle(JsonRpcRequest::new(4, "tools/call", None), &ctx)
            .await
            .unwrap();
        assert_eq!(no_params.error_object().unwrap().code, -32602);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();
        let reply = call(&handler, &ctx, 9, "resources/list", json!({})).await;
        let error = reply.error_object().unwrap();
        assert_eq!(error.code, -32601);
        assert_eq!(error.message, "Method not found: resources/list");
    }

    #[tokio::test]
    async fn test_unknown_method_goes_to_fallback() {
        let stub = Arc::new(StubForwarder::new(|_| {
            Ok(Some(JsonRpcResponse::success(77, json!({"resources": []}))))
        }));
        let handler = dispatcher(DispatcherConfig::default()).with_fallback(stub.clone());
        let ctx = RequestContext::detached();
        let reply = call(&handler, &ctx, 9, "resources/list", json!({})).await;

        assert_eq!(reply.id, RequestId::Number(9));
        assert_eq!(reply.result(), Some(&json!({"resources": []})));
        assert_eq!(stub.seen.lock().unwrap()[0].method, "resources/list");
    }

    #[tokio::test]
    async fn test_list_failure_policies() {
        let mut registry = ProviderRegistry::new();
        registry.register("down", Visibility::Public, Arc::new(DownProvider));
        let registry = Arc::new(registry);
        let ctx = RequestContext::detached();

        let lenient = Dispatcher::new(registry.clone(), DispatcherConfig::default());
        let reply = call(&lenient, &ctx, 1, "tools/list", json!({})).await;
        assert_eq!(reply.result(), Some(&json!({"tools": []})));

        let strict = Dispatcher::new(
            registry,
            DispatcherConfig {
                list_failure: ListFailurePolicy::Propagate,
                ..Default::default()
            },
        );
        let reply = call(&strict, &ctx, 2, "tools/list", json!({})).await;
        assert_eq!(reply.error_object().unwrap().code, -32001);
    }

    #[tokio::test]
    async fn test_string_and_null_ids_are_echoed() {
        let handler = dispatcher(DispatcherConfig::default());
        let ctx = RequestContext::detached();

        let reply = handler
            .handle(JsonRpcRequest::new("req-1", "ping", None), &ctx)
            .await
            .unwrap();
        assert_eq!(reply.id, RequestId::String("req-1".into()));

        let reply = handler
            .handle(JsonRpcRequest::new(RequestId::Null, "ping", None), &ctx)
            .await
            .unwrap();
        assert_eq!(reply.id, RequestId::Null);
    }
}
