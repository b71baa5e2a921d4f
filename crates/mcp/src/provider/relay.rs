// Tool provider that relays tools/list and tools/call to a forwarder.

use super::{ProviderError, ProviderKind, ToolProvider};
use crate::forward::Forwarder;
use crate::handler::RequestContext;
use crate::protocol::{methods, CallToolParams, CallToolResult, ListToolsResult, ToolDescriptor};
use crate::session::{Attachment, SessionPhase};
use relay_core::{JsonRpcRequest, JsonRpcResponse, RelayError, ResponsePayload};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub struct RelayProvider {
    forwarder: Arc<dyn Forwarder>,
    next_id: AtomicI64,
}

impl RelayProvider {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            forwarder,
            next_id: AtomicI64::new(1),
        }
    }

    pub fn forwarder(&self) -> &Arc<dyn Forwarder> {
        &self.forwarder
    }

    async fn call(
        &self,
        method: &str,
        params: Value,
        ctx: &RequestContext,
    ) -> Result<Value, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, Some(params));
        let reply: JsonRpcResponse = self
            .forwarder
            .forward(request, ctx)
            .await?
            .ok_or_else(|| RelayError::Internal("No response from upstream".to_string()))?;

        match reply.payload {
            ResponsePayload::Result(result) => Ok(result),
            ResponsePayload::Error(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl ToolProvider for RelayProvider {
    fn kind(&self) -> ProviderKind {
        self.forwarder.kind()
    }

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolDescriptor>, ProviderError> {
        let result = self.call(methods::TOOLS_LIST, serde_json::json!({}), ctx).await?;
        let listing: ListToolsResult = serde_json::from_value(result).map_err(|e| {
            ProviderError::Relay(RelayError::Internal(format!(
                "Malformed tools/list result: {}",
                e
            )))
        })?;
        Ok(listing.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ProviderError> {
        let params = serde_json::to_value(CallToolParams {
            name: name.to_string(),
            arguments,
        })
        .map_err(RelayError::from)?;
        let result = self.call(methods::TOOLS_CALL, params, ctx).await?;

        // Pass envelopes through untouched; wrap anything else as text.
        match serde_json::from_value::<CallToolResult>(result.clone()) {
            Ok(envelope) => Ok(envelope),
            Err(_) => Ok(CallToolResult::text(
                serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string()),
            )),
        }
    }

    fn attach(&self) -> Option<Attachment> {
        self.forwarder.attach()
    }

    fn phase(&self) -> Option<SessionPhase> {
        self.forwarder.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::tests::StubForwarder;
    use relay_core::JsonRpcError;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_tools_through_forwarder() {
        let stub = Arc::new(StubForwarder::new(|request| {
            Ok(Some(JsonRpcResponse::success(
                request.id.clone().unwrap(),
                json!({"tools": [{
                    "name": "run_query",
                    "description": "Run",
                    "inputSchema": {"type": "object"}
                }]}),
            )))
        }));
        let provider = RelayProvider::new(stub.clone());

        let tools = provider.list_tools(&RequestContext::detached()).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "run_query");
        assert_eq!(stub.seen.lock().unwrap()[0].method, "tools/list");
    }

    #[tokio::test]
    async fn test_ids_are_provider_local() {
        let stub = Arc::new(StubForwarder::new(|request| {
            Ok(Some(JsonRpcResponse::success(request.id.clone().unwrap(), json!({"tools": []}))))
        }));
        let provider = RelayProvider::new(stub.clone());
        let ctx = RequestContext::detached();
        provider.list_tools(&ctx).await.unwrap();
        provider.list_tools(&ctx).await.unwrap();

        let seen = stub.seen.lock().unwrap();
        assert_ne!(seen[0].id, seen[1].id);
    }

    #[tokio::test]
    async fn test_call_passes_envelope_through() {
        let stub = Arc::new(StubForwarder::new(|request| {
            assert_eq!(request.param("name"), Some(&json!("get_contact")));
            assert_eq!(request.param("arguments"), Some(&json!({"id": "42"})));
            Ok(Some(JsonRpcResponse::success(
                request.id.clone().unwrap(),
                json!({"content": [{"type": "text", "text": "found"}], "isError": false}),
            )))
        }));
        let provider = RelayProvider::new(stub);

        let result = provider
            .call_tool("get_contact", json!({"id": "42"}), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(result.joined_text(), "found");
        assert_eq!(result.is_error, Some(false));
    }

    #[tokio::test]
    async fn test_unshaped_result_is_wrapped_as_text() {
        let stub = Arc::new(StubForwarder::new(|request| {
            Ok(Some(JsonRpcResponse::success(request.id.clone().unwrap(), json!({"rows": 3}))))
        }));
        let provider = RelayProvider::new(stub);

        let result = provider
            .call_tool("count", json!({}), &RequestContext::detached())
            .await
            .unwrap();
        assert!(result.joined_text().contains("\"rows\": 3"));
    }

    #[tokio::test]
    async fn test_remote_error_keeps_code() {
        let stub = Arc::new(StubForwarder::new(|request| {
            Ok(Some(JsonRpcResponse::error(
                request.id.clone().unwrap(),
                JsonRpcError::method_not_found("tools/call"),
            )))
        }));
        let provider = RelayProvider::new(stub);

        let err = provider
            .call_tool("x", json!({}), &RequestContext::detached())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let stub = StubForwarder::new(|_| Err(RelayError::Timeout));
        let provider = RelayProvider::new(Arc::new(stub));
        let err = provider.list_tools(&RequestContext::detached()).await.unwrap_err();
        assert_eq!(err, ProviderError::Relay(RelayError::Timeout));
    }
}
