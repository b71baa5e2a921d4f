// Verbatim forwarding of JSON-RPC messages to a single backend.

use crate::handler::{MessageHandler, RequestContext};
use crate::provider::ProviderKind;
use crate::session::{Attachment, SessionPhase};
use relay_core::normalize::{from_error, normalize_response};
use relay_core::{JsonRpcRequest, JsonRpcResponse, RelayError};
use std::sync::Arc;
use tracing::warn;

/// A backend that accepts whole JSON-RPC messages: an HTTP upstream or a
/// backing child process.
#[async_trait::async_trait]
pub trait Forwarder: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Returns `Ok(None)` for notifications.
    async fn forward(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Result<Option<JsonRpcResponse>, RelayError>;

    fn attach(&self) -> Option<Attachment> {
        None
    }

    fn phase(&self) -> Option<SessionPhase> {
        None
    }
}

/// Handler that sends every message to one forwarder and normalizes the reply.
pub struct Passthrough {
    forwarder: Arc<dyn Forwarder>,
}

impl Passthrough {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }
}

#[async_trait::async_trait]
impl MessageHandler for Passthrough {
    async fn handle(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let method = request.method.clone();
        match (self.forwarder.forward(request, ctx).await, id) {
            (Ok(Some(reply)), Some(id)) => Some(normalize_response(id, reply)),
            (Ok(_), None) => None,
            // A forwarder must answer every request; treat silence as a loss.
            (Ok(None), Some(id)) => Some(from_error(
                id,
                &RelayError::Internal("No response from upstream".to_string()),
            )),
            (Err(e), Some(id)) => {
                warn!(%method, error = %e, "Forwarding failed");
                Some(from_error(id, &e))
            }
            (Err(e), None) => {
                warn!(%method, error = %e, "Forwarding notification failed");
                None
            }
        }
    }

    fn attachments(&self) -> Vec<Attachment> {
        self.forwarder.attach().into_iter().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use relay_core::RequestId;
    use serde_json::json;
    use std::sync::Mutex;

    /// Scripted forwarder for handler tests.
    pub(crate) struct StubForwarder {
        pub seen: Mutex<Vec<JsonRpcRequest>>,
        pub reply: Box<
            dyn Fn(&JsonRpcRequest) -> Result<Option<JsonRpcResponse>, RelayError> + Send + Sync,
        >,
    }

    impl StubForwarder {
        pub(crate) fn new(
            reply: impl Fn(&JsonRpcRequest) -> Result<Option<JsonRpcResponse>, RelayError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                reply: Box::new(reply),
            }
        }
    }

    #[async_trait::async_trait]
    impl Forwarder for StubForwarder {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Remote
        }

        async fn forward(
            &self,
            request: JsonRpcRequest,
            _ctx: &RequestContext,
        ) -> Result<Option<JsonRpcResponse>, RelayError> {
            let reply = (self.reply)(&request);
            self.seen.lock().unwrap().push(request);
            reply
        }
    }

    #[tokio::test]
    async fn test_reply_is_rekeyed_to_caller_id() {
        let handler = Passthrough::new(Arc::new(StubForwarder::new(|_| {
            Ok(Some(JsonRpcResponse::success(999, json!({"ok": true}))))
        })));
        let reply = handler
            .handle(
                JsonRpcRequest::new("abc", "custom/method", None),
                &RequestContext::detached(),
            )
            .await
            .unwrap();
        assert_eq!(reply.id, RequestId::String("abc".into()));
        assert_eq!(reply.result(), Some(&json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_errors_become_replies() {
        let handler = Passthrough::new(Arc::new(StubForwarder::new(|_| {
            Err(RelayError::Upstream("connection refused".into()))
        })));
        let reply = handler
            .handle(JsonRpcRequest::new(4, "tools/list", None), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(reply.id, RequestId::Number(4));
        assert_eq!(reply.error_object().unwrap().code, -32001);
    }

    #[tokio::test]
    async fn test_notifications_get_no_reply() {
        let stub = Arc::new(StubForwarder::new(|_| {
            Err(RelayError::Upstream("down".into()))
        }));
        let handler = Passthrough::new(stub.clone());
        let reply = handler
            .handle(
                JsonRpcRequest::notification("notifications/initialized", None),
                &RequestContext::detached(),
            )
            .await;
        assert!(reply.is_none());
        assert_eq!(stub.seen.lock().unwrap().len(), 1);
    }
}
