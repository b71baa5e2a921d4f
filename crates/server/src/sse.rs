//! SSE sessions: one long-lived event stream per client, fed by POSTs to
//! `/sse/message?sessionId=<id>`.

use crate::config::AppState;
use axum::http::{header, HeaderMap};
use axum::response::sse::Event;
use futures::Stream;
use relay_core::JsonRpcResponse;
use relay_mcp::{ConnectionState, MessageHandler, Principal};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SseSession {
    pub handler: Arc<dyn MessageHandler>,
    pub connection: Arc<ConnectionState>,
    pub principal: Option<Principal>,
    replies: mpsc::UnboundedSender<JsonRpcResponse>,
}

impl SseSession {
    /// Queue a reply for the stream. Dropped if the stream is already gone.
    pub fn send(&self, reply: JsonRpcResponse) {
        if self.replies.send(reply).is_err() {
            debug!(connection = %self.connection.id(), "SSE stream closed, dropping reply");
        }
    }
}

#[derive(Default)]
pub struct SseRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<SseSession>>>,
    shutdown: CancellationToken,
}

impl SseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SseSession>> {
        self.sessions.read().ok()?.get(&id).cloned()
    }

    /// Register a session on `handler`; its id is the connection id.
    pub fn open(
        &self,
        handler: Arc<dyn MessageHandler>,
        principal: Option<Principal>,
    ) -> (Uuid, mpsc::UnboundedReceiver<JsonRpcResponse>) {
        let connection = handler.connect();
        let id = connection.id();
        let (replies, outbound) = mpsc::unbounded_channel();
        let session = Arc::new(SseSession {
            handler,
            connection,
            principal,
            replies,
        });
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(id, session);
        }
        (id, outbound)
    }

    /// Forget a session and cancel its in-flight requests.
    pub fn remove(&self, id: Uuid) {
        let removed = self.sessions.write().ok().and_then(|mut s| s.remove(&id));
        if let Some(session) = removed {
            session.connection.close();
            info!(session_id = %id, "SSE session closed");
        }
    }

    /// End every open stream.
    pub fn close_all(&self) {
        self.shutdown.cancel();
    }
}

struct SessionGuard {
    app: Arc<AppState>,
    id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.app.sessions.remove(self.id);
    }
}

/// `endpoint` first, then replies as `message` events and `ping` keepalives.
pub fn event_stream(
    app: Arc<AppState>,
    id: Uuid,
    mut replies: mpsc::UnboundedReceiver<JsonRpcResponse>,
    endpoint: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let keepalive = app.config.sse.keepalive();
    let shutdown = app.sessions.shutdown.clone();
    // Held by the stream so an unpolled or dropped stream still unregisters.
    let guard = SessionGuard { app, id };

    async_stream::stream! {
        let _guard = guard;
        yield Ok(Event::default().event("endpoint").data(endpoint));

        let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
        loop {
            let event = tokio::select! {
                reply = replies.recv() => match reply {
                    Some(reply) => match Event::default().event("message").json_data(&reply) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(session_id = %id, error = %e, "Failed to encode reply");
                            continue;
                        }
                    },
                    None => break,
                },
                _ = ticker.tick() => Event::default().event("ping").data(unix_millis().to_string()),
                _ = shutdown.cancelled() => break,
            };
            yield Ok(event);
        }
    }
}

/// Origin clients should post to: `public_url` when configured, otherwise
/// rebuilt from forwarding headers or `Host`. Empty when nothing is known,
/// which leaves the endpoint relative.
pub fn endpoint_base(headers: &HeaderMap, public_url: Option<&str>) -> String {
    if let Some(url) = public_url {
        return url.trim_end_matches('/').to_string();
    }

    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    match value("x-forwarded-host").or_else(|| value(header::HOST.as_str())) {
        Some(host) => {
            let scheme = value("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
            format!("{}://{}", scheme, host)
        }
        None => String::new(),
    }
}

fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use relay_mcp::{Dispatcher, DispatcherConfig, ProviderRegistry};

    fn handler() -> Arc<dyn MessageHandler> {
        Arc::new(Dispatcher::new(Arc::new(ProviderRegistry::new()), DispatcherConfig::default()))
    }

    #[test]
    fn test_endpoint_base() {
        let mut headers = HeaderMap::new();
        assert_eq!(endpoint_base(&headers, None), "");

        headers.insert(header::HOST, HeaderValue::from_static("localhost:8080"));
        assert_eq!(endpoint_base(&headers, None), "http://localhost:8080");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert(
            "x-forwarded-host",
            HeaderValue::from_static("relay.example.com, proxy.internal"),
        );
        assert_eq!(endpoint_base(&headers, None), "https://relay.example.com");

        assert_eq!(
            endpoint_base(&headers, Some("https://public.example.com/")),
            "https://public.example.com"
        );
    }

    #[test]
    fn test_open_and_remove() {
        let registry = SseRegistry::new();
        let (id, mut outbound) = registry.open(handler(), None);
        assert_eq!(registry.len(), 1);

        let session = registry.get(id).unwrap();
        session.send(JsonRpcResponse::success(1, serde_json::json!({})));
        assert!(outbound.try_recv().is_ok());

        registry.remove(id);
        assert_eq!(registry.len(), 0);
        assert!(registry.get(id).is_none());
        assert!(session.connection.is_closed());
    }
}
