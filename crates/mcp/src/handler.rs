//! Per-connection state and the handler seam shared by every transport.

use crate::session::Attachment;
use chrono::{DateTime, Utc};
use relay_core::{JsonRpcRequest, JsonRpcResponse};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Authenticated caller, as established by a verified session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// State owned by one client connection (a stdio stream, an SSE stream or a
/// single HTTP exchange).
///
/// Dropping or closing it cancels the connection's in-flight work and releases
/// its hold on backing processes.
#[derive(Debug)]
pub struct ConnectionState {
    id: Uuid,
    created_at: DateTime<Utc>,
    initialized: AtomicBool,
    cancel: CancellationToken,
    attachments: Mutex<Vec<Attachment>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            initialized: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            attachments: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Move to the initialized state, returning whether it already was.
    pub fn mark_initialized(&self) -> bool {
        self.initialized.swap(true, Ordering::SeqCst)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Keep a backing session referenced for as long as this connection lives.
    pub fn hold(&self, attachment: Attachment) {
        if let Ok(mut attachments) = self.attachments.lock() {
            attachments.push(attachment);
        }
    }

    /// Cancel pending work first, then let go of backing sessions.
    pub fn close(&self) {
        self.cancel.cancel();
        let released = match self.attachments.lock() {
            Ok(mut attachments) => std::mem::take(&mut *attachments),
            Err(_) => Vec::new(),
        };
        drop(released);
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.close();
    }
}

/// Everything a handler knows about the caller of one message.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub principal: Option<Principal>,
    pub connection: Arc<ConnectionState>,
}

impl RequestContext {
    pub fn new(connection: Arc<ConnectionState>) -> Self {
        Self {
            principal: None,
            connection,
        }
    }

    pub fn with_principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    /// A context on a fresh, unattached connection.
    pub fn detached() -> Self {
        Self::new(Arc::new(ConnectionState::new()))
    }
}

/// Turns one inbound request or notification into at most one reply.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    /// `None` exactly when `request` is a notification.
    async fn handle(&self, request: JsonRpcRequest, ctx: &RequestContext)
        -> Option<JsonRpcResponse>;

    /// Attachments a new connection should hold on backing sessions.
    fn attachments(&self) -> Vec<Attachment> {
        Vec::new()
    }

    /// Open a connection bound to this handler's backing sessions.
    fn connect(&self) -> Arc<ConnectionState> {
        let connection = ConnectionState::new();
        for attachment in self.attachments() {
            connection.hold(attachment);
        }
        Arc::new(connection)
    }
}
