//! Backing-process lifecycle.
//!
//! A [`SessionManager`] owns at most one [`Session`] at a time and moves through
//! `Absent → Starting → Ready → Draining`. Process exit returns it to `Absent`;
//! the next request starts a fresh process.

mod process;

pub use process::{ProcessCommand, Session};

use crate::forward::Forwarder;
use crate::handler::RequestContext;
use crate::protocol::{methods, Implementation, InitializeParams, PROTOCOL_VERSION};
use crate::provider::ProviderKind;
use relay_core::normalize::normalize_response;
use relay_core::{JsonRpcRequest, JsonRpcResponse, RelayError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SPAWN_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Absent,
    Starting,
    Ready,
    Draining,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Absent => "absent",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
        };
        f.write_str(phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingMode {
    /// One long-lived process shared by every request.
    #[default]
    Persistent,
    /// A fresh process per request, killed once the reply is in.
    PerRequest,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: BackingMode,
    pub request_timeout: Duration,
    /// Terminate the process when the last attached connection closes.
    pub idle_shutdown: bool,
    /// Send `initialize` + `notifications/initialized` before first use.
    pub handshake: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: BackingMode::Persistent,
            request_timeout: Duration::from_secs(60),
            idle_shutdown: false,
            handshake: false,
        }
    }
}

#[derive(Debug)]
struct ManagerInner {
    name: String,
    command: ProcessCommand,
    config: SessionConfig,
    current: Mutex<Option<Arc<Session>>>,
    start_lock: tokio::sync::Mutex<()>,
    starting: AtomicBool,
    draining: AtomicBool,
    attached: AtomicUsize,
}

impl ManagerInner {
    fn live(&self) -> Option<Arc<Session>> {
        let mut current = self.current.lock().ok()?;
        match current.as_ref() {
            Some(session) if !session.is_closed() => Some(session.clone()),
            Some(_) => {
                *current = None;
                None
            }
            None => None,
        }
    }

    fn take(&self) -> Option<Arc<Session>> {
        self.current.lock().ok().and_then(|mut current| current.take())
    }

    fn detach(&self) {
        let remaining = self.attached.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 && self.config.idle_shutdown {
            if let Some(session) = self.take() {
                info!(
                    session = %self.name,
                    session_id = %session.id(),
                    "Last connection closed, stopping backing process"
                );
                session.terminate(RelayError::ConnectionLost);
            }
        }
    }
}

/// Keeps a manager's process referenced while held.
#[derive(Debug)]
pub struct Attachment {
    inner: Arc<ManagerInner>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.inner.detach();
    }
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(name: impl Into<String>, command: ProcessCommand, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                name: name.into(),
                command,
                config,
                current: Mutex::new(None),
                start_lock: tokio::sync::Mutex::new(()),
                starting: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                attached: AtomicUsize::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> SessionPhase {
        if self.inner.draining.load(Ordering::SeqCst) {
            SessionPhase::Draining
        } else if self.inner.starting.load(Ordering::SeqCst) {
            SessionPhase::Starting
        } else if self.inner.live().is_some() {
            SessionPhase::Ready
        } else {
            SessionPhase::Absent
        }
    }

    pub fn attached_count(&self) -> usize {
        self.inner.attached.load(Ordering::SeqCst)
    }

    /// The running session, if any. Does not start one.
    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner.live()
    }

    pub fn attach(&self) -> Attachment {
        self.inner.attached.fetch_add(1, Ordering::SeqCst);
        Attachment {
            inner: self.inner.clone(),
        }
    }

    /// Start the persistent process now instead of on first request.
    pub async fn start(&self) -> Result<Arc<Session>, RelayError> {
        self.ready_session().await
    }

    async fn ready_session(&self) -> Result<Arc<Session>, RelayError> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(RelayError::Draining);
        }
        if let Some(session) = self.inner.live() {
            return Ok(session);
        }

        let _starter = self.inner.start_lock.lock().await;
        // Another caller may have finished starting while we waited.
        if let Some(session) = self.inner.live() {
            return Ok(session);
        }
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(RelayError::Draining);
        }

        self.inner.starting.store(true, Ordering::SeqCst);
        let started = self.spawn_with_retry().await;
        self.inner.starting.store(false, Ordering::SeqCst);
        let session = started?;

        if let Ok(mut current) = self.inner.current.lock() {
            *current = Some(session.clone());
        }
        Ok(session)
    }

    async fn spawn_with_retry(&self) -> Result<Arc<Session>, RelayError> {
        match self.spawn_once().await {
            Ok(session) => Ok(session),
            Err(first) => {
                warn!(
                    session = %self.inner.name,
                    error = %first,
                    "Backing process failed to start, retrying once"
                );
                tokio::time::sleep(SPAWN_RETRY_DELAY).await;
                self.spawn_once().await.map_err(|e| match e {
                    RelayError::SpawnFailed(_) => e,
                    other => RelayError::SpawnFailed(other.to_string()),
                })
            }
        }
    }

    async fn spawn_once(&self) -> Result<Arc<Session>, RelayError> {
        let session = Session::spawn(&self.inner.command)?;
        if self.inner.config.handshake {
            if let Err(e) = self.handshake(&session).await {
                session.terminate(RelayError::ProcessExited);
                return Err(e);
            }
        }
        Ok(session)
    }

    async fn handshake(&self, session: &Session) -> Result<(), RelayError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params = serde_json::to_value(params)?;
        let request = JsonRpcRequest::new(0, methods::INITIALIZE, Some(params));
        let reply = session
            .request(request, self.inner.config.request_timeout, &CancellationToken::new())
            .await?;
        if let Some(error) = reply.error_object() {
            return Err(RelayError::SpawnFailed(format!(
                "initialize rejected: {}",
                error.message
            )));
        }
        session.notify(JsonRpcRequest::notification(methods::INITIALIZED, None))?;
        debug!(session = %self.inner.name, session_id = %session.id(), "Handshake complete");
        Ok(())
    }

    /// Send one request to the backing process and wait for its reply.
    pub async fn request(
        &self,
        request: JsonRpcRequest,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, RelayError> {
        let timeout = self.inner.config.request_timeout;
        match self.inner.config.mode {
            BackingMode::Persistent => {
                let session = self.ready_session().await?;
                session.request(request, timeout, cancel).await
            }
            BackingMode::PerRequest => {
                if self.inner.draining.load(Ordering::SeqCst) {
                    return Err(RelayError::Draining);
                }
                let session = self.spawn_with_retry().await?;
                let reply = session.request(request, timeout, cancel).await;
                session.terminate(RelayError::ProcessExited);
                reply
            }
        }
    }

    pub async fn notify(&self, notification: JsonRpcRequest) -> Result<(), RelayError> {
        match self.inner.config.mode {
            BackingMode::Persistent => self.ready_session().await?.notify(notification),
            // Nothing outlives a per-request process, so there is no one to tell.
            BackingMode::PerRequest => {
                debug!(
                    session = %self.inner.name,
                    method = %notification.method,
                    "Dropping notification"
                );
                Ok(())
            }
        }
    }

    /// Reject new work, stop the process and wait for it to be reaped.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.draining.store(true, Ordering::SeqCst);
        if let Some(session) = self.inner.take() {
            info!(
                session = %self.inner.name,
                session_id = %session.id(),
                "Draining backing process"
            );
            session.terminate(RelayError::Draining);
            if tokio::time::timeout(grace, session.exited()).await.is_err() {
                warn!(
                    session = %self.inner.name,
                    "Backing process did not exit within grace period"
                );
            }
        }
    }
}

#[async_trait::async_trait]
impl Forwarder for SessionManager {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Process
    }

    async fn forward(
        &self,
        request: JsonRpcRequest,
        ctx: &RequestContext,
    ) -> Result<Option<JsonRpcResponse>, RelayError> {
        match request.id.clone() {
            None => self.notify(request).await.map(|_| None),
            Some(id) => {
                let reply = self
                    .request(request, ctx.connection.cancellation())
                    .await?;
                Ok(Some(normalize_response(id, reply)))
            }
        }
    }

    fn attach(&self) -> Option<Attachment> {
        Some(SessionManager::attach(self))
    }

    fn phase(&self) -> Option<SessionPhase> {
        Some(SessionManager::phase(self))
    }
}
