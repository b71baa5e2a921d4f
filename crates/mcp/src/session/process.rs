// One backing child process speaking line-delimited JSON-RPC on stdio.

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use relay_core::{Frame, JsonRpcRequest, JsonRpcResponse, MessageCodec, RelayError, RequestId};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Reply = Result<JsonRpcResponse, RelayError>;

/// How to launch the backing process.
#[derive(Debug, Clone, Default)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct Pending {
    slots: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl Pending {
    fn insert(&self, id: u64, slot: oneshot::Sender<Reply>) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(id, slot);
        }
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        self.slots.lock().ok().and_then(|mut slots| slots.remove(&id))
    }

    fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    fn fail_all(&self, reason: &RelayError) -> usize {
        let drained: Vec<_> = match self.slots.lock() {
            Ok(mut slots) => slots.drain().collect(),
            Err(_) => return 0,
        };
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.send(Err(reason.clone()));
        }
        count
    }
}

// Removes a pending slot when its request stops waiting for any reason.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.take(self.id);
    }
}

/// A running child and the bookkeeping to correlate its replies.
///
/// Outbound ids are rewritten to a session-local counter; the caller's id is
/// restored on the reply, so concurrent callers can reuse ids freely.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    outbound: mpsc::UnboundedSender<JsonRpcRequest>,
    closed: CancellationToken,
    exited: CancellationToken,
    close_reason: Arc<Mutex<Option<RelayError>>>,
}

impl Session {
    pub fn spawn(command: &ProcessCommand) -> Result<Arc<Self>, RelayError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RelayError::SpawnFailed(format!("{}: {}", command.program, e)))?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    return Err(RelayError::SpawnFailed(
                        "child stdio was not captured".to_string(),
                    ))
                }
            };

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<JsonRpcRequest>();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            pid: child.id(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Pending::default()),
            outbound,
            closed: CancellationToken::new(),
            exited: CancellationToken::new(),
            close_reason: Arc::new(Mutex::new(None)),
        });

        info!(
            session_id = %session.id,
            pid = ?session.pid,
            program = %command.program,
            "Started backing process"
        );

        // Writer: the only task touching the child's stdin.
        let closed = session.closed.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, MessageCodec::new());
            loop {
                tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                warn!(error = %e, "Failed writing to backing process");
                                closed.cancel();
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = closed.cancelled() => break,
                }
            }
        });

        // Reader: demultiplexes replies by session-local id.
        let pending = session.pending.clone();
        let closed = session.closed.clone();
        let session_id = session.id;
        tokio::spawn(async move {
            let mut frames = FramedRead::new(stdout, MessageCodec::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Frame::Response(reply)) => match local_id(&reply.id) {
                        Some(id) => match pending.take(id) {
                            Some(slot) => {
                                let _ = slot.send(Ok(reply));
                            }
                            None => {
                                debug!(%session_id, id, "Dropping reply with no pending request")
                            }
                        },
                        None => {
                            debug!(%session_id, id = %reply.id, "Dropping reply with foreign id")
                        }
                    },
                    Ok(Frame::Request(message)) => {
                        debug!(
                            %session_id,
                            method = %message.method,
                            "Ignoring message from backing process"
                        )
                    }
                    Ok(Frame::Invalid(_)) => {
                        debug!(%session_id, "Ignoring non-JSON-RPC output from backing process")
                    }
                    Err(e) => {
                        warn!(%session_id, error = %e, "Failed reading from backing process");
                        break;
                    }
                }
            }
            closed.cancel();
        });

        // Stderr is diagnostics only.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(%session_id, "backing process: {}", line);
            }
        });

        tokio::spawn(supervise(
            child,
            session.id,
            session.pending.clone(),
            session.closed.clone(),
            session.exited.clone(),
            session.close_reason.clone(),
        ));

        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Send a request and wait for the matching reply, the timeout, or `cancel`.
    pub async fn request(
        &self,
        mut request: JsonRpcRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse, RelayError> {
        let original = request.id.clone().unwrap_or(RequestId::Null);
        let local = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (slot, reply) = oneshot::channel();
        self.pending.insert(local, slot);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: local,
        };

        // Checked after insertion: teardown cancels before draining the map.
        if self.closed.is_cancelled() {
            return Err(self.reason());
        }

        request.id = Some(RequestId::Number(local as i64));
        if self.outbound.send(request).is_err() {
            return Err(self.reason());
        }

        tokio::select! {
            reply = reply => match reply {
                Ok(Ok(response)) => Ok(response.with_id(original)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(self.reason()),
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    session_id = %self.id,
                    id = %original,
                    "Backing process did not reply in time"
                );
                Err(RelayError::Timeout)
            }
            _ = cancel.cancelled() => Err(RelayError::ConnectionLost),
        }
    }

    pub fn notify(&self, notification: JsonRpcRequest) -> Result<(), RelayError> {
        if self.closed.is_cancelled() {
            return Err(self.reason());
        }
        self.outbound.send(notification).map_err(|_| self.reason())
    }

    /// Stop the process; pending requests fail with `reason`.
    pub fn terminate(&self, reason: RelayError) {
        if let Ok(mut slot) = self.close_reason.lock() {
            slot.get_or_insert(reason);
        }
        self.closed.cancel();
    }

    /// Resolves once the child has been reaped and pending requests failed.
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    fn reason(&self) -> RelayError {
        close_reason(&self.close_reason)
    }
}

fn close_reason(reason: &Mutex<Option<RelayError>>) -> RelayError {
    reason
        .lock()
        .ok()
        .and_then(|r| r.clone())
        .unwrap_or(RelayError::ProcessExited)
}

fn local_id(id: &RequestId) -> Option<u64> {
    match id {
        RequestId::Number(n) => u64::try_from(*n).ok(),
        RequestId::String(s) => s.parse().ok(),
        RequestId::Null => None,
    }
}

async fn supervise(
    mut child: Child,
    session_id: Uuid,
    pending: Arc<Pending>,
    closed: CancellationToken,
    exited: CancellationToken,
    reason: Arc<Mutex<Option<RelayError>>>,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => info!(%session_id, %status, "Backing process exited"),
            Err(e) => warn!(%session_id, error = %e, "Failed waiting on backing process"),
        },
        _ = closed.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(%session_id, error = %e, "Failed to kill backing process");
            }
            info!(%session_id, "Backing process terminated");
        }
    }

    closed.cancel();
    let failed = pending.fail_all(&close_reason(&reason));
    if failed > 0 {
        warn!(%session_id, failed, "Failed pending requests at session teardown");
    }
    exited.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Answers every request with an empty result by rewriting `method` to `result`.
    fn echo_command() -> ProcessCommand {
        ProcessCommand::new("sed").args(["-u", r#"s/"method":"[^"]*"/"result":{}/"#])
    }

    fn silent_command() -> ProcessCommand {
        ProcessCommand::new("sh").args(["-c", "cat > /dev/null"])
    }

    #[tokio::test]
    async fn test_request_restores_caller_id() {
        let session = Session::spawn(&echo_command()).unwrap();
        let cancel = CancellationToken::new();

        let reply = session
            .request(
                JsonRpcRequest::new("client-1", "ping", None),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(reply.id, RequestId::String("client-1".into()));
        assert_eq!(reply.result(), Some(&json!({})));
        assert_eq!(session.pending_count(), 0);
        session.terminate(RelayError::Draining);
    }

    #[tokio::test]
    async fn test_concurrent_callers_may_share_ids() {
        let session = Session::spawn(&echo_command()).unwrap();
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(5);

        let (a, b) = tokio::join!(
            session.request(JsonRpcRequest::new(1, "ping", None), timeout, &cancel),
            session.request(JsonRpcRequest::new(1, "ping", None), timeout, &cancel),
        );
        assert_eq!(a.unwrap().id, RequestId::Number(1));
        assert_eq!(b.unwrap().id, RequestId::Number(1));
        session.terminate(RelayError::Draining);
    }

    #[tokio::test]
    async fn test_timeout_leaves_session_usable() {
        let session = Session::spawn(&silent_command()).unwrap();
        let cancel = CancellationToken::new();

        let err = session
            .request(
                JsonRpcRequest::new(7, "tools/call", None),
                Duration::from_millis(100),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Timeout);
        assert_eq!(session.pending_count(), 0);
        assert!(!session.is_closed());
        session.terminate(RelayError::Draining);
    }

    #[tokio::test]
    async fn test_process_exit_fails_pending() {
        let session =
            Session::spawn(&ProcessCommand::new("sh").args(["-c", "read line; exit 0"])).unwrap();
        let cancel = CancellationToken::new();

        let err = session
            .request(
                JsonRpcRequest::new(1, "ping", None),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::ProcessExited);

        session.exited().await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_cancellation_is_connection_lost() {
        let session = Session::spawn(&silent_command()).unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = session
            .request(
                JsonRpcRequest::new(1, "ping", None),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::ConnectionLost);
        session.terminate(RelayError::Draining);
    }

    #[tokio::test]
    async fn test_terminate_uses_given_reason() {
        let session = Session::spawn(&silent_command()).unwrap();
        let cancel = CancellationToken::new();

        let terminator = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            terminator.terminate(RelayError::Draining);
        });

        let err = session
            .request(
                JsonRpcRequest::new(1, "ping", None),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, RelayError::Draining);
        session.exited().await;
    }

    #[test]
    fn test_spawn_failure() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _enter = runtime.enter();
        let err = Session::spawn(&ProcessCommand::new("/nonexistent/relay-backend")).unwrap_err();
        assert!(matches!(err, RelayError::SpawnFailed(_)));
    }
}
