//! Line-delimited JSON-RPC over a byte stream pair (normally stdin/stdout).
//!
//! Each request runs on its own task so a slow tool call never blocks the
//! next message; replies may therefore leave out of order. A single writer
//! task owns the output stream.

use crate::handler::{MessageHandler, RequestContext};
use futures::{SinkExt, StreamExt};
use relay_core::{Frame, JsonRpcResponse, MessageCodec};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

pub struct StdioBridge {
    handler: Arc<dyn MessageHandler>,
    drain_timeout: Duration,
}

impl StdioBridge {
    pub fn new(handler: Arc<dyn MessageHandler>, drain_timeout: Duration) -> Self {
        Self {
            handler,
            drain_timeout,
        }
    }

    /// Serve one client until its input ends or its output breaks.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = self.handler.connect();
        let cancel = connection.cancellation().clone();
        info!(connection = %connection.id(), "Client connected");

        let (replies, mut outbound) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, MessageCodec::new());
            while let Some(reply) = outbound.recv().await {
                if let Err(e) = sink.send(reply).await {
                    warn!(error = %e, "Failed writing reply, closing connection");
                    writer_cancel.cancel();
                    return Err(e);
                }
            }
            Ok(())
        });

        let mut frames = FramedRead::new(reader, MessageCodec::new());
        let mut in_flight = JoinSet::new();
        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = cancel.cancelled() => break,
                // Reap finished tasks so the set does not grow without bound.
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => continue,
            };

            match frame {
                Some(Ok(Frame::Request(request))) => {
                    let handler = self.handler.clone();
                    let ctx = RequestContext::new(connection.clone());
                    let replies = replies.clone();
                    in_flight.spawn(async move {
                        if let Some(reply) = handler.handle(request, &ctx).await {
                            let _ = replies.send(reply);
                        }
                    });
                }
                Some(Ok(Frame::Invalid(reply))) => {
                    let _ = replies.send(reply);
                }
                Some(Ok(Frame::Response(reply))) => {
                    debug!(id = %reply.id, "Ignoring response from client");
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Failed reading from client");
                    break;
                }
                None => {
                    debug!("Client input closed");
                    break;
                }
            }
        }

        if !in_flight.is_empty() && !cancel.is_cancelled() {
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while in_flight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(
                    remaining = in_flight.len(),
                    "Requests still running after drain timeout, cancelling"
                );
            }
        }

        // Fails whatever is still pending with "connection lost" and lets go
        // of backing processes.
        connection.close();
        in_flight.shutdown().await;
        drop(replies);
        info!(connection = %connection.id(), "Client disconnected");

        match writer.await {
            Ok(result) => result,
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Dispatcher, DispatcherConfig};
    use crate::provider::ProviderRegistry;
    use relay_core::RequestId;
    use serde_json::{json, Value};
    use std::collections::HashSet;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn bridge() -> StdioBridge {
        let dispatcher =
            Dispatcher::new(Arc::new(ProviderRegistry::new()), DispatcherConfig::default());
        StdioBridge::new(Arc::new(dispatcher), Duration::from_secs(1))
    }

    async fn exchange(input: &str) -> Vec<Value> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(async move { bridge().run(server_read, server_write).await });

        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut lines = BufReader::new(client).lines();
        let mut replies = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str(&line).unwrap());
        }
        task.await.unwrap().unwrap();
        replies
    }

    #[tokio::test]
    async fn test_ping_scenario() {
        let replies = exchange("{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n").await;
        assert_eq!(replies, vec![json!({"jsonrpc": "2.0", "id": 1, "result": {}})]);
    }

    #[tokio::test]
    async fn test_parse_error_then_recovery() {
        let replies = exchange(
            "this is not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n",
        )
        .await;
        assert_eq!(replies.len(), 2);
        let parse_error = replies.iter().find(|r| r["id"].is_null()).unwrap();
        assert_eq!(parse_error["error"]["code"], -32700);
        let pong = replies.iter().find(|r| r["id"] == 2).unwrap();
        assert_eq!(pong["result"], json!({}));
    }

    #[tokio::test]
    async fn test_one_reply_per_request_and_none_for_notifications() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "\n",
            "{\"jsonrpc\":\"2.0\",\"id\":\"b\",\"method\":\"tools/list\"}\r\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"unknown_tool\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"ping\"}",
        );
        let replies = exchange(input).await;
        assert_eq!(replies.len(), 4);

        let ids: HashSet<RequestId> = replies
            .iter()
            .map(|r| serde_json::from_value(r["id"].clone()).unwrap())
            .collect();
        let expected: HashSet<RequestId> = [
            RequestId::Number(1),
            RequestId::String("b".into()),
            RequestId::Number(3),
            RequestId::Number(4),
        ]
        .into_iter()
        .collect();
        assert_eq!(ids, expected);

        let unknown = replies.iter().find(|r| r["id"] == 3).unwrap();
        assert_eq!(unknown["error"]["code"], -32601);
        let listing = replies.iter().find(|r| r["id"] == "b").unwrap();
        assert_eq!(listing["result"], json!({"tools": []}));
    }

    #[tokio::test]
    async fn test_invalid_version_is_rejected_with_id() {
        let replies = exchange("{\"jsonrpc\":\"1.0\",\"id\":9,\"method\":\"ping\"}\n").await;
        assert_eq!(replies[0]["id"], 9);
        assert_eq!(replies[0]["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_empty_input_ends_cleanly() {
        assert!(exchange("").await.is_empty());
    }
}
