//! Newline-delimited JSON-RPC framing.
//!
//! [`MessageCodec`] turns a byte stream into [`Frame`]s and never fails on bad
//! input: malformed lines come back as [`Frame::Invalid`] carrying the error reply
//! the caller should send, so one bad line cannot end a stream.

use crate::jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION};
use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::{cmp, io};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Maximum size of a single line (10 MiB).
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A request or notification.
    Request(JsonRpcRequest),
    /// A reply to something we sent.
    Response(JsonRpcResponse),
    /// Unusable input, with the reply to send back.
    Invalid(JsonRpcResponse),
}

/// Classify one message. Returns `None` for blank input.
pub fn parse_message(bytes: &[u8]) -> Option<Frame> {
    let trimmed = bytes.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_slice(trimmed) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Unparseable message");
            return Some(invalid(RequestId::Null, JsonRpcError::parse_error()));
        }
    };

    let object = match value {
        Value::Object(ref object) => object,
        Value::Array(_) => {
            return Some(invalid(
                RequestId::Null,
                JsonRpcError::invalid_request("Batch requests are not supported"),
            ))
        }
        _ => {
            return Some(invalid(
                RequestId::Null,
                JsonRpcError::invalid_request("Invalid Request"),
            ))
        }
    };

    let id = match object.get("id") {
        None => None,
        Some(raw) => match RequestId::from_value(raw) {
            Some(id) => Some(id),
            None => {
                return Some(invalid(
                    RequestId::Null,
                    JsonRpcError::invalid_request("Invalid request id"),
                ))
            }
        },
    };
    let reply_id = id.clone().unwrap_or(RequestId::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Some(invalid(
            reply_id,
            JsonRpcError::invalid_request("Invalid JSON-RPC version, expected \"2.0\""),
        ));
    }

    if object.contains_key("method") {
        return Some(match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => Frame::Request(request),
            Err(e) => invalid(reply_id, JsonRpcError::invalid_request(e.to_string())),
        });
    }

    if id.is_some() && (object.contains_key("result") || object.contains_key("error")) {
        return Some(match serde_json::from_value::<JsonRpcResponse>(value) {
            Ok(response) => Frame::Response(response),
            Err(e) => invalid(reply_id, JsonRpcError::invalid_request(e.to_string())),
        });
    }

    Some(invalid(reply_id, JsonRpcError::invalid_request("Missing method")))
}

fn invalid(id: RequestId, error: JsonRpcError) -> Frame {
    Frame::Invalid(JsonRpcResponse::error(id, error))
}

/// Line codec for JSON-RPC streams.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_length: usize,
    // Bytes already scanned for a newline.
    next_index: usize,
    // Inside an overlong line that has already been reported.
    discarding: bool,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_MESSAGE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if let Some(frame) = parse_message(&line[..end]) {
                        return Ok(Some(frame));
                    }
                }
                (false, None) if buf.len() > self.max_length => {
                    warn!(max_bytes = self.max_length, "Discarding oversized message");
                    self.discarding = true;
                    self.next_index = 0;
                    return Ok(Some(invalid(
                        RequestId::Null,
                        JsonRpcError::invalid_request(format!(
                            "Message exceeds {} bytes",
                            self.max_length
                        )),
                    )));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if self.discarding || buf.is_empty() {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(parse_message(&line))
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        serde_json::to_writer(dst.writer(), &item)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    fn error_code(frame: &Frame) -> i32 {
        match frame {
            Frame::Invalid(response) => response.error_object().unwrap().code,
            other => panic!("expected invalid frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_and_notification() {
        let frame = parse_message(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        match frame {
            Frame::Request(request) => {
                assert_eq!(request.id, Some(RequestId::Number(1)));
                assert_eq!(request.method, "ping");
            }
            other => panic!("unexpected {:?}", other),
        }

        let frame =
            parse_message(br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(matches!(frame, Frame::Request(ref r) if r.is_notification()));
    }

    #[test]
    fn test_parse_response() {
        let frame = parse_message(br#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        assert!(matches!(frame, Frame::Response(ref r) if r.id == RequestId::String("a".into())));
    }

    #[test]
    fn test_blank_input_is_skipped() {
        assert!(parse_message(b"").is_none());
        assert!(parse_message(b"  \r").is_none());
    }

    #[test]
    fn test_malformed_json_is_parse_error_with_null_id() {
        let frame = parse_message(b"{not json").unwrap();
        assert_eq!(error_code(&frame), -32700);
        if let Frame::Invalid(reply) = frame {
            assert_eq!(reply.id, RequestId::Null);
        }
    }

    #[test]
    fn test_envelope_violations_are_invalid_request() {
        assert_eq!(error_code(&parse_message(b"[]").unwrap()), -32600);
        assert_eq!(error_code(&parse_message(b"42").unwrap()), -32600);
        assert_eq!(
            error_code(&parse_message(br#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).unwrap()),
            -32600
        );
        assert_eq!(
            error_code(&parse_message(br#"{"jsonrpc":"2.0","id":1}"#).unwrap()),
            -32600
        );
        assert_eq!(
            error_code(&parse_message(br#"{"jsonrpc":"2.0","id":1,"method":7}"#).unwrap()),
            -32600
        );
    }

    #[test]
    fn test_wrong_version_echoes_id() {
        let frame = parse_message(br#"{"jsonrpc":"1.0","id":9,"method":"ping"}"#).unwrap();
        assert_eq!(error_code(&frame), -32600);
        if let Frame::Invalid(reply) = frame {
            assert_eq!(reply.id, RequestId::Number(9));
        }
    }

    #[test]
    fn test_decoder_buffers_partial_lines() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&br#"{"jsonrpc":"2.0","id":1,"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\"method\":\"ping\"}\r\n\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Request(ref r) if r.method == "ping"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_discards_oversized_line_once() {
        let mut codec = MessageCodec::with_max_length(32);
        let mut buf = BytesMut::from(&[b'x'; 40][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(error_code(&frame), -32600);

        // The rest of the long line is dropped without a second reply.
        buf.extend_from_slice(b"tail\n{\"jsonrpc\":\"2.0\"}\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        match frame {
            Frame::Invalid(reply) => {
                assert_eq!(reply.error_object().unwrap().message, "Missing method")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_recovers_after_parse_error() {
        let input: &[u8] = b"garbage\n\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}";
        let frames: Vec<Frame> = FramedRead::new(input, MessageCodec::new())
            .map(|frame| frame.unwrap())
            .collect()
            .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(error_code(&frames[0]), -32700);
        assert!(matches!(frames[1], Frame::Request(ref r) if r.id == Some(RequestId::Number(2))));
    }

    #[test]
    fn test_encoder_appends_newline() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(JsonRpcResponse::success(1, json!({})), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");
    }
}
