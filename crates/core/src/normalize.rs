// Reply normalization: every outbound message leaves as {jsonrpc,id,result} or
// {jsonrpc,id,error}, keyed to the id the caller used.

use crate::error::RelayError;
use crate::jsonrpc::{JsonRpcError, JsonRpcResponse, RequestId, ResponsePayload, INTERNAL_ERROR};
use serde_json::Value;

pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Normalize a raw upstream reply and re-key it to `caller_id`.
pub fn normalize_value(caller_id: RequestId, reply: Value) -> JsonRpcResponse {
    let mut object = match reply {
        Value::Object(object) => object,
        _ => return unknown_format(caller_id),
    };

    // `error` wins when an upstream sends both.
    if let Some(error) = object.remove("error").filter(|e| !e.is_null()) {
        return JsonRpcResponse::error(caller_id, error_from_value(error));
    }
    match object.remove("result") {
        Some(result) => JsonRpcResponse::success(caller_id, result),
        None => unknown_format(caller_id),
    }
}

/// Re-key an already typed reply and clean up its error object.
pub fn normalize_response(caller_id: RequestId, reply: JsonRpcResponse) -> JsonRpcResponse {
    match reply.payload {
        ResponsePayload::Result(result) => JsonRpcResponse::success(caller_id, result),
        ResponsePayload::Error(error) => JsonRpcResponse::error(caller_id, sanitize(error)),
    }
}

pub fn from_error(id: RequestId, error: &RelayError) -> JsonRpcResponse {
    JsonRpcResponse::error(id, sanitize(error.to_jsonrpc()))
}

/// Clamp the message length and force `data` to a string.
pub fn sanitize(mut error: JsonRpcError) -> JsonRpcError {
    error.message = truncate(&error.message);
    error.data = error.data.map(stringify);
    error
}

fn error_from_value(error: Value) -> JsonRpcError {
    match error {
        Value::Object(mut fields) => {
            let code = fields
                .get("code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok())
                .unwrap_or(INTERNAL_ERROR);
            let message = match fields.remove("message") {
                Some(Value::String(message)) => message,
                Some(other) => other.to_string(),
                None => "Unknown error".to_string(),
            };
            sanitize(JsonRpcError {
                code,
                message,
                data: fields.remove("data").filter(|d| !d.is_null()),
            })
        }
        Value::String(message) => sanitize(JsonRpcError::internal_error(message)),
        other => sanitize(JsonRpcError::internal_error(other.to_string())),
    }
}

fn unknown_format(id: RequestId) -> JsonRpcResponse {
    JsonRpcResponse::error(id, JsonRpcError::internal_error("Unknown response format"))
}

fn stringify(data: Value) -> Value {
    match data {
        Value::String(_) => data,
        other => Value::String(other.to_string()),
    }
}

fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}
