//! Error taxonomy for the relay.
//!
//! Every failure that can reach a client maps onto exactly one JSON-RPC error
//! object through [`RelayError::to_jsonrpc`].

use crate::jsonrpc::{
    JsonRpcError, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND,
    PARSE_ERROR, PROVIDER_ERROR, REQUEST_TIMEOUT, SESSION_DRAINING, UPSTREAM_ERROR,
};

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    /// Malformed JSON on the wire.
    #[error("Parse error")]
    Parse,

    /// Envelope present but not a valid JSON-RPC 2.0 request.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    Internal(String),

    /// No reply arrived within the request timeout.
    #[error("Request timeout")]
    Timeout,

    /// Network failure talking to an HTTP upstream.
    #[error("Upstream request failed: {0}")]
    Upstream(String),

    /// HTTP upstream answered with a non-success status.
    #[error("Upstream returned HTTP {status}")]
    UpstreamStatus { status: u16, body: String },

    /// Upstream answered with a JSON-RPC error of its own.
    #[error("{message}")]
    Remote { code: i32, message: String },

    /// The backing process exited with requests still pending.
    #[error("process exited")]
    ProcessExited,

    /// The owning connection closed with requests still pending.
    #[error("connection lost")]
    ConnectionLost,

    /// A required endpoint or credential is missing from the environment.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Failed to start backing process: {0}")]
    SpawnFailed(String),

    /// The session is shutting down and no longer accepts work.
    #[error("Session is draining")]
    Draining,
}

impl RelayError {
    pub fn code(&self) -> i32 {
        match self {
            Self::Parse => PARSE_ERROR,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Timeout => REQUEST_TIMEOUT,
            Self::Upstream(_) | Self::UpstreamStatus { .. } => UPSTREAM_ERROR,
            Self::Remote { code, .. } => *code,
            Self::NotConfigured(_) => PROVIDER_ERROR,
            Self::Draining => SESSION_DRAINING,
            Self::Internal(_)
            | Self::ProcessExited
            | Self::ConnectionLost
            | Self::SpawnFailed(_) => INTERNAL_ERROR,
        }
    }

    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let error = JsonRpcError::custom(self.code(), self.to_string());
        match self {
            Self::UpstreamStatus { body, .. } if !body.is_empty() => error.with_data(body.clone()),
            _ => error,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", e))
    }
}

impl From<RelayError> for JsonRpcError {
    fn from(e: RelayError) -> Self {
        e.to_jsonrpc()
    }
}
