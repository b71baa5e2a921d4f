//! Tool providers: the one abstraction every backend implements.

mod catalog;
mod registry;
mod relay;
mod rest;

pub use catalog::{
    json_schema_array, json_schema_boolean, json_schema_number, json_schema_object,
    json_schema_string, Tool, ToolRegistry,
};
pub use registry::{ProviderEntry, ProviderRegistry, ProviderStatus};
pub use relay::RelayProvider;
pub use rest::{ArgumentSpec, RestApi, RestApiConfig, RestTool, RestToolSpec};

use crate::handler::RequestContext;
use crate::protocol::{CallToolResult, ToolDescriptor};
use crate::session::{Attachment, SessionPhase};
use relay_core::jsonrpc::{INVALID_PARAMS, PROVIDER_ERROR};
use relay_core::{JsonRpcError, RelayError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Relays to an HTTP JSON-RPC endpoint.
    Remote,
    /// Relays to a backing child process.
    Process,
    /// Executes tools locally against a vendor REST API.
    Local,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Remote => "remote",
            Self::Process => "process",
            Self::Local => "local",
        };
        f.write_str(kind)
    }
}

/// Who may see a provider's tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    /// Only callers with a verified session token.
    Authenticated,
}

impl Visibility {
    pub fn allows(&self, ctx: &RequestContext) -> bool {
        match self {
            Self::Public => true,
            Self::Authenticated => ctx.is_authenticated(),
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Authenticated => f.write_str("authenticated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Missing required arguments: {}", .0.join(", "))]
    MissingArguments(Vec<String>),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A credential the tool needs is absent from the environment.
    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    #[error("Vendor API error (HTTP {status}): {message}")]
    Vendor { status: u16, message: String },

    /// JSON-RPC error reported by a relayed backend.
    #[error("{message}")]
    Remote { code: i32, message: String },

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ProviderError {
    pub fn code(&self) -> i32 {
        match self {
            Self::UnknownTool(_) | Self::MissingArguments(_) | Self::InvalidArguments(_) => {
                INVALID_PARAMS
            }
            Self::MissingCredential(_) | Self::Vendor { .. } => PROVIDER_ERROR,
            Self::Remote { code, .. } => *code,
            Self::Relay(e) => e.code(),
        }
    }

    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            Self::Relay(e) => e.to_jsonrpc(),
            _ => JsonRpcError::custom(self.code(), self.to_string()),
        }
    }
}

impl From<JsonRpcError> for ProviderError {
    fn from(error: JsonRpcError) -> Self {
        Self::Remote {
            code: error.code,
            message: error.message,
        }
    }
}

/// A source of tools. Relay-backed and locally executed providers look the
/// same from the dispatcher's side.
#[async_trait::async_trait]
pub trait ToolProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Vec<ToolDescriptor>, ProviderError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ProviderError>;

    fn attach(&self) -> Option<Attachment> {
        None
    }

    fn phase(&self) -> Option<SessionPhase> {
        None
    }
}
