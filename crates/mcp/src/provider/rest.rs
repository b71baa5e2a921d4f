// Tools backed by one authenticated REST call each

use super::catalog::{
    json_schema_array, json_schema_boolean, json_schema_number, json_schema_object,
    json_schema_string, Tool,
};
use super::ProviderError;
use crate::handler::RequestContext;
use crate::protocol::{CallToolResult, ToolDescriptor};
use relay_core::RelayError;
use reqwest::{header, Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

const MAX_OUTPUT_BYTES: usize = 100_000;
const MAX_VENDOR_MESSAGE_CHARS: usize = 500;

/// Connection settings and tool catalog for one vendor REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestApiConfig {
    /// Base URL used when `url_env` is unset or absent from the environment.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub url_env: Option<String>,
    /// Environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    /// Prefix placed before the token; empty sends the bare token.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_rest_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tools: Vec<RestToolSpec>,
}

fn default_auth_header() -> String {
    header::AUTHORIZATION.as_str().to_string()
}

fn default_auth_scheme() -> String {
    "Bearer".to_string()
}

fn default_rest_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Path below the base URL; `{arg}` segments are filled from arguments.
    pub path: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub name: String,
    #[serde(rename = "type", default = "default_argument_type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

fn default_argument_type() -> String {
    "string".to_string()
}

/// Shared HTTP client and credentials for a vendor's tools.
#[derive(Debug)]
pub struct RestApi {
    name: String,
    client: Client,
    config: RestApiConfig,
}

impl RestApi {
    pub fn new(name: impl Into<String>, config: RestApiConfig) -> Result<Self, RelayError> {
        let mut headers = header::HeaderMap::new();
        for (name, value) in &config.headers {
            let name = header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| RelayError::Internal(format!("Invalid header name: {}", name)))?;
            let value = header::HeaderValue::from_str(value)
                .map_err(|_| RelayError::Internal(format!("Invalid value for header {}", name)))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("mcp-relay/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            client,
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every tool of the catalog, bound to this API.
    pub fn tools(self: &Arc<Self>) -> Vec<RestTool> {
        self.config
            .tools
            .iter()
            .map(|spec| RestTool {
                api: self.clone(),
                spec: spec.clone(),
            })
            .collect()
    }

    fn base_url(&self) -> Result<Url, ProviderError> {
        let from_env = self
            .config
            .url_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty());
        let base = match (from_env, &self.config.base_url) {
            (Some(url), _) => url,
            (None, Some(url)) => url.clone(),
            (None, None) => {
                return Err(ProviderError::MissingCredential(
                    self.config
                        .url_env
                        .clone()
                        .unwrap_or_else(|| format!("base_url for {}", self.name)),
                ))
            }
        };
        Url::parse(&base).map_err(|e| {
            ProviderError::Relay(RelayError::NotConfigured(format!(
                "invalid base URL for {}: {}",
                self.name, e
            )))
        })
    }

    // Read at call time so a missing token only fails the calls that need it.
    fn authorize(&self, request: RequestBuilder) -> Result<RequestBuilder, ProviderError> {
        let Some(var) = self.config.token_env.as_deref() else {
            return Ok(request);
        };
        let token = std::env::var(var)
            .ok()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProviderError::MissingCredential(var.to_string()))?;
        let value = if self.config.auth_scheme.is_empty() {
            token
        } else {
            format!("{} {}", self.config.auth_scheme, token)
        };
        Ok(request.header(self.config.auth_header.as_str(), value))
    }
}

pub struct RestTool {
    api: Arc<RestApi>,
    spec: RestToolSpec,
}

impl RestTool {
    fn build_url(&self, args: &mut Map<String, Value>) -> Result<Url, ProviderError> {
        let mut url = self.api.base_url()?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                ProviderError::Relay(RelayError::NotConfigured(format!(
                    "base URL for {} cannot carry a path",
                    self.api.name
                )))
            })?;
            segments.pop_if_empty();
            for part in self.spec.path.split('/').filter(|p| !p.is_empty()) {
                match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                    Some(arg) => {
                        let value = args
                            .remove(arg)
                            .filter(|v| !v.is_null())
                            .ok_or_else(|| ProviderError::MissingArguments(vec![arg.to_string()]))?;
                        segments.push(&scalar(&value));
                    }
                    None => {
                        segments.push(part);
                    }
                }
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl Tool for RestTool {
    fn descriptor(&self) -> ToolDescriptor {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in &self.spec.arguments {
            let schema = match arg.kind.as_str() {
                "number" => json_schema_number(&arg.description),
                "integer" => serde_json::json!({"type": "integer", "description": arg.description}),
                "boolean" => json_schema_boolean(&arg.description),
                "array" => json_schema_array(serde_json::json!({}), &arg.description),
                "object" => serde_json::json!({"type": "object", "description": arg.description}),
                _ => json_schema_string(&arg.description),
            };
            properties.insert(arg.name.clone(), schema);
            if arg.required {
                required.push(arg.name.as_str());
            }
        }

        ToolDescriptor {
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
            input_schema: json_schema_object(Value::Object(properties), required),
        }
    }

    async fn execute(
        &self,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<CallToolResult, ProviderError> {
        let mut args = match arguments {
            Value::Object(args) => args,
            Value::Null => Map::new(),
            _ => {
                return Err(ProviderError::InvalidArguments(
                    "arguments must be an object".to_string(),
                ))
            }
        };

        let url = self.build_url(&mut args)?;
        let method = Method::from_bytes(self.spec.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                ProviderError::InvalidArguments(format!("unsupported method {}", self.spec.method))
            })?;
        debug!(api = %self.api.name, tool = %self.spec.name, %method, %url, "Calling vendor API");

        let mut request = self.api.client.request(method.clone(), url);
        if method == Method::GET || method == Method::DELETE {
            let query: Vec<(String, String)> = args
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), scalar(v)))
                .collect();
            request = request.query(&query);
        } else {
            request = request.json(&Value::Object(args));
        }
        let request = self.api.authorize(request)?;

        let exchange = async {
            let response = request.send().await.map_err(transport_error)?;
            let status = response.status();
            let body = response.text().await.map_err(transport_error)?;
            Ok::<_, ProviderError>((status, body))
        };
        let (status, body) = tokio::select! {
            result = exchange => result?,
            _ = ctx.connection.cancellation().cancelled() => {
                return Err(ProviderError::Relay(RelayError::ConnectionLost));
            }
        };

        if !status.is_success() {
            return Err(ProviderError::Vendor {
                status: status.as_u16(),
                message: vendor_message(&body),
            });
        }

        Ok(CallToolResult::text(render(status.as_u16(), &body)))
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Relay(RelayError::Timeout)
    } else {
        ProviderError::Relay(RelayError::Upstream(e.to_string()))
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn vendor_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let extracted = parsed.as_ref().and_then(|v| {
        v.get("message")
            .or_else(|| v.get("error_description"))
            .or_else(|| v.get("detail"))
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .or_else(|| v.pointer("/error/message"))
            .or_else(|| v.pointer("/errors/0/message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let message = extracted.unwrap_or_else(|| body.trim().to_string());
    if message.is_empty() {
        return "empty response body".to_string();
    }
    message.chars().take(MAX_VENDOR_MESSAGE_CHARS).collect()
}

fn render(status: u16, body: &str) -> String {
    if body.trim().is_empty() {
        return format!("Request succeeded (HTTP {})", status);
    }
    let mut output = match serde_json::from_str::<Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string()),
        Err(_) => body.to_string(),
    };

    // Truncate if too large (>100KB)
    if output.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str("\n\n... (truncated, content too large)");
    }
    output
}
