use crate::middleware::auth::TokenVerifier;
use crate::sse::SseRegistry;
use anyhow::{Context, Result};
use relay_mcp::{build, ConnectionState, MessageHandler, Relay, RelayConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub sse: SseConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible origin used in SSE endpoint events, e.g.
    /// `https://relay.example.com`.
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
        }
    }
}

/// Where the reply to a POST on an SSE session goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SseReplyMode {
    /// 202 to the POST, reply as an `event: message` on the stream.
    #[default]
    Stream,
    /// Reply in the POST's response body.
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,

    #[serde(default)]
    pub reply_mode: SseReplyMode,
}

fn default_keepalive() -> u64 {
    30
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive(),
            reply_mode: SseReplyMode::default(),
        }
    }
}

impl SseConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the HS256 token secret. Unset means every
    /// caller is anonymous.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

fn default_secret_env() -> String {
    "RELAY_TOKEN_SECRET".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            Self::from_toml_str(&content)?
        } else {
            tracing::info!(
                path = %config_path.display(),
                "Configuration file not found, using defaults"
            );
            Self::default()
        };

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse configuration file")?;
        config.relay.validate()?;
        Ok(config)
    }
}

/// One mount point: the root or a single provider.
pub struct Endpoint {
    /// Path prefix, empty for the root mount.
    pub prefix: String,
    pub handler: Arc<dyn MessageHandler>,
    /// Held for the gateway's lifetime, so backing processes with
    /// `idle_shutdown` are not stopped after every one-shot HTTP exchange.
    anchor: Arc<ConnectionState>,
}

impl Endpoint {
    pub fn new(prefix: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        let anchor = handler.connect();
        Self {
            prefix: prefix.into(),
            handler,
            anchor,
        }
    }

    /// Release the endpoint's hold on backing processes.
    pub fn close(&self) {
        self.anchor.close();
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    pub relay: Relay,
    pub root: Arc<Endpoint>,
    pub providers: HashMap<String, Arc<Endpoint>>,
    pub sessions: SseRegistry,
    pub verifier: TokenVerifier,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let relay = build(&config.relay).context("Failed to build relay")?;

        let root = Arc::new(Endpoint::new(String::new(), relay.handler()));
        let mut providers = HashMap::new();
        for name in relay.registry().names() {
            if let Some(handler) = relay.handler_for(name) {
                providers.insert(
                    name.to_string(),
                    Arc::new(Endpoint::new(format!("/{}", name), handler)),
                );
            }
        }

        let verifier = TokenVerifier::from_env(&config.auth.secret_env);
        if !verifier.is_enabled() {
            tracing::warn!(
                variable = %config.auth.secret_env,
                "Token secret not set, every caller is anonymous"
            );
        }

        Ok(Self {
            config,
            relay,
            root,
            providers,
            sessions: SseRegistry::new(),
            verifier,
            started_at: Instant::now(),
        })
    }
}
