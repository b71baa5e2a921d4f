use crate::dispatcher::DispatcherConfig;
use crate::provider::{RestApiConfig, Visibility};
use crate::session::BackingMode;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path segments the gateway routes itself; provider mounts may not shadow them.
const RESERVED_NAMES: &[&str] = &["health", "sse", "mcp", "jsonrpc", "message"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Answer MCP methods locally over the provider registry.
    #[default]
    Dispatch,
    /// Forward every message verbatim to the `upstream` provider.
    Passthrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mode: BridgeMode,

    /// Provider that receives every message in passthrough mode.
    #[serde(default)]
    pub upstream: Option<String>,

    /// Provider that receives methods the dispatcher does not handle.
    #[serde(default)]
    pub fallback: Option<String>,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Probe remote providers' `/health` at startup.
    #[serde(default)]
    pub health_check: bool,
}

fn default_drain_timeout() -> u64 {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mode: BridgeMode::default(),
            upstream: None,
            fallback: None,
            drain_timeout_secs: default_drain_timeout(),
            health_check: false,
        }
    }
}

impl BridgeConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(flatten)]
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// HTTP JSON-RPC endpoint.
    Remote(RemoteConfig),
    /// Child process speaking MCP on stdio.
    Process(ProcessConfig),
    /// Tools executed locally against a vendor REST API.
    Rest(RestApiConfig),
}

impl BackendConfig {
    pub fn is_forwardable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Process(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub url: Option<String>,

    /// Environment variable that overrides `url`.
    #[serde(default)]
    pub url_env: Option<String>,

    #[serde(default)]
    pub token_env: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_remote_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Variables copied from the relay's own environment when present.
    #[serde(default)]
    pub pass_env: Vec<String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub mode: BackingMode,

    #[serde(default = "default_process_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub idle_shutdown: bool,

    /// Start at boot; failing twice is fatal.
    #[serde(default)]
    pub eager_start: bool,

    #[serde(default)]
    pub handshake: bool,
}

fn default_process_timeout() -> u64 {
    60
}

impl RelayConfig {
    /// Load a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            let name = provider.name.as_str();
            let valid = name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if name.is_empty() || !valid {
                bail!(
                    "Provider name {:?} must be non-empty and use only letters, digits, '-' or '_'",
                    name
                );
            }
            if RESERVED_NAMES.contains(&name) {
                bail!("Provider name {:?} is reserved", name);
            }
            if !names.insert(name) {
                bail!("Duplicate provider name {:?}", name);
            }
            if let BackendConfig::Process(process) = &provider.backend {
                if process.command.trim().is_empty() {
                    bail!("Provider {:?} has an empty command", name);
                }
            }
        }

        if self.bridge.mode == BridgeMode::Passthrough && self.bridge.upstream.is_none() {
            bail!("Passthrough mode needs bridge.upstream");
        }
        for (field, target) in [
            ("bridge.upstream", &self.bridge.upstream),
            ("bridge.fallback", &self.bridge.fallback),
        ] {
            let Some(target) = target else { continue };
            match self.provider(target) {
                Some(provider) if provider.backend.is_forwardable() => {}
                Some(_) => bail!(
                    "{} names {:?}, which is not a remote or process provider",
                    field,
                    target
                ),
                None => bail!("{} names unknown provider {:?}", field, target),
            }
        }
        Ok(())
    }
}
