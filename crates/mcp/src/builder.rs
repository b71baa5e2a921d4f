// Turns a RelayConfig into live providers, forwarders and a message handler.

use crate::config::{BackendConfig, BridgeMode, ProcessConfig, RelayConfig, RemoteConfig};
use crate::dispatcher::Dispatcher;
use crate::forward::{Forwarder, Passthrough};
use crate::handler::MessageHandler;
use crate::provider::{
    ProviderRegistry, ProviderStatus, RelayProvider, RestApi, ToolProvider, ToolRegistry,
};
use crate::session::{ProcessCommand, SessionConfig, SessionManager};
use crate::upstream::{HttpUpstream, RetryConfig, UpstreamConfig};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Everything the transports need, built once at startup.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<ProviderRegistry>,
    forwarders: HashMap<String, Arc<dyn Forwarder>>,
    upstreams: Vec<Arc<HttpUpstream>>,
    managers: Vec<(SessionManager, bool)>,
    handler: Arc<dyn MessageHandler>,
}

pub fn build(config: &RelayConfig) -> Result<Relay> {
    config.validate()?;

    let mut registry = ProviderRegistry::new();
    let mut forwarders: HashMap<String, Arc<dyn Forwarder>> = HashMap::new();
    let mut upstreams = Vec::new();
    let mut managers = Vec::new();

    for provider in &config.providers {
        let name = provider.name.as_str();
        let tools: Arc<dyn ToolProvider> = match &provider.backend {
            BackendConfig::Remote(remote) => {
                let upstream = Arc::new(
                    remote_upstream(name, remote)
                        .with_context(|| format!("Failed to configure provider {}", name))?,
                );
                upstreams.push(upstream.clone());
                forwarders.insert(name.to_string(), upstream.clone());
                Arc::new(RelayProvider::new(upstream))
            }
            BackendConfig::Process(process) => {
                let manager = process_manager(name, process);
                managers.push((manager.clone(), process.eager_start));
                let forwarder: Arc<dyn Forwarder> = Arc::new(manager);
                forwarders.insert(name.to_string(), forwarder.clone());
                Arc::new(RelayProvider::new(forwarder))
            }
            BackendConfig::Rest(rest) => {
                let api = Arc::new(
                    RestApi::new(name, rest.clone())
                        .with_context(|| format!("Failed to configure provider {}", name))?,
                );
                let mut catalog = ToolRegistry::new();
                for tool in api.tools() {
                    catalog.register(Arc::new(tool));
                }
                if catalog.is_empty() {
                    warn!(provider = %name, "REST provider has no tools configured");
                }
                Arc::new(catalog)
            }
        };

        info!(
            provider = %name,
            kind = %tools.kind(),
            visibility = %provider.visibility,
            "Registered provider"
        );
        registry.register(name, provider.visibility, tools);
    }

    let registry = Arc::new(registry);
    let handler: Arc<dyn MessageHandler> = match config.bridge.mode {
        BridgeMode::Dispatch => {
            let mut dispatcher = Dispatcher::new(registry.clone(), config.dispatcher.clone());
            if let Some(fallback) = &config.bridge.fallback {
                dispatcher = dispatcher.with_fallback(lookup(&forwarders, fallback)?);
            }
            Arc::new(dispatcher)
        }
        BridgeMode::Passthrough => {
            let upstream = config
                .bridge
                .upstream
                .as_deref()
                .ok_or_else(|| anyhow!("Passthrough mode needs bridge.upstream"))?;
            Arc::new(Passthrough::new(lookup(&forwarders, upstream)?))
        }
    };

    Ok(Relay {
        config: config.clone(),
        registry,
        forwarders,
        upstreams,
        managers,
        handler,
    })
}

fn lookup(
    forwarders: &HashMap<String, Arc<dyn Forwarder>>,
    name: &str,
) -> Result<Arc<dyn Forwarder>> {
    forwarders
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow!("Provider {} cannot forward messages", name))
}

fn remote_upstream(name: &str, remote: &RemoteConfig) -> Result<HttpUpstream> {
    let from_env = remote
        .url_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty());
    let url = match from_env.or_else(|| remote.url.clone()) {
        Some(raw) => Some(
            Url::parse(&raw).with_context(|| format!("Invalid upstream URL {}", raw))?,
        ),
        None => {
            // Requests fail with a not-configured error until the variable is set.
            warn!(provider = %name, url_env = ?remote.url_env, "No upstream URL configured");
            None
        }
    };

    let token = match remote.token_env.as_deref() {
        Some(var) => {
            let token = std::env::var(var).ok().filter(|t| !t.is_empty());
            if token.is_none() {
                warn!(provider = %name, variable = %var, "Upstream token variable is not set");
            }
            token
        }
        None => None,
    };

    let config = UpstreamConfig {
        url,
        url_env: remote.url_env.clone(),
        token,
        headers: remote.headers.clone(),
        timeout: Duration::from_secs(remote.timeout_secs),
        retry: RetryConfig {
            max_retries: remote.max_retries,
            ..Default::default()
        },
    };
    Ok(HttpUpstream::new(name, config)?)
}

fn process_manager(name: &str, process: &ProcessConfig) -> SessionManager {
    let mut command = ProcessCommand::new(&process.command).args(&process.args);
    for (key, value) in &process.env {
        command = command.env(key, value);
    }
    for var in &process.pass_env {
        match std::env::var(var) {
            Ok(value) => command = command.env(var, value),
            Err(_) => warn!(provider = %name, variable = %var, "Pass-through variable is not set"),
        }
    }
    command.cwd = process.cwd.clone();

    SessionManager::new(
        name,
        command,
        SessionConfig {
            mode: process.mode,
            request_timeout: Duration::from_secs(process.timeout_secs),
            idle_shutdown: process.idle_shutdown,
            handshake: process.handshake,
        },
    )
}

impl Relay {
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Handler for the relay as a whole.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.handler.clone()
    }

    /// Handler scoped to one provider, with unknown methods forwarded to it
    /// when it is a relayed backend.
    pub fn handler_for(&self, provider: &str) -> Option<Arc<dyn MessageHandler>> {
        let scoped = self.registry.scoped(provider)?;
        let mut dispatcher = Dispatcher::new(Arc::new(scoped), self.config.dispatcher.clone());
        if let Some(forwarder) = self.forwarders.get(provider) {
            dispatcher = dispatcher.with_fallback(forwarder.clone());
        }
        Some(Arc::new(dispatcher))
    }

    pub fn statuses(&self) -> Vec<ProviderStatus> {
        self.registry.statuses()
    }

    /// Start every process marked `eager_start`. Any failure is fatal.
    pub async fn start_eager(&self) -> Result<()> {
        for (manager, eager) in &self.managers {
            if !eager {
                continue;
            }
            let session = manager
                .start()
                .await
                .with_context(|| {
                    format!("Failed to start backing process for {}", manager.name())
                })?;
            info!(provider = %manager.name(), pid = ?session.pid(), "Backing process started");
        }
        Ok(())
    }

    /// Probe each remote upstream's health endpoint. Failures are only logged.
    pub async fn check_health(&self) {
        for upstream in &self.upstreams {
            match upstream.probe_health().await {
                Ok(report) => info!(upstream = %upstream.name(), %report, "Upstream healthy"),
                Err(e) => {
                    warn!(upstream = %upstream.name(), error = %e, "Upstream health check failed")
                }
            }
        }
    }

    /// Drain every backing process.
    pub async fn shutdown(&self, grace: Duration) {
        for (manager, _) in &self.managers {
            manager.shutdown(grace).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestContext;
    use crate::provider::ProviderKind;
    use crate::session::SessionPhase;
    use relay_core::JsonRpcRequest;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(toml: &str) -> RelayConfig {
        RelayConfig::from_toml_str(toml).unwrap()
    }

    #[tokio::test]
    async fn test_builds_every_backend_kind() {
        let relay = build(&config(
            r#"
[[providers]]
name = "remote"
kind = "remote"
url_env = "RELAY_TEST_BUILDER_UNSET_URL"

[[providers]]
name = "child"
kind = "process"
command = "cat"

[[providers]]
name = "vendor"
kind = "rest"
base_url = "http://localhost:1"

[[providers.tools]]
name = "me"
path = "/me"
"#,
        ))
        .unwrap();

        let statuses = relay.statuses();
        assert_eq!(statuses.len(), 3);
        assert_eq!(statuses[0].kind, ProviderKind::Remote);
        assert_eq!(statuses[1].kind, ProviderKind::Process);
        assert_eq!(statuses[1].phase, Some(SessionPhase::Absent));
        assert_eq!(statuses[2].kind, ProviderKind::Local);
        assert!(relay.handler_for("vendor").is_some());
        assert!(relay.handler_for("missing").is_none());
    }

    #[tokio::test]
    async fn test_unset_remote_url_reports_not_configured() {
        let relay = build(&config(
            r#"
[dispatcher]
list_failure = "propagate"

[[providers]]
name = "remote"
kind = "remote"
url_env = "RELAY_TEST_BUILDER_UNSET_URL"
"#,
        ))
        .unwrap();

        let reply = relay
            .handler()
            .handle(JsonRpcRequest::new(1, "tools/list", None), &RequestContext::detached())
            .await
            .unwrap();
        let error = reply.error_object().unwrap();
        assert_eq!(error.code, -32002);
        assert!(error.message.contains("RELAY_TEST_BUILDER_UNSET_URL"));
    }

    #[tokio::test]
    async fn test_remote_url_from_environment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "tools/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "result": {"tools": [{"name": "run_report", "inputSchema": {"type": "object"}}]}
            })))
            .mount(&server)
            .await;
        std::env::set_var("RELAY_TEST_BUILDER_REMOTE_URL", format!("{}/mcp", server.uri()));

        let relay = build(&config(
            r#"
[[providers]]
name = "analytics"
kind = "remote"
url = "http://127.0.0.1:9/unused"
url_env = "RELAY_TEST_BUILDER_REMOTE_URL"
"#,
        ))
        .unwrap();

        let reply = relay
            .handler()
            .handle(JsonRpcRequest::new(5, "tools/list", None), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(reply.result().unwrap()["tools"][0]["name"], "run_report");
    }

    #[tokio::test]
    async fn test_passthrough_forwards_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "resources/list"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 123,
                "result": {"resources": []}
            })))
            .mount(&server)
            .await;

        let relay = build(&config(&format!(
            r#"
[bridge]
mode = "passthrough"
upstream = "up"

[[providers]]
name = "up"
kind = "remote"
url = "{}/mcp"
"#,
            server.uri()
        )))
        .unwrap();

        let reply = relay
            .handler()
            .handle(JsonRpcRequest::new("x", "resources/list", None), &RequestContext::detached())
            .await
            .unwrap();
        assert_eq!(reply.id, relay_core::RequestId::String("x".into()));
        assert_eq!(reply.result(), Some(&json!({"resources": []})));
    }

    #[tokio::test]
    async fn test_eager_start_failure_is_fatal() {
        let relay = build(&config(
            r#"
[[providers]]
name = "broken"
kind = "process"
command = "/nonexistent/relay-backend"
eager_start = true
"#,
        ))
        .unwrap();
        let err = relay.start_eager().await.unwrap_err();
        assert!(format!("{:#}", err).contains("broken"));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let result = build(&config(
            r#"
[[providers]]
name = "bad"
kind = "remote"
url = "not a url"
"#,
        ));
        assert!(result.is_err());
    }
}
