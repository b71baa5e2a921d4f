// MCP relay speaking line-delimited JSON-RPC on stdin/stdout

use anyhow::{Context, Result};
use clap::Parser;
use relay_mcp::{build, RelayConfig, StdioBridge};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "relay-stdio")]
#[command(about = "Relay MCP tool calls from stdio to remote, process and REST backends")]
#[command(long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Stdout carries the protocol; diagnostics go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_mcp=info,relay_stdio=info".into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if args.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = RelayConfig::load(&args.config)?;
    let relay = build(&config).context("Failed to build relay")?;

    relay.start_eager().await?;
    if config.bridge.health_check {
        relay.check_health().await;
    }

    tracing::info!(
        providers = relay.registry().len(),
        mode = ?config.bridge.mode,
        "MCP relay ready on stdio"
    );
    let bridge = StdioBridge::new(relay.handler(), config.bridge.drain_timeout());

    let outcome = tokio::select! {
        result = bridge.run(tokio::io::stdin(), tokio::io::stdout()) => result,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            Ok(())
        }
    };

    relay.shutdown(Duration::from_secs(5)).await;
    match outcome {
        // The client went away; nothing left to report to.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other.context("stdio bridge failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
