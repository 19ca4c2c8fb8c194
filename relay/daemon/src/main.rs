//! Relay Daemon - HTTP/SSE front end for the completion relay
//!
//! Serves the submit/stream endpoints over axum and drives upstream calls
//! through `relay-core`.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8080, config from ~/.config/chat-relay/relay.toml)
//! relay-daemon
//!
//! # Custom listen address and config file
//! relay-daemon --listen 0.0.0.0:9000 --config /etc/chat-relay/relay.toml
//!
//! # JSON logs, verbose
//! RUST_LOG=debug relay-daemon --log-format json
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting, cancel in-flight calls, close streams

mod display;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::{
    default_config_path, load_config_from_path, ConfigOverrides, OpenAiBackend, SinkRegistry,
    UpstreamRelay,
};

use server::AppState;

/// Relay Daemon - per-user streaming completion relay
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides config and environment)
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Completion API base URL (overrides config and environment)
    #[arg(long, value_name = "URL")]
    upstream_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, env = "RELAY_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Initialize logging; `RUST_LOG` wins over `--log-level`
fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "relay_daemon={level},relay_core={level},tower_http=warn"
        ))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_format);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    ConfigOverrides {
        listen_addr: args.listen,
        upstream_url: args.upstream_url.clone(),
    }
    .apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        upstream = %config.upstream.endpoint(),
        pacing = config.relay.pacing_policy().as_str(),
        channel_capacity = config.relay.channel_capacity,
        "Configuration loaded"
    );
    if config.upstream.api_key.is_none() {
        warn!("No API key configured; upstream calls will likely be rejected");
    }

    let backend =
        OpenAiBackend::new(config.upstream.clone()).context("Failed to build upstream client")?;
    let registry = SinkRegistry::with_capacity(config.relay.channel_capacity);
    let relay = UpstreamRelay::new(Arc::new(backend), registry.clone(), config.relay_config());

    let sweeper_stop = CancellationToken::new();
    let sweeper = config.server.idle_eviction.map(|idle_after| {
        server::spawn_idle_sweeper(
            registry.clone(),
            idle_after,
            config.server.sweep_interval,
            sweeper_stop.clone(),
        )
    });

    let state = AppState::new(relay.clone(), config.prompt.clone(), &config.server);
    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "Listening for HTTP connections");

    let shutdown_relay = relay.clone();
    let shutdown_registry = registry.clone();
    let shutdown_sweeper = sweeper_stop.clone();
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_relay.shutdown();
            shutdown_sweeper.cancel();
            // Open SSE responses only finish once their channel is gone
            for user_id in shutdown_registry.user_ids() {
                shutdown_registry.remove(&user_id);
            }
        })
        .await
        .context("HTTP server failed")?;

    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Idle sweeper ended abnormally");
        }
    }

    let stats = relay.metrics().snapshot();
    info!(
        calls_started = stats.calls_started,
        calls_completed = stats.calls_completed,
        calls_failed = stats.calls_failed,
        calls_cancelled = stats.calls_cancelled,
        "Shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["relay-daemon"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Text);
        assert_eq!(args.log_level, "info");
        assert!(args.listen.is_none());
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "relay-daemon",
            "--listen",
            "0.0.0.0:9000",
            "--log-format",
            "json",
            "--config",
            "/etc/chat-relay/relay.toml",
        ])
        .unwrap();
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.listen, Some(SocketAddr::from(([0, 0, 0, 0], 9000))));
        assert_eq!(
            args.config.as_deref(),
            Some(std::path::Path::new("/etc/chat-relay/relay.toml"))
        );
    }

    #[test]
    fn test_args_reject_bad_listen_addr() {
        assert!(Args::try_parse_from(["relay-daemon", "--listen", "nowhere"]).is_err());
    }
}
