//! Rendezvous Server Daemon
//!
//! Runs the control channel, the signaling channel and the idle-session
//! reaper until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rdv_core::config::{self, ServerConfig};
use rdv_server::auth::StaticCredentials;
use rdv_server::server::{ControlServer, SignalingServer};
use rdv_server::session::Reaper;
use rdv_server::ServerState;

#[derive(Parser)]
#[command(name = "rdv-server")]
#[command(about = "Rendezvous directory server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control channel bind address (overrides config)
    #[arg(long)]
    control_bind: Option<String>,

    /// Signaling channel bind address (overrides config)
    #[arg(long)]
    signaling_bind: Option<String>,

    /// Idle session timeout in seconds, 0 disables eviction (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the effective configuration to --config (or the default path) and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Rendezvous server starting...");

    let config = load_config(&args)?;
    config.validate().context("Invalid configuration")?;

    if args.write_config {
        let path = write_config(&args, &config)?;
        tracing::info!("Wrote configuration to {:?}", path);
        return Ok(());
    }

    let credentials =
        StaticCredentials::from_config(&config).context("Failed to load credentials")?;
    if credentials.is_empty() {
        tracing::warn!("No users configured - every Connect will be rejected");
    } else {
        tracing::info!("Loaded {} users", credentials.len());
    }

    let control_addr = config.control_addr()?;
    let signaling_addr = config.signaling_addr()?;

    let state = Arc::new(ServerState::new(config, Arc::new(credentials)));

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    // Bind both channels before serving anything
    let control = ControlServer::bind(control_addr, Arc::clone(&state), cancel.clone()).await?;
    let signaling =
        SignalingServer::bind(signaling_addr, Arc::clone(&state), cancel.clone()).await?;
    let reaper = Reaper::from_config(Arc::clone(state.registry()), &state.config);

    let reaper_task = tokio::spawn(reaper.run(cancel.clone()));

    let signaling_cancel = cancel.clone();
    let signaling_task = tokio::spawn(async move {
        let result = signaling.run().await;
        signaling_cancel.cancel();
        result
    });

    let control_cancel = cancel.clone();
    let control_task = tokio::spawn(async move {
        let result = control.run().await;
        control_cancel.cancel();
        result
    });

    let (reaper_result, signaling_result, control_result) =
        tokio::join!(reaper_task, signaling_task, control_task);

    reaper_result.context("Reaper task panicked")?;
    signaling_result
        .context("Signaling task panicked")?
        .context("Signaling channel failed")?;
    control_result
        .context("Control task panicked")?
        .context("Control channel failed")?;

    tracing::info!("Rendezvous server shutdown complete");
    Ok(())
}

/// Load the config file and apply command-line overrides
fn load_config(args: &Args) -> Result<ServerConfig> {
    // A config file about to be written for the first time need not exist yet
    let explicit = args
        .config
        .as_ref()
        .filter(|path| !args.write_config || path.exists());

    let mut config = if let Some(config_path) = explicit {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Some(bind) = &args.control_bind {
        config.control_bind = bind.clone();
    }
    if let Some(bind) = &args.signaling_bind {
        config.signaling_bind = bind.clone();
    }
    if let Some(secs) = args.timeout {
        config.session_timeout = Duration::from_secs(secs);
    }

    Ok(config)
}

/// Save `config` to `--config`, or the default path; returns where
fn write_config(args: &Args, config: &ServerConfig) -> Result<PathBuf> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    config::save_config(&path, config)
        .with_context(|| format!("Failed to write config to {:?}", path))?;
    Ok(path)
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
            _ = cancel.cancelled() => return,
        }

        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_config_saves_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rendezvous").join("server.toml");
        let path_arg = path.to_str().unwrap();

        let args = Args::parse_from([
            "rdv-server",
            "--config",
            path_arg,
            "--control-bind",
            "127.0.0.1:9001",
            "--timeout",
            "30",
            "--write-config",
        ]);

        let config = load_config(&args).unwrap();
        assert_eq!(write_config(&args, &config).unwrap(), path);

        let saved: ServerConfig = config::load_config(&path).unwrap();
        assert_eq!(saved.control_bind, "127.0.0.1:9001");
        assert_eq!(saved.session_timeout, Duration::from_secs(30));
        assert_eq!(saved.signaling_bind, ServerConfig::default().signaling_bind);
    }

    #[test]
    fn test_missing_config_still_an_error_without_write() {
        let args = Args::parse_from(["rdv-server", "--config", "/definitely/not/here.toml"]);
        assert!(load_config(&args).is_err());
    }
}
