//! rdv: command-line client for a rendezvous server

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rdv_client::{ClientOptions, RendezvousClient};
use rdv_core::config::{DEFAULT_CONTROL_PORT, DEFAULT_SIGNALING_PORT};

#[derive(Parser)]
#[command(name = "rdv")]
#[command(author, version, about = "Rendezvous directory client")]
struct Cli {
    /// Server host name or address
    #[arg(short, long, env = "RDV_SERVER")]
    server: String,

    /// Server control channel port
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Server signaling channel port
    #[arg(long, default_value_t = DEFAULT_SIGNALING_PORT)]
    signaling_port: u16,

    /// Login to authenticate as
    #[arg(short, long, env = "RDV_LOGIN")]
    login: String,

    /// Password for the login
    #[arg(short, long, env = "RDV_PASSWORD", hide_env_values = true)]
    password: String,

    /// Seconds to wait for each server reply
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected clients
    List,

    /// Resolve the address of a connected client
    Lookup {
        /// Login to resolve
        target: String,
    },

    /// Stay connected, refreshing the session until interrupted
    Watch {
        /// Seconds between keep-alives
        #[arg(short, long, default_value_t = 10)]
        interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let control_addr = resolve(&cli.server, cli.control_port).await?;
    let signaling_addr = resolve(&cli.server, cli.signaling_port).await?;
    let options = ClientOptions {
        reply_timeout: Duration::from_secs(cli.timeout),
    };

    let mut client = RendezvousClient::connect_with(
        control_addr,
        signaling_addr,
        &cli.login,
        &cli.password,
        options,
    )
    .await
    .with_context(|| format!("Failed to connect to {}", control_addr))?;

    let result = run(&mut client, cli.command).await;

    if let Err(e) = client.disconnect().await {
        tracing::warn!("Failed to disconnect cleanly: {}", e);
    }
    result
}

async fn run(client: &mut RendezvousClient, command: Commands) -> Result<()> {
    match command {
        Commands::List => {
            let logins = client.request_list().await.context("Failed to list clients")?;
            if logins.is_empty() {
                println!("No clients connected");
            }
            for login in logins {
                println!("{}", login);
            }
        }

        Commands::Lookup { target } => {
            let peer = client
                .request_ip(&target)
                .await
                .with_context(|| format!("Failed to look up {}", target))?;
            println!("{}", peer.socket_addr());
        }

        Commands::Watch { interval } => {
            let cancel = CancellationToken::new();
            let stopper = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.cancel();
                }
            });

            println!("Connected as {}, press Ctrl+C to leave", client.login());
            client
                .keep_alive(Duration::from_secs(interval.max(1)), cancel)
                .await
                .context("Keep-alive failed")?;
        }
    }

    Ok(())
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve {}", host))?
        .next()
        .with_context(|| format!("No address found for {}", host))
}
