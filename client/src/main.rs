use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod dispatcher;
mod error;
mod reporter;
mod session;
mod transport;

use config::DotunnelConfig;
use dispatcher::Dispatcher;
use error::TunnelError;
use reporter::ConsoleReporter;
use session::{Session, SessionConfig, SessionEnd, ShutdownHandle};
use transport::WsConnector;

#[derive(Parser)]
#[command(name = "dotunnel")]
#[command(author = "DoTunnel Team")]
#[command(version)]
#[command(about = "Expose your localhost to the world through a public relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Relay server URL (overrides the config file)
    #[arg(short, long)]
    relay: Option<String>,

    /// Path to a dotunnel.yml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose HTTP service
    Http {
        /// Local port to expose
        port: u16,

        /// Proxy name, becomes part of the public URL
        #[arg(short, long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match cli.config.clone().or_else(DotunnelConfig::find_config) {
        Some(path) => DotunnelConfig::load(&path)?,
        None => DotunnelConfig::default(),
    };
    if let Some(relay) = cli.relay {
        config.relay = relay;
        config.validate()?;
    }
    config.debug |= cli.verbose || std::env::var("DEBUG").map(|v| v == "true").unwrap_or(false);

    let default_filter = if config.debug { "dotunnel=debug" } else { "dotunnel=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Http { port, name } => run_http_tunnel(config, port, name).await,
    }
}

/// Run HTTP tunnel
async fn run_http_tunnel(config: DotunnelConfig, port: u16, name: String) -> Result<()> {
    config::validate_proxy_name(&name)?;
    tokio::net::TcpStream::connect((config.local_host.as_str(), port))
        .await
        .with_context(|| format!("Port is not open: {}:{}", config.local_host, port))?;

    let local_base = config.local_base(port);
    let dispatcher = Dispatcher::new(local_base.clone(), Arc::new(ConsoleReporter), config.debug)?;

    let session_config = SessionConfig {
        proxy_name: name.clone(),
        local_base,
        relay_url: config.relay_url(&name),
        public_url: config.public_url(&name),
        reconnect_delay: config.reconnect_delay(),
        shutdown_grace: config.shutdown_grace(),
        debug: config.debug,
    };
    info!("Connecting to relay: {}", session_config.relay_url);

    let mut session = Session::new(session_config, WsConnector::new(), Arc::new(dispatcher));
    spawn_signal_listener(session.shutdown_handle());

    let mut retries_left = config.handshake_retries;
    loop {
        match session.run(print_banner).await {
            Ok(SessionEnd::Shutdown) => {
                println!("\n✓ Tunnel stopped.");
                return Ok(());
            }
            Ok(SessionEnd::Disconnected(code)) => {
                info!("Relay closed the tunnel (code {:?}, state {:?})", code, session.state());
                return Ok(());
            }
            Err(TunnelError::NameInUse) => {
                error!("Proxy name '{}' is already in use, pick another one", name);
                return Err(TunnelError::NameInUse.into());
            }
            Err(e) if e.is_retryable() && retries_left > 0 => {
                retries_left -= 1;
                warn!("{}. Retrying in {:?}...", e, config.reconnect_delay());
                tokio::time::sleep(config.reconnect_delay()).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_banner(local_base: &str, public_url: &str) {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 DoTunnel Active                                          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", public_url);
    println!("║  Local:      {:<47} ║", local_base);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");
}

/// Route Ctrl+C (and SIGTERM on unix) to a graceful shutdown
fn spawn_signal_listener(handle: ShutdownHandle) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        handle.shutdown();
    });
}
