//! Persistent Shell Server
//!
//! WebSocket tool server that keeps PTY-backed shells alive between calls,
//! so working directory, environment and shell state persist across commands.

mod config;
mod files;
mod pty;
mod security;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::{Config, LogFormat, LoggingSettings};
use server::{ServerConfig, ToolHandler, WebSocketServer};

/// Persistent Shell Server
///
/// Persistent PTY shell sessions over WebSocket
#[derive(Parser, Debug)]
#[command(name = "persistent-shell")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, env = "PERSISTENT_SHELL_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Authentication token for remote connections
    #[arg(long)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the configuration file and apply command line overrides
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = Config::load(&self.config)?;
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if self.token.is_some() {
            config.server.token = self.token;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let verbose = args.verbose;
    let config = args.into_config()?;

    init_logging(&config.logging, verbose);

    info!("Persistent Shell Server v{}", env!("CARGO_PKG_VERSION"));
    config.warn_if_insecure();

    if config.server.token.is_some() {
        info!("Token authentication enabled");
    }

    let handler = ToolHandler::from_config(&config)?;
    let server = Arc::new(WebSocketServer::new(
        ServerConfig::from_config(&config),
        handler,
    ));
    let server_handle = Arc::clone(&server);

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level unless `--verbose`
/// was given.
fn init_logging(settings: &LoggingSettings, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.level.to_lowercase()))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Console => builder.compact().init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
