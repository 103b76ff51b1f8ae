use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use trellis_xmpp::{Config, XmppServer};

mod telemetry;

use telemetry::LogFormat;

/// Multi-tenant XMPP server.
#[derive(Parser)]
#[command(name = "trellis-server")]
#[command(about = "Multi-tenant XMPP server", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "TRELLIS_CONFIG", default_value = "trellis.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format).map_err(|e| anyhow!("failed to initialize logging: {}", e))?;

    info!("Trellis starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("a TLS crypto provider is already installed"))?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(
        config = %cli.config.display(),
        hosts = ?config.hosts.keys().collect::<Vec<_>>(),
        "Configuration loaded"
    );

    let server = XmppServer::new(config).context("starting server")?;

    tokio::select! {
        result = server.run() => result.context("server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for shutdown signal")?;
            warn!("Shutdown requested");
        }
    }

    info!("Trellis stopped");
    Ok(())
}
