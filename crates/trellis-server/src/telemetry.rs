//! Log output for the server process.
//!
//! `RUST_LOG` overrides the default filter. The `pretty` format is meant for
//! local development; `json` emits one object per event for log shippers.

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,trellis_server=debug,trellis_xmpp=debug";

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// Multi-line colored output.
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

/// Install the global subscriber.
pub fn init(format: LogFormat) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Compact => registry.with(fmt_layer.compact()).try_init()?,
        LogFormat::Pretty => registry.with(fmt_layer.pretty()).try_init()?,
        LogFormat::Json => registry.with(fmt_layer.json()).try_init()?,
    }

    tracing::info!(format = ?format, "Telemetry initialized");
    Ok(())
}
