//! Tracing setup for the server binary.

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,maxreq_server=debug,maxreq_handoff=debug";

/// Output format of the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human-oriented output.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

/// Install the global subscriber.
///
/// The filter comes from `RUST_LOG`, defaulting to
/// `info,maxreq_server=debug,maxreq_handoff=debug`. Logs go to stderr.
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    match format {
        LogFormat::Pretty => registry
            .with(fmt_layer.with_file(true).with_line_number(true).pretty())
            .try_init()?,
        LogFormat::Compact => registry.with(fmt_layer.compact()).try_init()?,
        LogFormat::Json => registry
            .with(fmt_layer.json().with_current_span(true).with_span_list(false))
            .try_init()?,
    }

    tracing::debug!(?format, "Telemetry initialized");
    Ok(())
}
