use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use maxreq_handoff::{
    current_generation, listener_name, spawn_signal_listener, DrainController, ExitReason,
    HandoffCoordinator, ImportError, ListenAddress, ListenerHandle, ListenerSet,
    ReadinessNotifier, SuccessorCommand,
};
use tracing::{error, info, warn};

mod access_log;
mod app;
mod config;
mod telemetry;

use access_log::AccessLog;
use app::HttpApp;
use config::{Cli, ServerConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init(cli.log_format) {
        eprintln!("Failed to initialize logging: {e:#}");
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = format!("{e:#}"), "Startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        generation = current_generation(),
        "maxreq server starting"
    );

    let config = ServerConfig::from_cli(&cli).context("Invalid configuration")?;
    config.log_config();

    let listeners = open_listeners(&config.listen).context("Failed to set up listening sockets")?;
    let readiness = ReadinessNotifier::from_env().context("Failed to adopt readiness channel")?;

    let access_log = match &config.logfile {
        Some(path) => {
            let log = AccessLog::open(path)
                .await
                .with_context(|| format!("Failed to open access log {}", path.display()))?;
            info!(path = %log.path().display(), "Access log opened");
            Some(Arc::new(log))
        }
        None => None,
    };
    let app = Arc::new(HttpApp::new(config.app, access_log));

    let command = SuccessorCommand::current().context("Failed to locate own executable")?;
    let coordinator = HandoffCoordinator::new(command, config.handoff.ready_timeout);
    let controller = DrainController::new(config.handoff.clone(), coordinator).with_readiness(readiness);
    let signals =
        spawn_signal_listener(controller.control()).context("Failed to install signal handlers")?;

    let report = controller.run(listeners, app).await?;
    signals.abort();

    match &report.reason {
        ExitReason::HandedOff(successor) => {
            info!(successor = successor.pid, served = report.served, "Handed off to successor")
        }
        ExitReason::Stopped => info!(served = report.served, "Stopped without handoff"),
        ExitReason::HandoffAbandoned { attempts, error } => {
            error!(attempts, error = %error, served = report.served, "Handoff abandoned")
        }
    }
    if let Err(e) = &report.drain {
        warn!(error = %e, "Drain did not complete");
    }

    Ok(report.exit_code())
}

/// Adopt the predecessor's listeners, or bind fresh ones on a cold start.
///
/// Inherited listeners are matched by position: `--listen` number `i` must
/// arrive as `listen-{i}` with the same transport.
fn open_listeners(addresses: &[ListenAddress]) -> Result<Vec<ListenerHandle>> {
    let mut inherited = ListenerSet::from_env()?;
    if let Some(set) = &inherited {
        info!(names = ?set.names(), "Inherited listeners from predecessor");
    }

    let mut listeners = Vec::with_capacity(addresses.len());
    for (index, address) in addresses.iter().enumerate() {
        let name = listener_name(index);
        let listener = match inherited.as_mut() {
            Some(set) => {
                let listener = set.take(&name)?;
                if listener.protocol() != address.protocol() {
                    return Err(ImportError::ProtocolMismatch {
                        name,
                        expected: address.protocol(),
                        found: listener.protocol(),
                    }
                    .into());
                }
                listener
            }
            None => ListenerHandle::bind(name, address)?,
        };
        info!(name = listener.name(), address = %listener.address(), "Listening");
        listeners.push(listener);
    }

    if let Some(set) = inherited {
        set.ensure_consumed()?;
    }
    Ok(listeners)
}
