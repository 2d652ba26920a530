//! Signal-driven stop and handoff requests.
//!
//! - `SIGTERM` / `SIGINT`: stop accepting, drain, exit without a successor
//! - `SIGQUIT`: hand off now, regardless of the request count

use std::io;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::info;

use crate::controller::{ControlHandle, Trigger};

/// Register the handlers and forward signals to `control` until the task is
/// aborted. Handlers are installed before this returns.
pub fn spawn_signal_listener(control: ControlHandle) -> io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, stopping without handoff");
                    control.request_stop();
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, stopping without handoff");
                    control.request_stop();
                }
                _ = sigquit.recv() => {
                    info!("Received SIGQUIT, handing off now");
                    control.request_handoff(Trigger::Signal);
                }
            }
        }
    }))
}
