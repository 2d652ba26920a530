//! # maxreq-handoff
//!
//! Listening-socket handoff for servers that restart themselves after a fixed
//! number of requests, following the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! 1. Every accepted connection increments a [`RequestCounter`]
//! 2. The accept that reaches the threshold pauses accepting and wakes the handoff task
//! 3. A successor process is forked with the listening sockets at fd 3.. and a
//!    private readiness channel
//! 4. The successor imports the sockets, starts accepting and writes `ready\n`
//! 5. The original stops accepting, drains in-flight connections and exits
//!
//! A failed attempt (spawn error, successor exit, readiness timeout) resumes
//! accepting on the original sockets and retries with exponential backoff.
//!
//! ## Signal Conventions
//!
//! - `SIGTERM` / `SIGINT`: stop accepting, drain, exit (no successor)
//! - `SIGQUIT`: hand off immediately, regardless of the request count
//!
//! ## Environment Variables
//!
//! - `LISTEN_FDS`: number of inherited listening sockets (starting at fd 3)
//! - `LISTEN_FD_NAMES`: colon-separated names for each inherited fd
//! - `LISTEN_PID`: when set, inherited fds are only adopted by this pid (systemd)
//! - `MAXREQ_READY_FD`: successor end of the readiness channel
//! - `MAXREQ_GENERATION`: number of handoffs that led to this process
//! - `MAXREQ_MAX_REQUESTS`, `MAXREQ_READY_TIMEOUT_SECS`,
//!   `MAXREQ_DRAIN_TIMEOUT_SECS`, `MAXREQ_MAX_HANDOFF_ATTEMPTS`: see [`HandoffConfig`]
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("maxreq-handoff requires a Unix platform (Linux or macOS)");

mod config;
mod controller;
mod coordinator;
mod counter;
mod error;
mod handler;
mod listener;
mod readiness;
mod signals;
mod state;
mod tracker;

pub use config::HandoffConfig;
pub use controller::{ControlHandle, DrainController, ExitReason, RunReport, Trigger};
pub use coordinator::{
    current_generation, Handoff, HandoffCoordinator, ProcessDescriptor, SuccessorCommand,
    GENERATION_ENV,
};
pub use counter::RequestCounter;
pub use error::{
    BindError, DrainError, HandlerError, HandoffError, ImportError, ReadinessError, RunError,
    SpawnError, TransitionError,
};
pub use handler::{ConnectionContext, ConnectionHandler};
pub use listener::{
    listener_name, Connection, ListenAddress, ListenerHandle, ListenerSet, PeerAddr, Protocol,
    DEFAULT_ADDRESS,
};
pub use readiness::{ReadinessChannel, ReadinessNotifier, ReadinessReceiver, READY_FD_ENV, READY_TOKEN};
pub use signals::spawn_signal_listener;
pub use state::{HandoffState, HandoffStateCell};
pub use tracker::{ConnectionGuard, ConnectionInfo, ConnectionTracker, DrainPolicy};
