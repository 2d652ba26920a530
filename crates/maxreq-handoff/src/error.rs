//! Error types for listener handoff.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::listener::Protocol;
use crate::state::HandoffState;
use crate::tracker::ConnectionInfo;

/// Error returned by a [`ConnectionHandler`](crate::ConnectionHandler).
///
/// Contained to its connection: the connection is closed and counted as finished.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to bind a listening socket. Fatal at startup.
#[derive(Debug, Error)]
pub enum BindError {
    /// The address string could not be parsed.
    #[error("Invalid listen address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Another socket already owns the address.
    #[error("Address {address} is already in use")]
    AddrInUse { address: String },

    /// Any other bind failure.
    #[error("Failed to bind {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub(crate) fn invalid(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn from_io(address: String, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::AddrInUse {
            Self::AddrInUse { address }
        } else {
            Self::Io { address, source }
        }
    }
}

/// Failure to adopt descriptors passed by a predecessor process.
///
/// Every variant indicates a bug in the parent process or a mismatch between
/// the old and new configuration. Fatal at startup.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Invalid value for {var}: '{value}'")]
    InvalidVar { var: &'static str, value: String },

    #[error("LISTEN_FD_NAMES has {names} entries but LISTEN_FDS says {fds}")]
    CountMismatch { names: usize, fds: usize },

    #[error("Inherited fd {fd} (name: {name}) is not a valid socket")]
    NotASocket { fd: i32, name: String },

    #[error("Expected inherited listener '{name}' but only have {available:?}")]
    Missing { name: String, available: Vec<String> },

    #[error("Unconsumed inherited listeners: {0:?}")]
    Unconsumed(Vec<String>),

    #[error("Inherited listener '{name}' is {found}, expected {expected}")]
    ProtocolMismatch {
        name: String,
        expected: Protocol,
        found: Protocol,
    },

    #[error("Failed to adopt inherited fd {fd}: {source}")]
    Io {
        fd: i32,
        #[source]
        source: io::Error,
    },
}

/// A [`HandoffState`] transition that would regress or skip a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid handoff transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: HandoffState,
    pub to: HandoffState,
}

/// The successor process could not be created or died before it was ready.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Could not determine successor executable: {0}")]
    Executable(#[source] io::Error),

    #[error("Argument or environment contains a NUL byte: {0}")]
    Nul(#[from] std::ffi::NulError),

    #[error("Could not prepare descriptors for inheritance: {0}")]
    Descriptor(#[source] io::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    #[error("Successor {pid} exited before signalling readiness ({status})")]
    Exited { pid: i32, status: String },
}

/// Failure on the readiness channel between predecessor and successor.
#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("No readiness token within {0:?}")]
    Timeout(Duration),

    #[error("Readiness channel closed before the token arrived")]
    Closed,

    #[error("Unexpected readiness token {0:?}")]
    UnexpectedToken(String),

    #[error("Readiness channel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A handoff attempt was aborted. The original listeners are still open.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("Failed to spawn successor: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Successor {pid} did not signal readiness within {timeout:?}")]
    ReadinessTimeout { pid: i32, timeout: Duration },

    #[error("Successor {pid} readiness failed: {source}")]
    Readiness {
        pid: i32,
        #[source]
        source: ReadinessError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// In-flight connections did not finish before the drain timeout.
#[derive(Debug, Error)]
pub enum DrainError {
    #[error("Drain timed out after {timeout:?} with {} connection(s) still open", .abandoned.len())]
    Timeout {
        timeout: Duration,
        abandoned: Vec<ConnectionInfo>,
    },
}

/// Unrecoverable controller failure.
#[derive(Debug, Error)]
pub enum RunError {
    /// The successor could not tell its predecessor it is accepting.
    #[error("Failed to signal readiness to predecessor: {0}")]
    Readiness(#[source] io::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
