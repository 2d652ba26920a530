//! The application boundary: one call per accepted connection.

use std::future::Future;

use crate::error::HandlerError;
use crate::listener::{Connection, PeerAddr};

/// Per-connection metadata handed to the application.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Tracker id, unique within this process.
    pub id: u64,
    pub peer: PeerAddr,
    /// Name of the listener that accepted the connection.
    pub listener: String,
    /// Value of the request counter after this connection was counted (1-based).
    pub sequence: u64,
}

/// Application logic invoked for each accepted connection.
///
/// The connection is closed when the returned future completes, whether it
/// succeeds or fails. Errors and panics are logged and contained to the
/// connection; they never interrupt accepting, handoff or draining.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(
        &self,
        connection: Connection,
        context: ConnectionContext,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}
