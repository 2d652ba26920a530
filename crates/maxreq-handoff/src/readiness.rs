//! One-shot readiness channel between a predecessor and its successor.
//!
//! The predecessor creates a Unix socket pair per handoff attempt and passes one
//! end to the successor as `MAXREQ_READY_FD`. The successor writes [`READY_TOKEN`]
//! once its accept loops are live. EOF before the token means the successor died.

use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{ImportError, ReadinessError};
use crate::listener::{set_cloexec, validate_fd};

/// Environment variable carrying the successor's end of the channel.
pub const READY_FD_ENV: &str = "MAXREQ_READY_FD";

/// The single message of the protocol.
pub const READY_TOKEN: &[u8] = b"ready\n";

/// A fresh socket pair for one handoff attempt.
#[derive(Debug)]
pub struct ReadinessChannel {
    receiver: UnixStream,
    successor_end: OwnedFd,
}

impl ReadinessChannel {
    pub fn new() -> io::Result<Self> {
        let (receiver, successor_end) = UnixStream::pair()?;
        Ok(Self {
            receiver,
            successor_end: successor_end.into(),
        })
    }

    /// Split into the predecessor's receiving end and the fd to hand to the
    /// successor. The caller must drop its copy of the successor fd after
    /// spawning, otherwise EOF is never observed.
    pub fn split(self) -> (ReadinessReceiver, OwnedFd) {
        (
            ReadinessReceiver {
                stream: self.receiver,
            },
            self.successor_end,
        )
    }
}

/// Predecessor side: waits for the token.
#[derive(Debug)]
pub struct ReadinessReceiver {
    stream: UnixStream,
}

impl ReadinessReceiver {
    /// Wait up to `timeout` for the successor's token.
    pub async fn wait(self, timeout: Duration) -> Result<(), ReadinessError> {
        self.stream.set_nonblocking(true)?;
        let mut stream = tokio::net::UnixStream::from_std(self.stream)?;
        let mut token = [0u8; READY_TOKEN.len()];

        match tokio::time::timeout(timeout, stream.read_exact(&mut token)).await {
            Err(_) => Err(ReadinessError::Timeout(timeout)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ReadinessError::Closed),
            Ok(Err(e)) => Err(ReadinessError::Io(e)),
            Ok(Ok(_)) if token.as_slice() == READY_TOKEN => Ok(()),
            Ok(Ok(_)) => Err(ReadinessError::UnexpectedToken(
                String::from_utf8_lossy(&token).into_owned(),
            )),
        }
    }
}

/// Successor side: sends the token once.
#[derive(Debug)]
pub struct ReadinessNotifier {
    stream: UnixStream,
}

impl ReadinessNotifier {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            stream: UnixStream::from(fd),
        }
    }

    /// Adopt the channel named by `MAXREQ_READY_FD`, if any.
    pub fn from_env() -> Result<Option<Self>, ImportError> {
        let Ok(raw) = std::env::var(READY_FD_ENV) else {
            return Ok(None);
        };
        let fd: RawFd = raw.parse().map_err(|_| ImportError::InvalidVar {
            var: READY_FD_ENV,
            value: raw.clone(),
        })?;
        if !validate_fd(fd) {
            return Err(ImportError::NotASocket {
                fd,
                name: READY_FD_ENV.to_string(),
            });
        }
        set_cloexec(fd).map_err(|source| ImportError::Io { fd, source })?;

        // SAFETY: fstat confirmed an open socket, passed to this process for
        // its exclusive use; it is wrapped exactly once.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(fd, "Adopted readiness channel from parent process");
        Ok(Some(Self::from_fd(owned)))
    }

    /// Write the token and close the channel.
    pub fn notify(mut self) -> io::Result<()> {
        self.stream.write_all(READY_TOKEN)?;
        self.stream.flush()?;
        debug!(fd = self.stream.as_raw_fd(), "Sent readiness token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_round_trip() {
        let (receiver, successor_end) = ReadinessChannel::new().unwrap().split();
        ReadinessNotifier::from_fd(successor_end).notify().unwrap();
        receiver.wait(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_without_token() {
        let (receiver, _successor_end) = ReadinessChannel::new().unwrap().split();
        let err = receiver.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ReadinessError::Timeout(_)), "{err}");
    }

    #[tokio::test]
    async fn test_closed_before_token() {
        let (receiver, successor_end) = ReadinessChannel::new().unwrap().split();
        drop(successor_end);
        let err = receiver.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReadinessError::Closed), "{err}");
    }

    #[tokio::test]
    async fn test_wrong_token() {
        let (receiver, successor_end) = ReadinessChannel::new().unwrap().split();
        let mut stream = UnixStream::from(successor_end);
        stream.write_all(b"nope!!").unwrap();
        let err = receiver.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReadinessError::UnexpectedToken(ref t) if t == "nope!!"));
    }
}
