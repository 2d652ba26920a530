//! Listening sockets: bind, accept, export to a successor, import from a predecessor.
//!
//! Inherited sockets follow the systemd `LISTEN_FDS` / `LISTEN_FD_NAMES`
//! convention: fds start at 3, names are colon-separated. Every inherited fd is
//! checked with `fstat` before it is adopted; a bad fd is a parent process bug and
//! fails startup instead of half-inheriting.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{BindError, ImportError};

/// First inherited descriptor, as in systemd socket activation.
pub(crate) const LISTEN_FDS_START: RawFd = 3;
pub(crate) const LISTEN_FDS_ENV: &str = "LISTEN_FDS";
pub(crate) const LISTEN_FD_NAMES_ENV: &str = "LISTEN_FD_NAMES";
pub(crate) const LISTEN_PID_ENV: &str = "LISTEN_PID";

/// Address used when no listen address is configured.
pub const DEFAULT_ADDRESS: &str = "tcp:8080";

/// Exported duplicates live at or above this fd so that placing them at
/// 3..N in the child never overwrites another exported fd.
pub(crate) const EXPORT_FD_FLOOR: RawFd = 100;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Transport of a listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Unix,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Unix => write!(f, "unix"),
        }
    }
}

/// Where a listener is bound.
///
/// Parsed from `tcp:<port>`, `tcp:<port>:interface=<host>`, `unix:<path>` or a
/// plain `<host>:<port>` socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl ListenAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            ListenAddress::Tcp(_) => Protocol::Tcp,
            ListenAddress::Unix(_) => Protocol::Unix,
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => write!(f, "tcp:{}:interface={}", addr.port(), addr.ip()),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for ListenAddress {
    type Err = BindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp:") {
            // The interface may be IPv6, so only the first colon separates options.
            let (port, options) = match rest.split_once(':') {
                Some((port, options)) => (port, Some(options)),
                None => (rest, None),
            };
            let port: u16 = port
                .parse()
                .map_err(|_| BindError::invalid(s, format!("invalid port '{port}'")))?;
            let ip = match options {
                None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                Some(option) => {
                    let host = option.strip_prefix("interface=").ok_or_else(|| {
                        BindError::invalid(s, format!("unsupported option '{option}'"))
                    })?;
                    host.trim_start_matches('[')
                        .trim_end_matches(']')
                        .parse()
                        .map_err(|_| BindError::invalid(s, format!("invalid interface '{host}'")))?
                }
            };
            return Ok(ListenAddress::Tcp(SocketAddr::new(ip, port)));
        }

        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(BindError::invalid(s, "empty socket path"));
            }
            return Ok(ListenAddress::Unix(PathBuf::from(path)));
        }

        s.parse::<SocketAddr>().map(ListenAddress::Tcp).map_err(|_| {
            BindError::invalid(
                s,
                "expected tcp:<port>[:interface=<host>], unix:<path> or <host>:<port>",
            )
        })
    }
}

/// Name given to the listener at `index`, used to match inherited fds.
pub fn listener_name(index: usize) -> String {
    format!("listen-{index}")
}

/// Remote end of an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix,
}

impl PeerAddr {
    /// Remote host for access logs; `-` when there is none.
    pub fn host(&self) -> String {
        match self {
            PeerAddr::Tcp(addr) => addr.ip().to_string(),
            PeerAddr::Unix => "-".to_string(),
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "{addr}"),
            PeerAddr::Unix => write!(f, "unix"),
        }
    }
}

/// An accepted connection, TCP or Unix.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

enum Socket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Socket {
    async fn accept(&self) -> io::Result<(Connection, PeerAddr)> {
        match self {
            Socket::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok((Connection::Tcp(stream), PeerAddr::Tcp(peer)))
            }
            Socket::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Connection::Unix(stream), PeerAddr::Unix))
            }
        }
    }

    fn local_address(&self) -> io::Result<ListenAddress> {
        match self {
            Socket::Tcp(listener) => Ok(ListenAddress::Tcp(listener.local_addr()?)),
            Socket::Unix(listener) => listener
                .local_addr()?
                .as_pathname()
                .map(|path| ListenAddress::Unix(path.to_path_buf()))
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unnamed unix socket")),
        }
    }

    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(listener) => listener.as_raw_fd(),
            Socket::Unix(listener) => listener.as_raw_fd(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptMode {
    Accepting,
    /// Not calling `accept`; new connections queue in the kernel backlog.
    Paused,
    /// Permanently done accepting.
    Stopped,
}

/// A named listening socket owned by this process.
///
/// The socket stays open for the lifetime of the handle, including after
/// [`stop_accepting`](Self::stop_accepting), so a successor holding a duplicate
/// keeps the kernel backlog alive.
pub struct ListenerHandle {
    name: String,
    address: ListenAddress,
    socket: Socket,
    mode: watch::Sender<AcceptMode>,
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("fd", &self.socket.as_raw_fd())
            .field("mode", &*self.mode.borrow())
            .finish()
    }
}

impl ListenerHandle {
    /// Bind a fresh listening socket. Must be called inside a tokio runtime.
    pub fn bind(name: impl Into<String>, address: &ListenAddress) -> Result<Self, BindError> {
        let display = address.to_string();
        let socket = match address {
            ListenAddress::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr)
                    .map_err(|e| BindError::from_io(display.clone(), e))?;
                listener
                    .set_nonblocking(true)
                    .and_then(|()| TcpListener::from_std(listener))
                    .map(Socket::Tcp)
            }
            ListenAddress::Unix(path) => {
                let listener = std::os::unix::net::UnixListener::bind(path)
                    .map_err(|e| BindError::from_io(display.clone(), e))?;
                listener
                    .set_nonblocking(true)
                    .and_then(|()| UnixListener::from_std(listener))
                    .map(Socket::Unix)
            }
        }
        .map_err(|e| BindError::from_io(display.clone(), e))?;

        let handle =
            Self::from_socket(name.into(), socket).map_err(|e| BindError::from_io(display, e))?;
        info!(name = %handle.name, address = %handle.address, "Bound listener");
        Ok(handle)
    }

    /// Adopt a listening socket passed down by a predecessor process.
    ///
    /// The descriptor must be a socket; its family decides TCP vs Unix. The fd is
    /// marked close-on-exec again so it only reaches a later successor through an
    /// explicit export.
    pub fn import_descriptor(name: impl Into<String>, fd: OwnedFd) -> Result<Self, ImportError> {
        let name = name.into();
        let raw = fd.as_raw_fd();
        if !validate_fd(raw) {
            return Err(ImportError::NotASocket { fd: raw, name });
        }
        Self::adopt(name, fd)
    }

    /// Wrap a descriptor already known to be a socket.
    fn adopt(name: String, fd: OwnedFd) -> Result<Self, ImportError> {
        let raw = fd.as_raw_fd();
        let io_err = |source| ImportError::Io { fd: raw, source };

        set_cloexec(raw).map_err(io_err)?;
        let socket = match socket_protocol(raw).map_err(io_err)? {
            Protocol::Tcp => {
                let listener = std::net::TcpListener::from(fd);
                listener
                    .set_nonblocking(true)
                    .and_then(|()| TcpListener::from_std(listener))
                    .map(Socket::Tcp)
            }
            Protocol::Unix => {
                let listener = std::os::unix::net::UnixListener::from(fd);
                listener
                    .set_nonblocking(true)
                    .and_then(|()| UnixListener::from_std(listener))
                    .map(Socket::Unix)
            }
        }
        .map_err(io_err)?;

        let handle = Self::from_socket(name, socket).map_err(io_err)?;
        info!(fd = raw, name = %handle.name, address = %handle.address, "Inherited listener from parent process");
        Ok(handle)
    }

    fn from_socket(name: String, socket: Socket) -> io::Result<Self> {
        let address = socket.local_address()?;
        let (mode, _) = watch::channel(AcceptMode::Accepting);
        Ok(Self {
            name,
            address,
            socket,
            mode,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address. For TCP this is the actual local address, so a
    /// requested port 0 shows the port the kernel picked.
    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn protocol(&self) -> Protocol {
        self.address.protocol()
    }

    /// Accept connections until [`stop_accepting`](Self::stop_accepting) is called,
    /// invoking `on_connection` for each.
    ///
    /// While paused, `accept` is not called and connections wait in the kernel
    /// backlog. After a stop, this returns immediately without accepting, and any
    /// later call does the same.
    pub async fn accept_loop<F>(&self, mut on_connection: F)
    where
        F: FnMut(Connection, PeerAddr),
    {
        let mut mode = self.mode.subscribe();
        loop {
            let current = *mode.borrow_and_update();
            match current {
                AcceptMode::Stopped => {
                    debug!(name = %self.name, "Accept loop stopped");
                    return;
                }
                AcceptMode::Paused => {
                    if mode.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                AcceptMode::Accepting => {}
            }

            tokio::select! {
                biased;
                changed = mode.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                accepted = self.socket.accept() => match accepted {
                    Ok((connection, peer)) => on_connection(connection, peer),
                    Err(e) => {
                        warn!(name = %self.name, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    /// Stop calling `accept` until [`resume_accepting`](Self::resume_accepting).
    /// Returns `false` if the listener was not accepting.
    pub fn pause_accepting(&self) -> bool {
        let paused = self.transition(AcceptMode::Accepting, AcceptMode::Paused);
        if paused {
            debug!(name = %self.name, "Paused accepting");
        }
        paused
    }

    /// Undo a pause. Has no effect after a stop.
    pub fn resume_accepting(&self) -> bool {
        let resumed = self.transition(AcceptMode::Paused, AcceptMode::Accepting);
        if resumed {
            debug!(name = %self.name, "Resumed accepting");
        }
        resumed
    }

    /// Permanently stop accepting. Already-accepted connections are untouched and
    /// the socket itself stays open.
    pub fn stop_accepting(&self) {
        let stopped = self.mode.send_if_modified(|mode| {
            let changed = *mode != AcceptMode::Stopped;
            *mode = AcceptMode::Stopped;
            changed
        });
        if stopped {
            info!(name = %self.name, address = %self.address, "Stopped accepting");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.mode.borrow() == AcceptMode::Stopped
    }

    fn transition(&self, from: AcceptMode, to: AcceptMode) -> bool {
        self.mode.send_if_modified(|mode| {
            if *mode == from {
                *mode = to;
                true
            } else {
                false
            }
        })
    }

    /// Duplicate the socket for inheritance by a child process.
    ///
    /// The duplicate is close-on-exec and lives at fd 100 or above; the
    /// coordinator moves it into the child's 3..N range after fork. This handle
    /// keeps its own descriptor open regardless.
    pub fn export_descriptor(&self) -> io::Result<OwnedFd> {
        dup_above(self.socket.as_raw_fd(), EXPORT_FD_FLOOR)
    }
}

/// A set of named listeners inherited from the parent process via fd passing.
#[derive(Debug)]
pub struct ListenerSet {
    listeners: Vec<ListenerHandle>,
}

impl ListenerSet {
    /// Create a listener set from inherited file descriptors.
    ///
    /// Reads `LISTEN_FDS`, `LISTEN_FD_NAMES` and `LISTEN_PID` from the environment.
    /// Returns `Ok(None)` on a cold start (no `LISTEN_FDS`, or `LISTEN_PID` naming
    /// another process). Must be called inside a tokio runtime.
    pub fn from_env() -> Result<Option<Self>, ImportError> {
        let var = |key: &str| std::env::var(key).ok();
        let Some(inherited) = inherited_fds(
            var(LISTEN_FDS_ENV).as_deref(),
            var(LISTEN_FD_NAMES_ENV).as_deref(),
            var(LISTEN_PID_ENV).as_deref(),
            std::process::id(),
        )?
        else {
            return Ok(None);
        };

        // SAFETY: LISTEN_FDS hands ownership of these descriptors to this
        // process, and nothing else in it has wrapped them.
        unsafe { Self::adopt_inherited(inherited) }.map(Some)
    }

    /// Adopt `(fd, name)` pairs, checking each fd once before taking ownership.
    ///
    /// # Safety
    ///
    /// Every fd must be owned by the caller and not wrapped anywhere else.
    unsafe fn adopt_inherited(inherited: Vec<(RawFd, String)>) -> Result<Self, ImportError> {
        let mut listeners = Vec::with_capacity(inherited.len());
        for (fd, name) in inherited {
            if !validate_fd(fd) {
                return Err(ImportError::NotASocket { fd, name });
            }
            // SAFETY: fstat confirmed fd is an open socket; the caller owns it.
            let owned = unsafe { OwnedFd::from_raw_fd(fd) };
            listeners.push(ListenerHandle::adopt(name, owned)?);
        }
        Ok(Self { listeners })
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners.iter().map(|l| l.name.clone()).collect()
    }

    /// Take a listener by name, removing it from the set.
    pub fn take(&mut self, name: &str) -> Result<ListenerHandle, ImportError> {
        match self.listeners.iter().position(|l| l.name == name) {
            Some(pos) => Ok(self.listeners.remove(pos)),
            None => Err(ImportError::Missing {
                name: name.to_string(),
                available: self.names(),
            }),
        }
    }

    /// Fail if any listeners remain. This catches mismatches between what the
    /// parent passed and what the child expected.
    pub fn ensure_consumed(self) -> Result<(), ImportError> {
        if self.listeners.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Unconsumed(self.names()))
        }
    }
}

/// Parse the socket-activation variables into `(fd, name)` pairs.
fn inherited_fds(
    listen_fds: Option<&str>,
    listen_fd_names: Option<&str>,
    listen_pid: Option<&str>,
    own_pid: u32,
) -> Result<Option<Vec<(RawFd, String)>>, ImportError> {
    let Some(raw_count) = listen_fds else {
        return Ok(None);
    };

    if let Some(raw_pid) = listen_pid {
        let pid: u32 = raw_pid.parse().map_err(|_| ImportError::InvalidVar {
            var: LISTEN_PID_ENV,
            value: raw_pid.to_string(),
        })?;
        if pid != own_pid {
            debug!(listen_pid = pid, own_pid, "LISTEN_PID names another process; ignoring LISTEN_FDS");
            return Ok(None);
        }
    }

    let count: usize = raw_count.parse().map_err(|_| ImportError::InvalidVar {
        var: LISTEN_FDS_ENV,
        value: raw_count.to_string(),
    })?;
    if count == 0 {
        return Ok(None);
    }

    let names: Vec<String> = match listen_fd_names {
        Some(raw_names) => raw_names.split(':').map(str::to_string).collect(),
        None => (0..count).map(listener_name).collect(),
    };
    if names.len() != count {
        return Err(ImportError::CountMismatch {
            names: names.len(),
            fds: count,
        });
    }

    Ok(Some(
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (LISTEN_FDS_START + i as RawFd, name))
            .collect(),
    ))
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn socket_protocol(fd: RawFd) -> io::Result<Protocol> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage is large enough for any address family and len says so.
    let result = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET | libc::AF_INET6 => Ok(Protocol::Tcp),
        libc::AF_UNIX => Ok(Protocol::Unix),
        family => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported socket family {family}"),
        )),
    }
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicate `fd` to the lowest free descriptor `>= floor`, with CLOEXEC set.
pub(crate) fn dup_above(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let duplicate = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    if duplicate < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(duplicate) })
}
