//! Successor spawning with listening-socket inheritance.
//!
//! The restart here forks instead of exec'ing in place: the original process has
//! connections to finish, so only the child runs the new image.
//!
//! 1. Export each listener with `F_DUPFD_CLOEXEC` to fd 100 and up (safe against clobber)
//! 2. Create a readiness socket pair and export the successor end the same way
//! 3. Build argv and the environment (`LISTEN_FDS`, `LISTEN_FD_NAMES`,
//!    `MAXREQ_READY_FD`, `MAXREQ_GENERATION`) before forking
//! 4. In the child, `dup2` the exports onto 3..N (clearing CLOEXEC) and `execve`
//! 5. In the parent, close the exports and wait for the readiness token

use std::ffi::{CString, NulError, OsString};
use std::future::Future;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use crate::error::{HandoffError, ReadinessError, SpawnError};
use crate::listener::{
    dup_above, ListenerHandle, EXPORT_FD_FLOOR, LISTEN_FDS_ENV, LISTEN_FDS_START,
    LISTEN_FD_NAMES_ENV, LISTEN_PID_ENV,
};
use crate::readiness::{ReadinessChannel, ReadinessReceiver, READY_FD_ENV};
use crate::state::{HandoffState, HandoffStateCell};

/// Environment variable counting the handoffs that led to this process.
pub const GENERATION_ENV: &str = "MAXREQ_GENERATION";

/// Generation of this process: 0 for a cold start, predecessor + 1 otherwise.
pub fn current_generation() -> u64 {
    std::env::var(GENERATION_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// The spawned successor.
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub pid: i32,
    pub spawn_time: SystemTime,
    /// Set once the successor's readiness token has arrived.
    pub readiness_flag: bool,
}

/// Program and argv used to start a successor.
#[derive(Debug, Clone)]
pub struct SuccessorCommand {
    program: PathBuf,
    /// Full argv, including argv\[0\].
    args: Vec<OsString>,
}

impl SuccessorCommand {
    /// Re-run the current executable with the current arguments.
    pub fn current() -> Result<Self, SpawnError> {
        let program = std::env::current_exe().map_err(SpawnError::Executable)?;
        Ok(Self {
            program,
            args: std::env::args_os().collect(),
        })
    }

    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let program = program.into();
        let args = std::iter::once(program.clone().into_os_string())
            .chain(args.into_iter().map(Into::into))
            .collect();
        Self { program, args }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

/// Transfers listeners to a successor and confirms it is accepting.
///
/// `state` is the attempt's state machine; implementations move it from `Idle`
/// through `AwaitingReady`, or abort it to `Terminated` on failure. On success the
/// caller owns the `AwaitingReady -> Draining` step.
pub trait Handoff: Send + Sync + 'static {
    fn hand_off(
        &self,
        listeners: &[Arc<ListenerHandle>],
        state: &HandoffStateCell,
    ) -> impl Future<Output = Result<ProcessDescriptor, HandoffError>> + Send;
}

/// Forks and execs successors.
#[derive(Debug)]
pub struct HandoffCoordinator {
    command: SuccessorCommand,
    ready_timeout: Duration,
    generation: u64,
    attempts: AtomicU32,
}

impl HandoffCoordinator {
    pub fn new(command: SuccessorCommand, ready_timeout: Duration) -> Self {
        Self {
            command,
            ready_timeout,
            generation: current_generation(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Number of handoff attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn spawn(
        &self,
        listeners: &[Arc<ListenerHandle>],
    ) -> Result<(ProcessDescriptor, ReadinessReceiver), SpawnError> {
        let exported = listeners
            .iter()
            .map(|l| l.export_descriptor())
            .collect::<io::Result<Vec<OwnedFd>>>()
            .map_err(SpawnError::Descriptor)?;

        let (receiver, successor_end) = ReadinessChannel::new()
            .map_err(SpawnError::Descriptor)?
            .split();
        let successor_end =
            dup_above(successor_end.as_raw_fd(), EXPORT_FD_FLOOR).map_err(SpawnError::Descriptor)?;

        let names: Vec<&str> = listeners.iter().map(|l| l.name()).collect();
        let ready_fd = LISTEN_FDS_START + exported.len() as RawFd;
        let env = successor_env(std::env::vars_os(), &names, ready_fd, self.generation + 1);
        let image = ExecImage::new(&self.command, &env)?;

        let plan: Vec<(RawFd, RawFd)> = exported
            .iter()
            .chain(std::iter::once(&successor_end))
            .enumerate()
            .map(|(i, fd)| (fd.as_raw_fd(), LISTEN_FDS_START + i as RawFd))
            .collect();

        // SAFETY: everything the child touches was allocated before fork, and the
        // child only calls dup2, execve and _exit.
        let pid = unsafe { image.fork_exec(&plan) }.map_err(SpawnError::Fork)?;

        info!(
            pid,
            fds = ?plan.iter().map(|(_, target)| *target).collect::<Vec<_>>(),
            names = ?names,
            exe = %self.command.program.display(),
            "Spawned successor process"
        );

        // Dropping `exported` and `successor_end` closes the parent's copies, so a
        // dead successor shows up as EOF on the readiness channel.
        Ok((
            ProcessDescriptor {
                pid,
                spawn_time: SystemTime::now(),
                readiness_flag: false,
            },
            receiver,
        ))
    }

    /// Clean up after a successor that failed the readiness handshake.
    async fn abandon(&self, pid: i32, error: ReadinessError) -> HandoffError {
        match error {
            ReadinessError::Timeout(timeout) => {
                let status = kill_and_reap(pid);
                warn!(pid, %status, "Killed successor that never signalled readiness");
                HandoffError::ReadinessTimeout { pid, timeout }
            }
            ReadinessError::Closed => {
                let status = reap_exited(pid).await;
                SpawnError::Exited { pid, status }.into()
            }
            source => {
                let status = kill_and_reap(pid);
                warn!(pid, %status, error = %source, "Killed successor after readiness failure");
                HandoffError::Readiness { pid, source }
            }
        }
    }
}

impl Handoff for HandoffCoordinator {
    async fn hand_off(
        &self,
        listeners: &[Arc<ListenerHandle>],
        state: &HandoffStateCell,
    ) -> Result<ProcessDescriptor, HandoffError> {
        state.advance(HandoffState::Idle, HandoffState::Spawning)?;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            attempt,
            generation = self.generation + 1,
            listener_count = listeners.len(),
            "Preparing handoff"
        );

        let (mut successor, receiver) = match self.spawn(listeners) {
            Ok(spawned) => spawned,
            Err(e) => {
                state.abort();
                return Err(e.into());
            }
        };
        state.advance(HandoffState::Spawning, HandoffState::AwaitingReady)?;

        let started = Instant::now();
        match receiver.wait(self.ready_timeout).await {
            Ok(()) => {
                successor.readiness_flag = true;
                info!(
                    pid = successor.pid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Successor is accepting"
                );
                Ok(successor)
            }
            Err(e) => {
                state.abort();
                Err(self.abandon(successor.pid, e).await)
            }
        }
    }
}

/// Environment for the successor: the current environment minus any stale
/// handoff variables, plus this attempt's.
fn successor_env<I>(
    current: I,
    names: &[&str],
    ready_fd: RawFd,
    generation: u64,
) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    const MANAGED: [&str; 5] = [
        LISTEN_FDS_ENV,
        LISTEN_FD_NAMES_ENV,
        LISTEN_PID_ENV,
        READY_FD_ENV,
        GENERATION_ENV,
    ];

    let mut env: Vec<(OsString, OsString)> = current
        .into_iter()
        .filter(|(key, _)| !MANAGED.iter().any(|managed| key == managed))
        .collect();
    let handoff: [(OsString, OsString); 4] = [
        (LISTEN_FDS_ENV.into(), names.len().to_string().into()),
        (LISTEN_FD_NAMES_ENV.into(), names.join(":").into()),
        (READY_FD_ENV.into(), ready_fd.to_string().into()),
        (GENERATION_ENV.into(), generation.to_string().into()),
    ];
    env.extend(handoff);
    env
}

/// argv and envp as C strings, prepared before fork.
struct ExecImage {
    program: CString,
    args: Vec<CString>,
    env: Vec<CString>,
}

impl ExecImage {
    fn new(command: &SuccessorCommand, env: &[(OsString, OsString)]) -> Result<Self, NulError> {
        let program = CString::new(command.program.as_os_str().as_bytes())?;
        let args = command
            .args
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let env = env
            .iter()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { program, args, env })
    }

    /// Fork; in the child, place each `(source, target)` fd and exec.
    ///
    /// # Safety
    ///
    /// Sources must be open and must not collide with any target. The child
    /// must not allocate or take locks, which holds as long as this function
    /// body only calls `dup2`, `execve` and `_exit` after the fork.
    unsafe fn fork_exec(&self, plan: &[(RawFd, RawFd)]) -> io::Result<libc::pid_t> {
        let argv: Vec<*const libc::c_char> = self
            .args
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp: Vec<*const libc::c_char> = self
            .env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        match libc::fork() {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                // dup2 leaves the new descriptor without FD_CLOEXEC.
                for &(source, target) in plan {
                    if libc::dup2(source, target) < 0 {
                        libc::_exit(126);
                    }
                }
                libc::execve(self.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
                libc::_exit(127)
            }
            pid => Ok(pid),
        }
    }
}

fn describe_status(status: libc::c_int) -> String {
    if libc::WIFEXITED(status) {
        format!("exit code {}", libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        format!("killed by signal {}", libc::WTERMSIG(status))
    } else {
        format!("wait status {status}")
    }
}

fn try_reap(pid: i32) -> Option<String> {
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    match result {
        0 => None,
        r if r == pid => Some(describe_status(status)),
        _ => Some(format!("wait failed: {}", io::Error::last_os_error())),
    }
}

fn kill_and_reap(pid: i32) -> String {
    unsafe { libc::kill(pid, libc::SIGKILL) };
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, 0) };
    if result == pid {
        describe_status(status)
    } else {
        format!("wait failed: {}", io::Error::last_os_error())
    }
}

/// Reap a successor that closed its readiness channel, killing it if it
/// lingers.
async fn reap_exited(pid: i32) -> String {
    for _ in 0..20 {
        if let Some(status) = try_reap(pid) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    kill_and_reap(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ListenAddress;

    fn listener() -> Arc<ListenerHandle> {
        let address: ListenAddress = "tcp:0:interface=127.0.0.1".parse().unwrap();
        Arc::new(ListenerHandle::bind("listen-0", &address).unwrap())
    }

    fn shell(script: &str, ready_timeout: Duration) -> HandoffCoordinator {
        HandoffCoordinator::new(SuccessorCommand::new("/bin/sh", ["-c", script]), ready_timeout)
    }

    #[test]
    fn test_successor_env_replaces_stale_values() {
        let current = vec![
            (OsString::from("PATH"), OsString::from("/usr/bin")),
            (OsString::from("LISTEN_FDS"), OsString::from("9")),
            (OsString::from("LISTEN_PID"), OsString::from("1")),
            (OsString::from("MAXREQ_GENERATION"), OsString::from("4")),
        ];
        let env = successor_env(current, &["listen-0", "listen-1"], 5, 5);
        let get = |key: &str| {
            env.iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
        };

        assert_eq!(get("PATH"), ["/usr/bin"]);
        assert_eq!(get("LISTEN_FDS"), ["2"]);
        assert_eq!(get("LISTEN_FD_NAMES"), ["listen-0:listen-1"]);
        assert_eq!(get("MAXREQ_READY_FD"), ["5"]);
        assert_eq!(get("MAXREQ_GENERATION"), ["5"]);
        assert!(get("LISTEN_PID").is_empty());
    }

    #[test]
    fn test_command_argv0_is_program() {
        let command = SuccessorCommand::new("/bin/true", ["--flag"]);
        assert_eq!(command.args, vec![OsString::from("/bin/true"), OsString::from("--flag")]);
    }

    #[tokio::test]
    async fn test_successor_signals_ready() {
        let coordinator = shell(
            r#"[ "$LISTEN_FDS" = 1 ] && [ "$LISTEN_FD_NAMES" = listen-0 ] && [ "$MAXREQ_READY_FD" = 4 ] && printf 'ready\n' >&4"#,
            Duration::from_secs(10),
        );
        let state = HandoffStateCell::new();

        let successor = coordinator.hand_off(&[listener()], &state).await.unwrap();
        assert!(successor.readiness_flag);
        assert!(successor.pid > 0);
        assert_eq!(state.get(), HandoffState::AwaitingReady);
        assert_eq!(coordinator.attempts(), 1);
        kill_and_reap(successor.pid);
    }

    #[tokio::test]
    async fn test_readiness_timeout_kills_successor() {
        let coordinator = shell("sleep 30", Duration::from_millis(200));
        let state = HandoffStateCell::new();
        let handle = listener();

        let err = coordinator.hand_off(&[Arc::clone(&handle)], &state).await.unwrap_err();
        let HandoffError::ReadinessTimeout { pid, .. } = err else {
            panic!("expected readiness timeout, got {err}");
        };
        assert_eq!(state.get(), HandoffState::Terminated);
        // Reaped: the pid no longer belongs to a child of ours.
        assert_eq!(unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) }, -1);
        // The original listener is untouched.
        assert!(!handle.is_stopped());
        assert!(handle.export_descriptor().is_ok());
    }

    #[tokio::test]
    async fn test_successor_exit_is_spawn_error() {
        let coordinator = shell("exit 3", Duration::from_secs(10));
        let state = HandoffStateCell::new();

        let err = coordinator.hand_off(&[listener()], &state).await.unwrap_err();
        match err {
            HandoffError::Spawn(SpawnError::Exited { status, .. }) => {
                assert_eq!(status, "exit code 3")
            }
            other => panic!("expected spawn error, got {other}"),
        }
        assert_eq!(state.get(), HandoffState::Terminated);
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let coordinator = HandoffCoordinator::new(
            SuccessorCommand::new("/nonexistent/maxreq-server", Vec::<String>::new()),
            Duration::from_secs(10),
        );
        let err = coordinator
            .hand_off(&[listener()], &HandoffStateCell::new())
            .await
            .unwrap_err();
        match err {
            HandoffError::Spawn(SpawnError::Exited { status, .. }) => {
                assert_eq!(status, "exit code 127")
            }
            other => panic!("expected spawn error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_attempt_must_start_idle() {
        let coordinator = shell("exit 0", Duration::from_secs(1));
        let state = HandoffStateCell::new();
        state.advance(HandoffState::Idle, HandoffState::Spawning).unwrap();

        let err = coordinator.hand_off(&[listener()], &state).await.unwrap_err();
        assert!(matches!(err, HandoffError::Transition(_)), "{err}");
        assert_eq!(coordinator.attempts(), 0);
    }
}
