//! Request serving lifecycle: accept, count, hand off, drain.
//!
//! [`DrainController::run`] owns the listeners for the life of the process.
//! One accept loop per listener feeds connections to the application through
//! a shared [`RequestCounter`]. The connection that reaches the threshold pauses
//! every listener and wakes the handoff task; from then on new connections wait
//! in the kernel backlog until either the successor accepts them or a failed
//! attempt resumes accepting here.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::HandoffConfig;
use crate::coordinator::{current_generation, Handoff, ProcessDescriptor};
use crate::counter::RequestCounter;
use crate::error::{DrainError, HandoffError, RunError};
use crate::handler::{ConnectionContext, ConnectionHandler};
use crate::listener::{Connection, ListenerHandle, PeerAddr};
use crate::readiness::ReadinessNotifier;
use crate::state::{HandoffState, HandoffStateCell};
use crate::tracker::ConnectionTracker;

/// What started a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The request counter reached its threshold at `count`.
    Threshold { count: u64 },
    /// An operator asked for a handoff (`SIGQUIT`).
    Signal,
}

#[derive(Debug)]
enum Command {
    HandOff(Trigger),
    Stop,
}

/// Sends lifecycle requests to a running [`DrainController`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ControlHandle {
    /// Ask for a handoff. Returns `false` once the controller has finished.
    pub fn request_handoff(&self, trigger: Trigger) -> bool {
        self.commands.send(Command::HandOff(trigger)).is_ok()
    }

    /// Stop accepting and drain without starting a successor.
    pub fn request_stop(&self) -> bool {
        self.commands.send(Command::Stop).is_ok()
    }
}

/// Why the controller stopped serving.
#[derive(Debug)]
pub enum ExitReason {
    /// A successor took over the listeners.
    HandedOff(ProcessDescriptor),
    /// A stop was requested; no successor was started.
    Stopped,
    /// Every allowed handoff attempt failed.
    HandoffAbandoned { attempts: u32, error: HandoffError },
}

/// Outcome of [`DrainController::run`].
#[derive(Debug)]
pub struct RunReport {
    pub reason: ExitReason,
    pub drain: Result<(), DrainError>,
    /// Connections accepted by this process.
    pub served: u64,
}

impl RunReport {
    /// Process exit status for this outcome.
    ///
    /// - `0`: clean exit
    /// - `2`: the drain timed out
    /// - `3`: handoff abandoned after spawn failures
    /// - `4`: handoff abandoned after a readiness timeout
    pub fn exit_code(&self) -> u8 {
        match (&self.reason, &self.drain) {
            (
                ExitReason::HandoffAbandoned {
                    error: HandoffError::ReadinessTimeout { .. },
                    ..
                },
                _,
            ) => 4,
            (ExitReason::HandoffAbandoned { .. }, _) => 3,
            (_, Err(_)) => 2,
            _ => 0,
        }
    }
}

/// Drives the listeners through accept, handoff and drain.
pub struct DrainController<C> {
    config: HandoffConfig,
    counter: Arc<RequestCounter>,
    coordinator: Arc<C>,
    readiness: Option<ReadinessNotifier>,
    control: ControlHandle,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C: Handoff> DrainController<C> {
    pub fn new(config: HandoffConfig, coordinator: C) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        Self {
            counter: Arc::new(RequestCounter::new(config.max_requests)),
            config,
            coordinator: Arc::new(coordinator),
            readiness: None,
            control: ControlHandle { commands: tx },
            commands,
        }
    }

    /// Notify a predecessor once every accept loop is live.
    pub fn with_readiness(mut self, notifier: Option<ReadinessNotifier>) -> Self {
        self.readiness = notifier;
        self
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    /// The request counter shared by every accept loop. Stays readable after
    /// a failed handoff, when accepting resumes.
    pub fn counter(&self) -> Arc<RequestCounter> {
        Arc::clone(&self.counter)
    }

    /// Serve until handed off or stopped, then drain.
    ///
    /// Returns once the drain has finished or timed out. Handler failures
    /// never end the run.
    pub async fn run<H>(
        mut self,
        listeners: Vec<ListenerHandle>,
        handler: Arc<H>,
    ) -> Result<RunReport, RunError>
    where
        H: ConnectionHandler,
    {
        let listeners: Arc<[Arc<ListenerHandle>]> = listeners.into_iter().map(Arc::new).collect();
        let counter = Arc::clone(&self.counter);
        let tracker = ConnectionTracker::new();

        info!(
            listeners = listeners.len(),
            max_requests = counter.threshold(),
            generation = current_generation(),
            "Starting accept loops"
        );

        let mut accept_loops = Vec::with_capacity(listeners.len());
        let mut live = Vec::with_capacity(listeners.len());
        for listener in listeners.iter() {
            let (live_tx, live_rx) = oneshot::channel();
            live.push(live_rx);

            let acceptor = Acceptor {
                listeners: Arc::clone(&listeners),
                counter: Arc::clone(&counter),
                tracker: tracker.clone(),
                handler: Arc::clone(&handler),
                control: self.control(),
            };
            let listener = Arc::clone(listener);
            accept_loops.push(tokio::spawn(async move {
                let _ = live_tx.send(());
                listener
                    .accept_loop(|connection, peer| acceptor.dispatch(&listener, connection, peer))
                    .await;
            }));
        }
        for ready in live {
            let _ = ready.await;
        }

        if let Some(notifier) = self.readiness.take() {
            if let Err(e) = notifier.notify() {
                stop_all(&listeners);
                return Err(RunError::Readiness(e));
            }
            info!(generation = current_generation(), "Signalled readiness to predecessor");
        }

        let (reason, attempt) = self.serve(&listeners).await?;

        stop_all(&listeners);
        for task in accept_loops {
            if let Err(e) = task.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        let drain = tracker.drain(self.config.drain_policy()).await;
        if let Some(attempt) = &attempt {
            attempt.advance(HandoffState::Draining, HandoffState::Terminated)?;
        }

        let served = counter.count();
        match &drain {
            Ok(()) => info!(served, "Last connection closed; exiting"),
            Err(e) => error!(served, error = %e, "Exiting with connections still open"),
        }

        Ok(RunReport {
            reason,
            drain,
            served,
        })
    }

    /// Wait for handoff or stop requests and run handoff attempts.
    ///
    /// Returns the exit reason and, after a successful handoff, the attempt's
    /// state (in `Draining`).
    async fn serve(
        &mut self,
        listeners: &[Arc<ListenerHandle>],
    ) -> Result<(ExitReason, Option<HandoffStateCell>), RunError> {
        let mut failures = 0u32;
        let mut pending: Option<Trigger> = None;

        loop {
            let trigger = match pending.take() {
                Some(trigger) => trigger,
                None => match self.commands.recv().await {
                    Some(Command::HandOff(trigger)) => trigger,
                    Some(Command::Stop) | None => {
                        info!("Stop requested, draining without handoff");
                        return Ok((ExitReason::Stopped, None));
                    }
                },
            };

            for listener in listeners {
                listener.pause_accepting();
            }
            info!(?trigger, attempt = failures + 1, "Starting handoff");

            let state = HandoffStateCell::new();
            let error = match self.coordinator.hand_off(listeners, &state).await {
                Ok(successor) => {
                    state.advance(HandoffState::AwaitingReady, HandoffState::Draining)?;
                    info!(pid = successor.pid, "Handoff complete, draining");
                    return Ok((ExitReason::HandedOff(successor), Some(state)));
                }
                Err(error) => error,
            };

            failures += 1;
            for listener in listeners {
                listener.resume_accepting();
            }

            if self.config.max_handoff_attempts != 0 && failures >= self.config.max_handoff_attempts {
                error!(attempts = failures, error = %error, "Giving up on handoff");
                return Ok((
                    ExitReason::HandoffAbandoned {
                        attempts: failures,
                        error,
                    },
                    None,
                ));
            }

            let backoff = self.config.retry_backoff_for(failures);
            warn!(
                attempt = failures,
                error = %error,
                retry_in_ms = backoff.as_millis() as u64,
                "Handoff failed; still accepting on the original listeners"
            );

            tokio::select! {
                _ = tokio::time::sleep(backoff) => pending = Some(trigger),
                command = self.commands.recv() => match command {
                    Some(Command::HandOff(next)) => pending = Some(next),
                    Some(Command::Stop) | None => {
                        info!("Stop requested, draining without handoff");
                        return Ok((ExitReason::Stopped, None));
                    }
                },
            }
        }
    }
}

fn stop_all(listeners: &[Arc<ListenerHandle>]) {
    for listener in listeners {
        listener.stop_accepting();
    }
}

/// Per-listener state shared by the accept callback.
struct Acceptor<H> {
    listeners: Arc<[Arc<ListenerHandle>]>,
    counter: Arc<RequestCounter>,
    tracker: ConnectionTracker,
    handler: Arc<H>,
    control: ControlHandle,
}

impl<H: ConnectionHandler> Acceptor<H> {
    fn dispatch(&self, listener: &ListenerHandle, connection: Connection, peer: PeerAddr) {
        let sequence = self.counter.increment();
        if sequence == self.counter.threshold() {
            info!(count = sequence, "Request threshold reached, pausing accept for handoff");
            for listener in self.listeners.iter() {
                listener.pause_accepting();
            }
            self.control.request_handoff(Trigger::Threshold { count: sequence });
        }

        let guard = self.tracker.track(peer.clone(), listener.name());
        let context = ConnectionContext {
            id: guard.id(),
            peer,
            listener: listener.name().to_string(),
            sequence,
        };
        let span = info_span!(
            "maxreq.connection",
            id = context.id,
            peer = %context.peer,
            sequence
        );
        let handler = Arc::clone(&self.handler);

        tokio::spawn(
            async move {
                // Nested task so a panicking handler still releases the guard.
                let outcome = tokio::spawn(
                    async move { handler.handle(connection, context).await }.in_current_span(),
                )
                .await;
                match outcome {
                    Ok(Ok(())) => debug!("Connection finished"),
                    Ok(Err(e)) => warn!(error = %e, "Connection handler failed"),
                    Err(e) if e.is_panic() => error!("Connection handler panicked"),
                    Err(e) => warn!(error = %e, "Connection task cancelled"),
                }
                drop(guard);
            }
            .instrument(span),
        );
    }
}
