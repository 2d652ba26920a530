//! Handoff lifecycle state machine.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::TransitionError;

/// Phase of a handoff attempt. Transitions only move forward.
///
/// ```text
/// Idle -> Spawning -> AwaitingReady -> Draining -> Terminated
///            \______________\___________________/^
///                     (failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum HandoffState {
    Idle = 0,
    Spawning = 1,
    AwaitingReady = 2,
    Draining = 3,
    Terminated = 4,
}

impl HandoffState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandoffState::Idle,
            1 => HandoffState::Spawning,
            2 => HandoffState::AwaitingReady,
            3 => HandoffState::Draining,
            _ => HandoffState::Terminated,
        }
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition(self, to: HandoffState) -> bool {
        use HandoffState::*;
        matches!(
            (self, to),
            (Idle, Spawning)
                | (Spawning, AwaitingReady)
                | (AwaitingReady, Draining)
                | (Spawning, Terminated)
                | (AwaitingReady, Terminated)
                | (Draining, Terminated)
        )
    }
}

/// Atomic holder for a [`HandoffState`].
///
/// `advance` is a compare-and-swap, so of several racing callers trying to
/// leave `Idle` exactly one succeeds.
#[derive(Debug)]
pub struct HandoffStateCell {
    state: AtomicU8,
}

impl Default for HandoffStateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoffStateCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(HandoffState::Idle as u8),
        }
    }

    pub fn get(&self) -> HandoffState {
        HandoffState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`.
    ///
    /// Fails if the edge does not exist or the current state is not `from`.
    pub fn advance(&self, from: HandoffState, to: HandoffState) -> Result<(), TransitionError> {
        if !from.can_transition(to) {
            return Err(TransitionError { from, to });
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| TransitionError {
                from: HandoffState::from_u8(actual),
                to,
            })
    }

    /// Abort the attempt from whatever non-idle phase it is in.
    ///
    /// Returns the phase that was left, or `None` if the attempt was idle or
    /// already terminated.
    pub fn abort(&self) -> Option<HandoffState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                HandoffState::from_u8(current)
                    .can_transition(HandoffState::Terminated)
                    .then_some(HandoffState::Terminated as u8)
            })
            .ok()
            .map(HandoffState::from_u8)
    }
}
