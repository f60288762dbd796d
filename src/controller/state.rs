//! Controller lifecycle state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::info;

/// Lifecycle of a [`Controller`](super::Controller)
///
/// `Created -> Syncing -> Running -> Draining -> Stopped`. A sync timeout
/// goes straight from `Syncing` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControllerState {
    Created = 0,
    Syncing = 1,
    Running = 2,
    Draining = 3,
    Stopped = 4,
}

impl ControllerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ControllerState::Created,
            1 => ControllerState::Syncing,
            2 => ControllerState::Running,
            3 => ControllerState::Draining,
            _ => ControllerState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Created => "created",
            ControllerState::Syncing => "syncing",
            ControllerState::Running => "running",
            ControllerState::Draining => "draining",
            ControllerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomically updated [`ControllerState`]
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ControllerState::Created as u8))
    }

    pub(crate) fn get(&self) -> ControllerState {
        ControllerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, next: ControllerState) {
        let previous = ControllerState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        if previous != next {
            info!(from = %previous, to = %next, "Controller state changed");
        }
    }

    /// Move from `from` to `to`; fails with the actual state otherwise
    pub(crate) fn transition(
        &self,
        from: ControllerState,
        to: ControllerState,
    ) -> Result<(), ControllerState> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| info!(from = %from, to = %to, "Controller state changed"))
            .map_err(ControllerState::from_u8)
    }
}
