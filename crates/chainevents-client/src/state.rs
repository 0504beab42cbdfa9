//! Connection state machine: Disconnected → Connecting → Connected → Disconnected.
//!
//! Transitions:
//! - `Disconnected` → `Connecting`: a connect or reconnect begins
//! - `Connecting` → `Connected`:    the dispatcher reports success
//! - `Connecting` → `Disconnected`: every attempt failed
//! - `Connected` → `Disconnected`:  the connection was lost or closed

use std::sync::atomic::{AtomicU8, Ordering};

/// The client's view of network connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }

    fn can_move_to(self, to: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Lock-free holder of a [`ConnectionState`].
#[derive(Debug)]
pub(crate) struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub(crate) fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from` → `to`. Returns `false` when the current state is not
    /// `from` or the edge is not part of the state machine.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        if !from.can_move_to(to) {
            return false;
        }
        let moved = self
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!(%from, %to, "connection state changed");
        }
        moved
    }

    /// Unconditionally mark the client disconnected.
    pub(crate) fn reset(&self) {
        self.0.store(ConnectionState::Disconnected as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn follows_the_cycle() {
        let state = AtomicConnectionState::new();
        assert_eq!(state.load(), Disconnected);
        assert!(state.transition(Disconnected, Connecting));
        assert!(state.transition(Connecting, Connected));
        assert!(state.transition(Connected, Disconnected));
        assert_eq!(state.load(), Disconnected);
    }

    #[test]
    fn rejects_illegal_edges() {
        let state = AtomicConnectionState::new();
        assert!(!state.transition(Disconnected, Connected));
        assert!(state.transition(Disconnected, Connecting));
        // A second connect cannot start while one is in flight.
        assert!(!state.transition(Disconnected, Connecting));
        assert!(!state.transition(Connected, Disconnected));
        assert_eq!(state.load(), Connecting);
    }

    #[test]
    fn reset_from_any_state() {
        let state = AtomicConnectionState::new();
        state.transition(Disconnected, Connecting);
        state.reset();
        assert_eq!(state.load(), Disconnected);
    }
}
