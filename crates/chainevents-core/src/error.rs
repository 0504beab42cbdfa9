//! Event-service error types.

use thiserror::Error;

/// Reason attached to a disconnect notification.
///
/// The transport or protocol layer decides whether the disconnect is fatal;
/// the client never infers it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DisconnectError {
    pub message: String,
    pub fatal: bool,
}

impl DisconnectError {
    /// A disconnect the client may recover from by reconnecting.
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), fatal: false }
    }

    /// A disconnect that must permanently close the client (e.g. access denied).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), fatal: true }
    }
}

/// Errors that can occur while registering for, or delivering, ledger events.
#[derive(Debug, Clone, Error)]
pub enum EventError {
    /// A transaction-status registration already exists for this ID.
    #[error("registration already exists for TX ID [{0}]")]
    DuplicateTxRegistration(String),

    /// A chaincode registration already exists for this chaincode and filter.
    #[error("registration already exists for chaincode [{chaincode_id}] and event [{event_filter}]")]
    DuplicateChaincodeRegistration {
        chaincode_id: String,
        event_filter: String,
    },

    /// The chaincode event filter is not a valid regular expression.
    #[error("invalid event filter [{filter}] for chaincode [{chaincode_id}]: {reason}")]
    InvalidEventFilter {
        chaincode_id: String,
        filter: String,
        reason: String,
    },

    /// The caller has no permission to receive full blocks.
    #[error("block events are not permitted")]
    BlockEventsNotPermitted,

    /// The dispatcher was used outside of its started lifetime.
    #[error("dispatcher is in state [{actual}], expected [{expected}]")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The dispatcher has stopped and no longer accepts commands.
    #[error("dispatcher has been stopped")]
    DispatcherStopped,

    /// The client has been closed.
    #[error("event client is closed")]
    ClientClosed,

    /// Discovery returned no candidate peers.
    #[error("no peers to connect to")]
    NoPeers,

    /// The resolver could not pick a peer out of the candidates.
    #[error("unable to resolve a peer from {candidates} candidate(s)")]
    NoPeerResolved { candidates: usize },

    /// A connection is already established (or being established).
    #[error("connection already established")]
    AlreadyConnected,

    /// No connection is established.
    #[error("not connected")]
    NotConnected,

    /// Dialing, handshaking or sending on the connection failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// Discovery failed.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// The connection was lost.
    #[error("disconnected: {0}")]
    Disconnected(DisconnectError),

    /// No response arrived within the configured duration.
    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl EventError {
    /// Returns `true` if a new connect attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoPeers
            | Self::NoPeerResolved { .. }
            | Self::Connection(_)
            | Self::Discovery(_)
            | Self::Timeout { .. } => true,
            Self::Disconnected(err) => !err.fatal,
            _ => false,
        }
    }

    /// Returns `true` if the error should permanently shut the client down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Disconnected(err) if err.fatal)
    }
}

impl From<DisconnectError> for EventError {
    fn from(err: DisconnectError) -> Self {
        Self::Disconnected(err)
    }
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
