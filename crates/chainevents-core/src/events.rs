//! Events published to subscribers.

use std::sync::Arc;

use crate::error::DisconnectError;
use crate::ledger::{Block, FilteredBlock, TxValidationCode};

/// A full block, published to block registrations.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub block: Arc<Block>,
    /// URL of the peer that delivered the block.
    pub source_url: String,
}

/// A filtered block, published to filtered-block registrations.
#[derive(Debug, Clone)]
pub struct FilteredBlockEvent {
    pub filtered_block: Arc<FilteredBlock>,
    pub source_url: String,
}

/// A chaincode event matching a chaincode registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CCEvent {
    pub chaincode_id: String,
    pub event_name: String,
    pub tx_id: String,
    pub payload: Vec<u8>,
    pub block_number: u64,
    pub source_url: String,
}

/// The commit status of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatusEvent {
    pub tx_id: String,
    pub validation_code: TxValidationCode,
    pub block_number: u64,
    pub source_url: String,
}

/// A change in connectivity to the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub connected: bool,
    /// Why the connection went down; `None` for requested disconnects.
    pub err: Option<DisconnectError>,
}

impl ConnectionEvent {
    pub fn connected() -> Self {
        Self { connected: true, err: None }
    }

    pub fn disconnected(err: Option<DisconnectError>) -> Self {
        Self { connected: false, err }
    }

    /// Returns `true` for a disconnect the client must not recover from.
    pub fn is_fatal(&self) -> bool {
        self.err.as_ref().map_or(false, |e| e.fatal)
    }
}
