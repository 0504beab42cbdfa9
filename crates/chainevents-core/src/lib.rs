//! chainevents-core: the ledger event dispatcher and its building blocks.
//!
//! # Overview
//!
//! ChainEvents delivers blocks, filtered blocks, chaincode events and
//! transaction statuses from a permissioned-ledger peer to local subscribers.
//! The core crate defines:
//!
//! - [`Dispatcher`]: the single-task event hub owning every registration
//! - [`Protocol`] / [`Connection`] / [`ConnectionProvider`]: the transport seam
//! - [`EventSnapshot`]: registrations handed from one dispatcher to the next
//! - [`resolver`] module: peer selection (min block height, preferred org/peer)
//! - [`EventError`] / [`DisconnectError`]: structured error types
//! - [`EventServiceConfig`]: JSON-loadable tunables

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod filter;
pub mod ledger;
pub mod logging;
pub mod peer;
pub mod registration;
pub mod resolver;
pub mod snapshot;

pub use config::{BalancerKind, EventServiceConfig, ResolverStrategy};
pub use connection::{Connection, ConnectionProvider, Inbound, Passthrough, Protocol};
pub use dispatcher::{
    Command, Connector, DispatchMetrics, Dispatcher, DispatcherConfig, DispatcherState, Event,
    EventSender, SendPolicy,
};
pub use error::{DisconnectError, EventError};
pub use events::{BlockEvent, CCEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};
pub use filter::BlockFilter;
pub use ledger::{Block, FilteredBlock, HeaderType, TxValidationCode};
pub use peer::{DiscoveryService, Peer, StaticDiscovery};
pub use registration::{Registration, RegistrationInfo};
pub use resolver::PeerResolver;
pub use snapshot::EventSnapshot;
