//! chainevents-client: keeps a ledger event stream connected.
//!
//! # Overview
//!
//! - [`Client`]: connect/close, registration pass-through and automatic reconnect
//! - [`ClientParams`]: attempts, delays and block-event permission
//! - [`ConnectionHooks`]: protocol work around (re)connects
//! - [`deliver`]: seek-based deliver protocol
//! - [`eventhub`]: interest-registration protocol
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainevents_client::deliver::{self, DeliverMode, DeliverProtocol, SeekType};
//! use chainevents_core::{ConnectionProvider, EventServiceConfig, Peer, StaticDiscovery};
//!
//! # async fn run(provider: Arc<dyn ConnectionProvider<DeliverProtocol>>) -> Result<(), chainevents_core::EventError> {
//! let config = EventServiceConfig::from_json(r#"{"max_connect_attempts": 3, "log": {"level": "info"}}"#)?;
//! chainevents_core::logging::init_tracing(&config.log)?;
//! let discovery = Arc::new(StaticDiscovery::new(vec![Peer::new("grpcs://peer0:7051", "Org1MSP")]));
//! let client = deliver::new_client(&config, "mychannel", discovery, provider, DeliverMode::FilteredBlock, SeekType::Newest)?;
//! client.connect().await?;
//! let (_reg, mut events) = client.register_chaincode_event("mycc", "transfer.*").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{} in block {}", event.event_name, event.block_number);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod deliver;
pub mod eventhub;
pub mod hooks;
pub mod params;
pub mod retry;
pub mod state;

pub use client::{Client, ClientOutcome};
pub use hooks::{ConnectionHooks, NoHooks};
pub use params::ClientParams;
pub use state::ConnectionState;
