//! chainevents-conncache: a concurrent connection cache for event transports.
//!
//! Connection providers dial peers through a [`CachingConnector`] so that
//! several streams to the same peer share one transport connection. Unused
//! and broken connections are closed by a background janitor.

pub mod connector;
pub mod error;

pub use connector::{CacheConfig, CachedConn, CachingConnector, ClientConn, ConnState, Dialer};
pub use error::CacheError;
