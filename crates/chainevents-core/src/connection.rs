//! The connection seam between the dispatcher and a wire transport.
//!
//! A transport implements [`Connection`] for one established event stream and
//! [`ConnectionProvider`] to open one. The protocol spoken over the stream is
//! described by a [`Protocol`], which turns protocol messages into the
//! dispatcher's generic [`Inbound`] vocabulary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatcher::EventSender;
use crate::error::{DisconnectError, EventError};
use crate::ledger::{Block, FilteredBlock};
use crate::peer::Peer;

/// What a protocol message means to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Block(Block),
    FilteredBlock(FilteredBlock),
    /// Response to a pending handshake request.
    HandshakeAck(Result<(), DisconnectError>),
    /// The remote end refused to continue serving the stream.
    Disconnect(DisconnectError),
    /// A message with no effect on subscribers.
    Ignore,
}

/// A protocol spoken over the event stream.
///
/// The dispatcher owns the protocol value and calls it from its own task, so
/// implementations may keep state without synchronization.
pub trait Protocol: Send + Sync + 'static {
    /// Message received from the stream.
    type Message: Send + 'static;
    /// Request written to the stream (seek, interest registration, ...).
    type Request: Send + 'static;

    fn name(&self) -> &'static str;

    fn translate(&mut self, message: Self::Message) -> Inbound;
}

/// Protocol for transports that already produce [`Inbound`] values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Protocol for Passthrough {
    type Message = Inbound;
    type Request = ();

    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn translate(&mut self, message: Inbound) -> Inbound {
        message
    }
}

/// One established event stream.
///
/// # Thread Safety
/// Shared between the dispatcher and the task draining the stream, so
/// implementations must be `Send + Sync`.
#[async_trait]
pub trait Connection<P: Protocol>: Send + Sync + 'static {
    /// Write a request to the stream.
    async fn send(&self, request: P::Request) -> Result<(), EventError>;

    /// Drain the stream into `events` until it ends.
    ///
    /// Each message is forwarded as `Event::Message`. When the stream ends for
    /// any reason other than [`close`](Self::close), the implementation pushes
    /// an `Event::Disconnected` describing why.
    async fn receive(&self, events: EventSender<P>);

    /// Tear the stream down. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens connections to a chosen peer.
#[async_trait]
pub trait ConnectionProvider<P: Protocol>: Send + Sync + 'static {
    async fn connect(
        &self,
        channel_id: &str,
        peer: &Peer,
    ) -> Result<Arc<dyn Connection<P>>, EventError>;
}
