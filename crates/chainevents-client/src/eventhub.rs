//! The event-hub protocol: the client registers its interests once the stream
//! is open and waits for the hub to accept them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use chainevents_core::{
    Block, DisconnectError, Dispatcher, EventError, FilteredBlock, Inbound, Protocol,
};

use crate::hooks::ConnectionHooks;

/// An event class the hub should stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interest {
    Block,
    FilteredBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventHubRequest {
    RegisterInterest(Vec<Interest>),
    UnregisterInterest(Vec<Interest>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventHubMessage {
    Block(Block),
    FilteredBlock(FilteredBlock),
    /// Answer to a `RegisterInterest` request.
    Registered { accepted: bool, reason: String },
    Unregistered,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EventHubProtocol;

impl Protocol for EventHubProtocol {
    type Message = EventHubMessage;
    type Request = EventHubRequest;

    fn name(&self) -> &'static str {
        "eventhub"
    }

    fn translate(&mut self, message: EventHubMessage) -> Inbound {
        match message {
            EventHubMessage::Block(block) => Inbound::Block(block),
            EventHubMessage::FilteredBlock(fblock) => Inbound::FilteredBlock(fblock),
            EventHubMessage::Registered { accepted: true, .. } => Inbound::HandshakeAck(Ok(())),
            EventHubMessage::Registered { accepted: false, reason } => {
                warn!(reason, "event hub rejected interest registration");
                Inbound::HandshakeAck(Err(DisconnectError::fatal(format!(
                    "interest registration rejected: {reason}"
                ))))
            }
            EventHubMessage::Unregistered => Inbound::Ignore,
        }
    }
}

/// Registers interests after every connect.
#[derive(Debug, Clone)]
pub struct EventHubHooks {
    interests: Vec<Interest>,
    response_timeout: Duration,
}

impl EventHubHooks {
    pub fn new(interests: Vec<Interest>, response_timeout: Duration) -> Self {
        Self { interests, response_timeout }
    }

    /// Interests matching the caller's block permission.
    pub fn for_block_events(permit_block_events: bool, response_timeout: Duration) -> Arc<Self> {
        let interest = if permit_block_events { Interest::Block } else { Interest::FilteredBlock };
        Arc::new(Self::new(vec![interest], response_timeout))
    }
}

#[async_trait]
impl ConnectionHooks<EventHubProtocol> for EventHubHooks {
    async fn after_connect(&self, dispatcher: &Dispatcher<EventHubProtocol>) -> Result<(), EventError> {
        debug!(interests = ?self.interests, "registering interests");
        let request = EventHubRequest::RegisterInterest(self.interests.clone());
        match tokio::time::timeout(self.response_timeout, dispatcher.handshake(request)).await {
            Ok(result) => result,
            Err(_) => Err(EventError::Timeout {
                ms: self.response_timeout.as_millis() as u64,
            }),
        }
    }
}
