//! The deliver protocol: a seek request opens the stream, the server replies
//! with blocks (or filtered blocks) and a closing status.
//!
//! After every connect the client writes a [`SeekInfo`]. Before a reconnect
//! the seek position moves to the block after the last one received, so a
//! reconnected stream resumes where the old one stopped.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use chainevents_core::{
    resolver, Block, ConnectionProvider, Connector, DisconnectError, DiscoveryService,
    Dispatcher, DispatcherConfig, EventError, EventServiceConfig, FilteredBlock, Inbound,
    Protocol,
};

use crate::client::Client;
use crate::hooks::ConnectionHooks;
use crate::params::ClientParams;

/// Where a stream starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeekType {
    Oldest,
    Newest,
    FromBlock(u64),
}

/// Which block representation the stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverMode {
    Block,
    #[default]
    FilteredBlock,
}

/// The request opening a deliver stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekInfo {
    pub seek: SeekType,
    pub mode: DeliverMode,
}

/// Status closing a deliver stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverStatus {
    Success,
    BadRequest,
    Forbidden,
    NotFound,
    RequestEntityTooLarge,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
    Other(i32),
}

impl DeliverStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            200 => Self::Success,
            400 => Self::BadRequest,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            413 => Self::RequestEntityTooLarge,
            500 => Self::InternalServerError,
            501 => Self::NotImplemented,
            503 => Self::ServiceUnavailable,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Success => 200,
            Self::BadRequest => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::RequestEntityTooLarge => 413,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for DeliverStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// A message on the deliver stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverResponse {
    Block(Block),
    FilteredBlock(FilteredBlock),
    Status(DeliverStatus),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeliverProtocol {
    mode: DeliverMode,
}

impl DeliverProtocol {
    pub fn new(mode: DeliverMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DeliverMode {
        self.mode
    }
}

impl Protocol for DeliverProtocol {
    type Message = DeliverResponse;
    type Request = SeekInfo;

    fn name(&self) -> &'static str {
        "deliver"
    }

    fn translate(&mut self, message: DeliverResponse) -> Inbound {
        match message {
            DeliverResponse::Block(block) => Inbound::Block(block),
            DeliverResponse::FilteredBlock(fblock) => Inbound::FilteredBlock(fblock),
            DeliverResponse::Status(DeliverStatus::Success) => {
                debug!("deliver stream reported success");
                Inbound::Ignore
            }
            DeliverResponse::Status(status) => {
                warn!(%status, "deliver server returned an error status, disconnecting");
                let message = format!("got error status from deliver server: {status}");
                if status == DeliverStatus::Forbidden {
                    Inbound::Disconnect(DisconnectError::fatal(message))
                } else {
                    Inbound::Disconnect(DisconnectError::transient(message))
                }
            }
        }
    }
}

/// Seeks after connect and moves the seek position before reconnect.
#[derive(Debug)]
pub struct DeliverHooks {
    mode: DeliverMode,
    seek: Mutex<SeekType>,
}

impl DeliverHooks {
    pub fn new(mode: DeliverMode, seek: SeekType) -> Self {
        Self { mode, seek: Mutex::new(seek) }
    }

    pub fn seek(&self) -> SeekType {
        *self.seek.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConnectionHooks<DeliverProtocol> for DeliverHooks {
    async fn after_connect(&self, dispatcher: &Dispatcher<DeliverProtocol>) -> Result<(), EventError> {
        let request = SeekInfo { seek: self.seek(), mode: self.mode };
        debug!(seek = ?request.seek, mode = ?request.mode, "sending seek request");
        dispatcher.send(request).await
    }

    async fn before_reconnect(&self, dispatcher: &Dispatcher<DeliverProtocol>) {
        let next = match dispatcher.last_block_num() {
            Some(last) => SeekType::FromBlock(last + 1),
            None => SeekType::Newest,
        };
        debug!(seek = ?next, "resuming deliver stream on reconnect");
        *self.seek.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }
}

/// Build a deliver client from `config`, starting its dispatcher.
pub fn new_client(
    config: &EventServiceConfig,
    channel_id: impl Into<String>,
    discovery: Arc<dyn DiscoveryService>,
    provider: Arc<dyn ConnectionProvider<DeliverProtocol>>,
    mode: DeliverMode,
    seek: SeekType,
) -> Result<Client<DeliverProtocol>, EventError> {
    config.validate()?;
    let connector = Connector::new(discovery, resolver::from_config(config), provider)
        .with_peer_monitor_period(config.peer_monitor_period());
    let dispatcher = Dispatcher::builder(DeliverProtocol::new(mode))
        .config(DispatcherConfig::from(config))
        .channel_id(channel_id)
        .connector(connector)
        .build();
    let params = ClientParams::from(config).permit_block_events(mode == DeliverMode::Block);
    Client::new(dispatcher, params, Arc::new(DeliverHooks::new(mode, seek)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_status_is_fatal() {
        let mut protocol = DeliverProtocol::new(DeliverMode::FilteredBlock);
        match protocol.translate(DeliverResponse::Status(DeliverStatus::Forbidden)) {
            Inbound::Disconnect(err) => {
                assert!(err.fatal);
                assert!(err.message.contains("Forbidden(403)"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn other_error_status_is_transient() {
        let mut protocol = DeliverProtocol::default();
        let status = DeliverStatus::from_code(503);
        assert_eq!(status, DeliverStatus::ServiceUnavailable);
        match protocol.translate(DeliverResponse::Status(status)) {
            Inbound::Disconnect(err) => assert!(!err.fatal),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn success_status_is_ignored() {
        let mut protocol = DeliverProtocol::default();
        assert_eq!(
            protocol.translate(DeliverResponse::Status(DeliverStatus::Success)),
            Inbound::Ignore
        );
    }

    #[test]
    fn unknown_codes_round_trip() {
        assert_eq!(DeliverStatus::from_code(418).code(), 418);
    }

    #[test]
    fn seek_type_from_config() {
        let seek: SeekType = serde_json::from_str(r#"{"from_block": 42}"#).unwrap();
        assert_eq!(seek, SeekType::FromBlock(42));
        let seek: SeekType = serde_json::from_str(r#""newest""#).unwrap();
        assert_eq!(seek, SeekType::Newest);
    }
}
