//! Connection handling for the dispatcher task.
//!
//! On connect the dispatcher asks discovery for candidates, lets the resolver
//! pick one, opens a connection through the provider and spawns a task that
//! drains the connection back into the dispatcher queue. When a peer monitor
//! period is configured, a second task periodically enqueues
//! [`Event::PeerCheck`] so the resolver can move the stream to a healthier peer.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::actor::DispatcherTask;
use super::{Event, Reply};
use crate::connection::{Connection, ConnectionProvider, Protocol};
use crate::error::{DisconnectError, EventError};
use crate::events::ConnectionEvent;
use crate::peer::{DiscoveryService, Peer};
use crate::resolver::PeerResolver;

/// Collaborators the dispatcher needs to open connections.
pub struct Connector<P: Protocol> {
    pub discovery: Arc<dyn DiscoveryService>,
    pub resolver: Arc<dyn PeerResolver>,
    pub provider: Arc<dyn ConnectionProvider<P>>,
    /// Re-evaluate the connected peer this often; zero disables the monitor.
    pub peer_monitor_period: Duration,
}

impl<P: Protocol> Connector<P> {
    pub fn new(
        discovery: Arc<dyn DiscoveryService>,
        resolver: Arc<dyn PeerResolver>,
        provider: Arc<dyn ConnectionProvider<P>>,
    ) -> Self {
        Self {
            discovery,
            resolver,
            provider,
            peer_monitor_period: Duration::ZERO,
        }
    }

    pub fn with_peer_monitor_period(mut self, period: Duration) -> Self {
        self.peer_monitor_period = period;
        self
    }
}

pub(crate) struct ActiveConnection<P: Protocol> {
    pub(crate) conn: Arc<dyn Connection<P>>,
    pub(crate) peer: Peer,
    receiver: JoinHandle<()>,
    monitor: Option<JoinHandle<()>>,
}

impl<P: Protocol> DispatcherTask<P> {
    pub(super) async fn handle_connect(&mut self) -> Result<(), EventError> {
        if self.connection.is_some() {
            return Err(EventError::AlreadyConnected);
        }
        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| EventError::Connection("no connection provider configured".into()))?;

        let peers = connector.discovery.peers().await?;
        if peers.is_empty() {
            return Err(EventError::NoPeers);
        }
        let peer = connector
            .resolver
            .resolve(&peers)
            .ok_or(EventError::NoPeerResolved { candidates: peers.len() })?;

        debug!(peer = %peer, channel = %self.channel_id, "opening event connection");
        let conn = connector.provider.connect(&self.channel_id, &peer).await?;

        let Some(tx) = self.weak_tx.upgrade() else {
            conn.close();
            return Err(EventError::DispatcherStopped);
        };
        let receiver = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.receive(tx).await })
        };
        let monitor = (!connector.peer_monitor_period.is_zero())
            .then(|| self.spawn_peer_monitor(connector.peer_monitor_period));

        info!(peer = %peer.url, protocol = self.protocol.name(), "event connection established");
        self.connection = Some(ActiveConnection { conn, peer, receiver, monitor });
        self.notify_connection(ConnectionEvent::connected()).await;
        Ok(())
    }

    fn spawn_peer_monitor(&self, period: Duration) -> JoinHandle<()> {
        let weak_tx = self.weak_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(tx) = weak_tx.upgrade() else { break };
                if tx.send(Event::PeerCheck).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Disconnect requested by the client.
    pub(super) async fn handle_disconnect(&mut self) -> Result<(), EventError> {
        if self.connection.is_none() {
            return Err(EventError::NotConnected);
        }
        info!(peer = %self.source_url(), "closing event connection");
        self.teardown_connection();
        self.fail_handshake(EventError::NotConnected);
        self.notify_connection(ConnectionEvent::disconnected(None)).await;
        Ok(())
    }

    /// Connection lost, or torn down in favour of another peer.
    pub(super) async fn handle_disconnected(&mut self, err: DisconnectError) {
        if self.connection.is_none() {
            debug!(error = %err, "ignoring disconnect: not connected");
            return;
        }
        warn!(peer = %self.source_url(), error = %err, fatal = err.fatal, "event connection lost");
        self.teardown_connection();
        self.fail_handshake(EventError::Disconnected(err.clone()));
        self.notify_connection(ConnectionEvent::disconnected(Some(err))).await;
    }

    pub(super) async fn handle_peer_check(&mut self) {
        let (Some(connector), Some(active)) = (&self.connector, &self.connection) else {
            return;
        };
        let peers = match connector.discovery.peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!(error = %e, "peer monitor: discovery failed");
                return;
            }
        };
        if connector.resolver.should_disconnect(&peers, &active.peer) {
            let err = DisconnectError::transient(format!(
                "peer [{}] is no longer the preferred event source",
                active.peer.url
            ));
            self.handle_disconnected(err).await;
        }
    }

    pub(super) async fn send_request(&mut self, request: P::Request) -> Result<(), EventError> {
        let active = self.connection.as_ref().ok_or(EventError::NotConnected)?;
        active.conn.send(request).await
    }

    pub(super) async fn handle_handshake(&mut self, request: P::Request, reply: Reply<()>) {
        if self.pending_handshake.is_some() {
            let _ = reply.send(Err(EventError::Other("handshake already in progress".into())));
            return;
        }
        match self.send_request(request).await {
            Ok(()) => self.pending_handshake = Some(reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    pub(super) async fn complete_handshake(&mut self, result: Result<(), DisconnectError>) {
        match self.pending_handshake.take() {
            Some(reply) => {
                let _ = reply.send(result.clone().map_err(EventError::from));
            }
            None => warn!("handshake acknowledgement without a pending handshake"),
        }
        if let Err(err) = result {
            self.handle_disconnected(err).await;
        }
    }

    fn fail_handshake(&mut self, err: EventError) {
        if let Some(reply) = self.pending_handshake.take() {
            let _ = reply.send(Err(err));
        }
    }

    pub(super) fn teardown_connection(&mut self) {
        if let Some(active) = self.connection.take() {
            active.conn.close();
            active.receiver.abort();
            if let Some(monitor) = active.monitor {
                monitor.abort();
            }
        }
    }

    async fn notify_connection(&self, event: ConnectionEvent) {
        if let Some(sender) = &self.connection_events {
            self.publisher.publish("connection", sender, event).await;
        }
    }
}
