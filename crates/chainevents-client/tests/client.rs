//! Connection state machine integration tests over a mock transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use chainevents_client::{
    Client, ClientOutcome, ClientParams, ConnectionHooks, ConnectionState, NoHooks,
};
use chainevents_core::{
    resolver, Connection, Connector, DisconnectError, Dispatcher, EventError, EventServiceConfig,
    Inbound, Passthrough, StaticDiscovery,
};
use common::{eventually, filtered_block, peer, MockProvider};

const WAIT: Duration = Duration::from_secs(10);

fn client(provider: &Arc<MockProvider<Passthrough>>, params: ClientParams) -> Client<Passthrough> {
    client_with_hooks(provider, params, Arc::new(NoHooks))
}

fn client_with_hooks(
    provider: &Arc<MockProvider<Passthrough>>,
    params: ClientParams,
    hooks: Arc<dyn ConnectionHooks<Passthrough>>,
) -> Client<Passthrough> {
    let connector = Connector::new(
        Arc::new(StaticDiscovery::new(vec![peer()])),
        resolver::from_config(&EventServiceConfig::default()),
        provider.clone(),
    );
    let dispatcher = Dispatcher::builder(Passthrough)
        .channel_id("mychannel")
        .connector(connector)
        .build();
    Client::new(dispatcher, params, hooks).unwrap()
}

fn params() -> ClientParams {
    ClientParams::default().with_time_between_connect_attempts(Duration::from_secs(1))
}

// ─── Connect ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn connect_succeeds_on_third_attempt() {
    let provider = MockProvider::new();
    provider.fail_next(2);
    let client = client(&provider, params().with_max_connect_attempts(3));

    client.connect().await.unwrap();
    assert_eq!(provider.attempts(), 3);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_gives_up_after_max_attempts() {
    let provider = MockProvider::new();
    provider.fail_next(5);
    let client = client(&provider, params().with_max_connect_attempts(2));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, EventError::Connection(_)));
    assert_eq!(provider.attempts(), 2);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    // The client can try again.
    provider.fail_next(0);
    client.connect().await.unwrap();
}

#[tokio::test]
async fn concurrent_connects_only_one_proceeds() {
    let provider = MockProvider::new();
    let client = client(&provider, params());

    let (a, b) = futures::join!(client.connect(), client.connect());
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    assert!(matches!(a.err().or(b.err()), Some(EventError::AlreadyConnected)));
    assert_eq!(provider.attempts(), 1);
    assert!(matches!(client.connect().await, Err(EventError::AlreadyConnected)));
}

// ─── Disconnect handling ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reconnect_disabled_closes_client() {
    let provider = MockProvider::new();
    let client = client(&provider, params().with_reconnect(false));
    client.connect().await.unwrap();
    let (_reg, mut rx) = client.register_filtered_block_event().await.unwrap();

    provider.hang_up(0);

    assert_eq!(timeout(WAIT, client.closed()).await.unwrap(), ClientOutcome::Closed);
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(rx.recv().await.is_none());
    assert_eq!(provider.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_disconnect_closes_client() {
    let provider = MockProvider::new();
    let client = client(&provider, params());
    client.connect().await.unwrap();

    provider
        .push(0, Inbound::Disconnect(DisconnectError::fatal("access denied")))
        .await;

    let outcome = timeout(WAIT, client.closed()).await.unwrap();
    assert_eq!(outcome, ClientOutcome::Fatal(DisconnectError::fatal("access denied")));
    assert!(client.is_closed());
    assert_eq!(provider.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_transient_disconnect() {
    let provider = MockProvider::new();
    let (events_tx, mut events) = mpsc::channel(10);
    let client = client(&provider, params().with_connection_events(events_tx));
    client.connect().await.unwrap();
    let (_reg, mut rx) = client.register_filtered_block_event().await.unwrap();

    provider.hang_up(0);
    eventually(|| {
        provider.attempts() == 2 && client.connection_state() == ConnectionState::Connected
    })
    .await;

    provider.push(1, Inbound::FilteredBlock(filtered_block(1))).await;
    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.filtered_block.number, 1);
    assert_eq!(event.source_url, "grpcs://peer0.org1:7051");
    assert!(client.outcome().is_none());

    assert!(events.recv().await.unwrap().connected);
    let lost = events.recv().await.unwrap();
    assert!(!lost.connected);
    assert!(!lost.is_fatal());
    assert!(events.recv().await.unwrap().connected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_failure_closes_client() {
    let provider = MockProvider::new();
    let client = client(&provider, params().with_max_reconnect_attempts(2));
    client.connect().await.unwrap();

    provider.fail_next(5);
    provider.hang_up(0);

    let outcome = timeout(WAIT, client.closed()).await.unwrap();
    assert!(matches!(outcome, ClientOutcome::ReconnectFailed(_)));
    assert_eq!(provider.attempts(), 3);
}

/// Ends the first connection while the client is still running its
/// after-connect hook.
struct DropFirstConnection {
    provider: Arc<MockProvider<Passthrough>>,
    fatal: bool,
}

#[async_trait]
impl ConnectionHooks<Passthrough> for DropFirstConnection {
    async fn after_connect(&self, _dispatcher: &Dispatcher<Passthrough>) -> Result<(), EventError> {
        if self.provider.attempts() == 1 {
            if self.fatal {
                self.provider
                    .push(0, Inbound::Disconnect(DisconnectError::fatal("forbidden")))
                    .await;
            } else {
                self.provider.hang_up(0);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn connection_lost_during_connect_reconnects() {
    let provider = MockProvider::new();
    let hooks = Arc::new(DropFirstConnection { provider: provider.clone(), fatal: false });
    let client = client_with_hooks(&provider, params(), hooks);
    let (_reg, mut rx) = client.register_filtered_block_event().await.unwrap();

    client.connect().await.unwrap();
    eventually(|| {
        provider.attempts() == 2 && client.connection_state() == ConnectionState::Connected
    })
    .await;
    assert!(provider.connection(0).is_closed());

    provider.push(1, Inbound::FilteredBlock(filtered_block(1))).await;
    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.filtered_block.number, 1);
    assert!(client.outcome().is_none());
}

#[tokio::test(start_paused = true)]
async fn fatal_loss_during_connect_fails_and_closes() {
    let provider = MockProvider::new();
    let hooks = Arc::new(DropFirstConnection { provider: provider.clone(), fatal: true });
    let client = client_with_hooks(&provider, params(), hooks);

    let err = client.connect().await.unwrap_err();
    assert!(err.is_fatal());
    assert!(client.is_closed());
    assert_eq!(
        client.outcome(),
        Some(ClientOutcome::Fatal(DisconnectError::fatal("forbidden")))
    );
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(provider.attempts(), 1);
}

// ─── Close ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_is_idempotent() {
    let provider = MockProvider::new();
    let client = client(&provider, params());
    client.connect().await.unwrap();
    let (_reg, mut rx) = client.register_tx_status_event("tx1").await.unwrap();

    client.close().await.unwrap();
    assert!(matches!(client.close().await, Err(EventError::ClientClosed)));
    assert!(matches!(client.connect().await, Err(EventError::ClientClosed)));
    assert!(rx.recv().await.is_none());
    assert!(provider.connection(0).is_closed());
    assert_eq!(client.outcome(), Some(ClientOutcome::Closed));
}

#[tokio::test]
async fn close_if_idle_respects_registrations() {
    let provider = MockProvider::new();
    let client = client(&provider, params());
    let (reg, _rx) = client.register_tx_status_event("tx1").await.unwrap();

    assert!(!client.close_if_idle().await.unwrap());
    assert!(!client.is_closed());

    client.unregister(reg).await.unwrap();
    assert!(client.close_if_idle().await.unwrap());
    assert!(client.is_closed());
    assert!(matches!(client.close_if_idle().await, Err(EventError::ClientClosed)));
}

#[tokio::test]
async fn block_events_require_permission() {
    let provider = MockProvider::new();
    let client = client(&provider, params());
    assert!(matches!(
        client.register_block_event(None).await,
        Err(EventError::BlockEventsNotPermitted)
    ));
    assert!(client.register_filtered_block_event().await.is_ok());

    let permitted = self::client(&provider, params().permit_block_events(true));
    assert!(permitted.register_block_event(None).await.is_ok());
}

#[tokio::test]
async fn transfer_registrations_keeps_channels_open() {
    let provider = MockProvider::new();
    let client = client(&provider, params());
    let (_reg, mut rx) = client.register_filtered_block_event().await.unwrap();

    let snapshot = client.transfer_registrations(true).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(snapshot.info().filtered_block, 1);

    let successor = Dispatcher::builder(Passthrough).snapshot(snapshot).build();
    successor.start().unwrap();
    successor
        .submit(chainevents_core::Event::FilteredBlock(filtered_block(3)))
        .await
        .unwrap();
    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.filtered_block.number, 3);
}
