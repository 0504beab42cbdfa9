//! Mock transport shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use chainevents_core::{
    Connection, ConnectionProvider, Event, EventError, EventSender, Peer, Protocol,
};
use chainevents_core::{DisconnectError, FilteredBlock};
use chainevents_core::ledger::{ChaincodeEvent, FilteredTransaction, HeaderType, TxValidationCode};

pub fn peer() -> Peer {
    Peer::new("grpcs://peer0.org1:7051", "Org1MSP")
}

pub fn filtered_block(number: u64) -> FilteredBlock {
    FilteredBlock {
        channel_id: "mychannel".into(),
        number,
        filtered_transactions: vec![FilteredTransaction {
            tx_id: format!("tx{number}"),
            header_type: HeaderType::EndorserTransaction,
            validation_code: TxValidationCode::Valid,
            chaincode_events: vec![ChaincodeEvent {
                chaincode_id: "mycc".into(),
                tx_id: format!("tx{number}"),
                event_name: "transfer".into(),
                payload: vec![],
            }],
        }],
    }
}

/// Poll `cond` until it holds, failing the test after a while.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not met in time");
}

pub struct MockConnection<P: Protocol> {
    feed: tokio::sync::Mutex<mpsc::Receiver<P::Message>>,
    sent: Mutex<Vec<P::Request>>,
    closed: AtomicBool,
}

#[async_trait]
impl<P: Protocol> Connection<P> for MockConnection<P> {
    async fn send(&self, request: P::Request) -> Result<(), EventError> {
        if self.is_closed() {
            return Err(EventError::Connection("connection closed".into()));
        }
        self.sent.lock().unwrap().push(request);
        Ok(())
    }

    async fn receive(&self, events: EventSender<P>) {
        let mut feed = self.feed.lock().await;
        while let Some(message) = feed.recv().await {
            if events.send(Event::Message(message)).await.is_err() {
                return;
            }
        }
        if !self.is_closed() {
            let _ = events
                .send(Event::Disconnected(DisconnectError::transient("stream terminated")))
                .await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct Link<P: Protocol> {
    conn: Arc<MockConnection<P>>,
    feed: Option<mpsc::Sender<P::Message>>,
}

/// Opens [`MockConnection`]s, optionally failing the next few dials.
pub struct MockProvider<P: Protocol> {
    fail_next: AtomicU32,
    attempts: AtomicU32,
    links: Mutex<Vec<Link<P>>>,
}

impl<P: Protocol> MockProvider<P> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            links: Mutex::new(vec![]),
        })
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection<P>> {
        Arc::clone(&self.links.lock().unwrap()[index].conn)
    }

    pub fn sent(&self, index: usize) -> Vec<P::Request>
    where
        P::Request: Clone,
    {
        let links = self.links.lock().unwrap();
        links
            .get(index)
            .map(|link| link.conn.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Deliver `message` on the `index`-th connection.
    pub async fn push(&self, index: usize, message: P::Message) {
        let feed = self.links.lock().unwrap()[index]
            .feed
            .clone()
            .expect("connection already hung up");
        feed.send(message).await.expect("connection is not receiving");
    }

    /// End the `index`-th stream as if the remote end went away.
    pub fn hang_up(&self, index: usize) {
        self.links.lock().unwrap()[index].feed.take();
    }
}

#[async_trait]
impl<P: Protocol> ConnectionProvider<P> for MockProvider<P> {
    async fn connect(
        &self,
        _channel_id: &str,
        _peer: &Peer,
    ) -> Result<Arc<dyn Connection<P>>, EventError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EventError::Connection("dial refused".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(MockConnection {
            feed: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
        });
        self.links.lock().unwrap().push(Link { conn: Arc::clone(&conn), feed: Some(tx) });
        Ok(conn)
    }
}
