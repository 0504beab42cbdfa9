//! The event dispatcher: a single task that owns every registration.
//!
//! Commands (register, connect, stop, ...) and ledger events (blocks,
//! protocol messages, disconnects) travel through one bounded channel and are
//! handled strictly in arrival order. Registration state is only ever touched
//! by the dispatcher task, so it needs no locks.
//!
//! ```text
//! Dispatcher handle ──Command──┐
//! Connection::receive ─Message─┼─▶ [ event queue ] ─▶ dispatcher task ─▶ subscriber channels
//! peer monitor ─────PeerCheck──┘
//! ```

mod actor;
mod connect;
pub mod publish;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

pub use connect::Connector;
pub use publish::{DispatchMetrics, SendPolicy};

use crate::config::EventServiceConfig;
use crate::connection::Protocol;
use crate::error::{DisconnectError, EventError};
use crate::events::{BlockEvent, CCEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};
use crate::filter::BlockFilter;
use crate::ledger::{Block, FilteredBlock};
use crate::registration::{Registration, RegistrationInfo};
use crate::snapshot::EventSnapshot;

use actor::DispatcherTask;
use publish::Counters;

/// One-shot reply to a command.
pub type Reply<T> = oneshot::Sender<Result<T, EventError>>;

/// Sending half of the dispatcher queue.
pub type EventSender<P> = mpsc::Sender<Event<P>>;

/// Anything the dispatcher task consumes.
pub enum Event<P: Protocol> {
    Command(Command<P>),
    Block(Block),
    FilteredBlock(FilteredBlock),
    /// A protocol message received from the connection.
    Message(P::Message),
    /// The connection was lost.
    Disconnected(DisconnectError),
    /// Periodic re-evaluation of the connected peer.
    PeerCheck,
}

/// Requests handled by the dispatcher task.
pub enum Command<P: Protocol> {
    RegisterBlock {
        filter: Option<BlockFilter>,
        reply: Reply<(Registration, mpsc::Receiver<BlockEvent>)>,
    },
    RegisterFilteredBlock {
        reply: Reply<(Registration, mpsc::Receiver<FilteredBlockEvent>)>,
    },
    RegisterChaincode {
        chaincode_id: String,
        event_filter: String,
        reply: Reply<(Registration, mpsc::Receiver<CCEvent>)>,
    },
    RegisterTxStatus {
        tx_id: String,
        reply: Reply<(Registration, mpsc::Receiver<TxStatusEvent>)>,
    },
    Unregister(Registration),
    RegistrationInfo(Reply<RegistrationInfo>),
    RegisterConnectionEvents {
        sender: mpsc::Sender<ConnectionEvent>,
        reply: Reply<()>,
    },
    Connect(Reply<()>),
    Disconnect(Reply<()>),
    /// Write a request on the live connection.
    Send {
        request: P::Request,
        reply: Reply<()>,
    },
    /// Write a request and wait for the protocol to acknowledge it.
    Handshake {
        request: P::Request,
        reply: Reply<()>,
    },
    Transfer(Reply<EventSnapshot>),
    StopAndTransfer(Reply<EventSnapshot>),
    Stop(Reply<()>),
}

/// Lifecycle of a dispatcher. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    Initial = 0,
    Started = 1,
    Stopped = 2,
}

impl DispatcherState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initial,
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

const NO_BLOCK: u64 = u64::MAX;

/// State visible from both the handle and the dispatcher task.
#[derive(Debug)]
pub(crate) struct Status {
    state: AtomicU8,
    last_block: AtomicU64,
    pub(crate) counters: Arc<Counters>,
}

impl Status {
    fn new(last_block: Option<u64>) -> Self {
        Self {
            state: AtomicU8::new(DispatcherState::Initial as u8),
            last_block: AtomicU64::new(last_block.unwrap_or(NO_BLOCK)),
            counters: Arc::new(Counters::default()),
        }
    }

    pub(crate) fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: DispatcherState, to: DispatcherState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_stopped(&self) {
        self.state.store(DispatcherState::Stopped as u8, Ordering::Release);
    }

    pub(crate) fn set_last_block(&self, number: u64) {
        self.last_block.store(number, Ordering::Release);
    }

    fn last_block(&self) -> Option<u64> {
        match self.last_block.load(Ordering::Acquire) {
            NO_BLOCK => None,
            n => Some(n),
        }
    }
}

/// Tunables of a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of each subscriber channel.
    pub buffer_size: usize,
    /// Capacity of the dispatcher queue.
    pub queue_size: usize,
    pub send_policy: SendPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            queue_size: 100,
            send_policy: SendPolicy::Deadline(Duration::from_millis(500)),
        }
    }
}

impl From<&EventServiceConfig> for DispatcherConfig {
    fn from(config: &EventServiceConfig) -> Self {
        Self {
            buffer_size: config.buffer_size,
            queue_size: config.buffer_size,
            send_policy: config.send_policy(),
        }
    }
}

struct Shared<P: Protocol> {
    status: Arc<Status>,
    tx: EventSender<P>,
    task: Mutex<Option<DispatcherTask<P>>>,
}

/// Handle to a dispatcher. Cheap to clone.
pub struct Dispatcher<P: Protocol> {
    shared: Arc<Shared<P>>,
}

impl<P: Protocol> Clone for Dispatcher<P> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder<P: Protocol> {
    protocol: P,
    config: DispatcherConfig,
    channel_id: String,
    connector: Option<Connector<P>>,
    snapshot: Option<EventSnapshot>,
}

impl<P: Protocol> DispatcherBuilder<P> {
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn channel_id(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = channel_id.into();
        self
    }

    /// Enable connection management.
    pub fn connector(mut self, connector: Connector<P>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Resume the registrations and block position of a predecessor.
    pub fn snapshot(mut self, snapshot: EventSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn build(self) -> Dispatcher<P> {
        let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
        let last_block = self.snapshot.as_ref().and_then(|s| s.last_block_num);
        let status = Arc::new(Status::new(last_block));
        let task = DispatcherTask::new(
            self.protocol,
            self.config,
            self.channel_id,
            self.connector,
            self.snapshot,
            Arc::clone(&status),
            rx,
            tx.downgrade(),
        );
        Dispatcher {
            shared: Arc::new(Shared { status, tx, task: Mutex::new(Some(task)) }),
        }
    }
}

impl<P: Protocol> Dispatcher<P> {
    pub fn builder(protocol: P) -> DispatcherBuilder<P> {
        DispatcherBuilder {
            protocol,
            config: DispatcherConfig::default(),
            channel_id: String::new(),
            connector: None,
            snapshot: None,
        }
    }

    /// Launch the dispatcher task. Must be called from a Tokio runtime.
    pub fn start(&self) -> Result<(), EventError> {
        let status = &self.shared.status;
        if !status.transition(DispatcherState::Initial, DispatcherState::Started) {
            return Err(EventError::InvalidState {
                expected: DispatcherState::Initial.as_str(),
                actual: status.state().as_str(),
            });
        }
        let task = self
            .shared
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(EventError::DispatcherStopped)?;
        tokio::spawn(task.run());
        Ok(())
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.status.state()
    }

    /// Number of the last block accepted, `None` before the first block.
    pub fn last_block_num(&self) -> Option<u64> {
        self.shared.status.last_block()
    }

    pub fn metrics(&self) -> DispatchMetrics {
        self.shared.status.counters.snapshot()
    }

    /// Sender feeding the dispatcher queue. Only available while started.
    pub fn event_sender(&self) -> Result<EventSender<P>, EventError> {
        self.ensure_started()?;
        Ok(self.shared.tx.clone())
    }

    /// Enqueue an event.
    pub async fn submit(&self, event: Event<P>) -> Result<(), EventError> {
        self.ensure_started()?;
        self.shared
            .tx
            .send(event)
            .await
            .map_err(|_| EventError::DispatcherStopped)
    }

    fn ensure_started(&self) -> Result<(), EventError> {
        match self.state() {
            DispatcherState::Started => Ok(()),
            DispatcherState::Stopped => Err(EventError::DispatcherStopped),
            DispatcherState::Initial => Err(EventError::InvalidState {
                expected: DispatcherState::Started.as_str(),
                actual: DispatcherState::Initial.as_str(),
            }),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command<P>) -> Result<T, EventError> {
        let (tx, rx) = oneshot::channel();
        self.submit(Event::Command(command(tx))).await?;
        rx.await.map_err(|_| EventError::DispatcherStopped)?
    }

    /// Register for full blocks accepted by `filter` (all blocks when `None`).
    pub async fn register_block_event(
        &self,
        filter: Option<BlockFilter>,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), EventError> {
        self.request(|reply| Command::RegisterBlock { filter, reply }).await
    }

    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), EventError> {
        self.request(|reply| Command::RegisterFilteredBlock { reply }).await
    }

    /// Register for events of `chaincode_id` whose name matches the regular
    /// expression `event_filter`.
    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String>,
        event_filter: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<CCEvent>), EventError> {
        let chaincode_id = chaincode_id.into();
        let event_filter = event_filter.into();
        self.request(|reply| Command::RegisterChaincode { chaincode_id, event_filter, reply })
            .await
    }

    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), EventError> {
        let tx_id = tx_id.into();
        self.request(|reply| Command::RegisterTxStatus { tx_id, reply }).await
    }

    /// Remove a registration and close its channel. Unknown handles are ignored.
    pub async fn unregister(&self, registration: Registration) -> Result<(), EventError> {
        self.submit(Event::Command(Command::Unregister(registration))).await
    }

    pub async fn registration_info(&self) -> Result<RegistrationInfo, EventError> {
        self.request(Command::RegistrationInfo).await
    }

    /// Route connection up/down notifications to `sender`, replacing any previous one.
    pub async fn register_connection_events(
        &self,
        sender: mpsc::Sender<ConnectionEvent>,
    ) -> Result<(), EventError> {
        self.request(|reply| Command::RegisterConnectionEvents { sender, reply }).await
    }

    pub async fn connect(&self) -> Result<(), EventError> {
        self.request(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), EventError> {
        self.request(Command::Disconnect).await
    }

    pub async fn send(&self, request: P::Request) -> Result<(), EventError> {
        self.request(|reply| Command::Send { request, reply }).await
    }

    pub async fn handshake(&self, request: P::Request) -> Result<(), EventError> {
        self.request(|reply| Command::Handshake { request, reply }).await
    }

    /// Move every registration into a snapshot. The dispatcher keeps running, empty.
    pub async fn transfer(&self) -> Result<EventSnapshot, EventError> {
        self.request(Command::Transfer).await
    }

    /// Move every registration into a snapshot and stop.
    pub async fn stop_and_transfer(&self) -> Result<EventSnapshot, EventError> {
        self.request(Command::StopAndTransfer).await
    }

    /// Close every registration channel and stop. A stopped dispatcher cannot be restarted.
    pub async fn stop(&self) -> Result<(), EventError> {
        self.request(Command::Stop).await
    }
}
