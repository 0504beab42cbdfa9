//! The event client: connects a dispatcher and keeps it connected.
//!
//! A client owns one [`Dispatcher`]. `connect` drives the dispatcher's
//! connect command through the retry policy and the protocol hooks. The first
//! connect also starts a monitor task that consumes the dispatcher's
//! connection events. When the connection drops, the monitor either
//! reconnects, closes the client (reconnect disabled), or closes it with a
//! fatal outcome (the disconnect was marked fatal).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use chainevents_core::{
    BlockEvent, BlockFilter, CCEvent, ConnectionEvent, DisconnectError, Dispatcher,
    DispatcherState, EventError, EventSnapshot, FilteredBlockEvent, Protocol, Registration,
    RegistrationInfo, TxStatusEvent,
};

use crate::hooks::ConnectionHooks;
use crate::params::ClientParams;
use crate::retry::RetryPolicy;
use crate::state::{AtomicConnectionState, ConnectionState};

const CONNECTION_EVENT_BUFFER: usize = 32;

/// Why a client stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    /// Closed by the caller, or after a disconnect with reconnect disabled.
    Closed,
    /// The event source refused to serve the client any longer.
    Fatal(DisconnectError),
    /// Every reconnect attempt failed.
    ReconnectFailed(String),
}

enum Recovery {
    Reconnect,
    Close(ClientOutcome),
}

struct Inner<P: Protocol> {
    dispatcher: Dispatcher<P>,
    params: ClientParams,
    hooks: Arc<dyn ConnectionHooks<P>>,
    state: AtomicConnectionState,
    closed: AtomicBool,
    monitor_started: AtomicBool,
    /// Connection lost while a connect was still running its hooks.
    pending_loss: Mutex<Option<DisconnectError>>,
    user_events: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
    outcome: watch::Sender<Option<ClientOutcome>>,
}

/// Handle to an event client. Cheap to clone.
pub struct Client<P: Protocol> {
    inner: Arc<Inner<P>>,
}

impl<P: Protocol> Clone for Client<P> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<P: Protocol> Client<P> {
    /// Wrap `dispatcher`, starting it if it has not been started yet.
    pub fn new(
        dispatcher: Dispatcher<P>,
        params: ClientParams,
        hooks: Arc<dyn ConnectionHooks<P>>,
    ) -> Result<Self, EventError> {
        match dispatcher.state() {
            DispatcherState::Initial => dispatcher.start()?,
            DispatcherState::Started => {}
            DispatcherState::Stopped => return Err(EventError::DispatcherStopped),
        }
        let (outcome, _) = watch::channel(None);
        let user_events = Mutex::new(params.connection_events.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                dispatcher,
                params,
                hooks,
                state: AtomicConnectionState::new(),
                closed: AtomicBool::new(false),
                monitor_started: AtomicBool::new(false),
                pending_loss: Mutex::new(None),
                user_events,
                outcome,
            }),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher<P> {
        &self.inner.dispatcher
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.load()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Why the client stopped, `None` while it is open.
    pub fn outcome(&self) -> Option<ClientOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait until the client stops.
    pub async fn closed(&self) -> ClientOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(ClientOutcome::Closed)
    }

    /// Connect to an event source.
    ///
    /// Fails with [`EventError::AlreadyConnected`] while another connect or a
    /// reconnect is in progress, or once connected. If the connection is lost
    /// before the connect completes, the loss is handled like any other: a
    /// fatal one closes the client and fails the connect, a transient one
    /// starts a reconnect.
    pub async fn connect(&self) -> Result<(), EventError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(EventError::ClientClosed);
        }
        if !inner
            .state
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            return Err(EventError::AlreadyConnected);
        }
        if let Err(e) = self.start_monitor().await {
            inner.state.reset();
            return Err(e);
        }

        let policy = inner.params.connect_policy();
        match inner.connect_with_retry(&policy).await {
            Ok(()) => match inner.settle_connected() {
                None => {
                    info!("event client connected");
                    Ok(())
                }
                Some(err) => inner.recover_lost_connect(err).await,
            },
            Err(e) => {
                inner
                    .state
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                warn!(error = %e, "event client failed to connect");
                Err(e)
            }
        }
    }

    async fn start_monitor(&self) -> Result<(), EventError> {
        if self.inner.monitor_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(CONNECTION_EVENT_BUFFER);
        if let Err(e) = self.inner.dispatcher.register_connection_events(tx).await {
            self.inner.monitor_started.store(false, Ordering::Release);
            return Err(e);
        }
        tokio::spawn(monitor(Arc::downgrade(&self.inner), rx));
        Ok(())
    }

    /// Close the client: stop the dispatcher, closing every registration
    /// channel. A second call returns [`EventError::ClientClosed`].
    pub async fn close(&self) -> Result<(), EventError> {
        self.inner.close_with(ClientOutcome::Closed).await
    }

    /// Close the client only if nothing is registered. Returns whether it closed.
    pub async fn close_if_idle(&self) -> Result<bool, EventError> {
        if self.is_closed() {
            return Err(EventError::ClientClosed);
        }
        let info = self.inner.dispatcher.registration_info().await?;
        if info.total > 0 {
            debug!(registrations = info.total, "not closing: client has registrations");
            return Ok(false);
        }
        self.close().await?;
        Ok(true)
    }

    /// Hand the registrations to a successor. With `close`, the client is
    /// closed without closing the subscriber channels.
    pub async fn transfer_registrations(&self, close: bool) -> Result<EventSnapshot, EventError> {
        if self.is_closed() {
            return Err(EventError::ClientClosed);
        }
        if !close {
            return self.inner.dispatcher.transfer().await;
        }
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(EventError::ClientClosed);
        }
        let snapshot = self.inner.dispatcher.stop_and_transfer().await;
        self.inner.finish(ClientOutcome::Closed);
        snapshot
    }

    pub async fn register_block_event(
        &self,
        filter: Option<BlockFilter>,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), EventError> {
        if !self.inner.params.permit_block_events {
            return Err(EventError::BlockEventsNotPermitted);
        }
        self.ensure_open()?;
        self.inner.dispatcher.register_block_event(filter).await
    }

    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), EventError> {
        self.ensure_open()?;
        self.inner.dispatcher.register_filtered_block_event().await
    }

    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String>,
        event_filter: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<CCEvent>), EventError> {
        self.ensure_open()?;
        self.inner
            .dispatcher
            .register_chaincode_event(chaincode_id, event_filter)
            .await
    }

    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String>,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), EventError> {
        self.ensure_open()?;
        self.inner.dispatcher.register_tx_status_event(tx_id).await
    }

    pub async fn unregister(&self, registration: Registration) -> Result<(), EventError> {
        self.ensure_open()?;
        self.inner.dispatcher.unregister(registration).await
    }

    pub async fn registration_info(&self) -> Result<RegistrationInfo, EventError> {
        self.ensure_open()?;
        self.inner.dispatcher.registration_info().await
    }

    fn ensure_open(&self) -> Result<(), EventError> {
        if self.is_closed() {
            Err(EventError::ClientClosed)
        } else {
            Ok(())
        }
    }
}

impl<P: Protocol> Inner<P> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run connect attempts until one succeeds or the policy gives up.
    async fn connect_with_retry(&self, policy: &RetryPolicy) -> Result<(), EventError> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);
            let err = match self.try_connect().await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "connected after retry");
                    }
                    return Ok(());
                }
                Err(e) => e,
            };
            if self.is_closed() || !should_retry(&err) {
                return Err(err);
            }
            let Some(delay) = policy.next_delay(attempt) else {
                return Err(err);
            };
            warn!(
                attempt,
                max_attempts = policy.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "connect attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn try_connect(&self) -> Result<(), EventError> {
        self.pending_loss.lock().unwrap_or_else(|e| e.into_inner()).take();
        let timeout = self.params.response_timeout;
        match tokio::time::timeout(timeout, self.dispatcher.connect()).await {
            Err(_) => {
                // The dispatcher may still complete the connect; undo it once it does.
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move {
                    let _ = dispatcher.disconnect().await;
                });
                Err(EventError::Timeout { ms: timeout.as_millis() as u64 })
            }
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => {
                if let Err(e) = self.hooks.after_connect(&self.dispatcher).await {
                    warn!(error = %e, "after-connect hook failed, disconnecting");
                    let _ = self.dispatcher.disconnect().await;
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn forward(&self, event: &ConnectionEvent) {
        let guard = self.user_events.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(event.clone()).is_err() {
                warn!(connected = event.connected, "connection event dropped: listener not keeping up");
            }
        }
    }

    /// Move out of `Connecting` once the connect attempts succeeded. Returns
    /// the loss recorded while the hooks ran, leaving the state `Disconnected`.
    fn settle_connected(&self) -> Option<DisconnectError> {
        let mut pending = self.pending_loss.lock().unwrap_or_else(|e| e.into_inner());
        let lost = pending.take();
        let next = if lost.is_some() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        };
        self.state.transition(ConnectionState::Connecting, next);
        lost
    }

    /// A connect succeeded but its connection was already gone. Fails when
    /// the client had to close because of it.
    async fn recover_lost_connect(self: &Arc<Self>, err: DisconnectError) -> Result<(), EventError> {
        warn!(error = %err, "connection lost while connecting");
        let _ = self.dispatcher.disconnect().await;
        match self.recovery_for(err.clone()) {
            Recovery::Close(outcome) => {
                let _ = self.close_with(outcome).await;
                Err(EventError::Disconnected(err))
            }
            Recovery::Reconnect => {
                tokio::spawn(Arc::clone(self).reconnect());
                Ok(())
            }
        }
    }

    fn recovery_for(&self, err: DisconnectError) -> Recovery {
        if err.fatal {
            error!(error = %err, "fatal disconnect, closing event client");
            return Recovery::Close(ClientOutcome::Fatal(err));
        }
        if !self.params.reconnect {
            info!(error = %err, "disconnected and reconnect is disabled, closing event client");
            return Recovery::Close(ClientOutcome::Closed);
        }
        warn!(error = %err, "event client disconnected, reconnecting");
        Recovery::Reconnect
    }

    /// Runs on the monitor task, which must keep draining connection events,
    /// so the follow-up work is spawned.
    fn handle_lost_connection(self: Arc<Self>, err: DisconnectError) {
        {
            let mut pending = self.pending_loss.lock().unwrap_or_else(|e| e.into_inner());
            if !self
                .state
                .transition(ConnectionState::Connected, ConnectionState::Disconnected)
            {
                if self.state.load() == ConnectionState::Connecting {
                    debug!(error = %err, "connection lost during connect, deferring");
                    if !pending.as_ref().is_some_and(|p| p.fatal) {
                        *pending = Some(err);
                    }
                } else {
                    debug!(state = %self.state.load(), error = %err, "disconnect while not connected");
                }
                return;
            }
        }
        match self.recovery_for(err) {
            Recovery::Close(outcome) => {
                tokio::spawn(async move {
                    let _ = self.close_with(outcome).await;
                });
            }
            Recovery::Reconnect => {
                tokio::spawn(self.reconnect());
            }
        }
    }

    async fn reconnect(self: Arc<Self>) {
        loop {
            if self.is_closed() {
                return;
            }
            if !self
                .state
                .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
            {
                debug!(state = %self.state.load(), "reconnect skipped");
                return;
            }
            // A stale loss report can leave the dispatcher connected.
            let _ = self.dispatcher.disconnect().await;
            self.hooks.before_reconnect(&self.dispatcher).await;

            let delay = self.params.reconnect_initial_delay;
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::time::sleep(delay).await;
            }

            let policy = self.params.reconnect_policy();
            match self.connect_with_retry(&policy).await {
                Ok(()) => {
                    let Some(err) = self.settle_connected() else {
                        info!("event client reconnected");
                        return;
                    };
                    let _ = self.dispatcher.disconnect().await;
                    match self.recovery_for(err) {
                        Recovery::Reconnect => continue,
                        Recovery::Close(outcome) => {
                            let _ = self.close_with(outcome).await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.state
                        .transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                    if self.is_closed() {
                        return;
                    }
                    error!(error = %e, "reconnect failed, closing event client");
                    let _ = self.close_with(ClientOutcome::ReconnectFailed(e.to_string())).await;
                    return;
                }
            }
        }
    }

    async fn close_with(&self, outcome: ClientOutcome) -> Result<(), EventError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("event client already closed");
            return Err(EventError::ClientClosed);
        }
        info!(outcome = ?outcome, "closing event client");
        let result = match self.dispatcher.stop().await {
            Err(EventError::DispatcherStopped) => Ok(()),
            other => other,
        };
        self.finish(outcome);
        result
    }

    fn finish(&self, outcome: ClientOutcome) {
        self.user_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.state.reset();
        self.outcome.send_replace(Some(outcome));
    }
}

fn should_retry(err: &EventError) -> bool {
    !err.is_fatal()
        && !matches!(
            err,
            EventError::ClientClosed | EventError::DispatcherStopped | EventError::AlreadyConnected
        )
}

async fn monitor<P: Protocol>(inner: Weak<Inner<P>>, mut rx: mpsc::Receiver<ConnectionEvent>) {
    debug!("connection monitor started");
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        inner.forward(&event);
        if event.connected {
            continue;
        }
        match event.err {
            Some(err) => inner.handle_lost_connection(err),
            None => debug!("connection closed on request"),
        }
    }
    debug!("connection monitor exited");
}
