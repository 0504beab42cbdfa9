//! The dispatcher task: registration handling and publishing.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::connect::{ActiveConnection, Connector};
use super::publish::{Counters, Publisher};
use super::{Command, DispatcherConfig, Event, Reply, Status};
use crate::connection::{Inbound, Protocol};
use crate::error::EventError;
use crate::events::{BlockEvent, CCEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};
use crate::ledger::{Block, FilteredBlock};
use crate::registration::Registrations;
use crate::snapshot::EventSnapshot;

pub(crate) struct DispatcherTask<P: Protocol> {
    pub(super) protocol: P,
    pub(super) config: DispatcherConfig,
    pub(super) channel_id: String,
    pub(super) status: Arc<Status>,
    pub(super) publisher: Publisher,
    pub(super) registrations: Registrations,
    pub(super) last_block_num: Option<u64>,
    pub(super) rx: mpsc::Receiver<Event<P>>,
    pub(super) weak_tx: mpsc::WeakSender<Event<P>>,
    pub(super) connector: Option<Connector<P>>,
    pub(super) connection: Option<ActiveConnection<P>>,
    pub(super) connection_events: Option<mpsc::Sender<ConnectionEvent>>,
    pub(super) pending_handshake: Option<Reply<()>>,
    seed: Option<EventSnapshot>,
}

impl<P: Protocol> DispatcherTask<P> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        protocol: P,
        config: DispatcherConfig,
        channel_id: String,
        connector: Option<Connector<P>>,
        seed: Option<EventSnapshot>,
        status: Arc<Status>,
        rx: mpsc::Receiver<Event<P>>,
        weak_tx: mpsc::WeakSender<Event<P>>,
    ) -> Self {
        let publisher = Publisher::new(config.send_policy, Arc::clone(&status.counters));
        Self {
            protocol,
            config,
            channel_id,
            publisher,
            registrations: Registrations::default(),
            last_block_num: seed.as_ref().and_then(|s| s.last_block_num),
            status,
            rx,
            weak_tx,
            connector,
            connection: None,
            connection_events: None,
            pending_handshake: None,
            seed,
        }
    }

    pub(super) async fn run(mut self) {
        if let Some(snapshot) = self.seed.take() {
            let info = snapshot.info();
            info!(
                registrations = info.total,
                last_block = ?snapshot.last_block_num,
                "resuming registrations from snapshot"
            );
            self.registrations.seed(snapshot.registrations);
        }
        debug!(protocol = self.protocol.name(), "dispatcher started");

        while let Some(event) = self.rx.recv().await {
            if self.handle(event).await.is_break() {
                break;
            }
        }

        self.shutdown();
        debug!(protocol = self.protocol.name(), "dispatcher stopped");
    }

    async fn handle(&mut self, event: Event<P>) -> ControlFlow<()> {
        match event {
            Event::Command(command) => return self.handle_command(command).await,
            Event::Block(block) => self.handle_block(block).await,
            Event::FilteredBlock(fblock) => self.handle_filtered_block(fblock).await,
            Event::Message(message) => {
                let inbound = self.protocol.translate(message);
                self.handle_inbound(inbound).await;
            }
            Event::Disconnected(err) => self.handle_disconnected(err).await,
            Event::PeerCheck => self.handle_peer_check().await,
        }
        ControlFlow::Continue(())
    }

    async fn handle_command(&mut self, command: Command<P>) -> ControlFlow<()> {
        match command {
            Command::RegisterBlock { filter, reply } => {
                let (tx, rx) = mpsc::channel(self.config.buffer_size);
                let reg = self.registrations.add_block(filter, tx);
                debug!(registration = ?reg, "registered for block events");
                let _ = reply.send(Ok((reg, rx)));
            }
            Command::RegisterFilteredBlock { reply } => {
                let (tx, rx) = mpsc::channel(self.config.buffer_size);
                let reg = self.registrations.add_filtered_block(tx);
                debug!(registration = ?reg, "registered for filtered block events");
                let _ = reply.send(Ok((reg, rx)));
            }
            Command::RegisterChaincode { chaincode_id, event_filter, reply } => {
                let (tx, rx) = mpsc::channel(self.config.buffer_size);
                let result = self
                    .registrations
                    .add_chaincode(&chaincode_id, &event_filter, tx)
                    .map(|reg| (reg, rx));
                if let Err(e) = &result {
                    warn!(chaincode_id, event_filter, error = %e, "chaincode registration rejected");
                }
                let _ = reply.send(result);
            }
            Command::RegisterTxStatus { tx_id, reply } => {
                let (tx, rx) = mpsc::channel(self.config.buffer_size);
                let result = self
                    .registrations
                    .add_tx_status(&tx_id, tx)
                    .map(|reg| (reg, rx));
                if let Err(e) = &result {
                    warn!(tx_id, error = %e, "tx status registration rejected");
                }
                let _ = reply.send(result);
            }
            Command::Unregister(reg) => {
                if self.registrations.remove(&reg) {
                    debug!(registration = ?reg, "unregistered");
                } else {
                    warn!(registration = ?reg, "unregister: no such registration");
                }
            }
            Command::RegistrationInfo(reply) => {
                let _ = reply.send(Ok(self.registrations.info()));
            }
            Command::RegisterConnectionEvents { sender, reply } => {
                self.connection_events = Some(sender);
                let _ = reply.send(Ok(()));
            }
            Command::Connect(reply) => {
                let result = self.handle_connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                let result = self.handle_disconnect().await;
                let _ = reply.send(result);
            }
            Command::Send { request, reply } => {
                let result = self.send_request(request).await;
                let _ = reply.send(result);
            }
            Command::Handshake { request, reply } => self.handle_handshake(request, reply).await,
            Command::Transfer(reply) => {
                let _ = reply.send(Ok(self.take_snapshot()));
            }
            Command::StopAndTransfer(reply) => {
                let snapshot = self.take_snapshot();
                self.shutdown();
                let _ = reply.send(Ok(snapshot));
                return ControlFlow::Break(());
            }
            Command::Stop(reply) => {
                info!(registrations = self.registrations.info().total, "stopping dispatcher");
                self.shutdown();
                let _ = reply.send(Ok(()));
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Block(block) => self.handle_block(block).await,
            Inbound::FilteredBlock(fblock) => self.handle_filtered_block(fblock).await,
            Inbound::HandshakeAck(result) => self.complete_handshake(result).await,
            Inbound::Disconnect(err) => self.handle_disconnected(err).await,
            Inbound::Ignore => {}
        }
    }

    fn take_snapshot(&mut self) -> EventSnapshot {
        let snapshot = EventSnapshot {
            last_block_num: self.last_block_num,
            registrations: self.registrations.take(),
        };
        info!(
            registrations = snapshot.info().total,
            last_block = ?snapshot.last_block_num,
            "transferred registrations"
        );
        snapshot
    }

    /// Close the connection and every subscriber channel.
    fn shutdown(&mut self) {
        self.teardown_connection();
        if let Some(reply) = self.pending_handshake.take() {
            let _ = reply.send(Err(EventError::DispatcherStopped));
        }
        self.registrations.clear();
        self.connection_events = None;
        self.status.set_stopped();
    }

    /// Accept `number` as the newest block. Returns `false` for a stale or repeated block.
    fn update_last_block_num(&mut self, number: u64) -> bool {
        match self.last_block_num {
            Some(last) if number <= last => {
                Counters::incr(&self.status.counters.out_of_order_blocks);
                warn!(
                    expected_above = last,
                    received = number,
                    "discarding out-of-order block"
                );
                false
            }
            _ => {
                self.last_block_num = Some(number);
                self.status.set_last_block(number);
                true
            }
        }
    }

    pub(super) fn source_url(&self) -> String {
        self.connection
            .as_ref()
            .map(|c| c.peer.url.clone())
            .unwrap_or_default()
    }

    async fn handle_block(&mut self, block: Block) {
        if !self.update_last_block_num(block.number) {
            return;
        }
        Counters::incr(&self.status.counters.blocks_received);
        debug!(number = block.number, txs = block.transactions.len(), "received block");

        let source_url = self.source_url();
        let block = Arc::new(block);
        for reg in &self.registrations.block {
            if !reg.accepts(&block) {
                continue;
            }
            let event = BlockEvent { block: Arc::clone(&block), source_url: source_url.clone() };
            self.publisher.publish("block", &reg.sender, event).await;
        }

        if self.registrations.wants_filtered_view() {
            self.publish_filtered(block.to_filtered(), &source_url).await;
        }
    }

    async fn handle_filtered_block(&mut self, fblock: FilteredBlock) {
        if !self.update_last_block_num(fblock.number) {
            return;
        }
        Counters::incr(&self.status.counters.filtered_blocks_received);
        debug!(
            number = fblock.number,
            txs = fblock.filtered_transactions.len(),
            "received filtered block"
        );
        let source_url = self.source_url();
        self.publish_filtered(fblock, &source_url).await;
    }

    async fn publish_filtered(&self, fblock: FilteredBlock, source_url: &str) {
        let fblock = Arc::new(fblock);
        for reg in &self.registrations.filtered_block {
            let event = FilteredBlockEvent {
                filtered_block: Arc::clone(&fblock),
                source_url: source_url.to_string(),
            };
            self.publisher.publish("filtered_block", &reg.sender, event).await;
        }

        for ftx in &fblock.filtered_transactions {
            if let Some(reg) = self.registrations.tx_status.get(&ftx.tx_id) {
                let event = TxStatusEvent {
                    tx_id: ftx.tx_id.clone(),
                    validation_code: ftx.validation_code,
                    block_number: fblock.number,
                    source_url: source_url.to_string(),
                };
                self.publisher.publish("tx_status", &reg.sender, event).await;
            }

            if !ftx.validation_code.is_valid() {
                if !ftx.chaincode_events.is_empty() {
                    debug!(
                        tx_id = %ftx.tx_id,
                        code = %ftx.validation_code,
                        "not publishing chaincode events of invalid transaction"
                    );
                }
                continue;
            }

            for cc_event in &ftx.chaincode_events {
                for reg in self.registrations.chaincode.values() {
                    if !reg.matches(&cc_event.chaincode_id, &cc_event.event_name) {
                        continue;
                    }
                    let event = CCEvent {
                        chaincode_id: cc_event.chaincode_id.clone(),
                        event_name: cc_event.event_name.clone(),
                        tx_id: cc_event.tx_id.clone(),
                        payload: cc_event.payload.clone(),
                        block_number: fblock.number,
                        source_url: source_url.to_string(),
                    };
                    self.publisher.publish("chaincode", &reg.sender, event).await;
                }
            }
        }
    }
}
