//! Subscriber registrations.
//!
//! A registration pairs an interest (all blocks, filtered blocks, a chaincode
//! event pattern or a single transaction) with the sending half of the
//! subscriber's channel. Dropping the registration drops the sender, which
//! closes the subscriber's channel exactly once.

use std::collections::HashMap;

use regex::Regex;
use tokio::sync::mpsc;

use crate::error::EventError;
use crate::events::{BlockEvent, CCEvent, FilteredBlockEvent, TxStatusEvent};
use crate::filter::BlockFilter;

/// Identity assigned to each registration by the dispatcher.
pub type RegistrationId = u64;

/// Handle returned by a register call; pass it back to unregister.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Registration {
    Block(RegistrationId),
    FilteredBlock(RegistrationId),
    Chaincode {
        id: RegistrationId,
        chaincode_id: String,
        event_filter: String,
    },
    TxStatus {
        id: RegistrationId,
        tx_id: String,
    },
}

impl Registration {
    pub fn id(&self) -> RegistrationId {
        match self {
            Self::Block(id) | Self::FilteredBlock(id) => *id,
            Self::Chaincode { id, .. } | Self::TxStatus { id, .. } => *id,
        }
    }
}

/// Interest in every block accepted by `filter`.
pub struct BlockRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) filter: Option<BlockFilter>,
    pub(crate) sender: mpsc::Sender<BlockEvent>,
}

impl BlockRegistration {
    pub(crate) fn accepts(&self, block: &crate::ledger::Block) -> bool {
        self.filter.as_ref().map_or(true, |f| f(block))
    }
}

/// Interest in every filtered block.
pub struct FilteredBlockRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) sender: mpsc::Sender<FilteredBlockEvent>,
}

/// Interest in events of one chaincode whose name matches a pattern.
pub struct ChaincodeRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) chaincode_id: String,
    pub(crate) event_filter: String,
    pub(crate) regex: Regex,
    pub(crate) sender: mpsc::Sender<CCEvent>,
}

impl ChaincodeRegistration {
    pub(crate) fn matches(&self, chaincode_id: &str, event_name: &str) -> bool {
        self.chaincode_id == chaincode_id && self.regex.is_match(event_name)
    }

    fn key(&self) -> String {
        chaincode_key(&self.chaincode_id, &self.event_filter)
    }
}

/// Interest in the commit status of a single transaction.
pub struct TxStatusRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) sender: mpsc::Sender<TxStatusEvent>,
}

/// Outstanding registrations, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub total: usize,
    pub block: usize,
    pub filtered_block: usize,
    pub chaincode: usize,
    pub tx_status: usize,
}

fn chaincode_key(chaincode_id: &str, event_filter: &str) -> String {
    format!("{chaincode_id}/{event_filter}")
}

/// Compile a chaincode event-name filter.
pub(crate) fn compile_event_filter(chaincode_id: &str, filter: &str) -> Result<Regex, EventError> {
    Regex::new(filter).map_err(|e| EventError::InvalidEventFilter {
        chaincode_id: chaincode_id.to_string(),
        filter: filter.to_string(),
        reason: e.to_string(),
    })
}

/// The registration table owned by the dispatcher task.
#[derive(Default)]
pub(crate) struct Registrations {
    next_id: RegistrationId,
    pub(crate) block: Vec<BlockRegistration>,
    pub(crate) filtered_block: Vec<FilteredBlockRegistration>,
    pub(crate) chaincode: HashMap<String, ChaincodeRegistration>,
    pub(crate) tx_status: HashMap<String, TxStatusRegistration>,
}

impl Registrations {
    pub(crate) fn next_id(&mut self) -> RegistrationId {
        self.next_id += 1;
        self.next_id
    }

    pub(crate) fn add_block(
        &mut self,
        filter: Option<BlockFilter>,
        sender: mpsc::Sender<BlockEvent>,
    ) -> Registration {
        let id = self.next_id();
        self.block.push(BlockRegistration { id, filter, sender });
        Registration::Block(id)
    }

    pub(crate) fn add_filtered_block(
        &mut self,
        sender: mpsc::Sender<FilteredBlockEvent>,
    ) -> Registration {
        let id = self.next_id();
        self.filtered_block.push(FilteredBlockRegistration { id, sender });
        Registration::FilteredBlock(id)
    }

    pub(crate) fn add_chaincode(
        &mut self,
        chaincode_id: &str,
        event_filter: &str,
        sender: mpsc::Sender<CCEvent>,
    ) -> Result<Registration, EventError> {
        let key = chaincode_key(chaincode_id, event_filter);
        if self.chaincode.contains_key(&key) {
            return Err(EventError::DuplicateChaincodeRegistration {
                chaincode_id: chaincode_id.to_string(),
                event_filter: event_filter.to_string(),
            });
        }
        let regex = compile_event_filter(chaincode_id, event_filter)?;
        let id = self.next_id();
        self.chaincode.insert(
            key,
            ChaincodeRegistration {
                id,
                chaincode_id: chaincode_id.to_string(),
                event_filter: event_filter.to_string(),
                regex,
                sender,
            },
        );
        Ok(Registration::Chaincode {
            id,
            chaincode_id: chaincode_id.to_string(),
            event_filter: event_filter.to_string(),
        })
    }

    pub(crate) fn add_tx_status(
        &mut self,
        tx_id: &str,
        sender: mpsc::Sender<TxStatusEvent>,
    ) -> Result<Registration, EventError> {
        if self.tx_status.contains_key(tx_id) {
            return Err(EventError::DuplicateTxRegistration(tx_id.to_string()));
        }
        let id = self.next_id();
        self.tx_status.insert(
            tx_id.to_string(),
            TxStatusRegistration { id, sender },
        );
        Ok(Registration::TxStatus { id, tx_id: tx_id.to_string() })
    }

    /// Remove a registration, dropping its sender. Returns `false` if the
    /// handle does not refer to a live registration.
    pub(crate) fn remove(&mut self, reg: &Registration) -> bool {
        match reg {
            Registration::Block(id) => {
                let before = self.block.len();
                self.block.retain(|r| r.id != *id);
                self.block.len() != before
            }
            Registration::FilteredBlock(id) => {
                let before = self.filtered_block.len();
                self.filtered_block.retain(|r| r.id != *id);
                self.filtered_block.len() != before
            }
            Registration::Chaincode { id, chaincode_id, event_filter } => {
                let key = chaincode_key(chaincode_id, event_filter);
                match self.chaincode.get(&key) {
                    Some(r) if r.id == *id => self.chaincode.remove(&key).is_some(),
                    _ => false,
                }
            }
            Registration::TxStatus { id, tx_id } => match self.tx_status.get(tx_id) {
                Some(r) if r.id == *id => self.tx_status.remove(tx_id).is_some(),
                _ => false,
            },
        }
    }

    pub(crate) fn info(&self) -> RegistrationInfo {
        let block = self.block.len();
        let filtered_block = self.filtered_block.len();
        let chaincode = self.chaincode.len();
        let tx_status = self.tx_status.len();
        RegistrationInfo {
            total: block + filtered_block + chaincode + tx_status,
            block,
            filtered_block,
            chaincode,
            tx_status,
        }
    }

    /// Returns `true` if any registration consumes the filtered view of a block.
    pub(crate) fn wants_filtered_view(&self) -> bool {
        !self.filtered_block.is_empty() || !self.chaincode.is_empty() || !self.tx_status.is_empty()
    }

    /// Move every registration out, leaving the table empty.
    pub(crate) fn take(&mut self) -> Registrations {
        Registrations {
            next_id: self.next_id,
            block: std::mem::take(&mut self.block),
            filtered_block: std::mem::take(&mut self.filtered_block),
            chaincode: std::mem::take(&mut self.chaincode),
            tx_status: std::mem::take(&mut self.tx_status),
        }
    }

    /// Install registrations carried over from a predecessor dispatcher.
    pub(crate) fn seed(&mut self, other: Registrations) {
        self.next_id = self.next_id.max(other.next_id);
        self.block.extend(other.block);
        self.filtered_block.extend(other.filtered_block);
        for reg in other.chaincode.into_values() {
            self.chaincode.insert(reg.key(), reg);
        }
        self.tx_status.extend(other.tx_status);
    }

    /// Drop every registration, closing all subscriber channels.
    pub(crate) fn clear(&mut self) {
        self.block.clear();
        self.filtered_block.clear();
        self.chaincode.clear();
        self.tx_status.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_tx_registration_rejected() {
        let mut regs = Registrations::default();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, mut rx2) = mpsc::channel(1);

        let first = regs.add_tx_status("tx1", tx1).unwrap();
        let err = regs.add_tx_status("tx1", tx2).unwrap_err();
        assert!(matches!(err, EventError::DuplicateTxRegistration(ref id) if id == "tx1"));
        // The rejected sender was dropped, the original stays installed.
        assert!(rx2.try_recv().is_err());
        assert_eq!(regs.info().tx_status, 1);
        assert!(regs.remove(&first));
    }

    #[test]
    fn duplicate_chaincode_registration_rejected() {
        let mut regs = Registrations::default();
        let (tx, _rx) = mpsc::channel(1);
        regs.add_chaincode("cc1", "evt.*", tx.clone()).unwrap();
        assert!(regs.add_chaincode("cc1", "evt.*", tx.clone()).is_err());
        // Same chaincode, different filter is a different key.
        assert!(regs.add_chaincode("cc1", "other", tx).is_ok());
        assert_eq!(regs.info().chaincode, 2);
    }

    #[test]
    fn invalid_regex_not_installed() {
        let mut regs = Registrations::default();
        let (tx, _rx) = mpsc::channel(1);
        let err = regs.add_chaincode("cc1", "evt(", tx).unwrap_err();
        assert!(matches!(err, EventError::InvalidEventFilter { .. }));
        assert_eq!(regs.info().total, 0);
    }

    #[test]
    fn unregister_closes_channel() {
        let mut regs = Registrations::default();
        let (tx, mut rx) = mpsc::channel(1);
        let reg = regs.add_filtered_block(tx);
        assert!(regs.remove(&reg));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        // Second removal of the same handle is a no-op.
        assert!(!regs.remove(&reg));
    }

    #[test]
    fn stale_tx_handle_does_not_remove_newer_registration() {
        let mut regs = Registrations::default();
        let (tx, _rx) = mpsc::channel(1);
        let old = regs.add_tx_status("tx1", tx.clone()).unwrap();
        assert!(regs.remove(&old));
        let _new = regs.add_tx_status("tx1", tx).unwrap();
        assert!(!regs.remove(&old));
        assert_eq!(regs.info().tx_status, 1);
    }

    #[test]
    fn take_and_seed_preserve_registrations() {
        let mut regs = Registrations::default();
        let (btx, _brx) = mpsc::channel(1);
        let (ctx, _crx) = mpsc::channel(1);
        regs.add_block(None, btx);
        regs.add_chaincode("cc1", "evt.*", ctx).unwrap();

        let taken = regs.take();
        assert_eq!(regs.info().total, 0);

        let mut successor = Registrations::default();
        successor.seed(taken);
        assert_eq!(successor.info().total, 2);
        assert!(successor.next_id() > 2);
    }
}
