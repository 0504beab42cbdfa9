//! Hand-off of dispatcher state to a successor dispatcher.

use crate::registration::{RegistrationInfo, Registrations};

/// All live registrations plus the last block number seen.
///
/// Produced by `transfer` / `stop_and_transfer`. The subscriber channels move
/// with the snapshot: feeding it to a new dispatcher resumes delivery on the
/// same channels. Dropping an unused snapshot closes them.
pub struct EventSnapshot {
    pub(crate) last_block_num: Option<u64>,
    pub(crate) registrations: Registrations,
}

impl EventSnapshot {
    /// Number of the last block the predecessor accepted, if any.
    pub fn last_block_num(&self) -> Option<u64> {
        self.last_block_num
    }

    pub fn info(&self) -> RegistrationInfo {
        self.registrations.info()
    }
}

impl std::fmt::Debug for EventSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSnapshot")
            .field("last_block_num", &self.last_block_num)
            .field("registrations", &self.info())
            .finish()
    }
}
