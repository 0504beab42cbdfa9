//! Block filters for block registrations.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ledger::{Block, HeaderType};

/// Predicate deciding whether a block is published to a block registration.
pub type BlockFilter = Arc<dyn Fn(&Block) -> bool + Send + Sync>;

/// Accept every block.
pub fn accept_all() -> BlockFilter {
    Arc::new(|_| true)
}

/// Accept blocks containing at least one transaction of the given header types.
pub fn header_types(types: impl IntoIterator<Item = HeaderType>) -> BlockFilter {
    let types: HashSet<HeaderType> = types.into_iter().collect();
    Arc::new(move |block: &Block| {
        block
            .transactions
            .iter()
            .any(|tx| types.contains(&tx.header_type))
    })
}
