//! Candidate event-source peers and the discovery seam that supplies them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// A node that can serve the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    pub url: String,
    pub msp_id: String,
    /// Ledger height last reported by discovery. May be stale.
    #[serde(default)]
    pub block_height: Option<u64>,
}

impl Peer {
    pub fn new(url: impl Into<String>, msp_id: impl Into<String>) -> Self {
        Self { url: url.into(), msp_id: msp_id.into(), block_height: None }
    }

    pub fn with_block_height(mut self, height: u64) -> Self {
        self.block_height = Some(height);
        self
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.block_height {
            Some(h) => write!(f, "{} ({}, height {})", self.url, self.msp_id, h),
            None => write!(f, "{} ({})", self.url, self.msp_id),
        }
    }
}

/// Supplies the candidate set the peer resolver chooses from.
#[async_trait]
pub trait DiscoveryService: Send + Sync + 'static {
    async fn peers(&self) -> Result<Vec<Peer>, EventError>;
}

/// Discovery over a fixed peer list.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    peers: Vec<Peer>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl DiscoveryService for StaticDiscovery {
    async fn peers(&self) -> Result<Vec<Peer>, EventError> {
        Ok(self.peers.clone())
    }
}

/// Highest reported block height across `peers`, 0 if none report one.
pub fn max_block_height(peers: &[Peer]) -> u64 {
    peers.iter().filter_map(|p| p.block_height).max().unwrap_or(0)
}
