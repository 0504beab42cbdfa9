//! Block-height aware resolution.
//!
//! Peers lagging the cluster's highest reported block by more than
//! `block_height_lag_threshold` are not eligible. An established connection is
//! only abandoned once its peer lags by more than the larger
//! `reconnect_block_height_lag_threshold`, so the client does not bounce
//! between peers whose heights differ by a block or two.

use std::sync::Arc;

use crate::peer::{max_block_height, Peer};
use crate::resolver::balancer::LoadBalancePolicy;
use crate::resolver::PeerResolver;

pub const DEFAULT_BLOCK_HEIGHT_LAG_THRESHOLD: i64 = 5;
pub const DEFAULT_RECONNECT_BLOCK_HEIGHT_LAG_THRESHOLD: i64 = 10;

pub struct MinBlockHeightResolver {
    balancer: Arc<dyn LoadBalancePolicy>,
    block_height_lag_threshold: i64,
    reconnect_block_height_lag_threshold: i64,
}

impl MinBlockHeightResolver {
    pub fn new(balancer: Arc<dyn LoadBalancePolicy>) -> Self {
        Self {
            balancer,
            block_height_lag_threshold: DEFAULT_BLOCK_HEIGHT_LAG_THRESHOLD,
            reconnect_block_height_lag_threshold: DEFAULT_RECONNECT_BLOCK_HEIGHT_LAG_THRESHOLD,
        }
    }

    /// `-1` disables filtering; `0` keeps only the most up-to-date peers.
    pub fn with_block_height_lag_threshold(mut self, threshold: i64) -> Self {
        self.block_height_lag_threshold = threshold;
        self
    }

    /// `-1` never disconnects a lagging peer.
    pub fn with_reconnect_block_height_lag_threshold(mut self, threshold: i64) -> Self {
        self.reconnect_block_height_lag_threshold = threshold;
        self
    }

    pub(crate) fn balancer(&self) -> &Arc<dyn LoadBalancePolicy> {
        &self.balancer
    }

    /// Peers within the lag threshold of the highest reported height.
    ///
    /// Peers that report no height are kept.
    pub fn filter(&self, peers: &[Peer]) -> Vec<Peer> {
        let Some(cutoff) = cutoff_height(peers, self.block_height_lag_threshold) else {
            return peers.to_vec();
        };
        let eligible: Vec<Peer> = peers
            .iter()
            .filter(|p| p.block_height.map_or(true, |h| h >= cutoff))
            .cloned()
            .collect();
        tracing::debug!(
            cutoff,
            candidates = peers.len(),
            eligible = eligible.len(),
            "filtered peers by block height"
        );
        eligible
    }
}

/// Lowest acceptable height, or `None` when every peer qualifies.
fn cutoff_height(peers: &[Peer], threshold: i64) -> Option<u64> {
    if threshold < 0 {
        return None;
    }
    let lag = threshold as u64;
    let max = max_block_height(peers);
    if max <= lag {
        return None;
    }
    Some(max - lag)
}

impl PeerResolver for MinBlockHeightResolver {
    fn resolve(&self, peers: &[Peer]) -> Option<Peer> {
        self.balancer.choose(&self.filter(peers))
    }

    fn should_disconnect(&self, peers: &[Peer], connected: &Peer) -> bool {
        // Prefer the freshly discovered height of the connected peer.
        let height = peers
            .iter()
            .find(|p| p.url == connected.url)
            .and_then(|p| p.block_height)
            .or(connected.block_height);
        let Some(height) = height else {
            return false;
        };
        let Some(cutoff) = cutoff_height(peers, self.reconnect_block_height_lag_threshold) else {
            return false;
        };
        if height < cutoff {
            tracing::info!(
                peer = %connected.url,
                height,
                cutoff,
                "connected peer is lagging behind the cluster"
            );
            return true;
        }
        false
    }
}
