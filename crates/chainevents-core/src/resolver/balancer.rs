//! Load-balance policies: the final pick among eligible peers.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::peer::Peer;

/// Chooses one peer out of an already-filtered candidate set.
pub trait LoadBalancePolicy: Send + Sync + 'static {
    /// Returns `None` when `peers` is empty.
    fn choose(&self, peers: &[Peer]) -> Option<Peer>;
}

/// Rotates through the candidates in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancePolicy for RoundRobin {
    fn choose(&self, peers: &[Peer]) -> Option<Peer> {
        if peers.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
        tracing::trace!(index = idx, peer = %peers[idx].url, "round-robin choice");
        Some(peers[idx].clone())
    }
}

/// Uniform random choice.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl LoadBalancePolicy for Random {
    fn choose(&self, peers: &[Peer]) -> Option<Peer> {
        if peers.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..peers.len());
        tracing::trace!(index = idx, peer = %peers[idx].url, "random choice");
        Some(peers[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(n: usize) -> Vec<Peer> {
        (0..n).map(|i| Peer::new(format!("grpcs://p{i}:7051"), "Org1MSP")).collect()
    }

    #[test]
    fn round_robin_rotates() {
        let rr = RoundRobin::new();
        let candidates = peers(3);
        let picks: Vec<String> = (0..4).map(|_| rr.choose(&candidates).unwrap().url).collect();
        assert_eq!(
            picks,
            vec!["grpcs://p0:7051", "grpcs://p1:7051", "grpcs://p2:7051", "grpcs://p0:7051"]
        );
    }

    #[test]
    fn empty_set_yields_none() {
        assert!(RoundRobin::new().choose(&[]).is_none());
        assert!(Random.choose(&[]).is_none());
    }

    #[test]
    fn random_stays_in_set() {
        let candidates = peers(5);
        for _ in 0..50 {
            let p = Random.choose(&candidates).unwrap();
            assert!(candidates.contains(&p));
        }
    }
}
