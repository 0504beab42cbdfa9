//! Peer resolvers: which peer to (re)connect to, and when to leave one.
//!
//! | Strategy | Candidates | Leaves the connected peer when |
//! |---|---|---|
//! | [`Balanced`] | all peers | never |
//! | [`MinBlockHeightResolver`] | peers within the lag threshold | it lags by more than the reconnect threshold |
//! | [`PreferredResolver`] | preferred up-to-date peers, else any up-to-date peer | it lags, or a preferred peer is available |

pub mod balancer;
pub mod minblockheight;
pub mod preferred;

use std::sync::Arc;

pub use balancer::{LoadBalancePolicy, Random, RoundRobin};
pub use minblockheight::MinBlockHeightResolver;
pub use preferred::PreferredResolver;

use crate::config::{BalancerKind, EventServiceConfig, ResolverStrategy};
use crate::peer::Peer;

/// Chooses the event-source peer out of the discovered candidates.
pub trait PeerResolver: Send + Sync + 'static {
    /// Returns `None` if no peer is suitable (including an empty candidate set).
    fn resolve(&self, peers: &[Peer]) -> Option<Peer>;

    /// Returns `true` if the connection to `connected` should be torn down in
    /// favour of a better peer.
    fn should_disconnect(&self, peers: &[Peer], connected: &Peer) -> bool;
}

/// Plain load balancing with no health criteria.
pub struct Balanced {
    balancer: Arc<dyn LoadBalancePolicy>,
}

impl Balanced {
    pub fn new(balancer: Arc<dyn LoadBalancePolicy>) -> Self {
        Self { balancer }
    }
}

impl PeerResolver for Balanced {
    fn resolve(&self, peers: &[Peer]) -> Option<Peer> {
        self.balancer.choose(peers)
    }

    fn should_disconnect(&self, _peers: &[Peer], _connected: &Peer) -> bool {
        false
    }
}

/// Build the resolver selected by `config`.
pub fn from_config(config: &EventServiceConfig) -> Arc<dyn PeerResolver> {
    let balancer: Arc<dyn LoadBalancePolicy> = match config.balancer {
        BalancerKind::RoundRobin => Arc::new(RoundRobin::new()),
        BalancerKind::Random => Arc::new(Random),
    };
    let min_height = || {
        MinBlockHeightResolver::new(balancer.clone())
            .with_block_height_lag_threshold(config.block_height_lag_threshold)
            .with_reconnect_block_height_lag_threshold(config.reconnect_block_height_lag_threshold)
    };
    match config.resolver_strategy {
        ResolverStrategy::Balanced => Arc::new(Balanced::new(balancer.clone())),
        ResolverStrategy::MinBlockHeight => Arc::new(min_height()),
        ResolverStrategy::PreferOrg => {
            Arc::new(PreferredResolver::prefer_org(config.msp_id.clone(), min_height()))
        }
        ResolverStrategy::PreferPeer => Arc::new(PreferredResolver::prefer_peers(
            config.preferred_peers.clone(),
            min_height(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<Peer> {
        vec![
            Peer::new("grpcs://org1-p0:7051", "Org1MSP").with_block_height(10),
            Peer::new("grpcs://org2-p0:7051", "Org2MSP").with_block_height(100),
        ]
    }

    #[test]
    fn balanced_never_disconnects() {
        let r = Balanced::new(Arc::new(RoundRobin::new()));
        let p = peers();
        assert!(r.resolve(&p).is_some());
        assert!(!r.should_disconnect(&p, &p[0]));
    }

    #[test]
    fn factory_builds_configured_strategy() {
        let config = EventServiceConfig {
            resolver_strategy: ResolverStrategy::PreferOrg,
            msp_id: "Org1MSP".into(),
            block_height_lag_threshold: -1,
            ..Default::default()
        };
        let r = from_config(&config);
        assert_eq!(r.resolve(&peers()).unwrap().msp_id, "Org1MSP");

        let config = EventServiceConfig {
            resolver_strategy: ResolverStrategy::MinBlockHeight,
            ..Default::default()
        };
        let r = from_config(&config);
        assert_eq!(r.resolve(&peers()).unwrap().msp_id, "Org2MSP");
    }
}
