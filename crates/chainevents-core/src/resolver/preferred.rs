//! Resolution preferring the caller's own organization or a peer allow-list.

use std::collections::HashSet;

use crate::peer::Peer;
use crate::resolver::minblockheight::MinBlockHeightResolver;
use crate::resolver::PeerResolver;

#[derive(Debug, Clone)]
enum Preference {
    Org(String),
    Peers(HashSet<String>),
}

impl Preference {
    fn matches(&self, peer: &Peer) -> bool {
        match self {
            Self::Org(msp_id) => &peer.msp_id == msp_id,
            Self::Peers(urls) => urls.contains(&peer.url),
        }
    }
}

/// Layers a preference on top of block-height filtering.
///
/// Among up-to-date peers, preferred ones are chosen when any qualify;
/// otherwise any up-to-date peer is used.
pub struct PreferredResolver {
    inner: MinBlockHeightResolver,
    preference: Preference,
}

impl PreferredResolver {
    /// Prefer peers of organization `msp_id`.
    pub fn prefer_org(msp_id: impl Into<String>, inner: MinBlockHeightResolver) -> Self {
        Self { inner, preference: Preference::Org(msp_id.into()) }
    }

    /// Prefer the peers with the given URLs.
    pub fn prefer_peers(
        urls: impl IntoIterator<Item = impl Into<String>>,
        inner: MinBlockHeightResolver,
    ) -> Self {
        let urls = urls.into_iter().map(Into::into).collect();
        Self { inner, preference: Preference::Peers(urls) }
    }
}

impl PeerResolver for PreferredResolver {
    fn resolve(&self, peers: &[Peer]) -> Option<Peer> {
        let eligible = self.inner.filter(peers);
        let preferred: Vec<Peer> = eligible
            .iter()
            .filter(|p| self.preference.matches(p))
            .cloned()
            .collect();
        if preferred.is_empty() {
            tracing::debug!(preference = ?self.preference, "no preferred peer is eligible, falling back");
            return self.inner.balancer().choose(&eligible);
        }
        self.inner.balancer().choose(&preferred)
    }

    fn should_disconnect(&self, peers: &[Peer], connected: &Peer) -> bool {
        if self.inner.should_disconnect(peers, connected) {
            return true;
        }
        if self.preference.matches(connected) {
            return false;
        }
        let available = self
            .inner
            .filter(peers)
            .iter()
            .any(|p| self.preference.matches(p));
        if available {
            tracing::info!(peer = %connected.url, "a preferred peer is available");
        }
        available
    }
}
