//! `state`: the policy actor that owns [`RoutingMeta`] and is the only
//! thing `net` ever reaches through. A cloneable handle over
//! `Arc<Mutex<RoutingMeta>>`, the same shape the teacher uses for its
//! manager-style collaborators (one shared owner, many cheap handles).

use crate::config::RoutingMetaConfig;
use crate::error::RoutingError;
use crate::routing_meta::{RangeState, RoutingMeta, RoutingMetaEvent};
use crate::routing_table::{Range, RoutingTable};
use crate::types::{Id, Peer};
use kdht_tools::Clock;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::instrument;

#[derive(Clone)]
pub struct StateHandle<C: Clock> {
    inner: Arc<Mutex<RoutingMeta<C>>>,
}

impl<C: Clock> StateHandle<C> {
    /// Build the handle and return the receiver for range-refresh timer
    /// events; the caller (the node's top-level wiring) owns driving that
    /// receiver, since acting on `NeedsRefresh` means calling back into
    /// `net`, which `state` has no reference to.
    pub fn new(
        table: RoutingTable,
        clock: C,
        config: RoutingMetaConfig,
    ) -> (Self, mpsc::Receiver<RoutingMetaEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let meta = RoutingMeta::new(table, clock, tx, config);
        (
            Self {
                inner: Arc::new(Mutex::new(meta)),
            },
            rx,
        )
    }

    pub fn node_id(&self) -> Id {
        self.inner.lock().own_id()
    }

    pub fn closest_to(&self, id: &Id, k: usize) -> Vec<Peer> {
        self.inner.lock().neighbors(id, k)
    }

    /// Insert a freshly-observed peer. A refusal (table full, already a
    /// member) is not an error here — unsolicited traffic is opportunistic,
    /// not a command that must succeed.
    #[instrument(level = "trace", skip(self, peer), fields(peer = ?peer.id))]
    pub fn insert_node(&self, peer: Peer) {
        let mut inner = self.inner.lock();
        if !inner.is_member(&peer.id) {
            if let Err(err) = inner.insert(peer) {
                tracing::debug!(?err, "declined to insert observed peer");
            }
        }
    }

    /// Record the outcome of a request to `peer`: success confirms
    /// reachability, failure increments its timeout count.
    pub fn notify(&self, peer: Peer, request_success: bool) {
        let mut inner = self.inner.lock();
        if request_success {
            inner.node_touch(peer.id, true);
        } else {
            inner.node_timeout(peer.id);
        }
    }

    pub fn range_state(&self, range: &Range) -> Result<RangeState, RoutingError> {
        self.inner.lock().range_state(range)
    }

    pub fn range_members(&self, range: &Range) -> Vec<Peer> {
        self.inner.lock().range_members(range)
    }

    /// Bucket-mates of a node id — the substitute pool when replacing a bad
    /// neighbor.
    pub fn range_members_of(&self, id: &Id) -> Vec<Peer> {
        self.inner.lock().range_members_of(id)
    }

    pub fn reset_range_timer(&self, range: Range, force: bool) -> Result<(), RoutingError> {
        self.inner.lock().reset_range_timer(range, force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;
    use kdht_tools::SystemClock;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn insert_then_closest_to_finds_it() {
        let own = Id::random();
        let table = RoutingTable::new(own);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let peer = Peer::new(Id::random(), Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881));
        state.insert_node(peer);
        assert!(state.closest_to(&peer.id, 8).contains(&peer));
    }

    #[test]
    fn range_members_of_surfaces_bucket_mates() {
        let own = Id::random();
        let table = RoutingTable::new(own);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let peer = Peer::new(Id::random(), Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881));
        state.insert_node(peer);
        assert!(state.range_members_of(&peer.id).contains(&peer));
    }

    #[test]
    fn notify_failure_then_success_recovers_liveness() {
        let own = Id::random();
        let table = RoutingTable::new(own);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let peer = Peer::new(Id::random(), Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881));
        state.insert_node(peer);
        state.notify(peer, false);
        state.notify(peer, false);
        state.notify(peer, false);
        // three failures push it to bad; closest_to (good+questionable only)
        // must no longer surface it.
        assert!(!state.closest_to(&peer.id, 8).contains(&peer));
        state.notify(peer, true);
        assert!(state.closest_to(&peer.id, 8).contains(&peer));
    }
}
