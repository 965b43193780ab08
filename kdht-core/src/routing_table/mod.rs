//! The bitwise routing table: bucket membership, insertion with splitting,
//! and filtered k-closest lookup. Kept ignorant of liveness — callers
//! supply whatever filter they need (`routing_meta` supplies a
//! good/questionable one) — and of everything `net`-shaped.

use crate::types::{Id, Peer, ID_LEN};
use std::collections::HashSet;

/// Bucket capacity ("k" in Kademlia terms).
pub const BUCKET_SIZE: usize = 8;

const ID_BITS: usize = ID_LEN * 8;

/// A bucket's coverage: all peers whose XOR distance from the table's own
/// ID has a leading-zero-bit count in `[lo, hi)`. Two ranges either
/// coincide or are disjoint by construction — the table partitions
/// `[0, ID_BITS]` into contiguous, non-overlapping ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Range {
    pub lo: usize,
    pub hi: usize,
}

impl Range {
    fn contains_prefix(&self, prefix: usize) -> bool {
        prefix >= self.lo && prefix < self.hi
    }

    /// Whether this range's span could contain the table's own ID — the
    /// only bucket eligible to split, since distance-from-self-to-self has
    /// `leading_zero_bits() == ID_BITS`.
    fn covers_self(&self) -> bool {
        self.hi == ID_BITS
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    range: Range,
    members: Vec<Peer>,
}

/// The routing table itself: a partition of the ID space into buckets, each
/// holding up to [`BUCKET_SIZE`] peers.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    own_id: Id,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: Id) -> Self {
        Self {
            own_id,
            buckets: vec![Bucket {
                range: Range { lo: 0, hi: ID_BITS },
                members: Vec::new(),
            }],
        }
    }

    pub fn own_id(&self) -> Id {
        self.own_id
    }

    fn bucket_index_for(&self, id: &Id) -> usize {
        let prefix = self.own_id.distance(id).leading_zero_bits();
        self.buckets
            .iter()
            .position(|b| b.range.contains_prefix(prefix))
            .expect("buckets partition the full ID space")
    }

    pub fn is_member(&self, peer: &Peer) -> bool {
        let idx = self.bucket_index_for(&peer.id);
        self.buckets[idx].members.iter().any(|p| p.id == peer.id)
    }

    pub fn node_list(&self) -> Vec<Peer> {
        self.buckets.iter().flat_map(|b| b.members.clone()).collect()
    }

    pub fn ranges(&self) -> Vec<Range> {
        self.buckets.iter().map(|b| b.range).collect()
    }

    pub fn is_range(&self, range: &Range) -> bool {
        self.buckets.iter().any(|b| &b.range == range)
    }

    pub fn members_of_range(&self, range: &Range) -> Vec<Peer> {
        self.buckets
            .iter()
            .find(|b| &b.range == range)
            .map(|b| b.members.clone())
            .unwrap_or_default()
    }

    pub fn members_of_id(&self, id: &Id) -> Vec<Peer> {
        let idx = self.bucket_index_for(id);
        self.buckets[idx].members.clone()
    }

    /// Insert `peer`. May split the bucket covering the table's own ID when
    /// it is full; returns `true` if the peer ended up a member, `false` if
    /// the table refused it (full, not splittable).
    pub fn insert(&mut self, peer: Peer) -> bool {
        loop {
            let idx = self.bucket_index_for(&peer.id);
            if self.buckets[idx].members.iter().any(|p| p.id == peer.id) {
                return true;
            }
            if self.buckets[idx].members.len() < BUCKET_SIZE {
                self.buckets[idx].members.push(peer);
                return true;
            }
            if self.buckets[idx].range.covers_self() && self.split(idx) {
                continue;
            }
            return false;
        }
    }

    /// Split bucket `idx` at its midpoint. Returns `false` if the bucket
    /// cannot be split further (span of one bit).
    fn split(&mut self, idx: usize) -> bool {
        let range = self.buckets[idx].range;
        if range.hi - range.lo <= 1 {
            return false;
        }
        let mid = range.lo + (range.hi - range.lo) / 2;
        let lower = Range { lo: range.lo, hi: mid };
        let upper = Range { lo: mid, hi: range.hi };

        let members = std::mem::take(&mut self.buckets[idx].members);
        let (lower_members, upper_members): (Vec<_>, Vec<_>) = members.into_iter().partition(|p| {
            self.own_id.distance(&p.id).leading_zero_bits() < mid
        });

        self.buckets[idx] = Bucket {
            range: lower,
            members: lower_members,
        };
        self.buckets.insert(
            idx + 1,
            Bucket {
                range: upper,
                members: upper_members,
            },
        );
        true
    }

    pub fn delete(&mut self, id: &Id) {
        let idx = self.bucket_index_for(id);
        self.buckets[idx].members.retain(|p| &p.id != id);
    }

    /// Up to `k` peers closest to `id` satisfying `filter`, best (closest)
    /// first.
    pub fn closest_to<F>(&self, id: &Id, filter: F, k: usize) -> Vec<Peer>
    where
        F: Fn(&Peer) -> bool,
    {
        let mut seen = HashSet::new();
        let mut candidates: Vec<Peer> = self
            .buckets
            .iter()
            .flat_map(|b| b.members.iter())
            .filter(|p| filter(p) && seen.insert(p.id))
            .cloned()
            .collect();
        candidates.sort_by_key(|p| id.distance(&p.id));
        candidates.truncate(k);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer_for(id: Id) -> Peer {
        Peer::new(id, crate::types::Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881))
    }

    fn id_with_prefix_zero_bits(own: &Id, zero_bits: usize) -> Id {
        // Construct an id whose distance from `own` has exactly `zero_bits`
        // leading zero bits: flip the bit at position `zero_bits`, leave
        // everything before it equal to `own`.
        let mut bytes = own.0;
        if zero_bits < ID_BITS {
            let byte = zero_bits / 8;
            let bit = 7 - (zero_bits % 8);
            bytes[byte] ^= 1 << bit;
        }
        Id(bytes)
    }

    #[test]
    fn insert_and_is_member() {
        let own = Id::random();
        let mut table = RoutingTable::new(own);
        let peer = peer_for(id_with_prefix_zero_bits(&own, 3));
        assert!(table.insert(peer));
        assert!(table.is_member(&peer));
    }

    #[test]
    fn bucket_covering_self_splits_when_full() {
        let own = Id::random();
        let mut table = RoutingTable::new(own);
        // All these ids share no prefix with `own` at bit 0 (farthest
        // bucket), which does *not* cover self, so BUCKET_SIZE+1 inserts
        // into it should refuse once full.
        let far_bucket_peers: Vec<Peer> = (0..BUCKET_SIZE + 1)
            .map(|i| {
                let mut bytes = own.0;
                bytes[0] ^= 0x80; // flip MSB: leading_zero_bits() == 0
                bytes[ID_LEN - 1] = bytes[ID_LEN - 1].wrapping_add(i as u8 + 1);
                peer_for(Id(bytes))
            })
            .collect();
        let mut accepted = 0;
        for p in &far_bucket_peers {
            if table.insert(*p) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, BUCKET_SIZE, "far bucket cannot split, refuses past capacity");

        // The bucket covering self (hi == ID_BITS) should split instead of
        // refusing.
        let close_peers: Vec<Peer> = (0..BUCKET_SIZE + 4)
            .map(|i| id_with_prefix_zero_bits(&own, ID_BITS - 1 - (i % 4)))
            .map(peer_for)
            .collect();
        for p in &close_peers {
            table.insert(*p);
        }
        assert!(table.ranges().len() > 1, "self-covering bucket should have split");
    }

    #[test]
    fn closest_to_orders_by_distance_and_respects_filter() {
        let own = Id::random();
        let mut table = RoutingTable::new(own);
        let near = peer_for(id_with_prefix_zero_bits(&own, ID_BITS - 1));
        let far = peer_for(id_with_prefix_zero_bits(&own, 0));
        table.insert(near);
        table.insert(far);
        let closest = table.closest_to(&own, |_| true, 1);
        assert_eq!(closest, vec![near]);

        let filtered = table.closest_to(&own, |p| p.id != near.id, 2);
        assert_eq!(filtered, vec![far]);
    }
}
