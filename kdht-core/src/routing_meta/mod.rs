//! Routing metadata: wraps a [`RoutingTable`] with per-node activity and
//! per-range refresh timers, yielding BEP-5 good/questionable/bad liveness
//! and range-refresh decisions. Owned exclusively by whichever actor
//! processes its timer-expiry events (`state`, in this crate) — nothing
//! here is `Send`-shared across tasks.

use crate::config::RoutingMetaConfig;
use crate::error::RoutingError;
use crate::routing_table::{Range, RoutingTable};
use crate::types::{Id, Peer};
use kdht_tools::{Clock, Timestamp, TimestampDuration, TimerRef};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::instrument;

/// BEP-5 liveness classification, derived on read from `(last_activity,
/// timeout_count)` — never stored directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Good,
    Questionable(TimestampDuration),
    Bad,
}

impl Liveness {
    pub fn is_bad(&self) -> bool {
        matches!(self, Liveness::Bad)
    }
}

/// Outcome of [`RoutingMeta::range_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    Empty,
    Ok,
    NeedsRefresh(Id),
}

/// A message delivered by a range's refresh timer. The owning actor is
/// expected to call [`RoutingMeta::range_state`] and act on the result —
/// metadata never rearms a range timer on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMetaEvent {
    InactiveRange(Range),
}

#[derive(Debug, Clone, Copy)]
struct NodeEntry {
    last_activity: Timestamp,
    timeout_count: u32,
    reachable: bool,
}

struct RangeEntry {
    last_activity: Timestamp,
    timer_ref: TimerRef,
}

pub struct RoutingMeta<C: Clock> {
    own_id: Id,
    table: RoutingTable,
    nodes: HashMap<Id, NodeEntry>,
    ranges: HashMap<Range, RangeEntry>,
    clock: C,
    events_tx: mpsc::Sender<RoutingMetaEvent>,
    config: RoutingMetaConfig,
}

impl<C: Clock> RoutingMeta<C> {
    /// Build metadata over an existing table. Every current range gets a
    /// fresh `RANGE_TIMEOUT` timer from `now`; every current node is
    /// initialized as "stale but not bad" (`last_activity = now -
    /// NODE_TIMEOUT`, `reachable = false`), since membership alone doesn't
    /// establish reachability.
    pub fn new(
        table: RoutingTable,
        clock: C,
        events_tx: mpsc::Sender<RoutingMetaEvent>,
        config: RoutingMetaConfig,
    ) -> Self {
        let own_id = table.own_id();
        let now = clock.monotonic_time();
        let node_timeout = TimestampDuration::from_secs(config.node_timeout_secs);
        let range_timeout = TimestampDuration::from_secs(config.range_timeout_secs);

        let mut nodes = HashMap::new();
        for peer in table.node_list() {
            nodes.insert(
                peer.id,
                NodeEntry {
                    last_activity: stale_since(now, node_timeout),
                    timeout_count: 0,
                    reachable: false,
                },
            );
        }

        let mut ranges = HashMap::new();
        for range in table.ranges() {
            let timer_ref = arm_range_timer(&clock, &events_tx, range, now, now, range_timeout);
            ranges.insert(
                range,
                RangeEntry {
                    last_activity: now,
                    timer_ref,
                },
            );
        }

        Self {
            own_id,
            table,
            nodes,
            ranges,
            clock,
            events_tx,
            config,
        }
    }

    pub fn own_id(&self) -> Id {
        self.own_id
    }

    pub fn is_member(&self, id: &Id) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_list(&self) -> Vec<Peer> {
        self.table.node_list()
    }

    pub fn range_members(&self, range: &Range) -> Vec<Peer> {
        self.table.members_of_range(range)
    }

    /// The bucket-mates of a node id: everyone sharing its range, including
    /// `id` itself if it is a member. Useful for picking a substitute when
    /// replacing a bad node with one of its own neighbors.
    pub fn range_members_of(&self, id: &Id) -> Vec<Peer> {
        self.table.members_of_id(id)
    }

    fn node_timeout_duration(&self) -> TimestampDuration {
        TimestampDuration::from_secs(self.config.node_timeout_secs)
    }

    fn range_timeout_duration(&self) -> TimestampDuration {
        TimestampDuration::from_secs(self.config.range_timeout_secs)
    }

    /// `now - last_activity`, panicking with the time-warp-future invariant
    /// violation if `last_activity` is somehow in the future.
    fn age_since(&self, last_activity: Timestamp) -> TimestampDuration {
        let now = self.clock.monotonic_time();
        now.checked_sub(last_activity)
            .expect("monotonic clock ran backwards past a recorded last_activity")
    }

    #[instrument(level = "debug", skip(self), fields(peer = ?peer.id))]
    pub fn insert(&mut self, peer: Peer) -> Result<(), RoutingError> {
        debug_assert!(!self.is_member(&peer.id), "insert precondition: not already a member");

        let old_ranges = self.table.ranges();
        if !self.table.insert(peer) {
            return Err(RoutingError::NotInserted);
        }
        if !self.table.is_member(&peer) {
            return Err(RoutingError::NotInserted);
        }

        let now = self.clock.monotonic_time();
        self.nodes.insert(
            peer.id,
            NodeEntry {
                last_activity: now,
                timeout_count: 0,
                reachable: false,
            },
        );

        let new_ranges = self.table.ranges();
        let range_timeout = self.range_timeout_duration();

        for removed in old_ranges.iter().filter(|r| !new_ranges.contains(r)) {
            if let Some(entry) = self.ranges.remove(removed) {
                entry.timer_ref.cancel();
            }
        }
        for added in new_ranges.iter().filter(|r| !old_ranges.contains(r)) {
            let members = self.table.members_of_range(added);
            let oldest = self.oldest_activity(&members, now);
            let timer_ref = arm_range_timer(&self.clock, &self.events_tx, *added, oldest, now, range_timeout);
            self.ranges.insert(
                *added,
                RangeEntry {
                    last_activity: oldest,
                    timer_ref,
                },
            );
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(old = ?old, new = ?new.id))]
    pub fn replace(&mut self, old: Id, new: Peer) -> Result<(), RoutingError> {
        if !self.liveness(&old).map(|l| l.is_bad()).unwrap_or(false) {
            return Err(RoutingError::PreconditionNotBad);
        }
        if self.is_member(&new.id) {
            return Err(RoutingError::PreconditionAlreadyMember);
        }
        self.table.delete(&old);
        self.nodes.remove(&old);
        self.insert(new)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn remove(&mut self, id: Id) -> Result<(), RoutingError> {
        if !self.liveness(&id).map(|l| l.is_bad()).unwrap_or(false) {
            return Err(RoutingError::PreconditionNotBad);
        }
        self.table.delete(&id);
        self.nodes.remove(&id);
        Ok(())
    }

    /// `reachable=true` is a confirmed touch and always overwrites.
    /// `reachable=false` only refreshes a node that was already confirmed
    /// reachable; an unsolicited inbound from an unverified peer does not
    /// upgrade it (see the open question on this in the design notes).
    pub fn node_touch(&mut self, id: Id, reachable: bool) {
        let now = self.clock.monotonic_time();
        if reachable {
            self.nodes.insert(
                id,
                NodeEntry {
                    last_activity: now,
                    timeout_count: 0,
                    reachable: true,
                },
            );
        } else if let Some(entry) = self.nodes.get_mut(&id) {
            if entry.reachable {
                entry.last_activity = now;
                entry.timeout_count = 0;
            }
        }
    }

    pub fn node_timeout(&mut self, id: Id) {
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.timeout_count += 1;
        }
    }

    pub fn reset_range_timer(&mut self, range: Range, force: bool) -> Result<(), RoutingError> {
        if !self.ranges.contains_key(&range) {
            return Err(RoutingError::NotMember);
        }
        let now = self.clock.monotonic_time();
        let members = self.table.members_of_range(&range);
        let new_last_activity = if force { now } else { self.oldest_activity(&members, now) };
        let range_timeout = self.range_timeout_duration();
        let timer_ref = arm_range_timer(&self.clock, &self.events_tx, range, new_last_activity, now, range_timeout);
        if let Some(old) = self.ranges.insert(
            range,
            RangeEntry {
                last_activity: new_last_activity,
                timer_ref,
            },
        ) {
            old.timer_ref.cancel();
        }
        Ok(())
    }

    /// BEP-5 liveness derivation. `None` if `id` is not a known node.
    pub fn liveness(&self, id: &Id) -> Option<Liveness> {
        let entry = self.nodes.get(id)?;
        if entry.timeout_count > self.config.bad_timeout_count {
            return Some(Liveness::Bad);
        }
        let age = self.age_since(entry.last_activity);
        let node_timeout = self.node_timeout_duration();
        Some(if age.as_u64() < node_timeout.as_u64() {
            Liveness::Good
        } else {
            Liveness::Questionable(TimestampDuration::new(age.as_u64() - node_timeout.as_u64()))
        })
    }

    pub fn range_state(&self, range: &Range) -> Result<RangeState, RoutingError> {
        if !self.table.is_range(range) {
            return Err(RoutingError::NotMember);
        }
        let members = self.table.members_of_range(range);
        if members.is_empty() {
            return Ok(RangeState::Empty);
        }
        let newest = members
            .iter()
            .filter_map(|p| self.nodes.get(&p.id).map(|e| e.last_activity))
            .max()
            .unwrap_or_else(|| self.clock.monotonic_time());
        let age = self.age_since(newest);
        let range_timeout = self.range_timeout_duration();
        if age.as_u64() <= range_timeout.as_u64() {
            Ok(RangeState::Ok)
        } else {
            let chosen = members
                .choose(&mut rand::thread_rng())
                .expect("checked non-empty above");
            Ok(RangeState::NeedsRefresh(chosen.id))
        }
    }

    /// Up to `k` peers closest to `id`: `good` peers first (closest
    /// within-class first), then enough `questionable` ones to make up the
    /// shortfall. `bad` peers never appear.
    pub fn neighbors(&self, id: &Id, k: usize) -> Vec<Peer> {
        let mut good = self
            .table
            .closest_to(id, |p| matches!(self.liveness(&p.id), Some(Liveness::Good)), k);
        if good.len() < k {
            let shortfall = k - good.len();
            let questionable = self.table.closest_to(
                id,
                |p| matches!(self.liveness(&p.id), Some(Liveness::Questionable(_))),
                shortfall,
            );
            good.extend(questionable);
        }
        good
    }

    fn oldest_activity(&self, members: &[Peer], fallback: Timestamp) -> Timestamp {
        members
            .iter()
            .filter_map(|p| self.nodes.get(&p.id).map(|e| e.last_activity))
            .min()
            .unwrap_or(fallback)
    }
}

fn stale_since(now: Timestamp, node_timeout: TimestampDuration) -> Timestamp {
    Timestamp::new(now.as_u64().saturating_sub(node_timeout.as_u64()))
}

/// `mk_timer(start, interval, msg)`: arm a timer firing after
/// `max(0, interval - (now - start))`, so a range whose `last_activity` is
/// already old fires near-immediately rather than waiting a full interval.
fn arm_range_timer<C: Clock>(
    clock: &C,
    events_tx: &mpsc::Sender<RoutingMetaEvent>,
    range: Range,
    start: Timestamp,
    now: Timestamp,
    interval: TimestampDuration,
) -> TimerRef {
    let elapsed = now.saturating_sub(start);
    let delay = TimestampDuration::new(interval.as_u64().saturating_sub(elapsed.as_u64()));
    clock.send_after(delay, events_tx.clone(), RoutingMetaEvent::InactiveRange(range))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Endpoint;
    use kdht_tools::SystemClock;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer() -> Peer {
        Peer::new(Id::random(), Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881))
    }

    fn meta() -> (mpsc::Receiver<RoutingMetaEvent>, RoutingMeta<SystemClock>) {
        let table = RoutingTable::new(Id::random());
        let (tx, rx) = mpsc::channel(16);
        let meta = RoutingMeta::new(table, SystemClock, tx, RoutingMetaConfig::default());
        (rx, meta)
    }

    #[tokio::test]
    async fn insert_then_is_member_and_good() {
        let (_rx, mut meta) = meta();
        let p = peer();
        meta.insert(p).unwrap();
        assert!(meta.is_member(&p.id));
        assert_eq!(meta.liveness(&p.id), Some(Liveness::Good));
    }

    #[tokio::test]
    async fn three_timeouts_without_touch_goes_bad() {
        let (_rx, mut meta) = meta();
        let p = peer();
        meta.insert(p).unwrap();
        meta.node_timeout(p.id);
        meta.node_timeout(p.id);
        meta.node_timeout(p.id);
        assert_eq!(meta.liveness(&p.id), Some(Liveness::Bad));
    }

    #[tokio::test]
    async fn touch_reachable_resets_to_good() {
        let (_rx, mut meta) = meta();
        let p = peer();
        meta.insert(p).unwrap();
        meta.node_timeout(p.id);
        meta.node_timeout(p.id);
        meta.node_timeout(p.id);
        assert_eq!(meta.liveness(&p.id), Some(Liveness::Bad));
        meta.node_touch(p.id, true);
        assert_eq!(meta.liveness(&p.id), Some(Liveness::Good));
    }

    #[tokio::test]
    async fn unreachable_touch_on_unverified_peer_is_a_no_op() {
        let (_rx, mut meta) = meta();
        let p = peer();
        meta.insert(p).unwrap();
        let before = meta.nodes.get(&p.id).copied().unwrap();
        meta.node_touch(p.id, false);
        let after = meta.nodes.get(&p.id).copied().unwrap();
        assert_eq!(before.last_activity, after.last_activity);
        assert_eq!(before.timeout_count, after.timeout_count);
    }

    #[tokio::test]
    async fn replace_requires_bad_and_non_member() {
        let (_rx, mut meta) = meta();
        let old = peer();
        let new = peer();
        meta.insert(old).unwrap();
        assert_eq!(
            meta.replace(old.id, new),
            Err(RoutingError::PreconditionNotBad)
        );
        meta.node_timeout(old.id);
        meta.node_timeout(old.id);
        meta.node_timeout(old.id);
        assert!(meta.replace(old.id, new).is_ok());
        assert!(meta.is_member(&new.id));
        assert!(!meta.is_member(&old.id));
    }

    #[tokio::test]
    async fn neighbors_never_returns_bad_and_good_precedes_questionable() {
        let (_rx, mut meta) = meta();
        let good = peer();
        meta.insert(good).unwrap();
        let target = Id::random();
        let result = meta.neighbors(&target, 8);
        assert!(result.iter().all(|p| !matches!(meta.liveness(&p.id), Some(Liveness::Bad))));
    }

    #[tokio::test]
    async fn range_members_of_finds_its_own_bucket_mate() {
        let (_rx, mut meta) = meta();
        let p = peer();
        meta.insert(p).unwrap();
        assert!(meta.range_members_of(&p.id).contains(&p));
    }

    #[tokio::test]
    async fn range_state_on_unknown_range_errors() {
        let (_rx, meta) = meta();
        let bogus = Range { lo: 0, hi: 1 };
        assert_eq!(meta.range_state(&bogus), Err(RoutingError::NotMember));
    }
}
