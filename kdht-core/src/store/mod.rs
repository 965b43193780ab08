//! The value store: info-hash → list of endpoints announcing it. Plain
//! in-memory map, no persistence or eviction policy beyond a per-key cap —
//! the core owns none of the data-plane replication spec explicitly
//! excludes.

use crate::types::{Endpoint, Id};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Upper bound on announcers kept per info-hash, oldest dropped first. Not
/// specified by the source design; chosen to bound memory under a flood of
/// `store` calls for one hash.
const MAX_ENDPOINTS_PER_KEY: usize = 64;

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<Id, Vec<Endpoint>>,
}

/// Cloneable handle to the value store, following the same
/// `Arc<Mutex<Inner>>` shape `net`'s other collaborators use.
#[derive(Debug, Clone, Default)]
pub struct Store {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, id: &Id) -> Vec<Endpoint> {
        self.inner.lock().values.get(id).cloned().unwrap_or_default()
    }

    pub fn store(&self, id: Id, endpoint: Endpoint) {
        let mut inner = self.inner.lock();
        let entry = inner.values.entry(id).or_default();
        if !entry.contains(&endpoint) {
            if entry.len() >= MAX_ENDPOINTS_PER_KEY {
                entry.remove(0);
            }
            entry.push(endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn find_on_empty_key_returns_empty() {
        let store = Store::new();
        assert!(store.find(&Id::random()).is_empty());
    }

    #[test]
    fn store_then_find_round_trips() {
        let store = Store::new();
        let id = Id::random();
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        store.store(id, ep);
        assert_eq!(store.find(&id), vec![ep]);
    }

    #[test]
    fn store_is_idempotent_for_same_endpoint() {
        let store = Store::new();
        let id = Id::random();
        let ep = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881);
        store.store(id, ep);
        store.store(id, ep);
        assert_eq!(store.find(&id), vec![ep]);
    }
}
