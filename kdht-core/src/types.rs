//! Core value types shared across `routing_meta`, `net`, and their
//! collaborators: node identifiers, endpoints, peers, and the short-lived
//! tags and tokens used to correlate traffic.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

/// Width of a node ID / info-hash, in bytes (160 bits, as in Kademlia/BEP-5).
pub const ID_LEN: usize = 20;
static_assertions::const_assert_eq!(ID_LEN * 8, 160);

/// A 160-bit opaque identifier: a node ID or an info-hash share this type,
/// matching spec's treatment of both as "fixed-width opaque byte strings".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Id(pub [u8; ID_LEN]);

impl Id {
    pub const ZERO: Id = Id([0u8; ID_LEN]);

    pub fn random() -> Self {
        let mut buf = [0u8; ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut buf);
        Id(buf)
    }

    /// XOR distance metric between two IDs, compared lexicographically as
    /// the big unsigned integer it represents.
    pub fn distance(&self, other: &Id) -> Id {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Id(out)
    }

    /// Index of the highest set bit when read as a big-endian integer,
    /// counting from the most significant bit (0) to the least (`ID_LEN*8-1`).
    /// Used to pick which range (bucket) an ID falls into.
    pub fn leading_zero_bits(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_LEN * 8
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// `(ip, port)`, independent of any node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        SocketAddr::new(ep.ip, ep.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// `(NodeID, IP, Port)` — a peer identity plus the endpoint it was last
/// observed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub id: Id,
    pub endpoint: Endpoint,
}

impl Peer {
    pub fn new(id: Id, endpoint: Endpoint) -> Self {
        Self { id, endpoint }
    }
}

/// Per-query 16-bit transaction identifier correlating a response with its
/// waiter.
pub type Tag = u16;

/// Opaque value returned by `find_value` and echoed by a subsequent `store`.
pub type Token = u32;

/// `token_value(peer, secret) = hash32(ip, port, secret)`. Deliberately a
/// fast non-cryptographic hash — collisions are acceptable for
/// spam-filtering, not authentication (see the token-queue design notes).
pub fn token_value(endpoint: Endpoint, secret: u32) -> Token {
    let mut hasher = DefaultHasher::new();
    endpoint.ip.hash(&mut hasher);
    endpoint.port.hash(&mut hasher);
    secret.hash(&mut hasher);
    hasher.finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn distance_is_symmetric_and_zero_for_self() {
        let a = Id::random();
        let b = Id::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), Id::ZERO);
    }

    #[test]
    fn leading_zero_bits_of_zero_is_full_width() {
        assert_eq!(Id::ZERO.leading_zero_bits(), ID_LEN * 8);
    }

    #[test]
    fn token_value_is_deterministic_and_endpoint_sensitive() {
        let e1 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6881);
        let e2 = Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 6882);
        assert_eq!(token_value(e1, 42), token_value(e1, 42));
        assert_ne!(token_value(e1, 42), token_value(e2, 42));
        assert_ne!(token_value(e1, 42), token_value(e1, 43));
    }
}
