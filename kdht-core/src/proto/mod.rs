//! Wire codec: the `{query, response, error}` union, `bincode`-encoded.
//!
//! The teacher's wire layer builds each operation's request/response pair
//! as a `capnp` schema; that buys typed structs and zero-copy decode at the
//! cost of a schema compiler. A single UDP-sized DHT message is small
//! enough that the saving isn't worth the build-time dependency, so this
//! uses `serde` + `bincode` instead — the same tagged-variant shape, built
//! on the same kind of sum type the teacher composes its operations from.

use crate::types::{Endpoint, Id, Tag, Token};
use serde::{Deserialize, Serialize};

/// The body of a `query` message — one of the four RPCs the node issues or
/// answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Query {
    Ping,
    FindNode { target: Id },
    FindValue { target: Id },
    Store { token: Token, target: Id, port: u16 },
}

/// The body of a `response` message — mirrors the query it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ping,
    FindNode { nodes: Vec<WireNode> },
    FindValue { token: Token, result: FindValueResult },
    Store,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindValueResult {
    Nodes(Vec<WireNode>),
    Values(Vec<WireEndpoint>),
}

/// A peer as it travels on the wire: identity plus endpoint, kept distinct
/// from [`crate::types::Peer`] only so the wire shape can evolve
/// independently of the in-memory one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNode {
    pub id: Id,
    pub ip: std::net::IpAddr,
    pub port: u16,
}

impl From<crate::types::Peer> for WireNode {
    fn from(p: crate::types::Peer) -> Self {
        Self {
            id: p.id,
            ip: p.endpoint.ip,
            port: p.endpoint.port,
        }
    }
}

impl From<WireNode> for crate::types::Peer {
    fn from(w: WireNode) -> Self {
        crate::types::Peer::new(w.id, Endpoint::new(w.ip, w.port))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEndpoint {
    pub ip: std::net::IpAddr,
    pub port: u16,
}

impl From<Endpoint> for WireEndpoint {
    fn from(e: Endpoint) -> Self {
        Self { ip: e.ip, port: e.port }
    }
}

impl From<WireEndpoint> for Endpoint {
    fn from(w: WireEndpoint) -> Self {
        Endpoint::new(w.ip, w.port)
    }
}

/// The full envelope shared by all three message kinds: a 16-bit tag and
/// the sender's ID, plus the kind-specific body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Query { tag: Tag, sender: Id, query: Query },
    Response { tag: Tag, sender: Id, response: Response },
    Error { tag: Tag, sender: Id, code: i32, message: String },
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::Query { tag, .. } | Message::Response { tag, .. } | Message::Error { tag, .. } => *tag,
        }
    }

    pub fn sender(&self) -> Id {
        match self {
            Message::Query { sender, .. } | Message::Response { sender, .. } | Message::Error { sender, .. } => {
                *sender
            }
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, Message::Query { .. })
    }
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, crate::error::ProtoError> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode(bytes: &[u8]) -> Result<Message, crate::error::ProtoError> {
    Ok(bincode::deserialize(bytes)?)
}
