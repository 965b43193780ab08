//! Query handlers: pure(ish) functions from `(query, peer, own_id, tokens)`
//! to an outbound response, consulting `state` and `store`. Run off the
//! correlator's critical path as fire-and-forget sub-tasks — a panic or
//! error here must never reach the correlator's own mailbox loop.

use crate::error::ProtoError;
use crate::proto::{FindValueResult, Message, Query, Response, WireEndpoint, WireNode};
use crate::state::StateHandle;
use crate::store::Store;
use crate::types::{token_value, Endpoint, Id, Tag};
use kdht_tools::Clock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{instrument, warn};

/// Bucket target size used when answering `find_node`/`find_value` with a
/// node list — the same `k` as bucket capacity.
const ANSWER_SIZE: usize = crate::routing_table::BUCKET_SIZE;

#[instrument(level = "trace", skip(state, store, socket, token_secrets), fields(from = %from, tag))]
pub async fn handle_query<C: Clock>(
    own_id: Id,
    token_secrets: Vec<u32>,
    state: StateHandle<C>,
    store: Store,
    socket: Arc<UdpSocket>,
    from: Endpoint,
    tag: Tag,
    query: Query,
) {
    let response = match query {
        Query::Ping => Response::Ping,
        Query::FindNode { target } => {
            let nodes = state
                .closest_to(&target, ANSWER_SIZE)
                .into_iter()
                .filter(|p| p.endpoint != from)
                .map(WireNode::from)
                .collect();
            Response::FindNode { nodes }
        }
        Query::FindValue { target } => {
            let token = token_value(from, token_secrets.last().copied().unwrap_or_default());
            let values = store.find(&target);
            let result = if values.is_empty() {
                FindValueResult::Nodes(
                    state
                        .closest_to(&target, ANSWER_SIZE)
                        .into_iter()
                        .map(WireNode::from)
                        .collect(),
                )
            } else {
                FindValueResult::Values(values.into_iter().map(WireEndpoint::from).collect())
            };
            Response::FindValue { token, result }
        }
        Query::Store { token, target, port } => {
            let valid = token_secrets.iter().any(|secret| token_value(from, *secret) == token);
            if valid {
                store.store(target, Endpoint::new(from.ip, port));
            } else {
                warn!(%from, "rejected store with stale or invalid token");
            }
            Response::Store
        }
    };

    if let Err(err) = send_response(&socket, from, tag, own_id, response).await {
        warn!(%from, ?err, "failed to send query response");
    }
}

async fn send_response(
    socket: &UdpSocket,
    to: Endpoint,
    tag: Tag,
    sender: Id,
    response: Response,
) -> Result<(), ProtoError> {
    let msg = Message::Response { tag, sender, response };
    let bytes = crate::proto::encode(&msg)?;
    let addr: SocketAddr = to.into();
    let _ = socket.send_to(&bytes, addr).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingMetaConfig;
    use crate::routing_table::RoutingTable;
    use kdht_tools::SystemClock;
    use std::net::{IpAddr, Ipv4Addr};

    async fn bound_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn ping_query_answers_with_ping() {
        let own = Id::random();
        let table = RoutingTable::new(own);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let store = Store::new();
        let socket = bound_socket().await;
        let from = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9); // discard port, just needs to parse
        handle_query(own, vec![1, 2, 3], state, store, socket, from, 7, Query::Ping).await;
    }

    #[tokio::test]
    async fn store_with_valid_token_persists_value() {
        let own = Id::random();
        let table = RoutingTable::new(own);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let store = Store::new();
        let socket = bound_socket().await;
        let from = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let target = Id::random();
        let secret = 42u32;
        let token = token_value(from, secret);
        handle_query(
            own,
            vec![secret],
            state,
            store.clone(),
            socket,
            from,
            1,
            Query::Store { token, target, port: 6881 },
        )
        .await;
        assert_eq!(store.find(&target), vec![Endpoint::new(from.ip, 6881)]);
    }

    #[tokio::test]
    async fn store_with_invalid_token_is_silently_rejected() {
        let own = Id::random();
        let table = RoutingTable::new(own);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let store = Store::new();
        let socket = bound_socket().await;
        let from = Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9);
        let target = Id::random();
        handle_query(
            own,
            vec![1, 2, 3],
            state,
            store.clone(),
            socket,
            from,
            1,
            Query::Store { token: 0xbad, target, port: 6881 },
        )
        .await;
        assert!(store.find(&target).is_empty());
    }
}
