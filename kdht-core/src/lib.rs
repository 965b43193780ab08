//! Core of a Kademlia-style DHT node: routing metadata with BEP-5 liveness
//! classification (`routing_meta`), and a single-socket RPC correlator
//! (`net`) multiplexing `ping`/`find_node`/`find_value`/`store` over
//! short-lived transaction tags. `routing_table`, `proto`, and `store` are
//! the collaborators the core consults; `state` is the policy actor that
//! owns routing metadata and is the only thing `net` reaches into it
//! through.

pub mod config;
pub mod error;
pub mod net;
pub mod proto;
pub mod routing_meta;
pub mod routing_table;
pub mod state;
pub mod store;
pub mod types;

use config::NodeConfig;
use kdht_tools::{Clock, SystemClock, SystemRng};
use net::NetHandle;
use routing_meta::RangeState;
use routing_table::RoutingTable;
use state::StateHandle;
use store::Store;
use tokio::net::UdpSocket;
use tracing::{info, instrument, warn};
use types::Id;

/// A running node: its routing metadata and its network correlator, wired
/// together with a background task that drives range-refresh timers.
pub struct Node<C: Clock = SystemClock> {
    pub state: StateHandle<C>,
    pub net: NetHandle,
    net_join: tokio::task::JoinHandle<()>,
    refresh_join: tokio::task::JoinHandle<()>,
}

impl Node<SystemClock> {
    /// Bring up a node bound to `config.net.bind_ip:bind_port`, with a
    /// fresh random node ID and an empty routing table.
    #[instrument(level = "info", skip(config))]
    pub async fn bind(config: NodeConfig) -> std::io::Result<Self> {
        let own_id = Id::random();
        Self::bind_with_id(own_id, config).await
    }

    #[instrument(level = "info", skip(config))]
    pub async fn bind_with_id(own_id: Id, config: NodeConfig) -> std::io::Result<Self> {
        let table = RoutingTable::new(own_id);
        let addr = format!("{}:{}", config.net.bind_ip, config.net.bind_port);
        let socket = UdpSocket::bind(&addr).await?;
        info!(%addr, node_id = %own_id, "bound udp socket");

        let (state, events_rx) = StateHandle::new(table, SystemClock, config.routing_meta.clone());
        let store = Store::new();
        let (net, net_join) =
            net::spawn(socket, own_id, state.clone(), store, SystemClock, SystemRng, config.net.clone()).await;

        let refresh_join = tokio::spawn(drive_range_refresh(state.clone(), net.clone(), events_rx));

        Ok(Self {
            state,
            net,
            net_join,
            refresh_join,
        })
    }
}

impl<C: Clock> Node<C> {
    pub fn node_id(&self) -> Id {
        self.state.node_id()
    }

    /// Wait for the correlator's actor task to exit — normally only on a
    /// fatal protocol-invariant violation, since the actor otherwise runs
    /// forever.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.refresh_join.abort();
        self.net_join.await
    }
}

/// Drains range-refresh timer events: on `InactiveRange(range)`, call
/// `range_state` and, if it needs a refresh, issue a `find_node` to the
/// chosen member. Metadata itself never rearms a timer — this loop does,
/// implicitly, by calling `reset_range_timer` once the refresh is sent.
async fn drive_range_refresh<C: Clock>(
    state: StateHandle<C>,
    net: NetHandle,
    mut events_rx: tokio::sync::mpsc::Receiver<routing_meta::RoutingMetaEvent>,
) {
    while let Some(routing_meta::RoutingMetaEvent::InactiveRange(range)) = events_rx.recv().await {
        match state.range_state(&range) {
            Ok(RangeState::NeedsRefresh(member_id)) => {
                let Some(peer) = state
                    .range_members(&range)
                    .into_iter()
                    .find(|p| p.id == member_id)
                else {
                    continue;
                };
                if let Err(err) = net.find_node(peer, member_id).await {
                    warn!(?err, range = ?range, "range refresh find_node failed");
                }
                let _ = state.reset_range_timer(range, false);
            }
            Ok(_) => {
                let _ = state.reset_range_timer(range, false);
            }
            Err(err) => {
                warn!(?err, range = ?range, "range vanished before refresh could run");
            }
        }
    }
}
