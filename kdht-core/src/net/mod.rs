//! The net correlator: owns the UDP socket, the outstanding-request table,
//! and the token queue. A single-threaded cooperative actor — one task
//! processes every mailbox event (caller requests, inbound datagrams,
//! timer firings) in a total order — reached from the outside only through
//! [`NetHandle`]'s cloneable, `Send` methods.

mod handlers;
mod token;

use crate::config::NetConfig;
use crate::error::{FatalError, NetError};
use crate::proto::{self, FindValueResult, Message, Query, Response};
use crate::state::StateHandle;
use crate::store::Store;
use crate::types::{Endpoint, Id, Peer, Tag, Token};
use kdht_tools::{Clock, Rng, TimerRef, TimestampDuration};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

use token::TokenQueue;

/// Outcome of [`NetHandle::ping`] — `pang`, not an error, is the expected
/// shape of a timed-out ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    Ok(Id),
    Pang,
}

/// Outcome of a successful `find_node`/`find_value`-nodes answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodesResult {
    pub target: Id,
    pub nodes: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindValueOutcome {
    Nodes(NodesResult),
    Values { target: Id, token: Token, endpoints: Vec<Endpoint> },
}

type PingReply = oneshot::Sender<PingOutcome>;
type FindNodeReply = oneshot::Sender<Result<NodesResult, NetError>>;
type FindValueReply = oneshot::Sender<Result<FindValueOutcome, NetError>>;
type StoreReply = oneshot::Sender<Result<Id, NetError>>;

enum Command {
    Ping { endpoint: Endpoint, reply: PingReply },
    FindNode { peer: Peer, target: Id, reply: FindNodeReply },
    FindValue { endpoint: Endpoint, target: Id, reply: FindValueReply },
    Store { endpoint: Endpoint, token: Token, target: Id, port: u16, reply: StoreReply },
    NodePort { reply: oneshot::Sender<Endpoint> },
    Sync { reply: oneshot::Sender<()> },
    RequestTimeout { endpoint: Endpoint, tag: Tag },
    RotateTokens,
}

enum Waiter {
    Ping { reply: PingReply },
    FindNode { notify_peer: Peer, reply: FindNodeReply },
    FindValue { reply: FindValueReply },
    Store { reply: StoreReply },
}

struct Outstanding {
    waiter: Waiter,
    timer_ref: TimerRef,
}

/// A cheap, cloneable handle to a running correlator. Every method sends a
/// command and awaits the actor's reply — from the caller's point of view,
/// a blocking RPC.
#[derive(Clone)]
pub struct NetHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl NetHandle {
    pub async fn ping(&self, endpoint: Endpoint) -> PingOutcome {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Ping { endpoint, reply }).await.is_err() {
            return PingOutcome::Pang;
        }
        rx.await.unwrap_or(PingOutcome::Pang)
    }

    pub async fn find_node(&self, peer: Peer, target: Id) -> Result<NodesResult, NetError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::FindNode { peer, target, reply })
            .await
            .map_err(|_| NetError::SendFailure("correlator gone".into()))?;
        rx.await.map_err(|_| NetError::SendFailure("correlator gone".into()))?
    }

    pub async fn find_value(&self, endpoint: Endpoint, target: Id) -> Result<FindValueOutcome, NetError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::FindValue { endpoint, target, reply })
            .await
            .map_err(|_| NetError::SendFailure("correlator gone".into()))?;
        rx.await.map_err(|_| NetError::SendFailure("correlator gone".into()))?
    }

    pub async fn store(&self, endpoint: Endpoint, token: Token, target: Id, port: u16) -> Result<Id, NetError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Store { endpoint, token, target, port, reply })
            .await
            .map_err(|_| NetError::SendFailure("correlator gone".into()))?;
        rx.await.map_err(|_| NetError::SendFailure("correlator gone".into()))?
    }

    pub async fn node_port(&self) -> Option<Endpoint> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::NodePort { reply }).await.ok()?;
        rx.await.ok()
    }

    /// Barrier: returns once every command submitted before this call has
    /// been fully processed by the actor.
    pub async fn sync(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Sync { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the correlator's actor task. Returns a handle for callers and the
/// `JoinHandle` of the actor itself, so the server binary can detect a
/// fatal protocol-invariant panic and exit non-zero.
pub async fn spawn<C: Clock, R: Rng>(
    socket: UdpSocket,
    own_id: Id,
    state: StateHandle<C>,
    store: Store,
    clock: C,
    rng: R,
    config: NetConfig,
) -> (NetHandle, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let socket = Arc::new(socket);

    // `UDP_MAILBOX_SZ`: the recv task blocks once this many inbound
    // datagrams are buffered, which *is* the "pause for a batch of 16, then
    // resume" flow control spec describes — backed by ordinary mpsc
    // backpressure instead of a bespoke socket mode.
    let (inbound_tx, inbound_rx) = mpsc::channel(config.udp_mailbox_sz);
    tokio::spawn(recv_loop(Arc::clone(&socket), inbound_tx));

    let tokens = TokenQueue::new(config.token_queue_len, &rng);
    let actor = Actor {
        socket,
        own_id,
        state,
        store,
        clock,
        rng,
        config,
        outstanding: HashMap::new(),
        tokens,
        cmd_tx: cmd_tx.clone(),
    };
    let join = tokio::spawn(actor.run(cmd_rx, inbound_rx));
    (NetHandle { cmd_tx }, join)
}

async fn recv_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<(Endpoint, Vec<u8>)>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if tx.send((Endpoint::from(from), buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(?err, "udp recv failed");
                return;
            }
        }
    }
}

struct Actor<C: Clock, R: Rng> {
    socket: Arc<UdpSocket>,
    own_id: Id,
    state: StateHandle<C>,
    store: Store,
    clock: C,
    rng: R,
    config: NetConfig,
    outstanding: HashMap<(Endpoint, Tag), Outstanding>,
    tokens: TokenQueue,
    cmd_tx: mpsc::Sender<Command>,
}

impl<C: Clock, R: Rng> Actor<C, R> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, mut inbound_rx: mpsc::Receiver<(Endpoint, Vec<u8>)>) {
        self.arm_token_rotation();
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => return,
                    }
                }
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some((from, bytes)) => self.handle_inbound(from, bytes),
                        None => return,
                    }
                }
            }
        }
    }

    fn arm_token_rotation(&self) {
        let delay = TimestampDuration::from_secs(self.config.token_lifetime_secs);
        self.clock.send_after(delay, self.cmd_tx.clone(), Command::RotateTokens);
    }

    #[instrument(level = "debug", skip(self, cmd))]
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Ping { endpoint, reply } => self.start_ping(endpoint, reply),
            Command::FindNode { peer, target, reply } => self.start_find_node(peer, target, reply),
            Command::FindValue { endpoint, target, reply } => self.start_find_value(endpoint, target, reply),
            Command::Store { endpoint, token, target, port, reply } => {
                self.start_store(endpoint, token, target, port, reply)
            }
            Command::NodePort { reply } => {
                if let Ok(addr) = self.socket.local_addr() {
                    let _ = reply.send(Endpoint::from(addr));
                }
            }
            Command::Sync { reply } => {
                let _ = reply.send(());
            }
            Command::RequestTimeout { endpoint, tag } => self.handle_timeout(endpoint, tag),
            Command::RotateTokens => {
                self.tokens.rotate(&self.rng);
                self.arm_token_rotation();
            }
        }
    }

    /// Allocate a fresh tag for `endpoint`: a uniformly random 16-bit value,
    /// retried up to `tag_alloc_retries` times on collision.
    fn allocate_tag(&self, endpoint: Endpoint) -> Result<Tag, NetError> {
        for _ in 0..self.config.tag_alloc_retries {
            let candidate: Tag = self.rng.next_u16();
            if !self.outstanding.contains_key(&(endpoint, candidate)) {
                return Ok(candidate);
            }
        }
        Err(NetError::TagExhausted(endpoint))
    }

    fn send_query(&mut self, endpoint: Endpoint, query: Query, waiter: Waiter) {
        let tag = match self.allocate_tag(endpoint) {
            Ok(tag) => tag,
            Err(err) => {
                self.fail_waiter(waiter, err);
                return;
            }
        };
        let msg = Message::Query { tag, sender: self.own_id, query };
        let bytes = match proto::encode(&msg) {
            Ok(b) => b,
            Err(err) => {
                self.fail_waiter(waiter, NetError::SendFailure(err.to_string()));
                return;
            }
        };
        let addr: SocketAddr = endpoint.into();
        if let Err(err) = self.socket.try_send_to(&bytes, addr) {
            self.fail_waiter(waiter, NetError::SendFailure(err.to_string()));
            return;
        }
        let delay = TimestampDuration::from_millis(self.config.query_timeout_ms);
        let timer_ref = self
            .clock
            .send_after(delay, self.cmd_tx.clone(), Command::RequestTimeout { endpoint, tag });
        self.outstanding.insert((endpoint, tag), Outstanding { waiter, timer_ref });
    }

    fn fail_waiter(&self, waiter: Waiter, err: NetError) {
        match waiter {
            Waiter::Ping { reply, .. } => {
                let _ = reply.send(PingOutcome::Pang);
            }
            Waiter::FindNode { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Waiter::FindValue { reply } => {
                let _ = reply.send(Err(err));
            }
            Waiter::Store { reply } => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn start_ping(&mut self, endpoint: Endpoint, reply: PingReply) {
        self.send_query(endpoint, Query::Ping, Waiter::Ping { reply });
    }

    fn start_find_node(&mut self, peer: Peer, target: Id, reply: FindNodeReply) {
        self.send_query(
            peer.endpoint,
            Query::FindNode { target },
            Waiter::FindNode { notify_peer: peer, reply },
        );
    }

    fn start_find_value(&mut self, endpoint: Endpoint, target: Id, reply: FindValueReply) {
        self.send_query(endpoint, Query::FindValue { target }, Waiter::FindValue { reply });
    }

    fn start_store(&mut self, endpoint: Endpoint, token: Token, target: Id, port: u16, reply: StoreReply) {
        self.send_query(
            endpoint,
            Query::Store { token, target, port },
            Waiter::Store { reply },
        );
    }

    fn handle_timeout(&mut self, endpoint: Endpoint, tag: Tag) {
        // Race with a just-delivered reply: the entry may already be gone.
        if let Some(outstanding) = self.outstanding.remove(&(endpoint, tag)) {
            if let Waiter::FindNode { notify_peer, .. } = &outstanding.waiter {
                self.state.notify(*notify_peer, false);
            }
            self.fail_waiter(outstanding.waiter, NetError::Timeout);
        }
    }

    fn handle_inbound(&mut self, from: Endpoint, bytes: Vec<u8>) {
        let msg = match proto::decode(&bytes) {
            Ok(msg) => msg,
            Err(err) => {
                trace!(%from, ?err, "dropping undecodable datagram");
                return;
            }
        };
        let tag = msg.tag();
        let sender = msg.sender();

        match self.outstanding.remove(&(from, tag)) {
            Some(outstanding) => {
                outstanding.timer_ref.cancel();
                if msg.is_query() {
                    // A well-behaved peer never replies to our own tag with
                    // a fresh query; re-insert so the timeout still fires
                    // and treat this as the protocol-inversion invariant.
                    panic!("{}", FatalError::MessageToOurselves(tag));
                }
                self.deliver(from, sender, outstanding.waiter, msg);
            }
            None => {
                if msg.is_query() {
                    self.spawn_query_handler(from, tag, msg);
                } else {
                    trace!(%from, tag, "dropping unsolicited response/error");
                }
            }
        }
    }

    fn deliver(&self, from: Endpoint, sender: Id, waiter: Waiter, msg: Message) {
        match (waiter, msg) {
            (Waiter::Ping { reply, .. }, Message::Response { response: Response::Ping, .. }) => {
                let _ = reply.send(PingOutcome::Ok(sender));
            }
            (Waiter::Ping { reply, .. }, Message::Error { .. }) => {
                let _ = reply.send(PingOutcome::Pang);
            }
            (Waiter::FindNode { notify_peer, reply }, Message::Response { response: Response::FindNode { nodes }, .. }) => {
                self.state.notify(notify_peer, true);
                let _ = reply.send(Ok(NodesResult {
                    target: sender,
                    nodes: nodes.into_iter().map(Into::into).collect(),
                }));
            }
            (Waiter::FindNode { notify_peer, reply }, Message::Error { code, message, .. }) => {
                self.state.notify(notify_peer, false);
                let _ = reply.send(Err(NetError::Remote { code, message }));
            }
            (
                Waiter::FindValue { reply },
                Message::Response {
                    response: Response::FindValue { token, result },
                    ..
                },
            ) => {
                let outcome = match result {
                    FindValueResult::Nodes(nodes) => FindValueOutcome::Nodes(NodesResult {
                        target: sender,
                        nodes: nodes.into_iter().map(Into::into).collect(),
                    }),
                    FindValueResult::Values(values) => FindValueOutcome::Values {
                        target: sender,
                        token,
                        endpoints: values.into_iter().map(Into::into).collect(),
                    },
                };
                let _ = reply.send(Ok(outcome));
            }
            (Waiter::FindValue { reply }, Message::Error { code, message, .. }) => {
                let _ = reply.send(Err(NetError::Remote { code, message }));
            }
            (Waiter::Store { reply }, Message::Response { response: Response::Store, .. }) => {
                let _ = reply.send(Ok(sender));
            }
            (Waiter::Store { reply }, Message::Error { code, message, .. }) => {
                let _ = reply.send(Err(NetError::Remote { code, message }));
            }
            (waiter, _mismatched) => {
                debug!(%from, "response shape did not match the pending waiter's request kind");
                self.fail_waiter(waiter, NetError::Remote { code: -1, message: "malformed reply".into() });
            }
        }
    }

    /// Unsolicited query: inform `state` of the sender and answer it, both
    /// as fire-and-forget sub-tasks off the actor's own critical path. A
    /// panic inside either must not reach here — `tokio::spawn` already
    /// isolates panics to the spawned task.
    fn spawn_query_handler(&self, from: Endpoint, tag: Tag, msg: Message) {
        let sender = msg.sender();
        let peer = Peer::new(sender, from);
        self.state.insert_node(peer);

        let Message::Query { query, .. } = msg else {
            unreachable!("caller already matched is_query()")
        };
        let own_id = self.own_id;
        let token_secrets = self.tokens.snapshot();
        let state = self.state.clone();
        let store = self.store.clone();
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            handlers::handle_query(own_id, token_secrets, state, store, socket, from, tag, query).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingMetaConfig;
    use crate::routing_table::RoutingTable;
    use kdht_tools::{SystemClock, SystemRng};
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    async fn node_pair() -> ((NetHandle, Id, std::net::SocketAddr), (NetHandle, Id, std::net::SocketAddr)) {
        let a = spawn_test_node().await;
        let b = spawn_test_node().await;
        (a, b)
    }

    async fn spawn_test_node() -> (NetHandle, Id, std::net::SocketAddr) {
        spawn_test_node_with_config(NetConfig::default()).await
    }

    async fn spawn_test_node_with_config(config: NetConfig) -> (NetHandle, Id, std::net::SocketAddr) {
        let own_id = Id::random();
        let table = RoutingTable::new(own_id);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let store = Store::new();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (handle, _join) = spawn(socket, own_id, state, store, SystemClock, SystemRng, config).await;
        (handle, own_id, addr)
    }

    /// An `Rng` that hands out a scripted sequence of tags, one per call —
    /// lets a test force the retry-on-collision and exhaustion paths
    /// `allocate_tag` otherwise can't be made to hit deterministically.
    #[derive(Clone)]
    struct ScriptedTagRng {
        tags: Arc<Mutex<VecDeque<u16>>>,
    }

    impl ScriptedTagRng {
        fn new(tags: Vec<u16>) -> Self {
            Self { tags: Arc::new(Mutex::new(tags.into())) }
        }
    }

    impl Rng for ScriptedTagRng {
        fn next_u16(&self) -> u16 {
            self.tags.lock().unwrap().pop_front().expect("script ran out of tags")
        }
        fn next_u32(&self) -> u32 {
            0
        }
        fn choose_index(&self, len: usize) -> Option<usize> {
            if len == 0 {
                None
            } else {
                Some(0)
            }
        }
    }

    /// A fake outstanding entry just to occupy a `(Endpoint, Tag)` slot —
    /// its waiter and timer are never driven, only its presence in the map
    /// matters for collision detection.
    fn dummy_outstanding(clock: &SystemClock, cmd_tx: &mpsc::Sender<Command>) -> Outstanding {
        let (reply, _rx) = oneshot::channel();
        let timer_ref = clock.send_after(TimestampDuration::from_secs(3600), cmd_tx.clone(), Command::RotateTokens);
        Outstanding { waiter: Waiter::Store { reply }, timer_ref }
    }

    async fn test_actor(
        config: NetConfig,
        rng: ScriptedTagRng,
    ) -> (Actor<SystemClock, ScriptedTagRng>, Endpoint, mpsc::Sender<Command>) {
        let own_id = Id::random();
        let table = RoutingTable::new(own_id);
        let (state, _rx) = StateHandle::new(table, SystemClock, RoutingMetaConfig::default());
        let store = Store::new();
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap());
        let endpoint = Endpoint::from(socket.local_addr().unwrap());
        let (cmd_tx, _cmd_rx) = mpsc::channel(4);
        let tokens = TokenQueue::new(config.token_queue_len, &rng);
        let actor = Actor {
            socket,
            own_id,
            state,
            store,
            clock: SystemClock,
            rng,
            config,
            outstanding: HashMap::new(),
            tokens,
            cmd_tx: cmd_tx.clone(),
        };
        (actor, endpoint, cmd_tx)
    }

    #[tokio::test]
    async fn tag_allocation_retries_past_collisions_then_succeeds() {
        let config = NetConfig { tag_alloc_retries: 16, ..NetConfig::default() };
        // The first 15 scripted tags all collide with pre-existing entries;
        // the 16th (0) is free.
        let script: Vec<u16> = (1..=15).chain(std::iter::once(0)).collect();
        let (mut actor, endpoint, cmd_tx) = test_actor(config, ScriptedTagRng::new(script)).await;
        for tag in 1u16..=15 {
            actor.outstanding.insert((endpoint, tag), dummy_outstanding(&actor.clock, &cmd_tx));
        }

        let tag = actor.allocate_tag(endpoint).expect("16th try should land on the free tag");
        assert_eq!(tag, 0);
    }

    #[tokio::test]
    async fn tag_allocation_exhausts_after_configured_retries() {
        let config = NetConfig { tag_alloc_retries: 4, ..NetConfig::default() };
        // Every scripted draw collides with the one pre-existing entry.
        let script = vec![9u16, 9, 9, 9];
        let (mut actor, endpoint, cmd_tx) = test_actor(config, ScriptedTagRng::new(script)).await;
        actor.outstanding.insert((endpoint, 9), dummy_outstanding(&actor.clock, &cmd_tx));

        assert_eq!(actor.allocate_tag(endpoint), Err(NetError::TagExhausted(endpoint)));
    }

    #[tokio::test]
    async fn ping_round_trip_between_two_nodes() {
        let ((handle_a, _id_a, _addr_a), (_handle_b, id_b, addr_b)) = node_pair().await;
        let outcome = handle_a.ping(Endpoint::from(addr_b)).await;
        assert_eq!(outcome, PingOutcome::Ok(id_b));
    }

    #[tokio::test]
    async fn ping_to_nothing_times_out_as_pang() {
        let config = NetConfig {
            query_timeout_ms: 50,
            ..NetConfig::default()
        };
        let (handle, _id, _addr) = spawn_test_node_with_config(config).await;
        // Pick a port nothing is bound to by binding and dropping it.
        let throwaway = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let dead_addr = throwaway.local_addr().unwrap();
        drop(throwaway);
        let outcome = handle.ping(Endpoint::from(dead_addr)).await;
        assert_eq!(outcome, PingOutcome::Pang);
    }

    #[tokio::test]
    async fn node_port_reports_bound_address() {
        let (handle, _id, addr) = spawn_test_node().await;
        assert_eq!(handle.node_port().await, Some(Endpoint::from(addr)));
    }

    #[tokio::test]
    async fn sync_returns_after_prior_commands_drain() {
        let (handle, _id, _addr) = spawn_test_node().await;
        handle.sync().await;
    }
}
