//! Peer connection manager.
//!
//! Maintains the target number of outbound connections, drawing candidates
//! from the address manager with a diversity rule: no two outbound peers may
//! share an address group. Also owns the handshake state machine and the
//! per-peer misbehaviour scores.
use std::collections::{HashMap, HashSet};
use std::{net, net::SocketAddr, sync::Arc};

use tracing::{debug, error};

use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use bitcoin::{
    network::address::Address, network::constants::ServiceFlags,
    network::message_network::VersionMessage,
};

use crate::{
    common::network::Network,
    common::peer::{AddressSource, Source},
    common::time::Clock,
    fsm::addrmgr::{addr_group, is_local},
    fsm::handler::{DisconnectReason, PeerId, Socket, Whitelist},
    net::{Disconnect as NetDisconnect, Link, LocalDuration, LocalTime},
};

use super::output::{Connect, Disconnect, SetTimer, Wire};

/// Time a new connection has to complete the version/verack exchange. A
/// peer that has sent nothing by then is a silent peer and is dropped.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(60);
/// Time to wait for a new connection to be established.
pub const CONNECTION_TIMEOUT: LocalDuration = LocalDuration::from_secs(6);
/// Time to wait until idle.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);
/// Target number of concurrent outbound peer connections.
pub const TARGET_OUTBOUND_PEERS: usize = 8;
/// Maximum number of inbound peer connections.
pub const MAX_INBOUND_PEERS: usize = 117;

/// How long after startup the hardcoded seeds are held back, giving the
/// loaded address book a chance first.
const SEED_DELAY: LocalDuration = LocalDuration::from_secs(60);
/// Minimum random age given to an injected seed address.
const SEED_AGE_MIN: u64 = 7 * 24 * 60 * 60;
/// Maximum random age given to an injected seed address.
const SEED_AGE_MAX: u64 = 14 * 24 * 60 * 60;
/// Upper bound on candidate samples per maintenance run.
const MAX_SAMPLE_ATTEMPTS: usize = 100;
/// An address tried this recently is skipped...
const RETRY_DELAY: LocalDuration = LocalDuration::from_secs(600);
/// ...unless this many candidates were already rejected.
const RETRY_RELAX_AFTER: usize = 30;
/// Non-default ports are skipped unless this many candidates were rejected.
const PORT_RELAX_AFTER: usize = 50;

/// A time offset, in seconds.
type TimeOffset = i64;

/// An event originating in the peer manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// The `version` message was received from a peer.
    VersionReceived {
        /// The peer's id.
        addr: PeerId,
        /// The version message.
        msg: VersionMessage,
    },
    /// A peer has successfully negotiated (handshaked).
    Negotiated {
        /// The peer's id.
        addr: PeerId,
        /// Connection link.
        link: Link,
        /// Services offered by negotiated peer.
        services: ServiceFlags,
        /// Peer user agent.
        user_agent: String,
        /// Protocol version.
        version: u32,
        /// Peer's announced start height.
        height: i32,
    },
    /// Connecting to a peer found from the specified source.
    Connecting(PeerId, Source),
    /// Connection attempt failed.
    ConnectionFailed(PeerId, Arc<std::io::Error>),
    /// A new peer has connected and is ready to accept messages.
    /// This event is triggered *before* the peer handshake
    /// has successfully completed.
    Connected(PeerId, Link),
    /// A peer has been disconnected.
    Disconnected(PeerId, NetDisconnect<DisconnectReason>),
    /// A peer's misbehaviour score crossed the ban threshold.
    Misbehaved {
        /// The peer's id.
        addr: PeerId,
        /// Its accumulated score.
        score: u32,
        /// Why the last penalty was applied.
        reason: &'static str,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VersionReceived { addr, msg } => write!(
                fmt,
                "Peer address = {}, version = {}, height = {}, agent = {}, services = {}, nonce = {}",
                addr, msg.version, msg.start_height, msg.user_agent, msg.services, msg.nonce,
            ),
            Self::Negotiated {
                addr, services, ..
            } => write!(fmt, "{}: Peer negotiated with services {}", addr, services),
            Self::Connecting(addr, source) => {
                write!(fmt, "Connecting to peer {} from source `{}`", addr, source)
            }
            Self::Connected(addr, link) => write!(fmt, "{}: Peer connected ({:?})", &addr, link),
            Self::ConnectionFailed(addr, err) => {
                write!(fmt, "{}: Peer connection attempt failed: {}", &addr, err)
            }
            Self::Disconnected(addr, reason) => {
                write!(fmt, "Disconnected from {} ({})", &addr, reason)
            }
            Self::Misbehaved {
                addr,
                score,
                reason,
            } => {
                write!(fmt, "{}: Misbehaved (+{}): {}", &addr, score, reason)
            }
        }
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version.
    pub protocol_version: u32,
    /// Peer whitelist.
    pub whitelist: Whitelist,
    /// Services offered by this implementation.
    pub services: ServiceFlags,
    /// Exclusive peer list. When non-empty, only these peers are dialed and
    /// the generic dialer is disabled.
    pub connect: Vec<net::SocketAddr>,
    /// Peer addresses to persist connections with, in addition to the
    /// generic dialer.
    pub persistent: Vec<net::SocketAddr>,
    /// Services required by peers.
    pub required_services: ServiceFlags,
    /// Target number of outbound peer connections.
    pub target_outbound_peers: usize,
    /// Maximum number of inbound peer connections.
    pub max_inbound_peers: usize,
    /// Maximum time to wait between reconnection attempts.
    pub retry_max_wait: LocalDuration,
    /// Minimum time to wait between reconnection attempts.
    pub retry_min_wait: LocalDuration,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Hardcoded seed addresses, injected when the address book has
    /// nothing to offer.
    pub seeds: Vec<net::SocketAddr>,
    /// DNS seed hostnames. Empty when DNS seeding is disabled.
    pub dns_seeds: Vec<String>,
}

/// Peer negotiation (handshake) state.
#[derive(Copy, Clone, Debug, PartialOrd, PartialEq, Ord, Eq)]
enum HandshakeState {
    /// Received "version" and waiting for "verack" message from remote.
    Version { since: LocalTime },
    /// Received "verack". Handshake is complete.
    Verack { since: LocalTime },
}

/// A peer connection. Peers that haven't yet sent their `version` message
/// are stored as connections.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Remote peer socket.
    pub socket: Socket,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
    /// Accumulated misbehaviour score.
    pub misbehaviour: u32,
}

/// Peer state.
#[derive(Debug, Clone)]
pub enum Peer {
    /// A connection is being attempted.
    Connecting {
        /// Time the connection was attempted.
        time: LocalTime,
    },
    /// A connection is established.
    Connected {
        /// Connection.
        conn: Connection,
        /// Peer information, if a `version` message was received.
        peer: Option<PeerInfo>,
    },
}

/// A peer with protocol information.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// An offset in seconds, between this peer's clock and ours.
    /// A positive offset means the peer's clock is ahead of ours.
    pub time_offset: TimeOffset,
    /// Whether this peer relays transactions.
    pub relay: bool,
    /// The max protocol version supported by both ends.
    pub version: u32,
    /// The peer's announced start height.
    pub height: i32,
    /// Whether this is a persistent peer.
    pub persistent: bool,
    /// Peer nonce. Used to detect self-connections.
    nonce: u64,
    /// Peer handshake state.
    state: HandshakeState,
}

impl PeerInfo {
    /// Check whether the peer has finished negotiating and received our
    /// `version`.
    pub fn is_negotiated(&self) -> bool {
        matches!(self.state, HandshakeState::Verack { .. })
    }
}

/// Manages peer connections and handshake.
#[derive(Debug)]
pub struct PeerManager<U, C> {
    /// Peer manager configuration.
    pub config: Config,
    /// Last time we were idle.
    last_idle: Option<LocalTime>,
    /// When the manager was initialized.
    started_at: Option<LocalTime>,
    /// Whether the hardcoded seeds were already injected.
    seeded: bool,
    /// Connection states.
    peers_storage: HashMap<SocketAddr, Peer>,
    /// Peers that have been disconnected and a retry attempt is scheduled.
    disconnected: HashMap<net::SocketAddr, (Option<LocalTime>, usize)>,
    /// Nonces we have sent in `version` messages, per connection. A
    /// received `version` carrying one of these is a connection to self.
    local_nonces: HashMap<net::SocketAddr, u64>,
    /// The network we're on.
    network: Network,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Connect + Disconnect, C: Clock + Sync> PeerManager<U, C> {
    /// Create a new peer manager.
    pub fn new(
        config: Config,
        rng: fastrand::Rng,
        upstream: U,
        clock: C,
        network: Network,
    ) -> Self {
        Self {
            config,
            last_idle: None,
            started_at: None,
            seeded: false,
            peers_storage: HashMap::new(),
            disconnected: HashMap::new(),
            local_nonces: HashMap::new(),
            upstream,
            rng,
            clock,
            network,
        }
    }

    /// Initialize the peer manager. Must be called once.
    pub async fn initialize<A: AddressSource>(&mut self, addrs: &mut A) {
        self.started_at = Some(self.clock.local_time());

        let peers: Vec<_> = self
            .config
            .connect
            .iter()
            .chain(self.config.persistent.iter())
            .cloned()
            .collect();

        for addr in peers {
            if !self.connect(&addr) {
                debug!(target: "p2p", "{}: unable to connect to peer", addr);
            }
        }
        self.upstream.set_timer(IDLE_TIMEOUT);
        self.maintain_connections(addrs).await;
    }

    /// A persistent peer has been disconnected.
    fn persistent_disconnected(&mut self, addr: &net::SocketAddr, local_time: LocalTime) {
        let (retry_at, attempts) = self.disconnected.entry(*addr).or_default();
        let delay = LocalDuration::from_secs(2u64.saturating_pow(*attempts as u32))
            .clamp(self.config.retry_min_wait, self.config.retry_max_wait);

        *retry_at = Some(local_time + delay);
        *attempts += 1;

        self.upstream.set_timer(delay);
    }

    /// Maintain persistent peer connections.
    fn maintain_persistent(&mut self) {
        let local_time = self.clock.local_time();
        let mut reconnect = Vec::new();

        for (addr, (retry_at, _)) in &mut self.disconnected {
            if let Some(t) = retry_at {
                if *t <= local_time {
                    *retry_at = None;
                    reconnect.push(*addr);
                }
            }
        }

        for addr in reconnect {
            if !self.connect(&addr) {
                error!(target: "p2p", "Couldn't establish connection with {addr}");
            }
        }
    }

    /// Called when a peer connected.
    pub fn peer_connected(&mut self, addr: SocketAddr, local_addr: SocketAddr, link: Link) {
        let local_time = self.clock.local_time();

        #[cfg(debug_assertions)]
        if link.is_outbound() {
            debug_assert!(self.is_connecting(&addr), "{} is not connecting", addr)
        }
        debug_assert!(!self.is_connected(&addr), "{} is already connected", addr);

        self.peers_storage.insert(
            addr,
            Peer::Connected {
                conn: Connection {
                    socket: Socket::new(addr),
                    local_addr,
                    link,
                    since: local_time,
                    misbehaviour: 0,
                },
                peer: None,
            },
        );
        self.disconnected.remove(&addr);

        match link {
            Link::Inbound => {
                // Wait for their version message.
            }
            Link::Outbound => {
                let nonce = self.rng.u64(..);

                self.local_nonces.insert(addr, nonce);
                self.upstream
                    .version(addr, self.version(addr, local_addr, nonce));
            }
        }
        // Set a timeout for receiving the `version` message.
        self.upstream.set_timer(HANDSHAKE_TIMEOUT);
        self.upstream.event(Event::Connected(addr, link));
    }

    /// Called when a peer disconnected.
    pub async fn peer_disconnected<A: AddressSource>(
        &mut self,
        addr: &SocketAddr,
        addrs: &mut A,
        reason: NetDisconnect<DisconnectReason>,
    ) {
        let local_time = self.clock.local_time();

        if self.is_connected(addr) {
            self.upstream.event(Event::Disconnected(*addr, reason));
        } else if self.is_connecting(addr) {
            // If we haven't yet established a connection, the disconnect
            // reason should always be a `ConnectionError`.
            if let NetDisconnect::ConnectionError(err) = reason {
                self.upstream.event(Event::ConnectionFailed(*addr, err));
            }
        }
        self.peers_storage.remove(addr);
        self.local_nonces.remove(addr);

        if self.config.persistent.contains(addr) || self.config.connect.contains(addr) {
            self.persistent_disconnected(addr, local_time);
        } else {
            // If an outbound peer disconnected, we should make sure to
            // maintain our target outbound connection count.
            self.maintain_connections(addrs).await;
        }
    }

    /// Called when a `version` message was received.
    pub fn received_version<A: AddressSource>(
        &mut self,
        addr: &PeerId,
        msg: VersionMessage,
        addrs: &mut A,
    ) {
        if let Err(reason) = self.handle_version(addr, msg, addrs) {
            self._disconnect(*addr, reason);
        }
    }

    fn handle_version<A: AddressSource>(
        &mut self,
        addr: &PeerId,
        msg: VersionMessage,
        addrs: &mut A,
    ) -> Result<(), DisconnectReason> {
        let now = self.clock.local_time();

        if let Some(Peer::Connected { conn, .. }) = self.peers_storage.get(addr) {
            self.upstream.event(Event::VersionReceived {
                addr: *addr,
                msg: msg.clone(),
            });

            let VersionMessage {
                // Peer's local time.
                timestamp,
                // Highest protocol version understood by the peer.
                version,
                // Services offered by this peer.
                services,
                // User agent.
                user_agent,
                // Peer nonce.
                nonce,
                // Our address, as seen by the remote peer.
                receiver,
                // Peer's current best height.
                start_height,
                // Relay node.
                relay,
                ..
            } = msg;

            let target = self.config.target_outbound_peers;
            let trusted =
                self.config.whitelist.contains(&addr.ip(), &user_agent) || is_local(&addr.ip());

            // Don't support peers with too old of a protocol version.
            if version < crate::fsm::handler::MIN_PROTOCOL_VERSION {
                return Err(DisconnectReason::PeerProtocolVersion(version));
            }

            // Detect self-connections: the nonce is one we sent out
            // ourselves. Disconnect without penalty.
            if self.local_nonces.values().any(|local| *local == nonce) {
                return Err(DisconnectReason::SelfConnection);
            }

            // Peers that don't advertise the required services are not
            // useful to dial out to.
            if conn.link.is_outbound() && !services.has(self.config.required_services) && !trusted {
                return Err(DisconnectReason::PeerServices(services));
            }

            // If we already have enough outbound peers, don't take on more.
            if conn.link.is_outbound() && self.negotiated(Link::Outbound).count() >= target {
                return Err(DisconnectReason::ConnectionLimit);
            }

            // Record the address this peer has of us.
            if let Ok(addr) = receiver.socket_addr() {
                addrs.record_local_address(addr);
            }

            match conn.link {
                Link::Inbound => {
                    let reply_nonce = self.rng.u64(..);

                    self.local_nonces.insert(conn.socket.addr, reply_nonce);
                    self.upstream.version(
                        conn.socket.addr,
                        self.version(conn.socket.addr, conn.local_addr, reply_nonce),
                    );
                    self.upstream
                        .verack(conn.socket.addr)
                        .set_timer(HANDSHAKE_TIMEOUT);
                }
                Link::Outbound => {
                    self.upstream
                        .verack(conn.socket.addr)
                        .set_timer(HANDSHAKE_TIMEOUT);
                }
            }
            let conn = conn.clone();
            let persistent = self.config.persistent.contains(&conn.socket.addr)
                || self.config.connect.contains(&conn.socket.addr);

            self.peers_storage.insert(
                conn.socket.addr,
                Peer::Connected {
                    conn,
                    peer: Some(PeerInfo {
                        nonce,
                        time_offset: timestamp - now.as_secs() as i64,
                        services,
                        persistent,
                        user_agent,
                        height: start_height,
                        state: HandshakeState::Version { since: now },
                        relay,
                        version: u32::min(self.config.protocol_version, version),
                    }),
                },
            );
        }

        Ok(())
    }

    /// Called when a `verack` message was received.
    pub fn received_verack(
        &mut self,
        addr: &PeerId,
        local_time: LocalTime,
    ) -> Option<(PeerInfo, Connection)> {
        if let Some(Peer::Connected {
            peer: Some(peer),
            conn,
        }) = self.peers_storage.get_mut(addr)
        {
            if let HandshakeState::Version { .. } = peer.state {
                peer.state = HandshakeState::Verack { since: local_time };

                self.upstream.event(Event::Negotiated {
                    addr: *addr,
                    link: conn.link,
                    services: peer.services,
                    user_agent: peer.user_agent.clone(),
                    version: peer.version,
                    height: peer.height,
                });

                return Some((peer.clone(), conn.clone()));
            } else {
                self._disconnect(
                    *addr,
                    DisconnectReason::PeerMisbehaving("unexpected `verack` message received"),
                );
            }
        }
        None
    }

    /// Apply a misbehaviour score to a peer. Returns `true` when the peer
    /// crossed the ban threshold and should be banned and disconnected.
    /// Whitelisted and local peers are never banned.
    pub fn misbehaving(
        &mut self,
        addr: &PeerId,
        score: u32,
        reason: &'static str,
        banscore: u32,
    ) -> bool {
        let Some(Peer::Connected { conn, peer }) = self.peers_storage.get_mut(addr) else {
            return false;
        };

        conn.misbehaviour = conn.misbehaviour.saturating_add(score);
        let total = conn.misbehaviour;

        let user_agent = peer.as_ref().map(|p| p.user_agent.as_str()).unwrap_or("");
        let trusted =
            self.config.whitelist.contains(&addr.ip(), user_agent) || is_local(&addr.ip());

        debug!(target: "p2p", "{}: Misbehaving (+{} = {}): {}", addr, score, total, reason);

        if total >= banscore {
            self.upstream.event(Event::Misbehaved {
                addr: *addr,
                score: total,
                reason,
            });
            return !trusted;
        }
        false
    }

    /// Called when a tick was received.
    pub async fn received_wake<A: AddressSource>(&mut self, addrs: &mut A) {
        let mut timed_out = Vec::new();
        let local_time = self.clock.local_time();

        // Time out all peers that have been idle in a "connecting" state
        // for too long.
        for addr in self.idle_peers(local_time).collect::<Vec<_>>() {
            timed_out.push((addr, "connection"));
        }
        // Time out peers that haven't sent a `verack` quickly enough.
        for (peer, conn) in self.peers() {
            match peer.state {
                HandshakeState::Version { since } => {
                    if local_time - since >= HANDSHAKE_TIMEOUT {
                        timed_out.push((conn.socket.addr, "handshake"));
                    }
                }
                HandshakeState::Verack { .. } => {}
            }
        }
        // Time out peers that haven't sent a `version` quickly enough.
        // These have sent nothing since connecting: silent peers.
        for connected in self.peers_storage.values().filter_map(|c| match c {
            Peer::Connected { conn, peer: None } => Some(conn),
            _ => None,
        }) {
            if local_time - connected.since >= HANDSHAKE_TIMEOUT {
                timed_out.push((connected.socket.addr, "handshake"));
            }
        }
        // Disconnect all timed out peers.
        for (addr, reason) in timed_out {
            self._disconnect(addr, DisconnectReason::PeerTimeout(reason));
        }

        // Disconnect peers that have been dropped from all other
        // sub-protocols. Since the job of the peer manager is simply to
        // establish connections, if a peer is dropped from all other
        // sub-protocols and we are holding on to the last reference, there
        // is no use in keeping it around.
        let dropped = self
            .negotiated(Link::Outbound)
            .filter(|(_, c)| c.socket.refs() == 1)
            .map(|(_, c)| c.socket.addr)
            .collect::<Vec<_>>();
        for addr in dropped {
            self._disconnect(addr, DisconnectReason::PeerDropped);
        }

        if local_time - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.maintain_connections(addrs).await;
            self.upstream.set_timer(IDLE_TIMEOUT);
            self.last_idle = Some(local_time);
        }

        self.maintain_persistent();
    }

    /// Whitelist a peer.
    pub fn whitelist(&mut self, addr: net::SocketAddr) -> bool {
        self.config.whitelist.addr.insert(addr.ip())
    }

    /// Create a `version` message for this peer.
    pub fn version(
        &self,
        addr: net::SocketAddr,
        local_addr: net::SocketAddr,
        nonce: u64,
    ) -> VersionMessage {
        VersionMessage {
            // Our max supported protocol version.
            version: self.config.protocol_version,
            // Local services.
            services: self.config.services,
            // Local time.
            timestamp: self.clock.local_time().as_secs() as i64,
            // Receiver address and services, as perceived by us.
            receiver: Address::new(&addr, ServiceFlags::NONE),
            // Local address (unreliable) and local services.
            sender: Address::new(&local_addr, self.config.services),
            // A nonce to detect connections to self.
            nonce,
            // Our user agent string.
            user_agent: self.config.user_agent.to_owned(),
            // The height is advertised by the message-processing layer;
            // the core itself doesn't track one.
            start_height: 0,
            // Whether we want to receive transaction `inv` messages.
            relay: true,
        }
    }
}

/// Connection management functions.
impl<U: Connect + Disconnect + SetTimer + Wire<Event>, C: Clock + Sync> PeerManager<U, C> {
    /// Called when a peer is being connected to.
    pub fn peer_attempted(&mut self, addr: &net::SocketAddr) {
        // Since all "attempts" are made from this module, we expect that when
        // a peer is attempted, we know about it already.
        //
        // It's possible that as we were attempting to connect to a peer, that
        // peer in the meantime connected to us. Hence we also account for an
        // already-connected *inbound* peer.
        debug_assert!(self.is_connecting(addr) || self.is_inbound(addr));
    }

    /// Check whether a peer is connected via an inbound link.
    pub fn is_inbound(&self, addr: &PeerId) -> bool {
        self.peers_storage.get(addr).map_or(
            false,
            |c| matches!(c, Peer::Connected { conn, .. } if conn.link.is_inbound()),
        )
    }

    /// Check whether a peer is connecting.
    pub fn is_connecting(&self, addr: &PeerId) -> bool {
        self.peers_storage
            .get(addr)
            .map_or(false, |c| matches!(c, Peer::Connecting { .. }))
    }

    /// Check whether a peer is connected.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.peers_storage
            .get(addr)
            .map_or(false, |c| matches!(c, Peer::Connected { .. }))
    }

    /// Check whether a peer is disconnected.
    pub fn is_disconnected(&self, addr: &PeerId) -> bool {
        !self.is_connected(addr) && !self.is_connecting(addr)
    }

    /// Iterator over peers that have at least sent their `version` message.
    pub fn peers(&self) -> impl Iterator<Item = (&PeerInfo, &Connection)> + Clone {
        self.peers_storage.values().filter_map(move |c| match c {
            Peer::Connected {
                conn,
                peer: Some(peer),
            } => Some((peer, conn)),
            _ => None,
        })
    }

    /// Returns connecting peers.
    pub fn connecting(&self) -> impl Iterator<Item = &PeerId> {
        self.peers_storage
            .iter()
            .filter(|(_, p)| matches!(p, Peer::Connecting { .. }))
            .map(|(addr, _)| addr)
    }

    /// Iterator over peers in a *connected* state.
    pub fn connected(&self) -> impl Iterator<Item = &Connection> + Clone {
        self.peers_storage.values().filter_map(|c| match c {
            Peer::Connected { conn, .. } => Some(conn),
            _ => None,
        })
    }

    /// Iterator over fully negotiated peers.
    pub fn negotiated(&self, link: Link) -> impl Iterator<Item = (&PeerInfo, &Connection)> + Clone {
        self.peers()
            .filter(move |(p, c)| p.is_negotiated() && c.link == link)
    }

    /// Connect to a peer.
    pub fn connect(&mut self, addr: &PeerId) -> bool {
        let time = self.clock.local_time();

        if self.is_connected(addr) || self.is_connecting(addr) {
            return true;
        }
        if !self.is_disconnected(addr) {
            return false;
        }

        self.peers_storage.insert(*addr, Peer::Connecting { time });
        self.upstream.connect(*addr, CONNECTION_TIMEOUT);

        true
    }

    /// Disconnect from a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        if self.is_connected(&addr) {
            self._disconnect(addr, reason);
        }
    }

    /// Disconnect a peer (internal).
    fn _disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.upstream.disconnect(addr, reason);
    }

    /// Given the current peer state and target, calculate how many new
    /// connections we should make.
    fn delta(&self) -> usize {
        let negotiated = self.negotiated(Link::Outbound).count();
        let connected = self
            .connected()
            .filter(|c| c.link.is_outbound())
            .count()
            .saturating_sub(negotiated);
        let connecting = self.connecting().count();

        self.config
            .target_outbound_peers
            .saturating_sub(negotiated + connected + connecting)
    }

    /// Groups already represented among outbound peers, connecting included.
    fn connected_groups(&self) -> HashSet<u32> {
        self.connecting()
            .map(|addr| addr_group(&addr.ip()))
            .chain(
                self.connected()
                    .filter(|c| c.link.is_outbound())
                    .map(|c| addr_group(&c.socket.addr.ip())),
            )
            .collect()
    }

    /// Attempt to maintain a certain number of outbound peers.
    pub async fn maintain_connections<A: AddressSource>(&mut self, addrs: &mut A) {
        // With an exclusive peer list, the generic dialer is disabled
        // entirely; the configured peers are retried instead.
        if !self.config.connect.is_empty() {
            return;
        }

        let local_time = self.clock.local_time();
        let delta = self.delta();

        // Sampling bias towards the new pool grows with the number of
        // outbound peers we already have.
        let outbound = self.negotiated(Link::Outbound).count();
        let bias = 10 + (usize::min(outbound, 8) * 10) as u8;

        let mut groups = self.connected_groups();
        let connected_peers: HashSet<SocketAddr> = self.peers_storage.keys().cloned().collect();

        let mut connecting = 0;
        let mut rejected = 0;

        while connecting < delta && rejected < MAX_SAMPLE_ATTEMPTS {
            // The recently-tried and non-default-port rules soften as the
            // batch keeps getting rejected.
            let relax_retry = rejected >= RETRY_RELAX_AFTER;
            let relax_port = rejected >= PORT_RELAX_AFTER;
            let default_port = self.network.default_port();
            let groups_snapshot = groups.clone();

            let sampled = addrs.sample_with(bias, |ka| {
                let Ok(sockaddr) = ka.addr.socket_addr() else {
                    return false;
                };
                if connected_peers.contains(&sockaddr) {
                    return false;
                }
                // Never two outbound peers in the same address group.
                if groups_snapshot.contains(&addr_group(&sockaddr.ip())) {
                    return false;
                }
                if !relax_retry {
                    if let Some(last_attempt) = ka.last_attempt {
                        if local_time - last_attempt < RETRY_DELAY {
                            return false;
                        }
                    }
                }
                if !relax_port && sockaddr.port() != default_port {
                    return false;
                }
                true
            });

            match sampled {
                Some((addr, source)) => {
                    let Ok(sockaddr) = addr.socket_addr() else {
                        continue;
                    };
                    debug_assert!(!self.is_connected(&sockaddr));

                    if self.connect(&sockaddr) {
                        groups.insert(addr_group(&sockaddr.ip()));
                        connecting += 1;
                        self.upstream.event(Event::Connecting(sockaddr, source));
                    } else {
                        rejected += 1;
                    }
                }
                None => {
                    // The address book has nothing for us: fall back on the
                    // seed sources.
                    if !self.fetch_seeds(addrs).await {
                        break;
                    }
                    rejected += 1;
                }
            }
        }
    }

    /// Pull addresses from the seed sources into the address book. First
    /// the hardcoded seed list (held back for a minute after startup, and
    /// aged randomly so that real gossip immediately outranks it), then the
    /// DNS seeds. Returns whether any addresses were added.
    async fn fetch_seeds<A: AddressSource>(&mut self, addrs: &mut A) -> bool {
        let local_time = self.clock.local_time();

        if !self.seeded
            && !self.config.seeds.is_empty()
            && local_time - self.started_at.unwrap_or_default() >= SEED_DELAY
        {
            let seeds: Vec<(u32, Address)> = self
                .config
                .seeds
                .iter()
                .map(|addr| {
                    let age = self.rng.u64(SEED_AGE_MIN..SEED_AGE_MAX);

                    (
                        (local_time - LocalDuration::from_secs(age)).as_secs() as u32,
                        Address::new(addr, self.config.required_services),
                    )
                })
                .collect();

            debug!(target: "p2p", "Injecting {} hardcoded seed address(es)", seeds.len());

            addrs.insert(seeds, Source::Seed);
            self.seeded = true;

            return true;
        }

        if self.config.dns_seeds.is_empty() {
            debug!(target: "p2p", "Address book exhausted and no DNS seeds configured");
            return false;
        }

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

        let seed_ix = self.rng.usize(0..self.config.dns_seeds.len());
        let dns_seed = self
            .config
            .dns_seeds
            .get(seed_ix)
            .expect("must return dns seed");
        let port = self.network.default_port();

        match resolver.lookup_ip(dns_seed.to_string()).await {
            Ok(response) => {
                let ips: Vec<(u32, Address)> = response
                    .iter()
                    .map(|ip| {
                        (
                            self.clock.local_time().as_secs() as u32,
                            Address::new(&SocketAddr::new(ip, port), ServiceFlags::NONE),
                        )
                    })
                    .collect();

                debug!(target: "p2p", "Got {} address(es) from DNS seed {}", ips.len(), dns_seed);

                let empty = ips.is_empty();
                addrs.insert(ips, Source::Dns);

                !empty
            }
            Err(e) => {
                error!(target: "p2p", "Failed to get addresses from DNS seed {dns_seed}: {e}");
                false
            }
        }
    }

    /// Peers that have been idle longer than [`CONNECTION_TIMEOUT`].
    fn idle_peers(&self, now: LocalTime) -> impl Iterator<Item = PeerId> + '_ {
        self.peers_storage.iter().filter_map(move |(addr, c)| {
            if let Peer::Connecting { time } = c {
                if now - *time >= CONNECTION_TIMEOUT {
                    return Some(*addr);
                }
            }
            None
        })
    }
}
