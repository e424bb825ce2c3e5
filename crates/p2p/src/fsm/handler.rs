//! The protocol state machine.
//!
//! Aggregates the sub-protocol managers, dispatches decoded messages
//! between them, and forwards opaque frames to the message-processing
//! layer through the [`FrameHandler`] seam.
use std::{borrow::Cow, collections::HashSet, fmt, net, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bitcoin::network::Magic;
use bitcoin::network::{address::Address, constants::ServiceFlags, message::CommandString};
use flume as chan;
use tracing::{debug, trace};

use crate::common::network::Network;
use crate::fsm::output::{Outbox, Wire};
use crate::wire::{Inventory, NetworkMessage, RawNetworkMessage};
use crate::{
    common::peer,
    common::peer::AddressSource,
    common::peer::KnownAddress,
    common::time::AdjustedClock,
    fsm::addrmgr::AddressManager,
    fsm::banmgr::BanManager,
    fsm::event::Event,
    fsm::peermgr::PeerManager,
    fsm::pingmgr::PingManager,
    fsm::relaymgr::RelayManager,
    fsm::{banmgr, output, peermgr, relaymgr},
    net::{Disconnect, Link, LocalDuration, LocalTime},
};

pub type PeerId = net::SocketAddr;

/// Peer-to-peer protocol version.
pub const PROTOCOL_VERSION: u32 = 70001;
/// Minimum protocol version we talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 60002;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = concat!("/tessera:", env!("CARGO_PKG_VERSION"), "/");

/// Penalty for gossip floods.
const ADDR_FLOOD_SCORE: u32 = 20;
/// Penalty for subscriptions to channels that don't exist.
const SUBSCRIPTION_SCORE: u32 = 10;
/// Penalty for application frames sent before the handshake completed.
const PREMATURE_FRAME_SCORE: u32 = 1;

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Target outbound peer connections.
    pub max_outbound_peers: usize,
    /// Maximum inbound peer connections.
    pub max_inbound_peers: usize,
    /// Number of subscription channels.
    pub subscription_channels: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_outbound_peers: peermgr::TARGET_OUTBOUND_PEERS,
            max_inbound_peers: peermgr::MAX_INBOUND_PEERS,
            subscription_channels: relaymgr::DEFAULT_SUBSCRIPTION_CHANNELS,
        }
    }
}

/// Peer whitelist.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Trusted addresses.
    pub(crate) addr: HashSet<net::IpAddr>,
    /// Trusted user-agents.
    pub(crate) user_agent: HashSet<String>,
}

impl Whitelist {
    pub(crate) fn contains(&self, addr: &net::IpAddr, user_agent: &str) -> bool {
        self.addr.contains(addr) || self.user_agent.contains(user_agent)
    }
}

/// Reference counting virtual socket.
/// When there are no more references held, this peer can be dropped.
#[derive(Clone, Debug)]
pub struct Socket {
    /// Socket address.
    pub addr: net::SocketAddr,
    /// Reference counter.
    refs: Arc<()>,
}

impl Socket {
    /// Create a new virtual socket.
    pub fn new(addr: impl Into<net::SocketAddr>) -> Self {
        Self {
            addr: addr.into(),
            refs: Arc::new(()),
        }
    }

    /// Get the number of references to this virtual socket.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.refs)
    }
}

impl From<net::SocketAddr> for Socket {
    fn from(addr: net::SocketAddr) -> Self {
        Self::new(addr)
    }
}

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer is misbehaving.
    PeerMisbehaving(&'static str),
    /// Peer protocol version is too old.
    PeerProtocolVersion(u32),
    /// Peer doesn't have the required services.
    PeerServices(ServiceFlags),
    /// Peer magic is invalid.
    PeerMagic(Magic),
    /// Peer timed out.
    PeerTimeout(&'static str),
    /// Peer was dropped by all sub-protocols.
    PeerDropped,
    /// Connection to self was detected.
    SelfConnection,
    /// Inbound connection limit reached.
    ConnectionLimit,
    /// Error trying to decode incoming message.
    DecodeError,
    /// Peer flooded its receive or send buffer.
    FloodControl,
    /// Peer was forced to disconnect by external command.
    Command,
    /// Peer was banned for crossing the misbehaviour threshold.
    PeerBanned,
}

impl DisconnectReason {
    /// Check whether the disconnect reason is transient, ie. may no longer
    /// be applicable after some time.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLimit | Self::PeerTimeout(_))
    }
}

impl From<DisconnectReason> for crate::net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMisbehaving(reason) => write!(f, "peer misbehaving: {}", reason),
            Self::PeerProtocolVersion(_) => write!(f, "peer protocol version mismatch"),
            Self::PeerServices(_) => write!(f, "peer doesn't have the required services"),
            Self::PeerMagic(magic) => write!(f, "received message with invalid magic: {}", magic),
            Self::PeerTimeout(s) => write!(f, "peer timed out: {:?}", s),
            Self::PeerDropped => write!(f, "peer dropped"),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "inbound connection limit reached"),
            Self::DecodeError => write!(f, "message decode error"),
            Self::FloodControl => write!(f, "receive or send buffer exceeded"),
            Self::Command => write!(f, "received external command"),
            Self::PeerBanned => write!(f, "peer was banned due to violation of protocol rules"),
        }
    }
}

/// A remote peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: net::SocketAddr,
    /// Local peer address.
    pub local_addr: net::SocketAddr,
    /// Whether this is an inbound or outbound peer connection.
    pub link: Link,
    /// Connected since this time.
    pub since: LocalTime,
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// Peer's announced start height.
    pub height: i32,
    /// Whether this peer relays transactions.
    pub relay: bool,
}

impl Peer {
    /// Check if this is an outbound peer.
    pub fn is_outbound(&self) -> bool {
        self.link.is_outbound()
    }
}

impl From<(&peermgr::PeerInfo, &peermgr::Connection)> for Peer {
    fn from((peer, conn): (&peermgr::PeerInfo, &peermgr::Connection)) -> Self {
        Self {
            addr: conn.socket.addr,
            local_addr: conn.local_addr,
            link: conn.link,
            since: conn.since,
            services: peer.services,
            user_agent: peer.user_agent.clone(),
            height: peer.height,
            relay: peer.relay,
        }
    }
}

/// A misbehaviour report, returned by the message-processing layer when a
/// frame violates its protocol.
#[derive(Debug, Clone, Copy)]
pub struct Violation {
    /// Score to add to the peer's misbehaviour total.
    pub score: u32,
    /// Why the penalty was applied.
    pub reason: &'static str,
}

/// The upward seam to the message-processing layer.
///
/// The core interprets handshake, gossip, liveness, relay and subscription
/// messages itself; every other frame is handed here.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// An opaque frame was received from a negotiated peer. A returned
    /// [`Violation`] is added to the peer's misbehaviour score and may get
    /// it banned.
    async fn frame_received(
        &mut self,
        peer: &Peer,
        command: &CommandString,
        payload: &[u8],
    ) -> Result<(), Violation>;

    /// Collect frames to send to a negotiated peer. Called on every pump
    /// tick; `trickle` is true for the one random peer receiving deferred
    /// broadcasts this tick.
    async fn produce_frames(&mut self, peer: &Peer, trickle: bool) -> Vec<(CommandString, Vec<u8>)>;
}

/// An instance of the peer-to-peer protocol.
pub struct StateMachine<P, C, H> {
    /// The network we're connecting to.
    pub network: Network,
    /// Peer address manager.
    addrmgr: AddressManager<P, Outbox, C>,
    /// Ban manager.
    banmgr: BanManager<Outbox, C>,
    /// Ping manager.
    pingmgr: PingManager<Outbox, C>,
    /// Peer manager.
    pub peermgr: PeerManager<Outbox, C>,
    /// Relay manager.
    relaymgr: RelayManager<Outbox, C>,
    /// The external message-processing layer.
    handler: H,
    /// Network-adjusted clock.
    pub clock: C,
    /// Last time a status line was logged.
    last_tick: LocalTime,
    /// Misbehaviour score at which a peer is banned.
    banscore: u32,
    /// How long bans last.
    bantime: LocalDuration,
    /// Maximum inbound peer connections.
    max_inbound_peers: usize,
    /// Random number generator.
    pub rng: fastrand::Rng,
    /// Outbound I/O. Used to communicate protocol events with a reactor.
    pub outbox: Outbox,
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The network we are connected to.
    pub network: Network,
    /// Exclusive peer list; disables the generic dialer when non-empty.
    pub connect: Vec<net::SocketAddr>,
    /// Peers to persistently reconnect to, alongside the generic dialer.
    pub persistent: Vec<net::SocketAddr>,
    /// Services offered by our peer.
    pub services: ServiceFlags,
    /// Required peer services.
    pub required_services: ServiceFlags,
    /// Peer whitelist. Peers in this list are trusted by default.
    pub whitelist: Whitelist,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Configured limits.
    pub limits: Limits,
    /// Misbehaviour score at which a peer is banned.
    pub banscore: u32,
    /// How long bans last.
    pub bantime: LocalDuration,
    /// Hardcoded seed addresses.
    pub seeds: Vec<net::SocketAddr>,
    /// DNS seed hostnames. Empty disables DNS seeding.
    pub dns_seeds: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            connect: Vec::new(),
            persistent: Vec::new(),
            services: ServiceFlags::NETWORK,
            required_services: ServiceFlags::NETWORK,
            whitelist: Whitelist::default(),
            user_agent: USER_AGENT,
            limits: Limits::default(),
            banscore: banmgr::DEFAULT_BAN_SCORE,
            bantime: banmgr::DEFAULT_BAN_TIME,
            seeds: Vec::new(),
            dns_seeds: Vec::new(),
        }
    }
}

impl<P, C, H> Iterator for StateMachine<P, C, H> {
    type Item = output::Io;

    fn next(&mut self) -> Option<output::Io> {
        self.outbox.next()
    }
}

/// A command or request that can be sent to the protocol.
#[derive(Clone)]
pub enum Command {
    /// Get connected peers.
    GetPeers(chan::Sender<Vec<Peer>>),
    /// Connect to a peer.
    Connect(SocketAddr),
    /// Disconnect from a peer.
    Disconnect(SocketAddr),
    /// Broadcast an opaque frame to all negotiated peers.
    Broadcast(CommandString, Vec<u8>, chan::Sender<Vec<PeerId>>),
    /// Send an opaque frame to a random negotiated outbound peer.
    Query(CommandString, Vec<u8>, chan::Sender<Option<SocketAddr>>),
    /// Import addresses into the address book.
    ImportAddresses(Vec<Address>),
    /// Put an object into the relay pool and announce it.
    Relay(Inventory, CommandString, Vec<u8>),
    /// Subscribe the local node to a broadcast channel.
    Subscribe(u32, u32),
    /// Cancel a local channel subscription.
    CancelSubscribe(u32),
    /// Ban a peer and refuse its future connections.
    BanPeer(SocketAddr),
    /// Snapshot the address book, eg. for persisting it.
    DumpPeers(chan::Sender<Vec<(SocketAddr, KnownAddress)>>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetPeers(_) => write!(f, "GetPeers"),
            Self::Connect(addr) => write!(f, "Connect({})", addr),
            Self::Disconnect(addr) => write!(f, "Disconnect({})", addr),
            Self::Broadcast(cmd, payload, _) => {
                write!(f, "Broadcast({}, {} byte(s))", cmd, payload.len())
            }
            Self::Query(cmd, payload, _) => write!(f, "Query({}, {} byte(s))", cmd, payload.len()),
            Self::ImportAddresses(addrs) => write!(f, "ImportAddresses({:?})", addrs),
            Self::Relay(inv, cmd, _) => write!(f, "Relay({}, {})", inv, cmd),
            Self::Subscribe(channel, hops) => write!(f, "Subscribe({}, {})", channel, hops),
            Self::CancelSubscribe(channel) => write!(f, "CancelSubscribe({})", channel),
            Self::BanPeer(addr) => write!(f, "BanPeer({:?})", addr),
            Self::DumpPeers(_) => write!(f, "DumpPeers"),
        }
    }
}

impl<P, C, H> StateMachine<P, C, H>
where
    P: peer::Store + Send,
    C: AdjustedClock<PeerId> + Sync + Send,
    H: FrameHandler,
{
    /// Construct a new protocol instance.
    pub fn new(peers: P, clock: C, rng: fastrand::Rng, config: Config, handler: H) -> Self {
        let Config {
            network,
            connect,
            persistent,
            services,
            whitelist,
            user_agent,
            required_services,
            limits,
            banscore,
            bantime,
            seeds,
            dns_seeds,
        } = config;

        let outbox = Outbox::new(network);
        let banmgr = BanManager::new(outbox.clone(), clock.clone());
        let pingmgr = PingManager::new(rng.clone(), outbox.clone(), clock.clone());
        let peermgr = PeerManager::new(
            peermgr::Config {
                protocol_version: PROTOCOL_VERSION,
                whitelist,
                connect,
                persistent,
                target_outbound_peers: limits.max_outbound_peers,
                max_inbound_peers: limits.max_inbound_peers,
                retry_max_wait: LocalDuration::from_mins(2),
                retry_min_wait: LocalDuration::from_secs(1),
                required_services,
                services,
                user_agent,
                seeds,
                dns_seeds,
            },
            rng.clone(),
            outbox.clone(),
            clock.clone(),
            network,
        );
        let addrmgr = AddressManager::new(rng.clone(), peers, outbox.clone(), clock.clone());
        let relaymgr = RelayManager::new(
            limits.subscription_channels,
            rng.clone(),
            outbox.clone(),
            clock.clone(),
        );

        Self {
            network,
            clock,
            addrmgr,
            banmgr,
            pingmgr,
            peermgr,
            relaymgr,
            handler,
            last_tick: LocalTime::default(),
            banscore,
            bantime,
            max_inbound_peers: limits.max_inbound_peers,
            rng,
            outbox,
        }
    }

    /// Process a user command.
    pub async fn command(&mut self, cmd: Command) {
        debug!(target: "p2p", "Received command: {:?}", cmd);

        match cmd {
            Command::GetPeers(reply) => {
                let peers = self
                    .peermgr
                    .peers()
                    .filter(|(p, _)| p.is_negotiated())
                    .map(Peer::from)
                    .collect::<Vec<Peer>>();

                reply.send_async(peers).await.ok();
            }
            Command::Connect(addr) => {
                self.peermgr.whitelist(addr);
                self.peermgr.connect(&addr);
            }
            Command::Disconnect(addr) => {
                self.disconnect(addr, DisconnectReason::Command);
            }
            Command::Broadcast(command, payload, reply) => {
                let peers = self.broadcast(command, payload, |_| true);
                reply.send_async(peers).await.ok();
            }
            Command::Query(command, payload, reply) => {
                reply
                    .send_async(self.query(command, payload, |_| true))
                    .await
                    .ok();
            }
            Command::ImportAddresses(addrs) => {
                self.addrmgr.insert(
                    // Nb. For imported addresses, the time last active is not
                    // relevant.
                    addrs.into_iter().map(|a| (0u32, a)),
                    peer::Source::Imported,
                );
            }
            Command::Relay(inv, command, payload) => {
                self.relaymgr.relay(inv, command, payload);
            }
            Command::Subscribe(channel, hops) => {
                self.relaymgr.subscribe_local(channel, hops);
            }
            Command::CancelSubscribe(channel) => {
                self.relaymgr.cancel_subscribe_local(channel);
            }
            Command::BanPeer(addr) => {
                self.ban(addr);
            }
            Command::DumpPeers(reply) => {
                reply.send_async(self.addrmgr.snapshot()).await.ok();
            }
        }
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.peermgr.disconnect(addr, reason);
    }

    /// Ban a peer address and disconnect the peer, if connected.
    fn ban(&mut self, addr: PeerId) {
        self.banmgr.ban(addr.ip(), self.bantime);
        self.addrmgr.remove_ip(&addr.ip());
        self.peermgr.disconnect(addr, DisconnectReason::PeerBanned);
    }

    /// Apply a misbehaviour score to a peer, banning it when the threshold
    /// is crossed.
    pub fn misbehaving(&mut self, addr: PeerId, score: u32, reason: &'static str) {
        if self
            .peermgr
            .misbehaving(&addr, score, reason, self.banscore)
        {
            self.ban(addr);
        }
    }

    /// Send an opaque frame to all negotiated peers matching the predicate.
    fn broadcast<Q>(&mut self, command: CommandString, payload: Vec<u8>, predicate: Q) -> Vec<PeerId>
    where
        Q: Fn(&Peer) -> bool,
    {
        let mut peers = Vec::new();

        let negotiated: Vec<Peer> = self
            .peermgr
            .peers()
            .filter(|(p, _)| p.is_negotiated())
            .map(Peer::from)
            .collect();

        for peer in negotiated {
            if predicate(&peer) {
                peers.push(peer.addr);
                Wire::<Event>::raw(&mut self.outbox, peer.addr, command.clone(), payload.clone());
            }
        }

        peers
    }

    /// Send an opaque frame to a random negotiated outbound peer. Returns
    /// the chosen peer, if any.
    fn query<Q>(&mut self, command: CommandString, payload: Vec<u8>, f: Q) -> Option<PeerId>
    where
        Q: Fn(&Peer) -> bool,
    {
        let peers = self
            .peermgr
            .negotiated(Link::Outbound)
            .map(Peer::from)
            .filter(f)
            .collect::<Vec<_>>();

        match peers.len() {
            n if n > 0 => {
                let r = self.rng.usize(..n);
                let p = peers.get(r).unwrap();

                Wire::<Event>::raw(&mut self.outbox, p.addr, command, payload);

                Some(p.addr)
            }
            _ => None,
        }
    }

    /// The connected peer with the given address, if it has negotiated.
    fn negotiated_peer(&self, addr: &PeerId) -> Option<Peer> {
        self.peermgr
            .peers()
            .filter(|(p, _)| p.is_negotiated())
            .find(|(_, c)| c.socket.addr == *addr)
            .map(Peer::from)
    }
}

#[async_trait]
impl<P, C, H> crate::net::StateMachine for StateMachine<P, C, H>
where
    P: peer::Store + Send,
    C: AdjustedClock<PeerId> + Sync + Send,
    H: FrameHandler,
{
    type Message = RawNetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.banmgr.initialize();
        self.addrmgr.initialize();
        self.relaymgr.initialize();
        self.peermgr.initialize(&mut self.addrmgr).await;

        self.outbox.event(Event::Ready { time });
    }

    async fn message_received(&mut self, addr: &SocketAddr, msg: Cow<'_, RawNetworkMessage>) {
        let now = self.clock.local_time();
        let addr = *addr;
        let msg = msg.into_owned();

        if msg.magic != self.network.magic() {
            self.disconnect(addr, DisconnectReason::PeerMagic(msg.magic));
            return;
        }

        if !self.peermgr.is_connected(&addr) {
            debug!(target: "p2p", "Received {:?} from unknown peer {}", msg.command(), addr);
            return;
        }

        debug!(target: "p2p", "Received {:?} from {}", msg.command(), addr);

        // Any complete frame counts as activity.
        self.pingmgr.record_recv(&addr);
        self.addrmgr.peer_active(addr);

        match msg.payload {
            NetworkMessage::Version(version) => {
                self.peermgr
                    .received_version(&addr, version, &mut self.addrmgr);
            }
            NetworkMessage::Verack => {
                if let Some((peer, conn)) = self.peermgr.received_verack(&addr, now) {
                    self.clock.record_offset(conn.socket.addr, peer.time_offset);
                    self.addrmgr.peer_negotiated(&addr, peer.services);
                    self.pingmgr.peer_negotiated(conn.socket.addr);
                    self.relaymgr.peer_negotiated(conn.socket.addr);
                }
            }
            NetworkMessage::Ping(nonce) => {
                self.pingmgr.received_ping(addr, nonce);
            }
            NetworkMessage::Pong(nonce) => {
                self.pingmgr.received_pong(addr, nonce, now);
            }
            NetworkMessage::Addr(addresses) => {
                // Gossip for banned addresses is dropped at the door.
                let addresses: Vec<_> = addresses
                    .into_iter()
                    .filter(|(_, a)| {
                        a.socket_addr()
                            .map_or(false, |s| !self.banmgr.is_banned(&s.ip()))
                    })
                    .collect();

                if !self.addrmgr.received_addr(addr, addresses) {
                    self.misbehaving(addr, ADDR_FLOOD_SCORE, "address gossip flood");
                }
            }
            NetworkMessage::GetAddr => {
                self.addrmgr.received_getaddr(&addr);
            }
            NetworkMessage::Inv(inv) => {
                self.relaymgr.received_inv(addr, inv);
            }
            NetworkMessage::GetData(inv) => {
                let unserved = self.relaymgr.received_getdata(addr, inv);

                if !unserved.is_empty() {
                    trace!(
                        target: "p2p",
                        "{}: {} requested object(s) not in the relay pool",
                        addr,
                        unserved.len()
                    );
                }
            }
            NetworkMessage::Subscribe { channel, hops } => {
                if !self.relaymgr.received_subscribe(addr, channel, hops) {
                    self.misbehaving(addr, SUBSCRIPTION_SCORE, "invalid subscription channel");
                }
            }
            NetworkMessage::SubCancel { channel } => {
                if !self.relaymgr.received_sub_cancel(addr, channel) {
                    self.misbehaving(addr, SUBSCRIPTION_SCORE, "invalid subscription channel");
                }
            }
            NetworkMessage::Unknown { command, payload } => {
                let Some(peer) = self.negotiated_peer(&addr) else {
                    self.misbehaving(addr, PREMATURE_FRAME_SCORE, "frame before handshake");
                    return;
                };

                if let Err(violation) = self
                    .handler
                    .frame_received(&peer, &command, &payload)
                    .await
                {
                    self.misbehaving(addr, violation.score, violation.reason);
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.addrmgr.peer_attempted(addr);
        self.peermgr.peer_attempted(addr);
    }

    fn connected(
        &mut self,
        addr: net::SocketAddr,
        local_addr: &net::SocketAddr,
        link: Link,
    ) -> bool {
        if self.banmgr.is_banned(&addr.ip()) {
            debug!(target: "p2p", "{}: Refusing connection: banned", addr);
            return false;
        }
        if link.is_inbound() {
            let inbound = self
                .peermgr
                .connected()
                .filter(|c| c.link.is_inbound())
                .count();

            if inbound >= self.max_inbound_peers
                && !self.peermgr.config.whitelist.contains(&addr.ip(), "")
            {
                debug!(target: "p2p", "{}: Refusing connection: inbound limit reached", addr);
                return false;
            }
        }
        if self.peermgr.is_connected(&addr) {
            return false;
        }

        self.peermgr.peer_connected(addr, *local_addr, link);
        self.addrmgr.record_local_address(*local_addr);
        self.addrmgr.peer_connected(&addr);

        true
    }

    async fn disconnected(&mut self, addr: &SocketAddr, reason: Disconnect<DisconnectReason>) {
        self.addrmgr.peer_disconnected(addr);
        self.pingmgr.peer_disconnected(addr);
        self.relaymgr.peer_disconnected(addr);
        self.peermgr
            .peer_disconnected(addr, &mut self.addrmgr, reason)
            .await;
    }

    fn tick(&mut self, local_time: LocalTime) {
        trace!(target: "p2p", "Received tick");

        self.clock.set(local_time);
    }

    async fn timer_expired(&mut self) {
        trace!(target: "p2p", "Received wake");

        self.pingmgr.received_wake();
        self.addrmgr.received_wake();
        self.banmgr.received_wake();
        self.peermgr.received_wake(&mut self.addrmgr).await;

        let trickle = self.relaymgr.received_wake();

        // Pump the message-processing layer: collect its outgoing frames
        // for every negotiated peer, deferring broadcast-style traffic to
        // the trickle target.
        let peers: Vec<Peer> = self
            .peermgr
            .peers()
            .filter(|(p, _)| p.is_negotiated())
            .map(Peer::from)
            .collect();

        for peer in peers {
            let frames = self
                .handler
                .produce_frames(&peer, trickle == Some(peer.addr))
                .await;

            for (command, payload) in frames {
                Wire::<Event>::raw(&mut self.outbox, peer.addr, command, payload);
            }
        }

        let local_time = self.clock.local_time();

        if local_time - self.last_tick >= LocalDuration::from_secs(10) {
            let outbound = self.peermgr.negotiated(Link::Outbound).count();
            let inbound = self.peermgr.negotiated(Link::Inbound).count();
            let connecting = self.peermgr.connecting().count();
            let target = self.peermgr.config.target_outbound_peers;
            let max_inbound = self.peermgr.config.max_inbound_peers;
            let addresses = self.addrmgr.len();
            let banned = self.banmgr.len();

            debug!(
                target: "p2p",
                "outbound = {}/{}, inbound = {}/{}, connecting = {}, addresses = {}, banned = {}",
                outbound, target, inbound, max_inbound, connecting, addresses, banned
            );
            self.last_tick = local_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::peer::Cache;
    use crate::common::peer::Source;
    use crate::common::time::{AdjustedTime, RefClock};
    use crate::fsm::addrmgr::addr_group;
    use crate::fsm::output::Io;
    use crate::net::StateMachine as _;
    use bitcoin::network::message_network::VersionMessage;

    /// A message-processing layer that accepts everything.
    struct NullHandler;

    #[async_trait]
    impl FrameHandler for NullHandler {
        async fn frame_received(
            &mut self,
            _peer: &Peer,
            _command: &CommandString,
            _payload: &[u8],
        ) -> Result<(), Violation> {
            Ok(())
        }

        async fn produce_frames(
            &mut self,
            _peer: &Peer,
            _trickle: bool,
        ) -> Vec<(CommandString, Vec<u8>)> {
            vec![]
        }
    }

    /// A message-processing layer that penalizes every frame.
    struct StrictHandler(u32);

    #[async_trait]
    impl FrameHandler for StrictHandler {
        async fn frame_received(
            &mut self,
            _peer: &Peer,
            _command: &CommandString,
            _payload: &[u8],
        ) -> Result<(), Violation> {
            Err(Violation {
                score: self.0,
                reason: "frame rejected",
            })
        }

        async fn produce_frames(
            &mut self,
            _peer: &Peer,
            _trickle: bool,
        ) -> Vec<(CommandString, Vec<u8>)> {
            vec![]
        }
    }

    type Machine<H> = StateMachine<Cache, RefClock<AdjustedTime<PeerId>>, H>;

    const NOW: u64 = 1_700_000_000;

    fn machine<H: FrameHandler>(config: Config, handler: H, seed: u64) -> Machine<H> {
        StateMachine::new(
            Cache::new(),
            RefClock::from(AdjustedTime::new(LocalTime::from_secs(NOW))),
            fastrand::Rng::with_seed(seed),
            config,
            handler,
        )
    }

    fn drain<H>(machine: &mut Machine<H>) -> Vec<Io> {
        let mut io = Vec::new();
        while let Some(out) = machine.next() {
            io.push(out);
        }
        io
    }

    fn version(nonce: u64, receiver: SocketAddr) -> NetworkMessage {
        NetworkMessage::Version(VersionMessage {
            version: PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK,
            timestamp: NOW as i64,
            receiver: Address::new(&receiver, ServiceFlags::NONE),
            sender: Address::new(&receiver, ServiceFlags::NETWORK),
            nonce,
            user_agent: "/other:1.0/".to_owned(),
            start_height: 4807,
            relay: true,
        })
    }

    fn raw(payload: NetworkMessage) -> RawNetworkMessage {
        RawNetworkMessage {
            magic: Network::Mainnet.magic(),
            payload,
        }
    }

    async fn receive<H: FrameHandler>(
        machine: &mut Machine<H>,
        from: SocketAddr,
        payload: NetworkMessage,
    ) {
        machine
            .message_received(&from, Cow::Owned(raw(payload)))
            .await;
    }

    /// Dial out from `machine` to `remote`, completing the socket-level
    /// connection. Returns the `version` nonce we sent.
    async fn dial<H: FrameHandler>(machine: &mut Machine<H>, remote: SocketAddr) -> u64 {
        let local: SocketAddr = ([192, 168, 1, 7], 9333).into();

        machine.peermgr.connect(&remote);
        machine.attempted(&remote);
        assert!(machine.connected(remote, &local, Link::Outbound));

        drain(machine)
            .into_iter()
            .find_map(|io| match io {
                Io::Write(addr, msg) if addr == remote => match msg.payload {
                    NetworkMessage::Version(v) => Some(v.nonce),
                    _ => None,
                },
                _ => None,
            })
            .expect("an outbound connection sends its version first")
    }

    #[tokio::test]
    async fn test_outbound_handshake() {
        let alice_addr: SocketAddr = ([33, 44, 55, 66], 9333).into();
        let bob_addr: SocketAddr = ([77, 88, 99, 11], 9333).into();
        let local: SocketAddr = ([192, 168, 1, 7], 9333).into();

        let mut alice = machine(Config::default(), NullHandler, 1);
        let mut bob = machine(Config::default(), NullHandler, 2);

        alice.initialize(LocalTime::from_secs(NOW)).await;
        bob.initialize(LocalTime::from_secs(NOW)).await;
        drain(&mut alice);
        drain(&mut bob);

        // Alice dials, bob accepts.
        alice.peermgr.connect(&bob_addr);
        alice.attempted(&bob_addr);
        assert!(alice.connected(bob_addr, &local, Link::Outbound));
        assert!(bob.connected(alice_addr, &local, Link::Inbound));

        // Shuttle messages between the two machines until they go quiet.
        loop {
            let mut progress = false;

            for io in drain(&mut alice) {
                if let Io::Write(addr, msg) = io {
                    assert_eq!(addr, bob_addr);
                    bob.message_received(&alice_addr, Cow::Owned(msg)).await;
                    progress = true;
                }
            }
            for io in drain(&mut bob) {
                if let Io::Write(addr, msg) = io {
                    assert_eq!(addr, alice_addr);
                    alice.message_received(&bob_addr, Cow::Owned(msg)).await;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }

        let (alice_peer, _) = alice
            .peermgr
            .negotiated(Link::Outbound)
            .next()
            .expect("alice has an outbound peer");
        let (bob_peer, _) = bob
            .peermgr
            .negotiated(Link::Inbound)
            .next()
            .expect("bob has an inbound peer");

        assert_eq!(alice_peer.user_agent, USER_AGENT);
        assert_eq!(bob_peer.user_agent, USER_AGENT);
    }

    #[tokio::test]
    async fn test_self_connection_is_dropped() {
        let remote: SocketAddr = ([33, 44, 55, 66], 9333).into();
        let mut alice = machine(Config::default(), NullHandler, 3);

        alice.initialize(LocalTime::from_secs(NOW)).await;

        // The remote end echoes back the nonce we sent: it's us.
        let nonce = dial(&mut alice, remote).await;
        receive(&mut alice, remote, version(nonce, remote)).await;

        let disconnects: Vec<_> = drain(&mut alice)
            .into_iter()
            .filter_map(|io| match io {
                Io::Disconnect(addr, DisconnectReason::SelfConnection) => Some(addr),
                _ => None,
            })
            .collect();
        assert_eq!(disconnects, vec![remote]);
    }

    #[tokio::test]
    async fn test_misbehaving_peer_is_banned() {
        let remote: SocketAddr = ([54, 12, 9, 9], 9333).into();
        let local: SocketAddr = ([192, 168, 1, 7], 9333).into();

        let mut alice = machine(
            Config {
                banscore: 10,
                ..Config::default()
            },
            StrictHandler(10),
            4,
        );
        alice.initialize(LocalTime::from_secs(NOW)).await;

        // Inbound peer completes the handshake.
        assert!(alice.connected(remote, &local, Link::Inbound));
        receive(&mut alice, remote, version(999, remote)).await;
        receive(&mut alice, remote, NetworkMessage::Verack).await;
        assert_eq!(alice.peermgr.negotiated(Link::Inbound).count(), 1);
        drain(&mut alice);

        // Its first application frame crosses the ban threshold.
        receive(
            &mut alice,
            remote,
            NetworkMessage::Unknown {
                command: CommandString::try_from_static("object").unwrap(),
                payload: vec![1, 2, 3],
            },
        )
        .await;

        assert!(alice.banmgr.is_banned(&remote.ip()));
        assert!(drain(&mut alice).into_iter().any(|io| matches!(
            io,
            Io::Disconnect(addr, DisconnectReason::PeerBanned) if addr == remote
        )));

        // Further connections from the banned address are refused.
        alice.disconnected(&remote, DisconnectReason::PeerBanned.into()).await;
        assert!(!alice.connected(remote, &local, Link::Inbound));
    }

    #[tokio::test]
    async fn test_inbound_connection_limit() {
        let local: SocketAddr = ([192, 168, 1, 7], 9333).into();
        let mut alice = machine(
            Config {
                limits: Limits {
                    max_inbound_peers: 2,
                    ..Limits::default()
                },
                ..Config::default()
            },
            NullHandler,
            5,
        );
        alice.initialize(LocalTime::from_secs(NOW)).await;

        assert!(alice.connected(([54, 12, 9, 1], 9333).into(), &local, Link::Inbound));
        assert!(alice.connected(([54, 13, 9, 2], 9333).into(), &local, Link::Inbound));
        assert!(!alice.connected(([54, 14, 9, 3], 9333).into(), &local, Link::Inbound));
    }

    #[tokio::test]
    async fn test_outbound_group_diversity() {
        let mut alice = machine(
            Config {
                limits: Limits {
                    max_outbound_peers: 2,
                    ..Limits::default()
                },
                ..Config::default()
            },
            NullHandler,
            6,
        );
        alice.initialize(LocalTime::from_secs(NOW)).await;
        drain(&mut alice);

        // A hundred candidates in one /16, one in another.
        let mut addrs = Vec::new();
        for i in 0..100u8 {
            addrs.push((
                (NOW - 3600) as u32,
                Address::new(
                    &SocketAddr::from(([99, 99, i, 1], 9333)),
                    ServiceFlags::NETWORK,
                ),
            ));
        }
        addrs.push((
            (NOW - 3600) as u32,
            Address::new(
                &SocketAddr::from(([44, 7, 1, 1], 9333)),
                ServiceFlags::NETWORK,
            ),
        ));
        alice.addrmgr.insert(addrs, Source::Imported);

        alice.peermgr.received_wake(&mut alice.addrmgr).await;

        let dialed: Vec<SocketAddr> = drain(&mut alice)
            .into_iter()
            .filter_map(|io| match io {
                Io::Connect(addr) => Some(addr),
                _ => None,
            })
            .collect();

        assert_eq!(dialed.len(), 2, "both outbound slots are filled");

        let groups: HashSet<u32> = dialed.iter().map(|a| addr_group(&a.ip())).collect();
        assert_eq!(groups.len(), 2, "never two outbound peers in one /16");
    }
}

