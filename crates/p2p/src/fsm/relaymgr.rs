//! Relay of announced data and the subscription/broadcast system.
//!
//! Announced objects are kept for a short while in a bounded pool so that
//! peers requesting them again can be served without involving the layer
//! above. Announcements to all but one peer per tick are deferred (the
//! "trickle"), which blurs who first relayed an object.
//!
//! The subscription system uses a meet-in-the-middle strategy: senders
//! broadcast to `k` random peers and receivers subscribe from `k` random
//! peers, which for a large mesh gives near-certain delivery without a
//! full flood.
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bitcoin::network::message::CommandString;
use tracing::{debug, trace};

use crate::{
    common::collections::PeerMap,
    common::time::Clock,
    fsm::handler::PeerId,
    net::{LocalDuration, LocalTime},
    wire::Inventory,
};

use super::output::{SetTimer, Wire};

/// How long a relayed object is served from the pool.
pub const RELAY_TTL: LocalDuration = LocalDuration::from_mins(15);
/// Upper bound on the bytes held in the relay pool. Oldest entries are
/// evicted first.
pub const RELAY_POOL_LIMIT: usize = 10 * 1024 * 1024;
/// How long before an inventory can be re-requested from the network.
pub const ASK_RETRY_DELAY: LocalDuration = LocalDuration::from_mins(2);
/// Interval between trickle ticks.
pub const TRICKLE_INTERVAL: LocalDuration = LocalDuration::from_millis(100);
/// Default number of subscription channels.
pub const DEFAULT_SUBSCRIPTION_CHANNELS: usize = 16;

/// An event emitted by the relay manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// An object was announced to our peers.
    Announced {
        /// The announced inventory.
        inv: Inventory,
    },
    /// A pooled object was served to a peer.
    Served {
        /// The requested inventory.
        inv: Inventory,
        /// The requesting peer.
        peer: PeerId,
    },
    /// A channel gained or lost its first/last subscriber.
    SubscriptionChanged {
        /// The channel.
        channel: u32,
        /// Whether anyone is subscribed now.
        active: bool,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Announced { inv } => write!(fmt, "Announced {}", inv),
            Event::Served { inv, peer } => write!(fmt, "Served {} to {}", inv, peer),
            Event::SubscriptionChanged { channel, active } => {
                write!(fmt, "Channel {} active: {}", channel, active)
            }
        }
    }
}

/// Relay state of a peer.
#[derive(Debug)]
struct Peer {
    /// Channel subscription bitmap.
    subscriptions: Vec<bool>,
    /// Announcements deferred until this peer's trickle turn.
    queue: VecDeque<Inventory>,
}

/// Manages the relay pool, announcement trickle and subscriptions.
#[derive(Debug)]
pub struct RelayManager<U, C> {
    peers: PeerMap<SocketAddr, Peer>,
    /// Relayed objects, ready to be served on request.
    pool: HashMap<Inventory, (CommandString, Vec<u8>)>,
    /// Pool insertion order, for TTL and byte-cap eviction.
    pool_order: VecDeque<(LocalTime, Inventory)>,
    /// Total payload bytes in the pool.
    pool_bytes: usize,
    /// Earliest time an inventory may be requested again.
    asked: HashMap<Inventory, LocalTime>,
    /// Local subscription bitmap.
    local_subscriptions: Vec<bool>,
    /// Number of subscription channels.
    channels: usize,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer, C: Clock> RelayManager<U, C> {
    /// Create a new relay manager.
    pub fn new(channels: usize, rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            peers: PeerMap::new(rng.clone()),
            pool: HashMap::new(),
            pool_order: VecDeque::new(),
            pool_bytes: 0,
            asked: HashMap::new(),
            local_subscriptions: vec![false; channels],
            channels,
            upstream,
            rng,
            clock,
        }
    }

    /// Initialize the relay manager. Must be called once.
    pub fn initialize(&mut self) {
        self.upstream.set_timer(TRICKLE_INTERVAL);
    }

    /// Called when a peer has handshaked.
    pub fn peer_negotiated(&mut self, addr: SocketAddr) {
        self.peers.insert(
            addr,
            Peer {
                subscriptions: vec![false; self.channels],
                queue: VecDeque::new(),
            },
        );
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// Put an object into the relay pool and announce it to all peers.
    ///
    /// The actual announcements are trickled out; see [`Self::received_wake`].
    pub fn relay(&mut self, inv: Inventory, command: CommandString, payload: Vec<u8>) {
        let now = self.clock.local_time();

        self.expire(now);

        if !self.pool.contains_key(&inv) {
            self.pool_bytes += payload.len();
            self.pool.insert(inv, (command, payload));
            self.pool_order.push_back((now, inv));

            // Enforce the byte cap, oldest first.
            while self.pool_bytes > RELAY_POOL_LIMIT {
                let Some((_, oldest)) = self.pool_order.pop_front() else {
                    break;
                };
                if let Some((_, payload)) = self.pool.remove(&oldest) {
                    self.pool_bytes -= payload.len();
                }
            }
        }

        for peer in self.peers.values_mut() {
            peer.queue.push_back(inv);
        }
        self.upstream.event(Event::Announced { inv });
    }

    /// Whether the pool currently holds the given object.
    pub fn contains(&self, inv: &Inventory) -> bool {
        self.pool.contains_key(inv)
    }

    /// Called when an `inv` message is received. Requests the announced
    /// objects we don't have and haven't recently asked for.
    pub fn received_inv(&mut self, addr: SocketAddr, invs: Vec<Inventory>) {
        let now = self.clock.local_time();
        let mut fetch = Vec::new();

        for inv in invs {
            if self.pool.contains_key(&inv) {
                continue;
            }
            match self.asked.get(&inv) {
                Some(retry_at) if now < *retry_at => continue,
                _ => {}
            }
            self.asked.insert(inv, now + ASK_RETRY_DELAY);
            fetch.push(inv);
        }

        if !fetch.is_empty() {
            trace!(target: "p2p", "{}: Requesting {} object(s)", addr, fetch.len());
            self.upstream.get_data(addr, fetch);
        }
    }

    /// Called when a `getdata` message is received. Serves what the pool
    /// holds; returns the inventories that could not be served.
    pub fn received_getdata(&mut self, addr: SocketAddr, invs: Vec<Inventory>) -> Vec<Inventory> {
        let mut unserved = Vec::new();

        for inv in invs {
            match self.pool.get(&inv) {
                Some((command, payload)) => {
                    self.upstream.raw(addr, command.clone(), payload.clone());
                    self.upstream.event(Event::Served { inv, peer: addr });
                }
                None => unserved.push(inv),
            }
        }
        unserved
    }

    /// Whether any peer, or the local node, is subscribed to the channel.
    pub fn any_subscribed(&self, channel: u32) -> bool {
        let channel = channel as usize;

        if self.local_subscriptions.get(channel) == Some(&true) {
            return true;
        }
        self.peers
            .values()
            .any(|peer| peer.subscriptions.get(channel) == Some(&true))
    }

    /// Called when a `subscribe` message is received. Returns `false` if the
    /// channel is out of range, in which case the peer should be penalized.
    pub fn received_subscribe(&mut self, addr: SocketAddr, channel: u32, hops: u32) -> bool {
        if channel as usize >= self.channels {
            return false;
        }
        if !self.peers.contains_key(&addr) {
            return true;
        }

        if !self.any_subscribed(channel) {
            // First subscriber: relay the subscription to everyone else.
            let others: Vec<SocketAddr> = self
                .peers
                .keys()
                .filter(|peer| **peer != addr)
                .cloned()
                .collect();
            for peer in others {
                self.upstream.subscribe(peer, channel, hops);
            }
            self.upstream.event(Event::SubscriptionChanged {
                channel,
                active: true,
            });
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.subscriptions[channel as usize] = true;
        }
        true
    }

    /// Called when a `sub-cancel` message is received.
    pub fn received_sub_cancel(&mut self, addr: SocketAddr, channel: u32) -> bool {
        if channel as usize >= self.channels {
            return false;
        }

        // Don't relay a cancel for a channel the peer wasn't subscribed to.
        match self.peers.get_mut(&addr) {
            Some(peer) if peer.subscriptions[channel as usize] => {
                peer.subscriptions[channel as usize] = false;
            }
            _ => return true,
        }

        if !self.any_subscribed(channel) {
            let others: Vec<SocketAddr> = self
                .peers
                .keys()
                .filter(|peer| **peer != addr)
                .cloned()
                .collect();
            for peer in others {
                self.upstream.sub_cancel(peer, channel);
            }
            self.upstream.event(Event::SubscriptionChanged {
                channel,
                active: false,
            });
        }
        true
    }

    /// Subscribe the local node to a channel, relaying the subscription if
    /// it is the first one.
    pub fn subscribe_local(&mut self, channel: u32, hops: u32) {
        if channel as usize >= self.channels {
            return;
        }
        if !self.any_subscribed(channel) {
            let peers: Vec<SocketAddr> = self.peers.keys().cloned().collect();
            for peer in peers {
                self.upstream.subscribe(peer, channel, hops);
            }
        }
        self.local_subscriptions[channel as usize] = true;
    }

    /// Cancel a local channel subscription.
    pub fn cancel_subscribe_local(&mut self, channel: u32) {
        if channel as usize >= self.channels {
            return;
        }
        if !self.local_subscriptions[channel as usize] {
            return;
        }
        self.local_subscriptions[channel as usize] = false;

        if !self.any_subscribed(channel) {
            let peers: Vec<SocketAddr> = self.peers.keys().cloned().collect();
            for peer in peers {
                self.upstream.sub_cancel(peer, channel);
            }
        }
    }

    /// Called when a tick is received.
    ///
    /// Expires the pool, picks this tick's trickle target and flushes its
    /// deferred announcements. Returns the trickle target, if any.
    pub fn received_wake(&mut self) -> Option<SocketAddr> {
        let now = self.clock.local_time();

        self.expire(now);
        self.upstream.set_timer(TRICKLE_INTERVAL);

        if self.peers.is_empty() {
            return None;
        }

        // Pick one random peer to receive its deferred announcements this
        // tick. Deferring broadcasts to everyone else reduces correlation
        // of relay origins.
        let ix = self.rng.usize(..self.peers.len());
        let addr = *self.peers.keys().nth(ix).expect("index must be present");

        let peer = self.peers.get_mut(&addr).expect("peer must exist");
        if !peer.queue.is_empty() {
            let batch: Vec<Inventory> = peer.queue.drain(..).collect();

            debug!(target: "p2p", "{}: Trickling {} announcement(s)", addr, batch.len());
            self.upstream.inv(addr, batch);
        }
        Some(addr)
    }

    /// Drop pool entries past their TTL, and throttle records that have
    /// expired.
    fn expire(&mut self, now: LocalTime) {
        while let Some((inserted, inv)) = self.pool_order.front().copied() {
            if now - inserted < RELAY_TTL {
                break;
            }
            self.pool_order.pop_front();
            if let Some((_, payload)) = self.pool.remove(&inv) {
                self.pool_bytes -= payload.len();
            }
        }
        self.asked.retain(|_, retry_at| now < *retry_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{tests::drain, Outbox};
    use crate::net::Io;
    use crate::wire::NetworkMessage;

    fn inv(byte: u8) -> Inventory {
        Inventory {
            kind: 1,
            hash: [byte; 32],
        }
    }

    fn command() -> CommandString {
        CommandString::try_from_static("object").unwrap()
    }

    fn manager(now: LocalTime) -> RelayManager<Outbox, LocalTime> {
        let mut mgr = RelayManager::new(
            DEFAULT_SUBSCRIPTION_CHANNELS,
            fastrand::Rng::with_seed(21),
            Outbox::default(),
            now,
        );
        mgr.initialize();
        mgr
    }

    #[test]
    fn test_pool_serves_getdata() {
        let now = LocalTime::from_secs(1_000_000);
        let addr: SocketAddr = ([91, 92, 93, 94], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(addr);
        mgr.relay(inv(1), command(), vec![0xaa; 64]);

        let unserved = mgr.received_getdata(addr, vec![inv(1), inv(2)]);
        assert_eq!(unserved, vec![inv(2)]);

        let served = drain(&mut mgr.upstream)
            .into_iter()
            .filter(|io| {
                matches!(
                    io,
                    Io::Write(a, msg)
                        if *a == addr && matches!(&msg.payload, NetworkMessage::Unknown { .. })
                )
            })
            .count();
        assert_eq!(served, 1);
    }

    #[test]
    fn test_pool_expires() {
        let now = LocalTime::from_secs(1_000_000);
        let mut mgr = manager(now);

        mgr.relay(inv(1), command(), vec![0xaa; 64]);
        assert!(mgr.contains(&inv(1)));

        mgr.clock = now + RELAY_TTL + LocalDuration::from_secs(1);
        mgr.received_wake();
        assert!(!mgr.contains(&inv(1)));
        assert_eq!(mgr.pool_bytes, 0);
    }

    #[test]
    fn test_pool_byte_cap() {
        let now = LocalTime::from_secs(1_000_000);
        let mut mgr = manager(now);

        // Three entries of 4 MiB: the first must be evicted.
        for i in 0..3u8 {
            mgr.relay(inv(i), command(), vec![i; 4 * 1024 * 1024]);
        }
        assert!(mgr.pool_bytes <= RELAY_POOL_LIMIT);
        assert!(!mgr.contains(&inv(0)));
        assert!(mgr.contains(&inv(2)));
    }

    #[test]
    fn test_inv_is_throttled() {
        let now = LocalTime::from_secs(1_000_000);
        let addr: SocketAddr = ([91, 92, 93, 94], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(addr);
        mgr.received_inv(addr, vec![inv(7)]);
        mgr.received_inv(addr, vec![inv(7)]);

        let getdata = drain(&mut mgr.upstream)
            .into_iter()
            .filter(|io| {
                matches!(
                    io,
                    Io::Write(_, msg) if matches!(&msg.payload, NetworkMessage::GetData(_))
                )
            })
            .count();
        assert_eq!(getdata, 1, "second announcement must be throttled");

        // After the retry delay, the object may be requested again.
        mgr.clock = now + ASK_RETRY_DELAY + LocalDuration::from_secs(1);
        mgr.received_wake();
        mgr.received_inv(addr, vec![inv(7)]);

        let getdata = drain(&mut mgr.upstream)
            .into_iter()
            .filter(|io| {
                matches!(
                    io,
                    Io::Write(_, msg) if matches!(&msg.payload, NetworkMessage::GetData(_))
                )
            })
            .count();
        assert_eq!(getdata, 1);
    }

    #[test]
    fn test_subscribe_relays_once() {
        let now = LocalTime::from_secs(1_000_000);
        let alice: SocketAddr = ([91, 92, 93, 94], 9333).into();
        let bob: SocketAddr = ([95, 96, 97, 98], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(alice);
        mgr.peer_negotiated(bob);

        assert!(mgr.received_subscribe(alice, 3, 2));
        assert!(mgr.any_subscribed(3));

        // Only bob is told.
        let relayed: Vec<SocketAddr> = drain(&mut mgr.upstream)
            .into_iter()
            .filter_map(|io| match io {
                Io::Write(a, msg)
                    if matches!(&msg.payload, NetworkMessage::Subscribe { channel: 3, .. }) =>
                {
                    Some(a)
                }
                _ => None,
            })
            .collect();
        assert_eq!(relayed, vec![bob]);

        // A second subscriber doesn't trigger another relay.
        assert!(mgr.received_subscribe(bob, 3, 2));
        let relayed = drain(&mut mgr.upstream)
            .into_iter()
            .filter(|io| {
                matches!(
                    io,
                    Io::Write(_, msg)
                        if matches!(&msg.payload, NetworkMessage::Subscribe { .. })
                )
            })
            .count();
        assert_eq!(relayed, 0);

        // Out-of-range channels are a violation.
        assert!(!mgr.received_subscribe(alice, DEFAULT_SUBSCRIPTION_CHANNELS as u32, 1));
    }

    #[test]
    fn test_sub_cancel_relays_when_last() {
        let now = LocalTime::from_secs(1_000_000);
        let alice: SocketAddr = ([91, 92, 93, 94], 9333).into();
        let bob: SocketAddr = ([95, 96, 97, 98], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(alice);
        mgr.peer_negotiated(bob);
        mgr.received_subscribe(alice, 3, 2);
        mgr.received_subscribe(bob, 3, 2);
        drain(&mut mgr.upstream);

        // Alice cancels: bob still subscribed, no relay.
        mgr.received_sub_cancel(alice, 3);
        let cancels = drain(&mut mgr.upstream)
            .into_iter()
            .filter(|io| {
                matches!(
                    io,
                    Io::Write(_, msg)
                        if matches!(&msg.payload, NetworkMessage::SubCancel { .. })
                )
            })
            .count();
        assert_eq!(cancels, 0);

        // Bob cancels: last subscriber gone, relay the cancel.
        mgr.received_sub_cancel(bob, 3);
        assert!(!mgr.any_subscribed(3));
        let cancels = drain(&mut mgr.upstream)
            .into_iter()
            .filter(|io| {
                matches!(
                    io,
                    Io::Write(_, msg)
                        if matches!(&msg.payload, NetworkMessage::SubCancel { .. })
                )
            })
            .count();
        assert_eq!(cancels, 1);
    }

    #[test]
    fn test_trickle_flushes_one_peer() {
        let now = LocalTime::from_secs(1_000_000);
        let alice: SocketAddr = ([91, 92, 93, 94], 9333).into();
        let bob: SocketAddr = ([95, 96, 97, 98], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(alice);
        mgr.peer_negotiated(bob);
        mgr.relay(inv(5), command(), vec![1, 2, 3]);
        drain(&mut mgr.upstream);

        let target = mgr.received_wake().unwrap();
        let announced: Vec<SocketAddr> = drain(&mut mgr.upstream)
            .into_iter()
            .filter_map(|io| match io {
                Io::Write(a, msg) if matches!(&msg.payload, NetworkMessage::Inv(_)) => Some(a),
                _ => None,
            })
            .collect();

        // Exactly the trickle target was flushed; the other peer's
        // announcement is still deferred.
        assert_eq!(announced, vec![target]);
        let other = if target == alice { bob } else { alice };
        assert_eq!(mgr.peers.get(&other).unwrap().queue.len(), 1);
    }
}
