//!
//! The peer-to-peer address manager.
//!
//! Keeps the table of known peer addresses, together with the quality
//! metrics that drive outbound candidate selection. The table is bucketed
//! by the *group* of the address and the group of the address' source, so
//! that neither a network-adjacent adversary nor a single gossiping peer
//! can dominate it.
use std::collections::{HashMap, HashSet};
use std::net;
use std::net::SocketAddr;
use tracing::trace;

use crate::{
    common::peer::{AddressSource, KnownAddress, Source, Store},
    common::time::Clock,
    net::{LocalDuration, LocalTime},
};

use super::output::{SetTimer, Wire};
use bitcoin::network::address::Address;

/// Time to wait until a request times out.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);

/// Idle timeout. Used to run periodic functions.
pub const IDLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);

/// Sample timeout. How long before a sampled address can be returned again.
pub const SAMPLE_TIMEOUT: LocalDuration = LocalDuration::from_mins(3);

/// Maximum number of addresses expected in an `addr` message.
pub const MAX_ADDR_ADDRESSES: usize = 1000;
/// Maximum number of addresses stored in a single bucket.
const MAX_BUCKET_SIZE: usize = 64;
/// Number of eviction candidates examined when a bucket is full.
const EVICTION_SAMPLE: usize = 4;
/// How far into the future a gossiped timestamp may lie before it is
/// discarded.
const MAX_FUTURE_DRIFT: LocalDuration = LocalDuration::from_mins(60);

/// An event emitted by the address manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// Peer addresses have been received.
    AddressesReceived {
        /// Number of addresses received.
        count: usize,
        /// Source of addresses received.
        source: Source,
    },
    /// Address book exhausted.
    AddressBookExhausted,
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::AddressesReceived { count, source } => {
                write!(fmt, "received {} address(es) from source `{}`", count, source)
            }
            Event::AddressBookExhausted => {
                write!(fmt, "Address book exhausted, fetching new addresses from peers")
            }
        }
    }
}

/// Manages peer network addresses.
#[derive(Debug)]
pub struct AddressManager<P, U, C> {
    /// Peer address store.
    peers: P,
    /// Addresses, grouped into `(address group, source group)` buckets.
    buckets: HashMap<u8, HashSet<SocketAddr>>,
    /// Which bucket each stored address lives in.
    membership: HashMap<SocketAddr, u8>,
    connected: HashSet<SocketAddr>,
    sources: HashSet<net::SocketAddr>,
    local_addrs: HashSet<net::SocketAddr>,
    /// The last time we asked our peers for new addresses.
    last_request: Option<LocalTime>,
    /// The last time we idled.
    last_idle: Option<LocalTime>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<P: Store, U, C> AddressManager<P, U, C> {
    /// Check whether we have unused addresses.
    pub fn is_exhausted(&self) -> bool {
        let time = self
            .last_idle
            .expect("AddressManager::is_exhausted: manager must be initialized");

        for (addr, ka) in self.peers.iter() {
            // Unsuccessful attempt to connect.
            if ka.last_attempt.is_some() && ka.last_success.is_none() {
                continue;
            }
            if time - ka.last_sampled.unwrap_or_default() < SAMPLE_TIMEOUT {
                continue;
            }
            if !self.connected.contains(addr) {
                return false;
            }
        }
        true
    }
}

impl<P: Store, U: Wire<Event> + SetTimer, C: Clock> AddressManager<P, U, C> {
    /// Initialize the address manager. Must be called once.
    pub fn initialize(&mut self) {
        self.idle();
    }

    /// Get addresses from connected peers.
    pub fn get_addresses(&mut self) {
        for peer in &self.sources {
            self.upstream.get_addr(*peer);
        }
    }

    /// Called when we receive a `getaddr` message.
    pub fn received_getaddr(&mut self, from: &net::SocketAddr) {
        let mut addrs = Vec::new();

        // Include one random address per bucket.
        for bucket in self.buckets.values() {
            let ix = self.rng.usize(..bucket.len());
            let addr = bucket.iter().nth(ix).expect("index must be present");
            let ka = self.peers.get(addr).expect("address must exist");

            addrs.push((
                ka.last_active
                    .map(|t| t.as_secs() as u32)
                    .unwrap_or_default(),
                ka.addr.clone(),
            ));
        }
        self.upstream.addr(*from, addrs);
    }

    /// Called when a tick is received.
    pub fn received_wake(&mut self) {
        let local_time = self.clock.local_time();

        trace!(target: "p2p", "Received wake");

        // If we're already using all the addresses we have available, we
        // should fetch more.
        if local_time - self.last_request.unwrap_or_default() >= REQUEST_TIMEOUT
            && self.is_exhausted()
        {
            self.upstream
                .event(Event::AddressBookExhausted);

            self.get_addresses();
            self.last_request = Some(local_time);
            self.upstream.set_timer(REQUEST_TIMEOUT);
        }

        if local_time - self.last_idle.unwrap_or_default() >= IDLE_TIMEOUT {
            self.idle();
        }
    }

    /// Called when a peer signaled activity. Refreshes the address' last
    /// seen time, which never decreases.
    pub fn peer_active(&mut self, addr: net::SocketAddr) {
        let time = self.clock.local_time();
        if let Some(ka) = self.peers.get_mut(&addr) {
            if ka.last_active.map_or(true, |last| last < time) {
                ka.last_active = Some(time);
            }
        }
    }

    /// Called when a peer connection is attempted.
    pub fn peer_attempted(&mut self, addr: &SocketAddr) {
        let time = self.clock.local_time();

        if let Some(ka) = self.peers.get_mut(addr) {
            ka.last_attempt = Some(time);
            ka.attempts += 1;
        }
    }

    /// Called when a peer has connected.
    pub fn peer_connected(&mut self, addr: &SocketAddr) {
        if !is_routable(&addr.ip()) {
            return;
        }
        self.insert(
            vec![(
                self.clock.local_time().as_secs() as u32,
                Address::new(addr, bitcoin::network::constants::ServiceFlags::NONE),
            )],
            Source::Peer(*addr),
        );
        self.connected.insert(*addr);
    }

    /// Called when a peer has handshaked: the "good" transition. Resets the
    /// attempt counter and bumps the success counter.
    pub fn peer_negotiated(
        &mut self,
        addr: &SocketAddr,
        services: bitcoin::network::constants::ServiceFlags,
    ) {
        let time = self.clock.local_time();

        self.sources.insert(*addr);

        if let Some(ka) = self.peers.get_mut(addr) {
            // Only ask for addresses when connecting for the first time.
            if ka.last_success.is_none() {
                <U as Wire<Event>>::get_addr(&mut self.upstream, *addr);
            }
            ka.last_success = Some(time);
            ka.last_active = Some(time);
            ka.attempts = 0;
            ka.successes += 1;
            ka.addr.services = services;
        }
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        if self.connected.remove(addr) {
            // Disconnected peers cannot be used as a source for new
            // addresses.
            self.sources.remove(addr);
        }
    }

    fn idle(&mut self) {
        self.last_idle = Some(self.clock.local_time());
        self.upstream.set_timer(IDLE_TIMEOUT);
    }
}

impl<P: Store, U: Wire<Event>, C: Clock> AddressManager<P, U, C> {
    /// Create a new, empty address manager.
    pub fn new(rng: fastrand::Rng, peers: P, upstream: U, clock: C) -> Self {
        let mut addrmgr = Self {
            peers,
            buckets: HashMap::new(),
            membership: HashMap::new(),
            connected: HashSet::new(),
            sources: HashSet::new(),
            local_addrs: HashSet::new(),
            last_request: None,
            last_idle: None,
            upstream,
            rng,
            clock,
        };

        let addrs: Vec<(SocketAddr, Source)> = addrmgr
            .peers
            .iter()
            .map(|(addr, ka)| (*addr, ka.source))
            .collect();
        for (addr, source) in addrs {
            let key = bucket_key(addr_group(&addr.ip()), source_group(&source));
            addrmgr.buckets.entry(key).or_default().insert(addr);
            addrmgr.membership.insert(addr, key);
        }
        addrmgr
    }

    /// The number of addresses known.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether there are any addresses known to the address manager.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() || self.buckets.is_empty()
    }

    /// Snapshot the address table, eg. for persisting it.
    pub fn snapshot(&self) -> Vec<(SocketAddr, KnownAddress)> {
        self.peers
            .iter()
            .map(|(addr, ka)| (*addr, ka.clone()))
            .collect()
    }

    /// Called when we received an `addr` message from a peer.
    ///
    /// Returns `false` if the message is a flood (empty, or too many
    /// addresses), in which case the sender should be penalized.
    pub fn received_addr(&mut self, peer: net::SocketAddr, addrs: Vec<(u32, Address)>) -> bool {
        if addrs.is_empty() || addrs.len() > MAX_ADDR_ADDRESSES {
            return false;
        }
        let source = Source::Peer(peer);

        self.upstream.event(Event::AddressesReceived {
            count: addrs.len(),
            source,
        });
        self.insert(addrs, source);

        true
    }

    /// Remove all table entries for the given IP, eg. because it was banned.
    pub fn remove_ip(&mut self, ip: &net::IpAddr) {
        let addrs: Vec<SocketAddr> = self
            .membership
            .keys()
            .filter(|addr| addr.ip() == *ip)
            .cloned()
            .collect();

        for addr in addrs {
            self.remove(&addr);
        }
    }

    /// Add addresses to the address manager. The input matches that of the
    /// `addr` message sent by peers on the network.
    ///
    /// Addresses we already know are *merged*: the last seen time is raised
    /// to the maximum of the existing and incoming timestamps, and never
    /// lowered.
    pub fn insert(&mut self, addrs: impl IntoIterator<Item = (u32, Address)>, source: Source) {
        let time = self
            .last_idle
            .expect("AddressManager::insert: manager must be initialized before inserting");

        for (last_active, addr) in addrs {
            let Ok(socket_addr) = addr.socket_addr() else {
                continue;
            };

            // Ignore timestamps too far into the future.
            let last_active = match last_active {
                0 => None,
                secs if LocalTime::from_secs(secs as u64) > time + MAX_FUTURE_DRIFT => continue,
                secs => Some(LocalTime::from_secs(secs as u64)),
            };

            // No local addresses.
            if self.local_addrs.contains(&socket_addr) || is_local(&socket_addr.ip()) {
                continue;
            }
            // Gossiped and DNS addresses must be routable; seed and
            // imported addresses are taken on trust.
            if matches!(source, Source::Peer(_) | Source::Dns) && !is_routable(&socket_addr.ip())
            {
                continue;
            }

            if let Some(ka) = self.peers.get_mut(&socket_addr) {
                if ka.last_active < last_active {
                    ka.last_active = last_active;
                }
                if addr.services != bitcoin::network::constants::ServiceFlags::NONE {
                    ka.addr.services = addr.services;
                }
                continue;
            }

            let key = bucket_key(addr_group(&socket_addr.ip()), source_group(&source));
            if !self.make_room(key) {
                continue;
            }

            self.peers.insert(
                &socket_addr,
                KnownAddress::new(addr.clone(), source, last_active),
            );
            self.buckets.entry(key).or_default().insert(socket_addr);
            self.membership.insert(socket_addr, key);
        }
    }

    /// Pick an address at random from the set of known addresses.
    ///
    /// This function tries to ensure a good geo-diversity of addresses, such
    /// that an adversary controlling a disproportionately large number of
    /// addresses in the same address range does not have an advantage over
    /// other peers.
    ///
    /// This works under the assumption that adversaries are *localized*.
    pub fn sample(&mut self, bias: u8) -> Option<(Address, Source)> {
        self.sample_with(bias, |_: &KnownAddress| true)
    }

    /// Sample an address using the provided predicate. Only returns
    /// addresses which are `true` according to the predicate.
    ///
    /// `bias ∈ [0, 100]` tilts selection between the *tried* pool
    /// (addresses we've connected to before) and the *new* pool; a higher
    /// value prefers new addresses.
    pub fn sample_with(
        &mut self,
        bias: u8,
        predicate: impl Fn(&KnownAddress) -> bool,
    ) -> Option<(Address, Source)> {
        if self.is_empty() {
            return None;
        }

        let prefer_new = self.rng.u8(..100) < bias.min(100);

        self.sample_from_pool(prefer_new, &predicate)
            .or_else(|| self.sample_from_pool(!prefer_new, &predicate))
    }

    fn sample_from_pool(
        &mut self,
        new_pool: bool,
        predicate: &impl Fn(&KnownAddress) -> bool,
    ) -> Option<(Address, Source)> {
        let time = self
            .last_idle
            .expect("AddressManager::sample: manager must be initialized before sampling");

        let mut buckets: Vec<_> = self.buckets.values().collect();
        self.rng.shuffle(&mut buckets);

        // First select a random bucket, then a random address within it.
        for bucket in buckets.drain(..) {
            debug_assert!(!bucket.is_empty());

            let mut addrs: Vec<_> = bucket.iter().collect();
            self.rng.shuffle(&mut addrs);

            for addr in addrs.drain(..) {
                let ka = self.peers.get(addr).expect("address must exist");

                if ka.is_tried() == new_pool {
                    continue;
                }
                // If we recently sampled this address, don't return it again.
                if time - ka.last_sampled.unwrap_or_default() < SAMPLE_TIMEOUT {
                    continue;
                }
                // If we're already connected to this address, skip it.
                if self.connected.contains(addr) {
                    continue;
                }
                // If the provided filter doesn't pass, keep looking.
                if !predicate(ka) {
                    continue;
                }
                // Addresses that keep failing become progressively less
                // likely to be selected.
                if self.rng.f64() >= quality(ka, time) {
                    continue;
                }

                let addr = *addr;
                let ka = self.peers.get_mut(&addr).expect("address must exist");
                ka.last_sampled = Some(time);

                return Some((ka.addr.clone(), ka.source));
            }
        }

        None
    }

    ////////////////////////////////////////////////////////////////////////

    /// Make room in the given bucket, evicting an entry if it is full.
    /// Eviction is biased towards entries with an old last-seen time and a
    /// low success count. Returns `false` if no room could be made.
    fn make_room(&mut self, key: u8) -> bool {
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return true;
        };
        if bucket.len() < MAX_BUCKET_SIZE {
            return true;
        }

        let mut worst: Option<(SocketAddr, (u32, LocalTime))> = None;

        for _ in 0..EVICTION_SAMPLE {
            let ix = self.rng.usize(..bucket.len());
            let addr = *bucket.iter().nth(ix).expect("the bucket is not empty");

            if self.connected.contains(&addr) {
                continue;
            }
            let ka = self.peers.get(&addr).expect("address must exist");
            let score = (ka.successes, ka.last_active.unwrap_or_default());

            match worst {
                Some((_, best_score)) if score >= best_score => {}
                _ => worst = Some((addr, score)),
            }
        }

        let Some((addr, _)) = worst else {
            // Only connected addresses were sampled; keep the bucket as is.
            return false;
        };

        bucket.remove(&addr);
        self.peers.remove(&addr);
        self.membership.remove(&addr);

        true
    }

    /// Remove an address from the table.
    fn remove(&mut self, addr: &SocketAddr) -> Option<KnownAddress> {
        if let Some(key) = self.membership.remove(addr) {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.remove(addr);

                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
            return self.peers.remove(addr);
        }
        None
    }
}

impl<P: Store, U: Wire<Event> + SetTimer, C: Clock> AddressSource for AddressManager<P, U, C> {
    fn sample(&mut self, bias: u8) -> Option<(Address, Source)> {
        AddressManager::sample(self, bias)
    }

    fn sample_with(
        &mut self,
        bias: u8,
        predicate: impl Fn(&KnownAddress) -> bool,
    ) -> Option<(Address, Source)> {
        AddressManager::sample_with(self, bias, predicate)
    }

    fn record_local_address(&mut self, addr: net::SocketAddr) {
        self.local_addrs.insert(addr);
    }

    fn insert(&mut self, addrs: impl IntoIterator<Item = (u32, Address)>, source: Source) {
        AddressManager::insert(self, addrs, source);
    }
}

/// Sampling quality of an address: starts at one and decays with every
/// failed attempt since the last success.
fn quality(ka: &KnownAddress, now: LocalTime) -> f64 {
    let mut chance = 1.0f64;

    for _ in 0..ka.attempts.min(8) {
        chance *= 0.66;
    }
    // De-prioritize addresses not seen alive in over a month.
    if now - ka.last_active.unwrap_or_default() > LocalDuration::from_mins(60 * 24 * 30) {
        chance *= 0.5;
    }
    chance
}

/// Check whether an IP address is locally routable.
pub fn is_local(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => {
            addr.is_private() || addr.is_loopback() || addr.is_link_local() || addr.is_unspecified()
        }
        net::IpAddr::V6(addr) => addr.is_loopback() || addr.is_unspecified(),
    }
}

/// Check whether an IP address is globally routable.
pub fn is_routable(addr: &net::IpAddr) -> bool {
    match addr {
        net::IpAddr::V4(addr) => !is_local(&net::IpAddr::V4(*addr)) && !addr.is_broadcast(),
        net::IpAddr::V6(addr) => !addr.is_loopback() && !addr.is_unspecified(),
    }
}

/// The diversity group of an IP address.
///
/// For IPv4 this is the /16 prefix; for IPv6, the first 32 bits. Two
/// addresses with an equal group count as the same network.
pub fn addr_group(ip: &net::IpAddr) -> u32 {
    match ip {
        net::IpAddr::V4(ip) => {
            // Eg. 124.99.123.1 and 124.54.123.1 fall in different groups,
            // but 100.99.43.12 and 100.99.12.8 in the same one.
            let octets: [u8; 4] = ip.octets();

            (octets[0] as u32) << 8 | octets[1] as u32
        }
        net::IpAddr::V6(ip) => {
            let segments: [u16; 8] = ip.segments();

            (segments[0] as u32) << 16 | segments[1] as u32
        }
    }
}

/// The diversity group of an address source.
fn source_group(source: &Source) -> u32 {
    match source {
        Source::Peer(addr) => addr_group(&addr.ip()),
        // Non-peer sources each get their own group.
        Source::Dns => u32::MAX,
        Source::Seed => u32::MAX - 1,
        Source::Imported => u32::MAX - 2,
    }
}

/// The table bucket an address falls in, given its group and the group of
/// its source. Mixing in the source group prevents a single source from
/// filling more than a fixed slice of the table.
fn bucket_key(addr_group: u32, source_group: u32) -> u8 {
    let mixed = (addr_group as u64)
        .wrapping_mul(0x9E37_79B9)
        .wrapping_add(source_group as u64)
        .wrapping_mul(0x85EB_CA6B);

    (mixed >> 32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;
    use bitcoin::network::constants::ServiceFlags;
    use std::collections::HashMap as Map;

    type Manager = AddressManager<Map<SocketAddr, KnownAddress>, Outbox, LocalTime>;

    fn manager(seed: u64) -> Manager {
        let mut mgr = AddressManager::new(
            fastrand::Rng::with_seed(seed),
            Map::new(),
            Outbox::default(),
            LocalTime::from_secs(1_700_000_000),
        );
        mgr.initialize();
        mgr
    }

    fn address(ip: [u8; 4], port: u16) -> Address {
        Address::new(&SocketAddr::from((ip, port)), ServiceFlags::NETWORK)
    }

    fn timestamp() -> u32 {
        1_700_000_000 - 3600
    }

    #[test]
    fn test_insert_and_len() {
        let mut mgr = manager(1);

        mgr.insert(
            vec![
                (timestamp(), address([33, 44, 55, 66], 9333)),
                (timestamp(), address([34, 44, 55, 66], 9333)),
                // Duplicate.
                (timestamp(), address([33, 44, 55, 66], 9333)),
            ],
            Source::Dns,
        );
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_insert_ignores_local() {
        let mut mgr = manager(1);

        mgr.insert(
            vec![
                (timestamp(), address([127, 0, 0, 1], 9333)),
                (timestamp(), address([10, 0, 0, 1], 9333)),
                (timestamp(), address([192, 168, 1, 1], 9333)),
            ],
            Source::Dns,
        );
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_last_active_is_monotonic() {
        let mut mgr = manager(1);
        let addr = address([33, 44, 55, 66], 9333);
        let sock = addr.socket_addr().unwrap();

        mgr.insert(vec![(timestamp(), addr.clone())], Source::Dns);
        let before = mgr.peers.get(&sock).unwrap().last_active;

        // An older timestamp never lowers the recorded one.
        mgr.insert(vec![(timestamp() - 10_000, addr.clone())], Source::Dns);
        assert_eq!(mgr.peers.get(&sock).unwrap().last_active, before);

        // A newer one raises it.
        mgr.insert(vec![(timestamp() + 600, addr)], Source::Dns);
        assert!(mgr.peers.get(&sock).unwrap().last_active > before);
    }

    #[test]
    fn test_sample_skips_connected_and_sampled() {
        let mut mgr = manager(7);

        mgr.insert(
            vec![
                (timestamp(), address([33, 44, 55, 66], 9333)),
                (timestamp(), address([45, 44, 55, 66], 9333)),
            ],
            Source::Dns,
        );
        mgr.peer_connected(&SocketAddr::from(([33, 44, 55, 66], 9333)));

        for _ in 0..16 {
            if let Some((addr, _)) = mgr.sample(50) {
                assert_eq!(
                    addr.socket_addr().unwrap(),
                    SocketAddr::from(([45, 44, 55, 66], 9333))
                );
            }
        }
        // Both sampled or connected now: nothing left.
        let mut remaining = 0;
        for _ in 0..16 {
            if mgr.sample(50).is_some() {
                remaining += 1;
            }
        }
        assert_eq!(remaining, 0, "sampled addresses must not be returned again");
    }

    #[test]
    fn test_sample_bias() {
        let mut mgr = manager(3);

        // One tried address, many new ones.
        let tried = address([88, 10, 1, 1], 9333);
        let tried_sock = tried.socket_addr().unwrap();

        mgr.insert(vec![(timestamp(), tried)], Source::Dns);
        mgr.peer_connected(&tried_sock);
        mgr.peer_negotiated(&tried_sock, ServiceFlags::NETWORK);
        mgr.peer_disconnected(&tried_sock);

        for i in 0..16u8 {
            mgr.insert(
                vec![(timestamp(), address([89, i, 1, 1], 9333))],
                Source::Dns,
            );
        }

        // With a heavy new-pool bias, the tried address is almost never
        // the first pick.
        let mut tried_picks = 0;
        for _ in 0..8 {
            // Reset sampling state.
            for (_, ka) in mgr.peers.iter_mut() {
                ka.last_sampled = None;
            }
            if let Some((addr, _)) = mgr.sample(90) {
                if addr.socket_addr().unwrap() == tried_sock {
                    tried_picks += 1;
                }
            }
        }
        assert!(tried_picks <= 3);
    }

    #[test]
    fn test_bucket_is_bounded() {
        let mut mgr = manager(5);

        // All in the same /16, from the same source: a single bucket.
        for a in 0..=255u8 {
            mgr.insert(
                vec![(timestamp(), address([99, 99, a, 1], 9333))],
                Source::Dns,
            );
        }
        assert!(mgr.len() <= MAX_BUCKET_SIZE);
    }

    #[test]
    fn test_flood_is_rejected() {
        let mut mgr = manager(5);
        let peer: SocketAddr = ([22, 33, 44, 55], 9333).into();

        assert!(!mgr.received_addr(peer, vec![]));

        let flood: Vec<_> = (0..=MAX_ADDR_ADDRESSES)
            .map(|i| {
                (
                    timestamp(),
                    address([55, (i / 256) as u8, (i % 256) as u8, 1], 9333),
                )
            })
            .collect();
        assert!(!mgr.received_addr(peer, flood));
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_remove_ip() {
        let mut mgr = manager(9);
        let addr = address([33, 44, 55, 66], 9333);

        mgr.insert(vec![(timestamp(), addr)], Source::Dns);
        assert_eq!(mgr.len(), 1);

        mgr.remove_ip(&[33, 44, 55, 66].into());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_groups() {
        assert_eq!(
            addr_group(&[124, 99, 123, 1].into()),
            addr_group(&[124, 99, 200, 7].into())
        );
        assert_ne!(
            addr_group(&[124, 99, 123, 1].into()),
            addr_group(&[124, 54, 123, 1].into())
        );
    }
}
