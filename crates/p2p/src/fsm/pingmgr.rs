//! Peer liveness.
//!
//! Sends periodic pings and tears down peers that stop responding or go
//! silent for too long. The send direction is covered separately: a peer
//! that stops draining its socket is dropped by the reactor's
//! stuck-sender check.
use std::net::SocketAddr;

use tracing::trace;

use crate::{
    common::collections::PeerMap,
    common::time::Clock,
    fsm::handler::{DisconnectReason, PeerId},
    net::{LocalDuration, LocalTime},
};

use super::output::{Disconnect, SetTimer, Wire};

/// Interval between pings sent to an idle peer.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_mins(2);
/// Time a peer has to answer a ping before it is dropped.
pub const PING_TIMEOUT: LocalDuration = LocalDuration::from_secs(30);
/// A peer from which nothing is received for this long is stale and is
/// dropped, pings notwithstanding.
pub const STALE_TIMEOUT: LocalDuration = LocalDuration::from_mins(90);

/// An event emitted by the ping manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A peer answered a ping.
    PongReceived {
        /// The peer.
        addr: PeerId,
        /// Round-trip latency.
        latency: LocalDuration,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::PongReceived { addr, latency } => {
                write!(fmt, "{}: Pong received after {}", addr, latency)
            }
        }
    }
}

/// Ping state of a peer.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Nothing outstanding.
    Idle { since: LocalTime },
    /// A ping was sent, a pong echoing its nonce is expected.
    AwaitingPong { nonce: u64, since: LocalTime },
}

/// Per-peer liveness state.
#[derive(Debug)]
struct Peer {
    state: State,
    /// Last time any message was received from this peer.
    last_recv: LocalTime,
}

/// Sends and responds to liveness probes.
#[derive(Debug)]
pub struct PingManager<U, C> {
    peers: PeerMap<SocketAddr, Peer>,
    upstream: U,
    rng: fastrand::Rng,
    clock: C,
}

impl<U: Wire<Event> + SetTimer + Disconnect, C: Clock> PingManager<U, C> {
    /// Create a new ping manager.
    pub fn new(rng: fastrand::Rng, upstream: U, clock: C) -> Self {
        Self {
            peers: PeerMap::new(rng.clone()),
            upstream,
            rng,
            clock,
        }
    }

    /// Called when a peer has handshaked.
    pub fn peer_negotiated(&mut self, addr: SocketAddr) {
        let now = self.clock.local_time();
        let nonce = self.rng.u64(..);

        self.upstream.ping(addr, nonce).set_timer(PING_TIMEOUT);
        self.peers.insert(
            addr,
            Peer {
                state: State::AwaitingPong { nonce, since: now },
                last_recv: now,
            },
        );
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, addr: &SocketAddr) {
        self.peers.remove(addr);
    }

    /// Record receive activity from a peer.
    pub fn record_recv(&mut self, addr: &SocketAddr) {
        let now = self.clock.local_time();
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.last_recv = now;
        }
    }

    /// Called when a `ping` is received. Answers it.
    pub fn received_ping(&mut self, addr: SocketAddr, nonce: u64) -> bool {
        if self.peers.contains_key(&addr) {
            self.record_recv(&addr);
            self.upstream.pong(addr, nonce);

            return true;
        }
        false
    }

    /// Called when a `pong` is received. Returns whether the nonce matches
    /// the outstanding ping.
    pub fn received_pong(&mut self, addr: SocketAddr, nonce: u64, now: LocalTime) -> bool {
        let mut matched = false;

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_recv = now;

            if let State::AwaitingPong {
                nonce: expected,
                since,
            } = peer.state
            {
                if nonce == expected {
                    peer.state = State::Idle { since: now };
                    matched = true;

                    self.upstream.event(Event::PongReceived {
                        addr,
                        latency: now - since,
                    });
                }
                // A pong with a stale nonce is ignored; the peer will time
                // out if it never echoes the right one.
            }
        }
        matched
    }

    /// Called when a tick is received.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();

        trace!(target: "p2p", "Received wake");

        let mut dropped = Vec::new();
        let mut probed = Vec::new();

        for (addr, peer) in self.peers.iter_mut() {
            if now - peer.last_recv >= STALE_TIMEOUT {
                dropped.push((*addr, "stale"));
                continue;
            }
            match peer.state {
                State::AwaitingPong { since, .. } => {
                    if now - since >= PING_TIMEOUT {
                        dropped.push((*addr, "ping"));
                    }
                }
                State::Idle { since } => {
                    if now - since >= PING_INTERVAL {
                        let nonce = self.rng.u64(..);

                        peer.state = State::AwaitingPong { nonce, since: now };
                        probed.push((*addr, nonce));
                    }
                }
            }
        }

        for (addr, nonce) in probed {
            self.upstream.ping(addr, nonce).set_timer(PING_TIMEOUT);
        }
        for (addr, reason) in dropped {
            self.peers.remove(&addr);
            self.upstream
                .disconnect(addr, DisconnectReason::PeerTimeout(reason));
        }
        self.upstream.set_timer(PING_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::{tests::messages_to, Outbox};
    use crate::wire::NetworkMessage;

    fn manager(now: LocalTime) -> PingManager<Outbox, LocalTime> {
        PingManager::new(fastrand::Rng::with_seed(9), Outbox::default(), now)
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let now = LocalTime::from_secs(1_000_000);
        let addr: SocketAddr = ([41, 42, 43, 44], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(addr);

        let sent = messages_to(&mut mgr.upstream.clone(), &addr);
        let nonce = match sent.first() {
            Some(NetworkMessage::Ping(nonce)) => *nonce,
            other => panic!("expected ping, got {:?}", other),
        };

        assert!(!mgr.received_pong(addr, nonce ^ 1, now)); // Wrong nonce.
        assert!(mgr.received_pong(addr, nonce, now + LocalDuration::from_secs(1)));
    }

    #[test]
    fn test_ping_timeout_disconnects() {
        let now = LocalTime::from_secs(1_000_000);
        let addr: SocketAddr = ([41, 42, 43, 44], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(addr);
        // Drain the initial ping.
        messages_to(&mut mgr.upstream.clone(), &addr);

        mgr.clock = now + PING_TIMEOUT + LocalDuration::from_secs(1);
        mgr.received_wake();

        assert!(!mgr.peers.contains_key(&addr));
    }

    #[test]
    fn test_stale_peer_disconnects() {
        let now = LocalTime::from_secs(1_000_000);
        let addr: SocketAddr = ([41, 42, 43, 44], 9333).into();
        let mut mgr = manager(now);

        mgr.peer_negotiated(addr);

        let sent = messages_to(&mut mgr.upstream.clone(), &addr);
        let nonce = match sent.first() {
            Some(NetworkMessage::Ping(nonce)) => *nonce,
            other => panic!("expected ping, got {:?}", other),
        };
        mgr.received_pong(addr, nonce, now);

        // Nothing received for 90 minutes: the peer is stale. The
        // mirror-image failure, a peer that stops accepting our bytes,
        // is caught by the socket layer's stuck-sender check.
        mgr.clock = now + STALE_TIMEOUT;
        mgr.received_wake();

        assert!(!mgr.peers.contains_key(&addr));
    }
}
