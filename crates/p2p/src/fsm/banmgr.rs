//! Time-bounded address bans.
//!
//! Misbehaviour *scores* live on the connected peer, in the peer manager;
//! this module only tracks which addresses are banned and until when.
use std::collections::HashMap;
use std::net;

use tracing::debug;

use crate::common::time::Clock;
use crate::net::{LocalDuration, LocalTime};

use super::output::SetTimer;
use super::output::Wire;

/// Score at which a peer is banned and disconnected.
pub const DEFAULT_BAN_SCORE: u32 = 100;
/// How long a ban lasts, by default.
pub const DEFAULT_BAN_TIME: LocalDuration = LocalDuration::from_secs(60 * 60 * 24);
/// How often expired bans are swept.
pub const SWEEP_INTERVAL: LocalDuration = LocalDuration::from_mins(10);

/// An event emitted by the ban manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// An address was banned.
    Banned {
        /// The banned IP.
        ip: net::IpAddr,
        /// When the ban expires.
        until: LocalTime,
    },
    /// An expired ban was lifted.
    BanExpired {
        /// The unbanned IP.
        ip: net::IpAddr,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Banned { ip, until } => {
                write!(fmt, "Banned {} until {}", ip, until)
            }
            Event::BanExpired { ip } => {
                write!(fmt, "Ban of {} expired", ip)
            }
        }
    }
}

/// Manages banned addresses.
#[derive(Debug)]
pub struct BanManager<U, C> {
    /// Banned IPs and their ban expiry times.
    banned: HashMap<net::IpAddr, LocalTime>,
    last_sweep: Option<LocalTime>,
    upstream: U,
    clock: C,
}

impl<U: Wire<Event> + SetTimer, C: Clock> BanManager<U, C> {
    /// Create a new ban manager.
    pub fn new(upstream: U, clock: C) -> Self {
        Self {
            banned: HashMap::new(),
            last_sweep: None,
            upstream,
            clock,
        }
    }

    /// Initialize the ban manager. Must be called once.
    pub fn initialize(&mut self) {
        self.last_sweep = Some(self.clock.local_time());
        self.upstream.set_timer(SWEEP_INTERVAL);
    }

    /// Ban an address for the given duration. Banning an already banned
    /// address can only extend the ban, never shorten it.
    pub fn ban(&mut self, ip: net::IpAddr, duration: LocalDuration) {
        let until = self.clock.local_time() + duration;
        let entry = self.banned.entry(ip).or_insert(until);

        if *entry < until {
            *entry = until;
        }
        let until = *entry;

        debug!(target: "p2p", "Banned {} until {}", ip, until);
        self.upstream.event(Event::Banned { ip, until });
    }

    /// Whether the address is currently banned.
    pub fn is_banned(&self, ip: &net::IpAddr) -> bool {
        self.banned
            .get(ip)
            .map_or(false, |until| self.clock.local_time() < *until)
    }

    /// Lift all bans.
    pub fn clear(&mut self) {
        self.banned.clear();
    }

    /// Number of addresses currently banned.
    pub fn len(&self) -> usize {
        self.banned.len()
    }

    /// Whether no address is banned.
    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }

    /// Called when a tick is received. Sweeps expired entries.
    pub fn received_wake(&mut self) {
        let now = self.clock.local_time();

        if now - self.last_sweep.unwrap_or_default() < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = Some(now);

        let expired: Vec<_> = self
            .banned
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in expired {
            self.banned.remove(&ip);
            self.upstream.event(Event::BanExpired { ip });
        }
        self.upstream.set_timer(SWEEP_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::output::Outbox;

    fn manager(now: LocalTime) -> BanManager<Outbox, LocalTime> {
        let mut mgr = BanManager::new(Outbox::default(), now);
        mgr.initialize();
        mgr
    }

    #[test]
    fn test_ban_expires() {
        let now = LocalTime::from_secs(1_000_000);
        let ip: net::IpAddr = [77, 22, 11, 9].into();

        let mut mgr = manager(now);
        mgr.ban(ip, LocalDuration::from_secs(60));
        assert!(mgr.is_banned(&ip));

        mgr.clock = now + LocalDuration::from_secs(61);
        assert!(!mgr.is_banned(&ip));
    }

    #[test]
    fn test_ban_only_extends() {
        let now = LocalTime::from_secs(1_000_000);
        let ip: net::IpAddr = [77, 22, 11, 9].into();

        let mut mgr = manager(now);
        mgr.ban(ip, LocalDuration::from_mins(60));
        // A shorter re-ban doesn't shorten the existing ban.
        mgr.ban(ip, LocalDuration::from_secs(1));

        mgr.clock = now + LocalDuration::from_mins(30);
        assert!(mgr.is_banned(&ip));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let now = LocalTime::from_secs(1_000_000);
        let ip: net::IpAddr = [77, 22, 11, 9].into();

        let mut mgr = manager(now);
        mgr.ban(ip, LocalDuration::from_secs(30));
        assert_eq!(mgr.len(), 1);

        mgr.clock = now + SWEEP_INTERVAL + LocalDuration::from_secs(1);
        mgr.received_wake();
        assert!(mgr.is_empty());
    }
}
