//! State machine events.
use crate::net::LocalTime;

use crate::fsm::{
    addrmgr::Event as AddressEvent, banmgr::Event as BanEvent, peermgr::Event as PeerEvent,
    pingmgr::Event as PingEvent, relaymgr::Event as RelayEvent,
};

/// A peer-to-peer event.
#[derive(Debug, Clone)]
pub enum Event {
    /// The node is initializing its state machine and about to start network
    /// activity.
    Initializing,
    /// The node is initialized and ready to receive commands.
    Ready {
        /// Local time.
        time: LocalTime,
    },
    /// An address manager event.
    Address(AddressEvent),
    /// A ban manager event.
    Ban(BanEvent),
    /// A peer manager event.
    Peer(PeerEvent),
    /// A ping manager event.
    Ping(PingEvent),
    /// A relay manager event.
    Relay(RelayEvent),
}

impl From<AddressEvent> for Event {
    fn from(e: AddressEvent) -> Self {
        Self::Address(e)
    }
}

impl From<BanEvent> for Event {
    fn from(e: BanEvent) -> Self {
        Self::Ban(e)
    }
}

impl From<PeerEvent> for Event {
    fn from(e: PeerEvent) -> Self {
        Self::Peer(e)
    }
}

impl From<PingEvent> for Event {
    fn from(e: PingEvent) -> Self {
        Self::Ping(e)
    }
}

impl From<RelayEvent> for Event {
    fn from(e: RelayEvent) -> Self {
        Self::Relay(e)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Initializing => write!(fmt, "Initializing"),
            Event::Ready { time } => write!(fmt, "Ready at {}", time),
            Event::Address(e) => write!(fmt, "{}", e),
            Event::Ban(e) => write!(fmt, "{}", e),
            Event::Peer(e) => write!(fmt, "{}", e),
            Event::Ping(e) => write!(fmt, "{}", e),
            Event::Relay(e) => write!(fmt, "{}", e),
        }
    }
}
