//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! Each sub-protocol, eg. the "ping" or "handshake" protocols are given a
//! copy of this outbox with specific capabilities, eg. peer disconnection,
//! message sending etc. to communicate with the network.
use std::sync::{Arc, Mutex};
use std::{collections::VecDeque, net};
use tracing::debug;

use crate::common::network::Network;
use crate::wire::{Inventory, NetworkMessage, RawNetworkMessage};
use crate::{
    fsm::event::Event,
    fsm::handler::{DisconnectReason, PeerId},
    net::LocalDuration,
};
use bitcoin::network::{
    address::Address, message::CommandString, message_network::VersionMessage,
};

/// Output of a state transition of the protocol state machine.
pub type Io = crate::net::Io<RawNetworkMessage, Event, DisconnectReason>;

impl From<Event> for Io {
    fn from(event: Event) -> Self {
        Io::Event(event)
    }
}

/// Ability to connect to peers.
pub trait Connect {
    /// Connect to peer.
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration);
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from peer.
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason);
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// The wire protocol, as seen by the sub-protocol managers.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    // Handshake messages //////////////////////////////////////////////////

    /// Send a `version` message.
    fn version(&mut self, addr: PeerId, msg: VersionMessage);

    /// Send a `verack` message.
    fn verack(&mut self, addr: PeerId) -> &mut Self;

    // Ping/pong ///////////////////////////////////////////////////////////

    /// Send a `ping` message.
    fn ping(&mut self, addr: net::SocketAddr, nonce: u64) -> &Self;

    /// Send a `pong` message.
    fn pong(&mut self, addr: net::SocketAddr, nonce: u64) -> &Self;

    // Addresses ///////////////////////////////////////////////////////////

    /// Send a `getaddr` message.
    fn get_addr(&mut self, addr: PeerId);

    /// Send an `addr` message.
    fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>);

    // Relay ///////////////////////////////////////////////////////////////

    /// Send an `inv` message to a peer.
    fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self;

    /// Send a `getdata` message to a peer.
    fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self;

    // Subscriptions ///////////////////////////////////////////////////////

    /// Send a `subscribe` message to a peer.
    fn subscribe(&mut self, addr: PeerId, channel: u32, hops: u32) -> &mut Self;

    /// Send a `sub-cancel` message to a peer.
    fn sub_cancel(&mut self, addr: PeerId, channel: u32) -> &mut Self;

    // Opaque frames ///////////////////////////////////////////////////////

    /// Send an opaque frame to a peer.
    fn raw(&mut self, addr: PeerId, command: CommandString, payload: Vec<u8>) -> &mut Self;
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// The network we're on. Decides the magic of outgoing frames.
    network: Network,
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io>>>,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(Network::Mainnet)
    }
}

impl Iterator for Outbox {
    type Item = Io;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            outbound: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Push an output to the queue.
    pub fn push(&self, output: Io) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a message to the queue.
    pub fn message(&mut self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "p2p", "Sending {:?} to {}", payload.cmd(), addr);

        self.push(Io::Write(
            addr,
            RawNetworkMessage {
                magic: self.network.magic(),
                payload,
            },
        ));

        self
    }

    /// Push an event to the queue.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: net::SocketAddr, reason: DisconnectReason) {
        debug!(target: "p2p", "Disconnecting from {}: {}", addr, reason);

        self.push(Io::Disconnect(addr, reason));
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl Connect for Outbox {
    fn connect(&self, addr: net::SocketAddr, timeout: LocalDuration) {
        self.push(Io::Connect(addr));
        self.push(Io::SetTimer(timeout));
    }
}

impl<E: Into<Event> + std::fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "p2p", "{}", &event);
        self.event(event.into());
    }

    fn version(&mut self, addr: PeerId, msg: VersionMessage) {
        self.message(addr, NetworkMessage::Version(msg));
    }

    fn verack(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, NetworkMessage::Verack);
        self
    }

    fn ping(&mut self, addr: net::SocketAddr, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Ping(nonce));
        self
    }

    fn pong(&mut self, addr: net::SocketAddr, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Pong(nonce));
        self
    }

    fn get_addr(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    fn addr(&mut self, addr: PeerId, addrs: Vec<(u32, Address)>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    fn inv(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self {
        self.message(addr, NetworkMessage::Inv(inventories));
        self
    }

    fn get_data(&mut self, addr: PeerId, inventories: Vec<Inventory>) -> &mut Self {
        self.message(addr, NetworkMessage::GetData(inventories));
        self
    }

    fn subscribe(&mut self, addr: PeerId, channel: u32, hops: u32) -> &mut Self {
        self.message(addr, NetworkMessage::Subscribe { channel, hops });
        self
    }

    fn sub_cancel(&mut self, addr: PeerId, channel: u32) -> &mut Self {
        self.message(addr, NetworkMessage::SubCancel { channel });
        self
    }

    fn raw(&mut self, addr: PeerId, command: CommandString, payload: Vec<u8>) -> &mut Self {
        self.message(addr, NetworkMessage::Unknown { command, payload });
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Drain an outbox into a vector, for assertions.
    pub fn drain(outbox: &mut Outbox) -> Vec<Io> {
        let mut io = Vec::new();
        for out in outbox.by_ref() {
            io.push(out);
        }
        io
    }

    /// Collect the messages sent to the given peer.
    pub fn messages_to(outbox: &mut Outbox, addr: &PeerId) -> Vec<NetworkMessage> {
        drain(outbox)
            .into_iter()
            .filter_map(|io| match io {
                Io::Write(a, msg) if a == *addr => Some(msg.payload),
                _ => None,
            })
            .collect()
    }
}
