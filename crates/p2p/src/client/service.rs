//! Client service. Wraps the state machine and handles decoding and
//! encoding of network messages.
use async_trait::async_trait;
use bitcoin::consensus::Encodable;
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::net;
use tracing::{debug, error};

use crate::{
    client,
    client::P2PConfig,
    common::peer,
    common::time::AdjustedClock,
    fsm,
    fsm::handler::FrameHandler,
    net::LocalTime,
    net::StateMachine,
    net::{Disconnect, Io, Link},
};

/// Client service, ready to be run by a reactor.
pub struct Service<P, C, H> {
    inboxes: HashMap<net::SocketAddr, client::stream::Decoder>,
    machine: fsm::handler::StateMachine<P, C, H>,
}

impl<P, C, H> Service<P, C, H>
where
    P: peer::Store + Send,
    C: AdjustedClock<net::SocketAddr> + Sync + Send,
    H: FrameHandler,
{
    /// Create a new client service.
    pub fn new(peers: P, clock: C, rng: fastrand::Rng, config: P2PConfig, handler: H) -> Self {
        Self {
            inboxes: HashMap::new(),
            machine: fsm::handler::StateMachine::new(
                peers,
                clock,
                rng,
                config.into_fsm_config(),
                handler,
            ),
        }
    }
}

#[async_trait]
impl<P, C, H> crate::net::Service for Service<P, C, H>
where
    P: peer::Store + Send,
    C: AdjustedClock<net::SocketAddr> + Sync + Send,
    H: FrameHandler,
{
    type Command = fsm::handler::Command;

    async fn command_received(&mut self, cmd: Self::Command) {
        self.machine.command(cmd).await
    }
}

#[async_trait]
impl<P, C, H> StateMachine for Service<P, C, H>
where
    P: peer::Store + Send,
    C: AdjustedClock<net::SocketAddr> + Sync + Send,
    H: FrameHandler,
{
    type Message = [u8];
    type Event = crate::fsm::event::Event;
    type DisconnectReason = fsm::handler::DisconnectReason;

    async fn initialize(&mut self, time: LocalTime) {
        self.machine.initialize(time).await;
    }

    async fn message_received(&mut self, addr: &net::SocketAddr, bytes: Cow<'_, [u8]>) {
        let Some(inbox) = self.inboxes.get_mut(addr) else {
            debug!(target: "p2p", "Received message from unknown peer {}", addr);
            return;
        };

        inbox.input(bytes.borrow());

        loop {
            match inbox.decode_next() {
                Ok(Some(msg)) => self.machine.message_received(addr, Cow::Owned(msg)).await,
                Ok(None) => break,
                Err(err) => {
                    error!(target: "p2p", "Invalid message received from {}: {}", addr, err);

                    let reason = if err.is_flood() {
                        fsm::handler::DisconnectReason::FloodControl
                    } else {
                        fsm::handler::DisconnectReason::DecodeError
                    };
                    self.machine.disconnect(*addr, reason);
                    return;
                }
            }
        }
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.machine.attempted(addr)
    }

    fn connected(
        &mut self,
        addr: net::SocketAddr,
        local_addr: &net::SocketAddr,
        link: Link,
    ) -> bool {
        if !self.machine.connected(addr, local_addr, link) {
            return false;
        }
        self.inboxes.insert(
            addr,
            client::stream::Decoder::new(self.machine.network.magic(), 1024),
        );
        true
    }

    async fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: Disconnect<Self::DisconnectReason>,
    ) {
        self.inboxes.remove(addr);
        self.machine.disconnected(addr, reason).await
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.machine.tick(local_time);
    }

    async fn timer_expired(&mut self) {
        self.machine.timer_expired().await;
    }
}

impl<P, C, H> Iterator for Service<P, C, H> {
    type Item = Io<Vec<u8>, crate::fsm::event::Event, fsm::handler::DisconnectReason>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.machine.next() {
            Some(Io::Write(addr, msg)) => {
                let mut buf = Vec::new();

                msg.consensus_encode(&mut buf)
                    .expect("writing to an in-memory buffer doesn't fail");
                Some(Io::Write(addr, buf))
            }
            Some(Io::Event(e)) => Some(Io::Event(e)),
            Some(Io::Connect(a)) => Some(Io::Connect(a)),
            Some(Io::Disconnect(a, r)) => Some(Io::Disconnect(a, r)),
            Some(Io::SetTimer(d)) => Some(Io::SetTimer(d)),

            None => None,
        }
    }
}
