//! Node handles are created from nodes by users of the library, to
//! communicate with the underlying protocol instance.
use std::net;
use std::net::SocketAddr;

use async_trait::async_trait;
use bitcoin::network::{address::Address, message::CommandString};
use flume as chan;
use thiserror::Error;

use crate::common::peer::KnownAddress;
use crate::wire::Inventory;
use crate::{client::handle, fsm::handler::Command, fsm::handler::Peer};

/// An error resulting from a handle method.
#[derive(Error, Debug)]
pub enum Error {
    /// The command channel disconnected.
    #[error("command channel disconnected")]
    Disconnected,
    /// The command returned an error.
    #[error("command failed")]
    Command,
    /// The operation timed out.
    #[error("the operation timed out")]
    Timeout,
    /// An I/O error occured.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<chan::RecvError> for Error {
    fn from(_: chan::RecvError) -> Self {
        Self::Disconnected
    }
}

impl<T> From<chan::SendError<T>> for Error {
    fn from(_: chan::SendError<T>) -> Self {
        Self::Disconnected
    }
}

/// A handle for communicating with a node process.
#[async_trait]
pub trait Handle: Sized + Send + Sync + Clone {
    /// Send a command to the client.
    async fn command(&self, cmd: Command) -> Result<(), Error>;

    /// Get the currently negotiated peers.
    async fn get_peers(&self) -> Result<Vec<Peer>, Error>;

    /// Connect to the given peer and keep retrying it.
    async fn connect_peer(&self, addr: SocketAddr) -> Result<(), Error>;

    /// Disconnect from the given peer.
    async fn disconnect_peer(&self, addr: SocketAddr) -> Result<(), Error>;

    /// Broadcast an opaque frame to all negotiated peers. Returns the
    /// peers the frame was sent to.
    async fn broadcast(
        &self,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<Vec<net::SocketAddr>, Error>;

    /// Send an opaque frame to a random *outbound* peer. Returns the
    /// chosen peer or nothing if no peer was available.
    async fn query(
        &self,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<Option<net::SocketAddr>, Error>;

    /// Import addresses into the address book.
    async fn import_addresses(&self, addrs: Vec<Address>) -> Result<(), Error>;

    /// Put an object into the relay pool and announce it to the network.
    async fn relay(
        &self,
        inv: Inventory,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<(), handle::Error>;

    /// Subscribe the local node to a broadcast channel.
    async fn subscribe(&self, channel: u32, hops: u32) -> Result<(), handle::Error>;

    /// Cancel a local channel subscription.
    async fn cancel_subscribe(&self, channel: u32) -> Result<(), handle::Error>;

    /// Ban a peer, refusing future connections from its address.
    async fn ban_peer(&self, addr: SocketAddr) -> Result<(), handle::Error>;

    /// Snapshot the address book.
    async fn dump_peers(&self) -> Result<Vec<(SocketAddr, KnownAddress)>, handle::Error>;
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn command(&self, cmd: Command) -> Result<(), Error>;
        async fn get_peers(&self) -> Result<Vec<Peer>, Error>;
        async fn connect_peer(&self, addr: SocketAddr) -> Result<(), Error>;
        async fn disconnect_peer(&self, addr: SocketAddr) -> Result<(), Error>;
        async fn broadcast(
            &self,
            command: CommandString,
            payload: Vec<u8>,
        ) -> Result<Vec<net::SocketAddr>, Error>;
        async fn query(
            &self,
            command: CommandString,
            payload: Vec<u8>,
        ) -> Result<Option<net::SocketAddr>, Error>;
        async fn import_addresses(&self, addrs: Vec<Address>) -> Result<(), Error>;
        async fn relay(
            &self,
            inv: Inventory,
            command: CommandString,
            payload: Vec<u8>,
        ) -> Result<(), handle::Error>;
        async fn subscribe(&self, channel: u32, hops: u32) -> Result<(), handle::Error>;
        async fn cancel_subscribe(&self, channel: u32) -> Result<(), handle::Error>;
        async fn ban_peer(&self, addr: SocketAddr) -> Result<(), handle::Error>;
        async fn dump_peers(&self) -> Result<Vec<(SocketAddr, KnownAddress)>, handle::Error>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_mock() {
        let mut _mock = MockHandle::new();
    }
}
