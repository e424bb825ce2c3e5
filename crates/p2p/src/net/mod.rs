//! Peer-to-peer networking core types.
//!
//! The network layer is split in two: *state machines* implementing
//! protocol logic, and a *reactor* driving socket I/O. State machines
//! never touch sockets; they emit [`Io`] instructions that the reactor
//! carries out, and the reactor feeds network events back into them.
#![allow(clippy::type_complexity)]

use std::{borrow::Cow, fmt, hash::Hash, io, net, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use flume as chan;
use tokio_util::sync::CancellationToken;

pub use reactor::{ReactorTcp, Waker};
pub use time::{LocalDuration, LocalTime};

pub mod error;
pub mod reactor;
mod socket;
pub mod time;

/// Registered source of I/O readiness events.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Source<Id: PeerId> {
    /// A remote peer socket.
    Peer(Id),
    /// The listen socket.
    Listener,
    /// The event-loop waker.
    Waker,
}

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Inbound connection.
    Inbound,
    /// Outbound connection.
    Outbound,
}

impl Link {
    /// Check whether the link is outbound.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Check whether the link is inbound.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Output of a state transition of the state machine.
#[derive(Debug)]
pub enum Io<M, E, D, Id: PeerId = net::SocketAddr> {
    /// There are some bytes ready to be sent to a peer.
    Write(Id, M),
    /// Connect to a peer.
    Connect(Id),
    /// Disconnect from a peer.
    Disconnect(Id, D),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// Disconnection event which includes the reason.
#[derive(Debug, Clone)]
pub enum Disconnect<T> {
    /// Error while dialing the remote. This error occurs before a connection
    /// is even established. Errors of this kind are usually not transient.
    DialError(Arc<std::io::Error>),
    /// Error with an underlying established connection. Sometimes,
    /// reconnecting after such an error is possible.
    ConnectionError(Arc<std::io::Error>),
    /// Peer was disconnected by the protocol state machine.
    StateMachine(T),
}

impl<T> Disconnect<T> {
    /// Whether the disconnect is the result of a failed dial.
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }

    /// Whether the disconnect is the result of a connection error.
    pub fn is_connection_err(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl<T: fmt::Display> fmt::Display for Disconnect<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DialError(err) => write!(f, "{}", err),
            Self::ConnectionError(err) => write!(f, "{}", err),
            Self::StateMachine(reason) => write!(f, "{}", reason),
        }
    }
}

/// Remote peer id, which must be convertible into a [`net::SocketAddr`].
pub trait PeerId: Eq + Ord + Clone + Hash + fmt::Debug + From<net::SocketAddr> {
    fn to_socket_addr(&self) -> net::SocketAddr;
}

impl<T> PeerId for T
where
    T: Eq + Ord + Clone + Hash + fmt::Debug,
    T: Into<net::SocketAddr>,
    T: From<net::SocketAddr>,
{
    fn to_socket_addr(&self) -> net::SocketAddr {
        self.clone().into()
    }
}

/// A network service.
///
/// Network protocols must implement this trait to be drivable by the reactor.
#[async_trait]
pub trait Service<Id: PeerId = net::SocketAddr>: StateMachine<Id, Message = [u8]> {
    /// Commands handled by the service. These commands originate from an
    /// external "user" thread and are passed through the reactor via the
    /// channel given to [`NetReactor::run`]. The reactor calls
    /// [`Service::command_received`] on the service for each command.
    type Command: Send + Sync;

    /// An external command has been received.
    async fn command_received(&mut self, cmd: Self::Command);
}

/// A state machine implementing a network protocol's logic.
///
/// The state machine is parametrized by a peer id shared between the reactor
/// and the protocol code, and emits [`Io`] instructions to the reactor via
/// its [`Iterator`] implementation.
#[async_trait]
pub trait StateMachine<Id: PeerId = net::SocketAddr>:
    Iterator<Item = Io<<Self::Message as ToOwned>::Owned, Self::Event, Self::DisconnectReason, Id>>
{
    /// Message type sent between peers.
    type Message: fmt::Debug + ToOwned + ?Sized;
    /// Events emitted by the state machine.
    type Event: fmt::Debug + Send;
    /// Reason a peer was disconnected by the state machine.
    type DisconnectReason: fmt::Debug
        + fmt::Display
        + Into<Disconnect<Self::DisconnectReason>>;

    /// Initialize the state machine. Called once, before any other event.
    async fn initialize(&mut self, _time: LocalTime) {}

    /// Called by the reactor upon receiving bytes from a remote peer.
    async fn message_received(&mut self, addr: &Id, message: Cow<'_, Self::Message>);

    /// An outbound connection attempt is underway.
    ///
    /// Always called before [`StateMachine::connected`] for outbound links.
    /// For inbound connections, [`StateMachine::connected`] is called
    /// directly.
    fn attempted(&mut self, addr: &Id);

    /// New connection with a peer. Returning `false` refuses the connection:
    /// the reactor drops the socket without registering the peer. This is
    /// the gate enforcing the ban list and the inbound connection cap.
    fn connected(&mut self, addr: Id, local_addr: &net::SocketAddr, link: Link) -> bool;

    /// A remote peer was disconnected, either because of a network event or
    /// due to a local instruction via [`Io::Disconnect`].
    async fn disconnected(&mut self, addr: &Id, reason: Disconnect<Self::DisconnectReason>);

    /// Called every time the event loop gets data from the network or times
    /// out. Used to update the state machine's internal clock.
    fn tick(&mut self, local_time: LocalTime);

    /// A timer set with [`Io::SetTimer`] has expired.
    async fn timer_expired(&mut self);
}

/// Used to wake the event loop from other threads, for example when a
/// [`Service::Command`] is ready to be processed.
pub trait NetWaker: Send + Sync + Clone + 'static {
    /// Wake up! Call this after sending a command to make sure the command
    /// is processed in a timely fashion.
    fn wake(&self) -> io::Result<()>;
}

/// Any network reactor that can drive a [`Service`].
#[async_trait]
pub trait NetReactor<Id: PeerId = net::SocketAddr> {
    /// The type of waker this reactor uses.
    type Waker: NetWaker;

    /// Create a new reactor.
    ///
    /// Takes a channel on which the bound listen address is published, and
    /// an optional SOCKS proxy through which all outbound connections are
    /// dialed.
    fn new(
        listening: chan::Sender<net::SocketAddr>,
        proxy: Option<net::SocketAddr>,
    ) -> Result<Self, io::Error>
    where
        Self: Sized;

    /// Run the given service with the reactor, until cancelled.
    async fn run<S>(
        &mut self,
        listen_addr: &SocketAddr,
        service: S,
        commands: chan::Receiver<S::Command>,
        cancellation: CancellationToken,
    ) -> Result<(), error::Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync;

    /// Return a new waker.
    ///
    /// The reactor can provide multiple wakers such that multiple user
    /// threads may wake the event loop.
    fn waker(&self) -> Self::Waker;
}
