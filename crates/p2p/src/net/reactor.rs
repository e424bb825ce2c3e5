//! Poll-based reactor. This is a single-threaded reactor using a `poll` loop.
use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    io,
    io::prelude::*,
    net,
    net::SocketAddr,
    os::unix::io::AsRawFd,
    sync::Arc,
    time,
    time::SystemTime,
};

use async_trait::async_trait;
use flume as chan;
use flume::Receiver;
use popol::Event;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::net::socket::{Socket, SEND_BUFFER_LIMIT, SEND_STUCK_TIMEOUT};
use crate::net::time::TimeoutManager;
use crate::net::{
    error, error::Error, Disconnect, Io, Link, LocalDuration, LocalTime, NetReactor, NetWaker,
    PeerId, Service, Source,
};

/// Maximum time to wait when reading from a socket.
const READ_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum time to wait when writing to a socket.
const WRITE_TIMEOUT: time::Duration = time::Duration::from_secs(3);
/// Maximum time to wait when establishing a proxied connection.
const PROXY_CONNECT_TIMEOUT: time::Duration = time::Duration::from_secs(6);
/// Maximum amount of time to wait for i/o when no timer is due earlier.
const WAIT_TIMEOUT: LocalDuration = LocalDuration::from_secs(5);
/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 1024 * 192;

pub type ReactorTcp = Reactor<net::TcpStream>;

#[derive(Clone)]
pub struct Waker(Arc<popol::Waker>);

impl Waker {
    fn new<Id: PeerId>(sources: &mut popol::Sources<Source<Id>>) -> io::Result<Self> {
        let waker = Arc::new(popol::Waker::new(sources, Source::Waker)?);

        Ok(Self(waker))
    }
}

impl NetWaker for Waker {
    fn wake(&self) -> io::Result<()> {
        self.0.wake()
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor<R: Write + Read, Id: PeerId = net::SocketAddr> {
    peers: HashMap<Id, Socket<R>>,
    connecting: HashSet<Id>,
    sources: popol::Sources<Source<Id>>,
    waker: Waker,
    timeouts: TimeoutManager<()>,
    listening: chan::Sender<net::SocketAddr>,
    proxy: Option<net::SocketAddr>,
}

/// The `R` parameter represents the underlying stream type, eg.
/// `net::TcpStream`.
impl<R: Write + Read + AsRawFd, Id: PeerId> Reactor<R, Id> {
    /// Register a peer with the reactor.
    fn register_peer(&mut self, addr: Id, stream: R, link: Link) {
        let socket_addr = addr.to_socket_addr();
        let now = LocalTime::from(SystemTime::now());

        self.sources
            .register(Source::Peer(addr.clone()), &stream, popol::interest::ALL);
        self.peers
            .insert(addr, Socket::from(stream, socket_addr, link, now));
    }

    /// Unregister a peer from the reactor and inform the service.
    async fn unregister_peer<S>(
        &mut self,
        addr: Id,
        reason: Disconnect<S::DisconnectReason>,
        service: &mut S,
    ) where
        S: Service<Id>,
    {
        self.connecting.remove(&addr);
        self.peers.remove(&addr);
        self.sources.unregister(&Source::Peer(addr.clone()));

        service.disconnected(&addr, reason).await;
    }
}

#[async_trait]
impl<Id: PeerId + Send + Sync> NetReactor<Id> for Reactor<net::TcpStream, Id> {
    type Waker = Waker;

    fn new(
        listening: chan::Sender<net::SocketAddr>,
        proxy: Option<net::SocketAddr>,
    ) -> Result<Self, io::Error> {
        let mut sources = popol::Sources::new();
        let waker = Waker::new(&mut sources)?;
        let timeouts = TimeoutManager::new(LocalDuration::from_millis(50));

        Ok(Self {
            peers: HashMap::new(),
            connecting: HashSet::new(),
            sources,
            waker,
            timeouts,
            listening,
            proxy,
        })
    }

    /// Run the given service with the reactor.
    async fn run<S>(
        &mut self,
        listen_addr: &SocketAddr,
        mut service: S,
        commands: chan::Receiver<S::Command>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        let listener = self.listen(listen_addr).await?;

        let local_time = SystemTime::now().into();
        service.initialize(local_time).await;

        self.process(&mut service, local_time).await;

        // I/O readiness events populated by `popol::Sources::wait_timeout`.
        let mut events = Vec::with_capacity(32);
        // Timeouts populated by `TimeoutManager::wake`.
        let mut timeouts: Vec<()> = Vec::with_capacity(32);

        loop {
            select! {
                _ = cancellation.cancelled() => {
                    trace!(target: "net", "Reactor cancelled");
                    break Ok(());
                }
                result = self.step(&mut events, &mut service, &commands, &mut timeouts, &listener) => {
                    if let Err(e) = result {
                        break Err(e);
                    }
                }
            }
        }
    }

    fn waker(&self) -> Self::Waker {
        self.waker.clone()
    }
}

impl<Id: PeerId + Send + Sync> Reactor<net::TcpStream, Id> {
    /// Bind the listen socket and start accepting connections on it.
    async fn listen(&mut self, listen_addr: &SocketAddr) -> Result<net::TcpListener, Error> {
        let listener = net::TcpListener::bind(listen_addr).map_err(|source| error::Error::Bind {
            addr: *listen_addr,
            source,
        })?;
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;

        self.sources
            .register(Source::Listener, &listener, popol::interest::READ);
        self.listening.send_async(local_addr).await.ok();

        debug!(target: "net", "Listening for incoming connections on {}", local_addr);

        Ok(listener)
    }

    /// A single reactor iteration: poll, dispatch readiness events, run
    /// expired timers, process state machine outputs.
    async fn step<S>(
        &mut self,
        events: &mut Vec<Event<Source<Id>>>,
        service: &mut S,
        commands: &Receiver<S::Command>,
        timeouts: &mut Vec<()>,
        listener: &net::TcpListener,
    ) -> Result<(), Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        tokio::task::yield_now().await;

        // Wait until the nearest timer is due, but never longer than the
        // base poll timeout, so that protocol wakes aren't starved by a
        // busy socket set.
        let wait = self
            .timeouts
            .next(LocalTime::from(SystemTime::now()))
            .unwrap_or(WAIT_TIMEOUT)
            .clamp(LocalDuration::from_millis(1), WAIT_TIMEOUT);

        trace!(
            target: "net",
            "Polling {} source(s) and {} timeout(s), waking up in {}..",
            self.sources.len(),
            self.timeouts.len(),
            wait,
        );

        let result = self.sources.wait_timeout(events, wait.into()); // Blocking.
        let local_time = SystemTime::now().into();

        service.tick(local_time);

        match result {
            Ok(n) => {
                trace!(target: "net", "Woke up with {n} source(s) ready");

                self.dispatch(events, service, commands, listener).await?;
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        // Regardless of whether the poll returned events or timed out,
        // trigger the timers that are due.
        self.timeouts.wake(local_time, timeouts);
        if !timeouts.is_empty() {
            timeouts.clear();
            service.timer_expired().await;
        }

        self.process(service, local_time).await;
        self.drop_stuck_peers(local_time, service).await;

        Ok(())
    }

    /// Drop peers whose send queue has been non-empty for too long without
    /// the peer accepting a single byte.
    async fn drop_stuck_peers<S>(&mut self, local_time: LocalTime, service: &mut S)
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        let stuck: Vec<Id> = self
            .peers
            .iter()
            .filter(|(_, socket)| socket.is_stuck(local_time, SEND_STUCK_TIMEOUT))
            .map(|(addr, _)| addr.clone())
            .collect();

        for addr in stuck {
            error!(
                target: "net",
                "{}: Send queue stuck for {}, dropping peer",
                addr.to_socket_addr(), SEND_STUCK_TIMEOUT
            );
            self.peers
                .get(&addr)
                .and_then(|socket| socket.disconnect().ok());
            self.unregister_peer(
                addr,
                Disconnect::ConnectionError(Arc::new(io::Error::from(io::ErrorKind::TimedOut))),
                service,
            )
            .await;
        }
    }

    async fn dispatch<S>(
        &mut self,
        events: &mut Vec<Event<Source<Id>>>,
        service: &mut S,
        commands: &Receiver<S::Command>,
        listener: &net::TcpListener,
    ) -> Result<(), Error>
    where
        S: Service<Id> + Send + Sync,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>> + Send + Sync,
    {
        for event in events.drain(..) {
            match &event.key {
                Source::Peer(addr) => {
                    let addr = addr.clone();

                    if event.is_error() || event.is_hangup() {
                        // Let the subsequent read fail.
                        trace!(target: "net", "{}: Socket error triggered: {:?}", addr.to_socket_addr(), event);
                    }
                    if event.is_invalid() {
                        // File descriptor was closed and is invalid.
                        // Nb. This shouldn't happen. It means the source wasn't
                        // properly unregistered, or there is a duplicate source.
                        error!(target: "net", "{}: Socket is invalid, removing", addr.to_socket_addr());

                        self.sources.unregister(&event.key);
                        continue;
                    }

                    if event.is_writable() {
                        self.handle_writable(addr.clone(), &event.key, service)
                            .await?;
                    }
                    if event.is_readable() {
                        self.handle_readable(addr, service).await;
                    }
                }
                Source::Listener => self.handle_acceptable(listener, service).await?,
                Source::Waker => {
                    trace!(target: "net", "Woken up by waker ({} command(s))", commands.len());

                    popol::Waker::reset(event.source).ok();

                    while let Ok(cmd) = commands.try_recv() {
                        service.command_received(cmd).await;
                    }
                }
            }
        }

        Ok(())
    }

    /// Accept as many pending connections as are available.
    ///
    /// The service's `connected` hook acts as a gate: a `false` return
    /// (banned address, inbound limit reached) drops the socket without
    /// allocating any peer state.
    async fn handle_acceptable<S>(
        &mut self,
        listener: &net::TcpListener,
        service: &mut S,
    ) -> Result<(), Error>
    where
        S: Service<Id> + Send + Sync,
    {
        loop {
            let (conn, socket_addr) = match listener.accept() {
                Ok((conn, socket_addr)) => (conn, socket_addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(target: "net", "Accept error: {}", e.to_string());
                    break;
                }
            };
            trace!(target: "net", "{}: Accepting peer connection", socket_addr);

            conn.set_nonblocking(true)?;

            let local_addr = conn.local_addr()?;
            let addr = Id::from(socket_addr);

            if !service.connected(addr.clone(), &local_addr, Link::Inbound) {
                // Refused: close immediately, nothing was registered.
                debug!(target: "net", "{}: Connection refused", socket_addr);
                drop(conn);
                continue;
            }
            self.register_peer(addr, conn, Link::Inbound);
        }

        Ok(())
    }

    async fn handle_readable<S>(&mut self, addr: Id, service: &mut S)
    where
        S: Service<Id>,
    {
        // Nb. If the socket was readable and writable at the same time, and it
        // was disconnected during an attempt to write, it will no longer be
        // registered and hence available for reads.
        if let Some(socket) = self.peers.get_mut(&addr) {
            let mut buffer = [0; READ_BUFFER_SIZE];

            let socket_addr = addr.to_socket_addr();
            trace!(target: "net", "{}: Socket is readable", socket_addr);

            // Nb. Since `poll`, which this reactor is based on, is
            // *level-triggered*, we will be notified again if there is still
            // data to be read on the socket. Hence, there is no use in
            // putting this socket read in a loop, as the second invocation
            // would likely block.
            match socket.read(&mut buffer) {
                Ok(count) => {
                    if count > 0 {
                        service
                            .message_received(&addr, Cow::Borrowed(&buffer[..count]))
                            .await;
                    } else {
                        // Zero bytes read means the peer performed an
                        // orderly shutdown.
                        socket.disconnect().ok();

                        self.unregister_peer(
                            addr,
                            Disconnect::ConnectionError(Arc::new(io::Error::from(
                                io::ErrorKind::ConnectionReset,
                            ))),
                            service,
                        )
                        .await;
                    }
                }
                Err(err)
                    if [io::ErrorKind::WouldBlock, io::ErrorKind::Interrupted]
                        .contains(&err.kind()) =>
                {
                    // This shouldn't normally happen, since this function is
                    // only called when there's data on the socket.
                    trace!(target: "net", "{}: Benign read error: {}", socket_addr, err);
                }
                Err(err) => {
                    trace!(target: "net", "{}: Read error: {}", socket_addr, err.to_string());

                    socket.disconnect().ok();
                    self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                        .await;
                }
            }
        }
    }

    async fn handle_writable<S: Service<Id>>(
        &mut self,
        addr: Id,
        source: &Source<Id>,
        service: &mut S,
    ) -> io::Result<()> {
        let socket_addr = addr.to_socket_addr();
        trace!(target: "net", "{}: Socket is writable", socket_addr);

        let (Some(source), Some(socket)) =
            (self.sources.get_mut(source), self.peers.get_mut(&addr))
        else {
            return Ok(());
        };

        // "A file descriptor for a socket that is connecting asynchronously
        // shall indicate that it is ready for writing, once a connection has
        // been established."
        //
        // Since we perform a non-blocking connect, we're only really
        // connected once the socket is writable.
        if self.connecting.remove(&addr) {
            let local_addr = socket.local_address()?;
            let link = socket.link;

            if !service.connected(addr.clone(), &local_addr, link) {
                socket.disconnect().ok();
                self.unregister_peer(
                    addr,
                    Disconnect::ConnectionError(Arc::new(io::Error::from(
                        io::ErrorKind::ConnectionAborted,
                    ))),
                    service,
                )
                .await;

                return Ok(());
            }
        }

        match socket.flush(LocalTime::from(SystemTime::now())) {
            // We've written all the data, we are no longer interested in
            // writing to this socket.
            Ok(()) => {
                source.unset(popol::interest::WRITE);
            }
            // The write couldn't complete. Keep the `WRITE` interest to be
            // notified when the socket is ready to write again.
            Err(err)
                if [io::ErrorKind::WouldBlock, io::ErrorKind::WriteZero].contains(&err.kind()) =>
            {
                source.set(popol::interest::WRITE);
            }
            Err(err) => {
                error!(target: "net", "{}: Write error: {}", socket_addr, err.to_string());

                socket.disconnect().ok();
                self.unregister_peer(addr, Disconnect::ConnectionError(Arc::new(err)), service)
                    .await;
            }
        }
        Ok(())
    }

    /// Process state machine outputs.
    async fn process<S>(&mut self, service: &mut S, local_time: LocalTime)
    where
        S: Service<Id>,
        S::DisconnectReason: Into<Disconnect<S::DisconnectReason>>,
    {
        // Note that there may be messages destined for a peer that has since
        // been disconnected.
        while let Some(out) = service.next() {
            match out {
                Io::Write(addr, bytes) => {
                    let Some((socket, source)) = self.peers.get_mut(&addr).and_then(|socket| {
                        self.sources
                            .get_mut(&Source::Peer(addr.clone()))
                            .map(|source| (socket, source))
                    }) else {
                        continue;
                    };

                    if socket.push(&bytes, local_time) > SEND_BUFFER_LIMIT {
                        // The peer is not draining its socket: flood control.
                        error!(
                            target: "net",
                            "{}: Send queue exceeded {} bytes, dropping peer",
                            addr.to_socket_addr(), SEND_BUFFER_LIMIT
                        );
                        socket.disconnect().ok();
                        self.unregister_peer(
                            addr,
                            Disconnect::ConnectionError(Arc::new(io::Error::from(
                                io::ErrorKind::OutOfMemory,
                            ))),
                            service,
                        )
                        .await;
                    } else {
                        source.set(popol::interest::WRITE);
                    }
                }
                Io::Connect(addr) => self.handle_connect(addr, service).await,
                Io::Disconnect(addr, reason) => {
                    // Shutdown the connection, ignoring any potential errors.
                    // If the socket was already disconnected, this will yield
                    // an error that is safe to ignore (`ENOTCONN`). The other
                    // possible errors relate to an invalid file descriptor.
                    self.peers
                        .get(&addr)
                        .and_then(|peer| peer.disconnect().ok());
                    self.unregister_peer(addr, reason.into(), service).await;
                }
                Io::SetTimer(timeout) => {
                    self.timeouts.register((), local_time + timeout);
                }
                Io::Event(event) => {
                    trace!(target: "net", "Event: {:?}", event);
                }
            }
        }
    }

    async fn handle_connect<S: Service<Id>>(&mut self, addr: Id, service: &mut S) {
        let socket_addr = addr.to_socket_addr();

        let dialed = match self.proxy {
            Some(proxy) => dial_proxied(&socket_addr, &proxy),
            None => dial(&socket_addr),
        };

        match dialed {
            Ok(stream) => {
                trace!(target: "net", "{:#?}", stream);

                self.register_peer(addr.clone(), stream, Link::Outbound);
                self.connecting.insert(addr.clone());

                service.attempted(&addr);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Ignore. We are already establishing a connection through
                // this socket.
            }
            Err(err) => {
                error!(target: "net", "{}: Dial error: {}", socket_addr, err.to_string());

                service
                    .disconnected(&addr, Disconnect::DialError(Arc::new(err)))
                    .await;
            }
        }
    }
}

/// Connect to a peer given a remote address.
fn dial(addr: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    use socket2::{Domain, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, None)?;

    sock.set_read_timeout(Some(READ_TIMEOUT))?;
    sock.set_write_timeout(Some(WRITE_TIMEOUT))?;
    sock.set_nonblocking(true)?;

    match sock.connect(&(*addr).into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) if e.raw_os_error() == Some(libc::EALREADY) => {
            return Err(io::Error::from(io::ErrorKind::AlreadyExists))
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(sock.into())
}

/// Connect to a peer through a SOCKS4 proxy.
///
/// The proxy handshake is performed with a blocking, bounded-timeout
/// connection; the stream is switched to non-blocking before it is handed
/// to the reactor.
fn dial_proxied(addr: &SocketAddr, proxy: &SocketAddr) -> Result<net::TcpStream, io::Error> {
    let SocketAddr::V4(destination) = addr else {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "SOCKS4 proxying supports IPv4 destinations only",
        ));
    };

    let mut stream = net::TcpStream::connect_timeout(proxy, PROXY_CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;

    // VN=4, CD=1 (CONNECT), destination port and address, empty user id.
    let mut request = vec![4u8, 1];
    request.extend_from_slice(&destination.port().to_be_bytes());
    request.extend_from_slice(&destination.ip().octets());
    request.push(0);

    stream.write_all(&request)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;

    // CD=90 means request granted.
    if reply[1] != 90 {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused connection (code {})", reply[1]),
        ));
    }

    stream.set_nonblocking(true)?;

    Ok(stream)
}
