//! The client runtime: configuration, the client itself, and the handle
//! used to communicate with it.
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;
use std::{net, time};

use async_trait::async_trait;
use flume as chan;

use bitcoin::network::{address::Address, message::CommandString};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::network::Network;
use crate::common::peer::KnownAddress;
use crate::wire::Inventory;
use crate::{
    client::boot_nodes,
    client::error::Error,
    client::handle,
    client::handle::Handle as _,
    client::peer::{Cache, PeerPersistence},
    client::service::Service,
    common::time::{AdjustedTime, RefClock},
    fsm::banmgr,
    fsm::handler,
    fsm::handler::{Command, FrameHandler, Limits, Peer, Whitelist},
    net::{LocalDuration, NetReactor, NetWaker},
};

/// How often the address book is persisted.
const DUMP_INTERVAL: time::Duration = time::Duration::from_secs(100);
/// How long the final shutdown dump may take.
const DUMP_TIMEOUT: time::Duration = time::Duration::from_secs(2);

/// P2P client configuration.
#[derive(Debug, Clone)]
pub struct P2PConfig {
    /// The network to join.
    pub network: Network,
    /// Exclusive peer list; when non-empty, only these are dialed.
    pub connect: Vec<SocketAddr>,
    /// Peers to persistently retry, alongside the generic dialer.
    pub persistent: Vec<SocketAddr>,
    /// Client listen address.
    pub listen: SocketAddr,
    /// SOCKS proxy for all outbound connections.
    pub proxy: Option<SocketAddr>,
    /// Whether to use the DNS seeds.
    pub dns_seeds: bool,
    /// Trusted addresses, exempt from bans and inbound limits.
    pub whitelist: Vec<IpAddr>,
    /// User agent string.
    pub user_agent: &'static str,
    /// Misbehaviour score at which a peer is banned.
    pub banscore: u32,
    /// Ban duration, in seconds.
    pub bantime: u64,
    /// Configured limits (inbound/outbound connections, channels).
    pub limits: Limits,
}

impl P2PConfig {
    /// Create a new configuration for the given network.
    pub fn new(
        network: Network,
        listen: SocketAddr,
        connect: Vec<net::SocketAddr>,
        persistent: Vec<net::SocketAddr>,
        max_inbound: usize,
        max_outbound: usize,
    ) -> Self {
        Self {
            network,
            listen,
            connect,
            persistent,
            limits: Limits {
                max_outbound_peers: max_outbound,
                max_inbound_peers: max_inbound,
                ..Limits::default()
            },
            ..Self::default()
        }
    }

    /// Lower the configuration into the state machine's.
    pub(crate) fn into_fsm_config(self) -> handler::Config {
        let mut whitelist = Whitelist::default();
        for ip in &self.whitelist {
            whitelist.addr.insert(*ip);
        }

        handler::Config {
            network: self.network,
            connect: self.connect,
            persistent: self.persistent,
            whitelist,
            user_agent: self.user_agent,
            banscore: self.banscore,
            bantime: LocalDuration::from_secs(self.bantime),
            seeds: boot_nodes::seed_addresses(self.network),
            dns_seeds: if self.dns_seeds {
                boot_nodes::dns_seeds(self.network)
            } else {
                Vec::new()
            },
            limits: self.limits,

            ..handler::Config::default()
        }
    }
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            connect: Vec::new(),
            persistent: Vec::new(),
            listen: ([0, 0, 0, 0], 0).into(),
            proxy: None,
            dns_seeds: true,
            whitelist: Vec::new(),
            user_agent: handler::USER_AGENT,
            banscore: banmgr::DEFAULT_BAN_SCORE,
            bantime: banmgr::DEFAULT_BAN_TIME.as_secs(),
            limits: Limits::default(),
        }
    }
}

/// A pre-loaded client, ready to be run.
pub struct P2PClient<R: NetReactor, H> {
    handle: Handle<R::Waker>,
    service: Service<Cache, RefClock<AdjustedTime<SocketAddr>>, H>,
    listen: SocketAddr,
    commands: chan::Receiver<Command>,
    reactor: R,
    persistence: Option<Box<dyn PeerPersistence>>,
}

impl<R: NetReactor, H: FrameHandler> P2PClient<R, H> {
    /// Create a new client.
    ///
    /// The address book is read back through the persistence interface, if
    /// one is given, and periodically written through it while running.
    pub fn new(
        config: P2PConfig,
        frame_handler: H,
        persistence: Option<Box<dyn PeerPersistence>>,
    ) -> Result<Self, Error> {
        let (commands_tx, commands_rx) = chan::unbounded::<Command>();

        let (listening_send, listening) = chan::bounded(1);
        let reactor = <R as NetReactor>::new(listening_send, config.proxy)?;

        let local_time = SystemTime::now().into();
        let clock = AdjustedTime::<SocketAddr>::new(local_time);
        let rng = fastrand::Rng::new();

        let peers = match &persistence {
            Some(store) => {
                let cache = store.load().map_err(Error::PeerStore)?;

                debug!(target: "p2p", "Loaded {} peer address(es)", crate::common::peer::Store::len(&cache));
                cache
            }
            None => Cache::new(),
        };

        let listen = config.listen;
        let service = Service::new(peers, RefClock::from(clock), rng, config, frame_handler);

        let handle = Handle {
            commands: commands_tx,
            waker: reactor.waker(),
            timeout: time::Duration::from_secs(60),
            listening,
        };

        Ok(P2PClient {
            handle,
            listen,
            commands: commands_rx,
            reactor,
            service,
            persistence,
        })
    }

    /// Run the client until the given token is cancelled.
    ///
    /// Startup failures, such as an unbindable listen address, are
    /// returned; everything else is contained and retried internally.
    pub async fn run(mut self, cancellation: CancellationToken) -> Result<(), Error> {
        // The reactor gets its own token: on external cancellation the
        // address book is flushed first, while the reactor can still
        // process the dump command, and only then is the reactor stopped.
        let reactor_cancellation = CancellationToken::new();
        let dumper = tokio::spawn(run_address_dumper(
            self.handle.clone(),
            self.persistence.take(),
            cancellation,
            reactor_cancellation.clone(),
        ));

        let result = self
            .reactor
            .run(
                &self.listen,
                self.service,
                self.commands,
                reactor_cancellation,
            )
            .await;

        dumper.await.ok();

        Ok(result?)
    }

    /// Create a new handle to communicate with the client.
    pub fn handle(&self) -> Handle<R::Waker> {
        self.handle.clone()
    }
}

/// Periodically persists the address book, and flushes it one last time on
/// shutdown before stopping the reactor.
async fn run_address_dumper<W: NetWaker>(
    handle: Handle<W>,
    persistence: Option<Box<dyn PeerPersistence>>,
    cancellation: CancellationToken,
    reactor_cancellation: CancellationToken,
) {
    async fn dump<W: NetWaker>(handle: &Handle<W>, store: &dyn PeerPersistence) {
        match handle.dump_peers().await {
            Ok(peers) => {
                if let Err(err) = store.save(&peers) {
                    error!(target: "p2p", "Failed to persist the address book: {}", err);
                } else {
                    debug!(target: "p2p", "Persisted {} peer address(es)", peers.len());
                }
            }
            Err(err) => error!(target: "p2p", "Failed to snapshot the address book: {}", err),
        }
    }

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                if let Some(store) = &persistence {
                    info!(target: "p2p", "Flushing the address book before shutdown");

                    tokio::time::timeout(DUMP_TIMEOUT, dump(&handle, store.as_ref()))
                        .await
                        .ok();
                }
                reactor_cancellation.cancel();
                break;
            }
            _ = tokio::time::sleep(DUMP_INTERVAL) => {
                if let Some(store) = &persistence {
                    dump(&handle, store.as_ref()).await;
                }
            }
        }
    }
}

/// A handle on a running client.
#[derive(Clone)]
pub struct Handle<W: NetWaker> {
    pub commands: chan::Sender<Command>,
    pub waker: W,
    pub timeout: time::Duration,
    pub listening: chan::Receiver<net::SocketAddr>,
}

impl<W: NetWaker> Handle<W> {
    /// Send a command to the command channel, and wake up the event loop.
    async fn _command(&self, cmd: Command) -> Result<(), handle::Error> {
        if self.commands.send_async(cmd).await.is_err() {
            return Err(handle::Error::Command);
        }
        self.waker.wake()?;

        Ok(())
    }
}

#[async_trait]
impl<W: NetWaker> handle::Handle for Handle<W> {
    async fn command(&self, cmd: Command) -> Result<(), handle::Error> {
        self._command(cmd).await
    }

    async fn get_peers(&self) -> Result<Vec<Peer>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::GetPeers(transmit)).await?;

        match receive.recv_async().await {
            Ok(peers) => Ok(peers),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn connect_peer(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::Connect(addr)).await
    }

    async fn disconnect_peer(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::Disconnect(addr)).await
    }

    async fn broadcast(
        &self,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<Vec<net::SocketAddr>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::Broadcast(command, payload, transmit))
            .await?;

        match receive.recv_async().await {
            Ok(addrs) => Ok(addrs),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn query(
        &self,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<Option<net::SocketAddr>, handle::Error> {
        let (transmit, receive) = chan::bounded::<Option<SocketAddr>>(1);
        self.command(Command::Query(command, payload, transmit))
            .await?;

        match receive.recv_async().await {
            Ok(addr) => Ok(addr),
            Err(_) => Err(handle::Error::Timeout),
        }
    }

    async fn import_addresses(&self, addrs: Vec<Address>) -> Result<(), handle::Error> {
        self.command(Command::ImportAddresses(addrs)).await
    }

    async fn relay(
        &self,
        inv: Inventory,
        command: CommandString,
        payload: Vec<u8>,
    ) -> Result<(), handle::Error> {
        self.command(Command::Relay(inv, command, payload)).await
    }

    async fn subscribe(&self, channel: u32, hops: u32) -> Result<(), handle::Error> {
        self.command(Command::Subscribe(channel, hops)).await
    }

    async fn cancel_subscribe(&self, channel: u32) -> Result<(), handle::Error> {
        self.command(Command::CancelSubscribe(channel)).await
    }

    async fn ban_peer(&self, addr: SocketAddr) -> Result<(), handle::Error> {
        self.command(Command::BanPeer(addr)).await
    }

    async fn dump_peers(&self) -> Result<Vec<(SocketAddr, KnownAddress)>, handle::Error> {
        let (transmit, receive) = chan::bounded(1);
        self.command(Command::DumpPeers(transmit)).await?;

        match receive.recv_async().await {
            Ok(peers) => Ok(peers),
            Err(_) => Err(handle::Error::Timeout),
        }
    }
}
