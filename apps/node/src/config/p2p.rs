use eyre::{Context, OptionExt};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use tessera_p2p::client;
use tessera_p2p::common::network::Network;

/// Default total connection budget.
pub const DEFAULT_MAX_CONNECTIONS: usize = 125;

/// Hard cap on outbound connections. The outbound count is always
/// `min(8, max_outbound_connections)`; the rest of the budget is inbound.
pub const MAX_OUTBOUND_CONNECTIONS: usize = 8;

#[derive(Deserialize, Clone)]
pub struct P2pConfig {
    /// Address to listen on for incoming connections.
    pub address: String,
    /// Total connection budget; outbound takes up to
    /// [`MAX_OUTBOUND_CONNECTIONS`] of it, the rest is inbound.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum amount of outbound connections.
    #[serde(default = "default_max_outbound_connections")]
    pub max_outbound_connections: usize,
    /// Exclusive list of peers to connect to. Disables the generic dialer.
    #[serde(default)]
    pub connect: Vec<String>,
    /// Peers to add and persistently retry.
    #[serde(default)]
    pub addnode: Vec<String>,
    /// Whether to query the DNS seeds.
    #[serde(default = "default_true")]
    pub dnsseed: bool,
    /// SOCKS proxy for all outbound connections.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Misbehaviour score at which peers are banned.
    #[serde(default = "default_banscore")]
    pub banscore: u32,
    /// Ban duration, in seconds.
    #[serde(default = "default_bantime")]
    pub bantime: u64,
    /// Trusted addresses, exempt from bans and inbound limits.
    #[serde(default)]
    pub whitelist: Vec<IpAddr>,
    /// Where the address book is persisted. Disabled when unset.
    #[serde(default)]
    pub peers_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_max_outbound_connections() -> usize {
    MAX_OUTBOUND_CONNECTIONS
}

fn default_true() -> bool {
    true
}

fn default_banscore() -> u32 {
    100
}

fn default_bantime() -> u64 {
    60 * 60 * 24
}

impl P2pConfig {
    pub fn to_client_config(&self, network: Network) -> eyre::Result<client::P2PConfig> {
        let connect = resolve(&self.connect)?;
        let persistent = resolve(&self.addnode)?;

        let address = self
            .address
            .to_socket_addrs()
            .wrap_err("Failed to resolve listen address")?
            .next()
            .ok_or_eyre("No address found in listen address")?;

        let proxy = self
            .proxy
            .as_ref()
            .map(|proxy| {
                proxy
                    .to_socket_addrs()
                    .wrap_err("Failed to resolve proxy address")?
                    .next()
                    .ok_or_eyre("No address found in proxy address")
            })
            .transpose()?;

        let max_outbound = usize::min(MAX_OUTBOUND_CONNECTIONS, self.max_outbound_connections);
        let max_inbound = self.max_connections.saturating_sub(max_outbound);

        let mut config = client::P2PConfig::new(
            network,
            address,
            connect,
            persistent,
            max_inbound,
            max_outbound,
        );
        config.proxy = proxy;
        config.dns_seeds = self.dnsseed;
        config.banscore = self.banscore;
        config.bantime = self.bantime;
        config.whitelist = self.whitelist.clone();

        Ok(config)
    }

    /// Where the address book is persisted, if anywhere.
    pub fn peers_file(&self) -> Option<PathBuf> {
        self.peers_file.clone()
    }
}

fn resolve(addrs: &[String]) -> eyre::Result<Vec<SocketAddr>> {
    Ok(addrs
        .iter()
        .map(|addr| {
            addr.to_socket_addrs()
                .wrap_err("Failed to resolve peer address")
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect())
}
