//! Hardcoded seed data.
//!
//! These tables are configuration data, not logic: the connection manager
//! injects them into the address book only when it has nothing better, and
//! ages them randomly so that live gossip immediately outranks them.
use std::{net::SocketAddr, str::FromStr};

use crate::common::network::Network;

const MAINNET: &[&str] = &[
    "45.32.91.14:9333",
    "82.165.112.7:9333",
    "104.196.44.91:9333",
    "144.76.28.9:9333",
    "158.69.221.203:9333",
    "185.25.48.184:9333",
];

const TESTNET: &[&str] = &[
    "95.179.144.86:19333",
    "149.28.201.11:19333",
];

const MAINNET_DNS: &[&str] = &[
    "seed.tessera.network",
    "seed.tessera-nodes.net",
    "dnsseed.tessera.dev",
];

const TESTNET_DNS: &[&str] = &["testnet-seed.tessera.network"];

/// The hardcoded seed addresses for the given network.
pub(crate) fn seed_addresses(network: Network) -> Vec<SocketAddr> {
    let seeds = match network {
        Network::Mainnet => MAINNET,
        Network::Testnet => TESTNET,
        Network::Regtest => &[],
    };

    seeds
        .iter()
        .map(|seed| SocketAddr::from_str(seed).expect("seed addresses are valid"))
        .collect()
}

/// The DNS seed hostnames for the given network.
pub(crate) fn dns_seeds(network: Network) -> Vec<String> {
    let seeds: &[&str] = match network {
        Network::Mainnet => MAINNET_DNS,
        Network::Testnet => TESTNET_DNS,
        Network::Regtest => &[],
    };

    seeds.iter().map(|seed| seed.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_tables_parse() {
        assert!(!seed_addresses(Network::Mainnet).is_empty());
        assert!(!seed_addresses(Network::Testnet).is_empty());
        assert!(seed_addresses(Network::Regtest).is_empty());
    }
}
