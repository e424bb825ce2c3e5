//! Peer network, eg. *Mainnet*.

use core::{fmt::Display, str::FromStr};

use bitcoin::network::Magic;

/// Mainnet message-start bytes.
const MAINNET_MAGIC: [u8; 4] = [0x54, 0x45, 0x53, 0x41];
/// Testnet message-start bytes.
const TESTNET_MAGIC: [u8; 4] = [0x54, 0x45, 0x53, 0x74];
/// Regtest message-start bytes.
const REGTEST_MAGIC: [u8; 4] = [0x54, 0x45, 0x53, 0x72];

/// The network a node is a member of. Peers on different networks use
/// different magic bytes and default ports and will not talk to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The public test network.
    Testnet,
    /// A private regression-test network.
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl Network {
    /// The network-identity constant carried by every frame.
    pub fn magic(&self) -> Magic {
        match self {
            Self::Mainnet => Magic::from_bytes(MAINNET_MAGIC),
            Self::Testnet => Magic::from_bytes(TESTNET_MAGIC),
            Self::Regtest => Magic::from_bytes(REGTEST_MAGIC),
        }
    }

    /// The default listen and dial port of this network.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Mainnet => 9333,
            Self::Testnet => 19333,
            Self::Regtest => 19444,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
            Self::Regtest => write!(f, "regtest"),
        }
    }
}

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            _ => Err(NetworkParseError::UnknownType),
        }
    }
}

impl<'de> serde::Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        Network::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Failure to parse a network name.
#[derive(Debug)]
pub enum NetworkParseError {
    /// The name matches no known network.
    UnknownType,
}

impl Display for NetworkParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NetworkParseError::UnknownType => write!(f, "unknown network type"),
        }
    }
}

impl std::error::Error for NetworkParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magics_are_distinct() {
        assert_ne!(Network::Mainnet.magic(), Network::Testnet.magic());
        assert_ne!(Network::Testnet.magic(), Network::Regtest.magic());
    }

    #[test]
    fn test_parse() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("devnet".parse::<Network>().is_err());
    }
}
