//! Shared peer-address types.

use std::net;
use std::net::SocketAddr;

use bitcoin::network::address::Address;

use crate::net::time::LocalTime;

/// Peer store.
///
/// Used to store peer addresses and quality metadata.
pub trait Store {
    /// Get a known peer address.
    fn get(&self, addr: &SocketAddr) -> Option<&KnownAddress>;

    /// Get a known peer address mutably.
    fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut KnownAddress>;

    /// Insert a *new* address into the store. Returns `true` if the address
    /// was inserted, or `false` if it was already known.
    fn insert(&mut self, addr: &SocketAddr, ka: KnownAddress) -> bool;

    /// Remove an address from the store.
    fn remove(&mut self, addr: &SocketAddr) -> Option<KnownAddress>;

    /// Return an iterator over the known addresses.
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&SocketAddr, &KnownAddress)> + 'a>;

    /// Returns the number of addresses.
    fn len(&self) -> usize;

    /// Returns true if there are no addresses.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the store of all addresses.
    fn clear(&mut self);
}

/// Implementation of [`Store`] for [`std::collections::HashMap`].
impl Store for std::collections::HashMap<SocketAddr, KnownAddress> {
    fn get(&self, addr: &SocketAddr) -> Option<&KnownAddress> {
        self.get(addr)
    }

    fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut KnownAddress> {
        self.get_mut(addr)
    }

    fn insert(&mut self, addr: &SocketAddr, ka: KnownAddress) -> bool {
        use ::std::collections::hash_map::Entry;

        match self.entry(*addr) {
            Entry::Vacant(v) => {
                v.insert(ka);
            }
            Entry::Occupied(_) => return false,
        }
        true
    }

    fn remove(&mut self, addr: &SocketAddr) -> Option<KnownAddress> {
        self.remove(addr)
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&SocketAddr, &KnownAddress)> + 'a> {
        Box::new(self.iter())
    }

    fn len(&self) -> usize {
        self.len()
    }

    fn clear(&mut self) {
        self.clear()
    }
}

/// Address source. Specifies where an address originated from.
///
/// The source takes part in address-table bucketing, so that a flood of
/// addresses from a single source cannot dominate the table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// An address that was gossiped by another peer.
    Peer(net::SocketAddr),
    /// An address that came from a DNS seed.
    Dns,
    /// An address from the hardcoded seed list.
    Seed,
    /// An address that came from some source external to the system, eg.
    /// specified by the user or added directly to the address manager.
    Imported,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(addr) => write!(f, "{}", addr),
            Self::Dns => write!(f, "DNS"),
            Self::Seed => write!(f, "Seed"),
            Self::Imported => write!(f, "Imported"),
        }
    }
}

/// A known address, together with the quality metrics driving selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownAddress {
    /// Network address.
    pub addr: Address,
    /// Address of the peer who sent us this address.
    pub source: Source,
    /// Last time this address was used to successfully connect to a peer.
    pub last_success: Option<LocalTime>,
    /// Last time this address was returned from a sample.
    pub last_sampled: Option<LocalTime>,
    /// Last time this address was tried.
    pub last_attempt: Option<LocalTime>,
    /// Last time this peer was seen alive. Never decreases.
    pub last_active: Option<LocalTime>,
    /// Number of connection attempts since the last success.
    pub attempts: u32,
    /// Number of successful handshakes over this address.
    pub successes: u32,
}

impl KnownAddress {
    /// Create a new known address.
    pub fn new(addr: Address, source: Source, last_active: Option<LocalTime>) -> Self {
        Self {
            addr,
            source,
            last_success: None,
            last_sampled: None,
            last_attempt: None,
            last_active,
            attempts: 0,
            successes: 0,
        }
    }

    /// Whether this address has ever been successfully connected to.
    pub fn is_tried(&self) -> bool {
        self.successes > 0
    }
}

/// Source of candidate peer addresses, as seen by the connection manager.
pub trait AddressSource {
    /// Sample a random peer address, where `bias ∈ [0, 100]` tilts selection
    /// between the *tried* and *new* address pools; higher values prefer
    /// addresses that have not been successfully connected to yet.
    /// Returns `None` if no candidate is available.
    fn sample(&mut self, bias: u8) -> Option<(Address, Source)>;

    /// Sample a peer address satisfying the provided predicate.
    fn sample_with(
        &mut self,
        bias: u8,
        predicate: impl Fn(&KnownAddress) -> bool,
    ) -> Option<(Address, Source)>;

    /// Record an address of ours as seen by a remote peer.
    fn record_local_address(&mut self, addr: net::SocketAddr);

    /// Add addresses to the underlying address table.
    fn insert(&mut self, addrs: impl IntoIterator<Item = (u32, Address)>, source: Source);
}
