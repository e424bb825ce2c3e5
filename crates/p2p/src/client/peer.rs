//! Client-side peer address storage.
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use bitcoin::network::{address::Address, constants::ServiceFlags};
use serde::{Deserialize, Serialize};

use crate::common::peer::{KnownAddress, Source, Store};
use crate::net::LocalTime;

/// In-memory address store.
#[derive(Debug, Default)]
pub struct Cache(HashMap<SocketAddr, KnownAddress>);

impl Cache {
    /// Create a new cache.
    pub fn new() -> Self {
        Self(HashMap::new())
    }
}

impl FromIterator<(SocketAddr, KnownAddress)> for Cache {
    fn from_iter<T: IntoIterator<Item = (SocketAddr, KnownAddress)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Store for Cache {
    fn get(&self, addr: &SocketAddr) -> Option<&KnownAddress> {
        self.0.get(addr)
    }

    fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut KnownAddress> {
        self.0.get_mut(addr)
    }

    fn insert(&mut self, addr: &SocketAddr, known_address: KnownAddress) -> bool {
        <HashMap<_, _> as Store>::insert(&mut self.0, addr, known_address)
    }

    fn remove(&mut self, addr: &SocketAddr) -> Option<KnownAddress> {
        self.0.remove(addr)
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&SocketAddr, &KnownAddress)> + 'a> {
        Box::new(self.0.iter())
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    fn clear(&mut self) {
        self.0.clear()
    }
}

/// Durable storage for the address book.
///
/// The address book is written through this interface every couple of
/// minutes and once on shutdown, and read back on startup. The on-disk
/// format is up to the implementation.
pub trait PeerPersistence: Send + Sync {
    /// Load the persisted address book.
    fn load(&self) -> io::Result<Cache>;

    /// Persist a snapshot of the address book.
    fn save(&self, peers: &[(SocketAddr, KnownAddress)]) -> io::Result<()>;
}

/// Where a persisted address came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum SourceRecord {
    Peer(SocketAddr),
    Dns,
    Seed,
    Imported,
}

impl From<Source> for SourceRecord {
    fn from(source: Source) -> Self {
        match source {
            Source::Peer(addr) => Self::Peer(addr),
            Source::Dns => Self::Dns,
            Source::Seed => Self::Seed,
            Source::Imported => Self::Imported,
        }
    }
}

impl From<SourceRecord> for Source {
    fn from(record: SourceRecord) -> Self {
        match record {
            SourceRecord::Peer(addr) => Self::Peer(addr),
            SourceRecord::Dns => Self::Dns,
            SourceRecord::Seed => Self::Seed,
            SourceRecord::Imported => Self::Imported,
        }
    }
}

/// A single persisted address book entry.
#[derive(Debug, Serialize, Deserialize)]
struct PeerRecord {
    addr: SocketAddr,
    services: u64,
    source: SourceRecord,
    last_active: Option<u64>,
    last_success: Option<u64>,
    attempts: u32,
    successes: u32,
}

/// [`PeerPersistence`] backed by a JSON file.
#[derive(Debug, Clone)]
pub struct JsonPeerStore {
    path: PathBuf,
}

impl JsonPeerStore {
    /// Create a store reading and writing the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PeerPersistence for JsonPeerStore {
    fn load(&self) -> io::Result<Cache> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Cache::new()),
            Err(err) => return Err(err),
        };
        let records: Vec<PeerRecord> = serde_json::from_slice(&bytes)?;

        Ok(records
            .into_iter()
            .map(|record| {
                let ka = KnownAddress {
                    addr: Address::new(&record.addr, ServiceFlags::from(record.services)),
                    source: record.source.into(),
                    last_success: record.last_success.map(LocalTime::from_secs),
                    last_sampled: None,
                    last_attempt: None,
                    last_active: record.last_active.map(LocalTime::from_secs),
                    attempts: record.attempts,
                    successes: record.successes,
                };
                (record.addr, ka)
            })
            .collect())
    }

    fn save(&self, peers: &[(SocketAddr, KnownAddress)]) -> io::Result<()> {
        let records: Vec<PeerRecord> = peers
            .iter()
            .map(|(addr, ka)| PeerRecord {
                addr: *addr,
                services: ka.addr.services.to_u64(),
                source: ka.source.into(),
                last_active: ka.last_active.map(|t| t.as_secs()),
                last_success: ka.last_success.map(|t| t.as_secs()),
                attempts: ka.attempts,
                successes: ka.successes,
            })
            .collect();

        let bytes = serde_json::to_vec(&records)?;

        // Write-then-rename, so a crash never leaves a torn file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(addr: SocketAddr) -> KnownAddress {
        KnownAddress {
            addr: Address::new(&addr, ServiceFlags::NETWORK),
            source: Source::Dns,
            last_success: Some(LocalTime::from_secs(1_700_000_000)),
            last_sampled: None,
            last_attempt: None,
            last_active: Some(LocalTime::from_secs(1_700_000_100)),
            attempts: 2,
            successes: 5,
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = std::env::temp_dir().join(format!("peers-{}.json", std::process::id()));
        let store = JsonPeerStore::new(path.clone());

        let addr: SocketAddr = ([43, 12, 88, 1], 9333).into();
        store.save(&[(addr, known(addr))]).unwrap();

        let cache = store.load().unwrap();
        let loaded = cache.get(&addr).unwrap();

        assert_eq!(loaded.successes, 5);
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.last_active, Some(LocalTime::from_secs(1_700_000_100)));
        assert_eq!(loaded.addr.services, ServiceFlags::NETWORK);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = JsonPeerStore::new(std::env::temp_dir().join("does-not-exist-peers.json"));

        assert!(store.load().unwrap().is_empty());
    }
}
