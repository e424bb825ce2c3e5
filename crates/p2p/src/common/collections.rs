use bitcoin_hashes::siphash24::Hash;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

/// Hasher using `siphash24`.
#[derive(Default)]
pub struct Hasher {
    data: Vec<u8>,
    key1: u64,
    key2: u64,
}

impl Hasher {
    fn new(key1: u64, key2: u64) -> Self {
        Self {
            data: vec![],
            key1,
            key2,
        }
    }
}

impl std::hash::Hasher for Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    fn finish(&self) -> u64 {
        Hash::hash_with_keys(self.key1, self.key2, &self.data).as_u64()
    }
}

/// Random hasher state.
#[derive(Default, Clone)]
pub struct RandomState {
    key1: u64,
    key2: u64,
}

impl RandomState {
    fn new(mut rng: fastrand::Rng) -> Self {
        Self {
            key1: rng.u64(..),
            key2: rng.u64(..),
        }
    }
}

impl std::hash::BuildHasher for RandomState {
    type Hasher = Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Hasher::new(self.key1, self.key2)
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self::new(rng)
    }
}

/// A map keyed by a randomized hasher, so that remote peers cannot predict
/// bucket placement. Used for per-peer protocol state.
#[derive(Debug)]
pub struct PeerMap<K, V> {
    inner: HashMap<K, V, RandomState>,
}

impl<K, V> PeerMap<K, V> {
    /// Create a new peer map keyed with the given RNG.
    pub fn new(rng: fastrand::Rng) -> Self {
        Self {
            inner: HashMap::with_hasher(RandomState::new(rng)),
        }
    }
}

impl<K, V> Deref for PeerMap<K, V> {
    type Target = HashMap<K, V, RandomState>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<K, V> DerefMut for PeerMap<K, V> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
