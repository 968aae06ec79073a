// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! State keys, permissions and the storage seam.
//!
//! Transactions declare every state key they touch together with permission
//! bits. Keys carry a trailing `u16` capacity (max value chunks) used by the
//! gas model; values persisted by the host store carry a trailing `u16`
//! declaring the chunk count of their payload.

use crate::crypto::Digest;
use ahash::AHashMap;
use std::ops::BitOr;
use thiserror::Error;

/// Root id produced by the host merkle database.
pub type RootId = Digest;

/// Granularity of value gas accounting: a value of `n` bytes spans
/// `n / 64 + 1` chunks.
pub const VALUE_CHUNK_SIZE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StateError {
    #[error("key not found")]
    NotFound,
    #[error("invalid key or permission")]
    InvalidKeyOrPermission,
    #[error("allocation disabled")]
    AllocationDisabled,
    #[error("invalid key or value chunk encoding")]
    InvalidKeyValue,
}

/// Permission bits over {Read, Allocate, Write}. Bits outside the defined
/// range are ignored: a scope entry constructed from them grants nothing.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(1 << 0);
    pub const ALLOCATE: Permissions = Permissions(1 << 1);
    pub const WRITE: Permissions = Permissions(1 << 2);

    const MASK: u8 = 0b111;

    /// Out-of-range bits are dropped, not rejected.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::MASK)
    }

    pub fn all() -> Self {
        Self::READ | Self::ALLOCATE | Self::WRITE
    }

    pub fn has(self, required: Permissions) -> bool {
        required.0 != 0 && self.0 & required.0 == required.0
    }

    pub fn is_allocate_write(self) -> bool {
        self.has(Self::ALLOCATE) || self.has(Self::WRITE)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

pub type StateKey = Vec<u8>;

/// Declared key set of a task or transaction: key bytes to permission bits.
#[derive(Clone, Default, Debug)]
pub struct Keys(AHashMap<StateKey, Permissions>);

impl Keys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adding the same key twice unions the permission bits.
    pub fn add(&mut self, key: impl Into<StateKey>, permissions: Permissions) {
        let entry = self.0.entry(key.into()).or_insert(Permissions::NONE);
        *entry = *entry | permissions;
    }

    pub fn get(&self, key: &[u8]) -> Option<Permissions> {
        self.0.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, Permissions)> {
        self.0.iter().map(|(k, p)| (k, *p))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn merge(&mut self, other: Keys) {
        for (k, p) in other.0 {
            self.add(k, p);
        }
    }
}

impl FromIterator<(StateKey, Permissions)> for Keys {
    fn from_iter<T: IntoIterator<Item = (StateKey, Permissions)>>(iter: T) -> Self {
        let mut keys = Keys::new();
        for (k, p) in iter {
            keys.add(k, p);
        }
        keys
    }
}

/// Append the max-chunks capacity suffix to a raw key.
pub fn encode_chunks(mut key: Vec<u8>, max_chunks: u16) -> Vec<u8> {
    key.extend_from_slice(&max_chunks.to_le_bytes());
    key
}

/// Capacity encoded in a key's trailing `u16`, if present.
pub fn max_chunks(key: &[u8]) -> Option<u16> {
    if key.len() < 2 {
        return None;
    }
    let tail: [u8; 2] = key[key.len() - 2..].try_into().unwrap();
    Some(u16::from_le_bytes(tail))
}

/// Chunk span of a value payload. Every non-empty payload costs at least one
/// chunk; the empty payload is one chunk as well (a key with an empty value
/// still occupies a slot).
pub fn num_chunks(value: &[u8]) -> u16 {
    let raw = value.len() / VALUE_CHUNK_SIZE + 1;
    raw.min(u16::MAX as usize) as u16
}

/// A value may only be written under a key whose capacity suffix admits it.
pub fn verify_value(key: &[u8], value: &[u8]) -> bool {
    match max_chunks(key) {
        Some(mc) => num_chunks(value) <= mc,
        None => false,
    }
}

/// Append the chunk-count suffix a host store expects on persisted values.
pub fn encode_stored(mut payload: Vec<u8>) -> Vec<u8> {
    let chunks = num_chunks(&payload);
    payload.extend_from_slice(&chunks.to_le_bytes());
    payload
}

/// Split a stored value into payload and declared chunk count. A missing or
/// inconsistent suffix is the disk-corruption class of [`StateError::InvalidKeyValue`].
pub fn decode_stored(stored: &[u8]) -> Result<(Vec<u8>, u16), StateError> {
    if stored.len() < 2 {
        return Err(StateError::InvalidKeyValue);
    }
    let (payload, tail) = stored.split_at(stored.len() - 2);
    let declared = u16::from_le_bytes(tail.try_into().unwrap());
    if declared != num_chunks(payload) {
        return Err(StateError::InvalidKeyValue);
    }
    Ok((payload.to_vec(), declared))
}

/// Read-only view over some state snapshot.
pub trait ImmutableState: Send + Sync {
    fn get_value(&self, key: &[u8]) -> Result<Vec<u8>, StateError>;
}

pub trait MutableState: ImmutableState {
    fn insert(&self, key: &[u8], value: Vec<u8>) -> Result<(), StateError>;
    fn remove(&self, key: &[u8]) -> Result<(), StateError>;
}

/// The host merkle key-value database. Persistence format is the host's
/// business; the core only relies on the stored-value chunk suffix.
pub trait StateDatabase: MutableState {
    fn get_values(&self, keys: &[&[u8]]) -> Vec<Result<Vec<u8>, StateError>>;

    /// Apply a batch of puts (`Some`) and deletes (`None`). Returns the
    /// number of applied operations.
    fn update(&self, batch: Vec<(StateKey, Option<Vec<u8>>)>) -> usize;

    /// Capture the current revision; the returned closure computes its root
    /// (potentially expensive, run off the acceptance path).
    fn prepare_commit(&self) -> Box<dyn FnOnce() -> Result<RootId, StateError> + Send>;
}

/// Canonical names of the chain metadata keys, provided by the host. All
/// returned keys must already carry their capacity suffix.
pub trait StateManager: Send + Sync {
    fn height_key(&self) -> StateKey;
    fn timestamp_key(&self) -> StateKey;
    fn fee_key(&self) -> StateKey;
    fn balance_key(&self, actor: &[u8]) -> StateKey;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_bits() {
        let rw = Permissions::READ | Permissions::WRITE;
        assert!(rw.has(Permissions::READ));
        assert!(rw.has(Permissions::WRITE));
        assert!(!rw.has(Permissions::ALLOCATE));
        assert!(rw.is_allocate_write());
        assert!(!Permissions::READ.is_allocate_write());
    }

    #[test]
    fn out_of_range_bits_grant_nothing() {
        let p = Permissions::from_bits(100);
        assert!(!p.has(Permissions::READ));
        assert!(!p.has(Permissions::WRITE));
        assert!(!p.has(Permissions::ALLOCATE));
    }

    #[test]
    fn keys_union_permissions() {
        let mut keys = Keys::new();
        keys.add(b"k".to_vec(), Permissions::READ);
        keys.add(b"k".to_vec(), Permissions::WRITE);
        assert_eq!(keys.len(), 1);
        assert!(keys.get(b"k").unwrap().has(Permissions::READ | Permissions::WRITE));
    }

    #[test]
    fn key_capacity_suffix() {
        let key = encode_chunks(b"key1".to_vec(), 3);
        assert_eq!(max_chunks(&key), Some(3));
        assert_eq!(max_chunks(b"k"), None);
        assert!(verify_value(&key, &[0u8; 100]));
        assert!(!verify_value(&key, &[0u8; 200]));
        assert!(!verify_value(b"x", b"v"));
    }

    #[test]
    fn value_chunk_span() {
        assert_eq!(num_chunks(b""), 1);
        assert_eq!(num_chunks(&[0u8; 63]), 1);
        assert_eq!(num_chunks(&[0u8; 64]), 2);
        assert_eq!(num_chunks(&[0u8; 129]), 3);
    }

    #[test]
    fn stored_value_suffix_round_trip() {
        let stored = encode_stored(b"payload".to_vec());
        let (payload, chunks) = decode_stored(&stored).unwrap();
        assert_eq!(payload, b"payload");
        assert_eq!(chunks, 1);
    }

    #[test]
    fn stored_value_suffix_faults() {
        assert_eq!(decode_stored(&[1]), Err(StateError::InvalidKeyValue));
        // Declared count disagrees with the payload span.
        let mut stored = b"payload".to_vec();
        stored.extend_from_slice(&9u16.to_le_bytes());
        assert_eq!(decode_stored(&stored), Err(StateError::InvalidKeyValue));
    }
}
