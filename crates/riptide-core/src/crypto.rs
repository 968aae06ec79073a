// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Content digests and the BLS seam.
//!
//! Chunk ids are 32-byte blake2b hashes of canonical marshals. BLS signing
//! and verification are host collaborators: the core only carries fixed-width
//! key/signature bytes and calls through [`ChunkSigner`] / [`ChunkVerifier`].

use digest::Digest as _;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DIGEST_SIZE: usize = 32;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const BLS_SIGNATURE_SIZE: usize = 96;

type ContentHasher = blake2::Blake2b<digest::consts::U32>;

/// 32-byte content hash. Used for chunk ids, transaction ids, state roots
/// and chain ids.
#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Default, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn hash_of(bytes: &[u8]) -> Self {
        let mut hasher = ContentHasher::default();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", hex_prefix(&self.0))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", hex_prefix(&self.0))
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct BlsPublicKey(pub [u8; BLS_PUBLIC_KEY_SIZE]);

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct BlsSignature(pub [u8; BLS_SIGNATURE_SIZE]);

impl Default for BlsPublicKey {
    fn default() -> Self {
        Self([0; BLS_PUBLIC_KEY_SIZE])
    }
}

impl Default for BlsSignature {
    fn default() -> Self {
        Self([0; BLS_SIGNATURE_SIZE])
    }
}

impl AsRef<[u8]> for BlsPublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for BlsSignature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pk:{}", hex_prefix(&self.0))
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", hex_prefix(&self.0))
    }
}

/// Payload actually signed for a digest: a prefix commits the network and
/// chain so signatures cannot be replayed across deployments.
pub fn signing_payload(network_id: u32, chain_id: &Digest, digest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + DIGEST_SIZE + digest.len());
    out.extend_from_slice(&network_id.to_le_bytes());
    out.extend_from_slice(chain_id.as_ref());
    out.extend_from_slice(digest);
    out
}

/// Host-side signing key for chunks this node produces.
pub trait ChunkSigner: Send + Sync {
    fn public_key(&self) -> BlsPublicKey;
    fn sign(&self, payload: &[u8]) -> BlsSignature;
}

/// Host-side BLS verification.
pub trait ChunkVerifier: Send + Sync {
    fn verify(&self, public_key: &BlsPublicKey, signature: &BlsSignature, payload: &[u8]) -> bool;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_and_content_addressed() {
        let a = Digest::hash_of(b"payload");
        let b = Digest::hash_of(b"payload");
        let c = Digest::hash_of(b"payloae");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn signing_payload_commits_network_and_chain() {
        let chain = Digest::hash_of(b"chain");
        let a = signing_payload(1, &chain, b"digest");
        let b = signing_payload(2, &chain, b"digest");
        let c = signing_payload(1, &Digest::hash_of(b"other"), b"digest");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn mock_bls_round_trip() {
        use testing::MockBls;
        let signer = MockBls::new(7);
        let sig = signer.sign(b"msg");
        assert!(signer.verify(&signer.public_key(), &sig, b"msg"));
        assert!(!signer.verify(&signer.public_key(), &sig, b"other"));
    }
}
