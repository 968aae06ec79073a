// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Wire entities.
//!
//! Chunks are signed batches of transactions produced by validators and
//! identified by the hash of their canonical marshal. Everything here
//! round-trips through the packed codec; decoders fault on trailing bytes.

use crate::codec::{CodecError, Reader, Writer, NETWORK_SIZE_LIMIT};
use crate::crypto::{
    signing_payload, ChunkSigner, ChunkVerifier, Digest, BLS_PUBLIC_KEY_SIZE, BLS_SIGNATURE_SIZE,
};
use crate::transaction::{Parser, Transaction};
use std::fmt;

pub type Height = u64;
pub type ChunkId = Digest;

pub use crate::crypto::{BlsPublicKey, BlsSignature};

/// Chunk slots are quantized to 100 ms.
pub const SLOT_DURATION_MS: i64 = 100;

pub const NODE_ID_SIZE: usize = 20;

pub fn quantize_slot(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(SLOT_DURATION_MS)
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Default, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_SIZE]);

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node:{}",
            self.0[..4]
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        )
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Signed batch of transactions. The id is the hash of the full marshal;
/// the signature covers the digest (everything but the signature) under a
/// prefix committing the network and chain.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub slot: i64,
    pub txs: Vec<Transaction>,
    pub producer: NodeId,
    pub signer: BlsPublicKey,
    pub signature: BlsSignature,
}

impl Chunk {
    pub fn new_signed(
        slot: i64,
        txs: Vec<Transaction>,
        producer: NodeId,
        signer: &dyn ChunkSigner,
        network_id: u32,
        chain_id: &Digest,
    ) -> Self {
        let mut chunk = Self {
            slot,
            txs,
            producer,
            signer: signer.public_key(),
            signature: BlsSignature::default(),
        };
        let payload = signing_payload(network_id, chain_id, &chunk.digest());
        chunk.signature = signer.sign(&payload);
        chunk
    }

    /// Marshal without the signature; this is what producers sign.
    pub fn digest(&self) -> Vec<u8> {
        let mut w = Writer::new(self.size_hint());
        self.pack_unsigned(&mut w);
        w.into_bytes()
    }

    fn pack_unsigned(&self, w: &mut Writer) {
        w.pack_i64(self.slot);
        w.pack_i32(self.txs.len() as i32);
        for tx in &self.txs {
            tx.marshal(w);
        }
        w.pack_fixed(self.producer.as_ref());
        w.pack_fixed(self.signer.as_ref());
    }

    fn size_hint(&self) -> usize {
        8 + 4 + 128 * self.txs.len() + NODE_ID_SIZE + BLS_PUBLIC_KEY_SIZE + BLS_SIGNATURE_SIZE
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut w = Writer::new(self.size_hint());
        self.pack_unsigned(&mut w);
        w.pack_fixed(self.signature.as_ref());
        w.into_bytes()
    }

    pub fn id(&self) -> ChunkId {
        Digest::hash_of(&self.marshal())
    }

    pub fn verify_signature(
        &self,
        network_id: u32,
        chain_id: &Digest,
        verifier: &dyn ChunkVerifier,
    ) -> bool {
        let payload = signing_payload(network_id, chain_id, &self.digest());
        verifier.verify(&self.signer, &self.signature, &payload)
    }

    pub fn unmarshal(raw: &[u8], parser: &Parser) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let slot = r.unpack_i64()?;
        let count = r.unpack_i32()?;
        if count <= 0 {
            // Chunks are never empty.
            return Err(CodecError::EmptyField("txs"));
        }
        // Decode incrementally instead of preallocating a claimed count.
        let mut txs = Vec::new();
        for _ in 0..count {
            txs.push(Transaction::unmarshal(&mut r, parser)?);
        }
        let producer = NodeId(r.unpack_fixed()?);
        let signer = BlsPublicKey(r.unpack_fixed()?);
        let signature = BlsSignature(r.unpack_fixed()?);
        r.done()?;
        Ok(Self {
            slot,
            txs,
            producer,
            signer,
            signature,
        })
    }
}

/// One validator's vote on a chunk. The slot lets builders that have not
/// yet sequenced the chunk check it is not expired.
#[derive(Clone, Debug)]
pub struct ChunkSignature {
    pub chunk: ChunkId,
    pub slot: i64,
    pub signer: BlsPublicKey,
    pub signature: BlsSignature,
}

impl ChunkSignature {
    pub fn digest(&self) -> Vec<u8> {
        let mut w = Writer::new(40);
        w.pack_fixed(self.chunk.as_ref());
        w.pack_i64(self.slot);
        w.into_bytes()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut w = Writer::new(40 + BLS_PUBLIC_KEY_SIZE + BLS_SIGNATURE_SIZE);
        w.pack_fixed(self.chunk.as_ref());
        w.pack_i64(self.slot);
        w.pack_fixed(self.signer.as_ref());
        w.pack_fixed(self.signature.as_ref());
        w.into_bytes()
    }

    pub fn verify_signature(
        &self,
        network_id: u32,
        chain_id: &Digest,
        verifier: &dyn ChunkVerifier,
    ) -> bool {
        let payload = signing_payload(network_id, chain_id, &self.digest());
        verifier.verify(&self.signer, &self.signature, &payload)
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let out = Self {
            chunk: Digest(r.unpack_fixed()?),
            slot: r.unpack_i64()?,
            signer: BlsPublicKey(r.unpack_fixed()?),
            signature: BlsSignature(r.unpack_fixed()?),
        };
        r.done()?;
        Ok(out)
    }
}

pub const MAX_SIGNER_BITSET_BYTES: usize = 32;

/// Minimal-length bitset of committee indices. The wire form never carries
/// trailing zero bytes; a padded encoding fails to parse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignerBits(Vec<u8>);

impl SignerBits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, index: usize) {
        let byte = index / 8;
        if byte >= self.0.len() {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (index % 8);
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .is_some_and(|b| b & (1 << (index % 8)) != 0)
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CodecError> {
        if bytes.last() == Some(&0) {
            // Round-tripped length must equal the minimal representation.
            return Err(CodecError::Invalid("signers not minimal"));
        }
        Ok(Self(bytes))
    }
}

/// Aggregate committee signature over a chunk id and slot. Which validator
/// set verifies it is pinned by the host (sets change across heights).
#[derive(Clone, Debug)]
pub struct ChunkCertificate {
    pub chunk: ChunkId,
    pub slot: i64,
    pub signers: SignerBits,
    pub signature: BlsSignature,
}

impl ChunkCertificate {
    pub fn id(&self) -> ChunkId {
        self.chunk
    }

    pub fn expiry(&self) -> i64 {
        self.slot
    }

    pub fn digest(&self) -> Vec<u8> {
        let mut w = Writer::new(40);
        w.pack_fixed(self.chunk.as_ref());
        w.pack_i64(self.slot);
        w.into_bytes()
    }

    pub fn marshal(&self) -> Vec<u8> {
        let mut w = Writer::new(48 + self.signers.bytes().len() + BLS_SIGNATURE_SIZE);
        w.pack_fixed(self.chunk.as_ref());
        w.pack_i64(self.slot);
        w.pack_bytes(self.signers.bytes());
        w.pack_fixed(self.signature.as_ref());
        w.into_bytes()
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let chunk = Digest(r.unpack_fixed()?);
        let slot = r.unpack_i64()?;
        let signers = SignerBits::from_bytes(r.unpack_bytes(MAX_SIGNER_BITSET_BYTES)?)?;
        let signature = BlsSignature(r.unpack_fixed()?);
        r.done()?;
        Ok(Self {
            chunk,
            slot,
            signers,
            signature,
        })
    }
}

/// Chunk after execution: invalid transactions dropped, with the warp
/// verification outcomes as a bitset in original transaction order.
#[derive(Clone, Debug)]
pub struct FilteredChunk {
    pub chunk: ChunkId,
    pub producer: NodeId,
    pub txs: Vec<Transaction>,
    pub warp_results: u64,
}

impl FilteredChunk {
    pub fn marshal(&self) -> Vec<u8> {
        let mut w = Writer::new(64 + 128 * self.txs.len());
        w.pack_fixed(self.chunk.as_ref());
        w.pack_fixed(self.producer.as_ref());
        w.pack_i32(self.txs.len() as i32);
        for tx in &self.txs {
            tx.marshal(&mut w);
        }
        w.pack_u64(self.warp_results);
        w.into_bytes()
    }

    pub fn id(&self) -> ChunkId {
        Digest::hash_of(&self.marshal())
    }

    pub fn unmarshal(raw: &[u8], parser: &Parser) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let chunk = Digest(r.unpack_fixed()?);
        let producer = NodeId(r.unpack_fixed()?);
        let count = r.unpack_i32()?;
        if count < 0 {
            return Err(CodecError::EmptyField("txs"));
        }
        let mut txs = Vec::new();
        for _ in 0..count {
            txs.push(Transaction::unmarshal(&mut r, parser)?);
        }
        let warp_results = r.unpack_u64()?;
        r.done()?;
        Ok(Self {
            chunk,
            producer,
            txs,
            warp_results,
        })
    }
}

/// Execution outcome of one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxResult {
    pub success: bool,
    pub units: u64,
    pub output: Option<Vec<u8>>,
    pub warp_message: Option<Vec<u8>>,
}

impl TxResult {
    pub fn marshal(&self, w: &mut Writer) {
        w.pack_bool(self.success);
        w.pack_varuint(self.units);
        w.pack_bytes(self.output.as_deref().unwrap_or_default());
        w.pack_bytes(self.warp_message.as_deref().unwrap_or_default());
    }

    pub fn unmarshal(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let success = r.unpack_bool()?;
        let units = r.unpack_varuint()?;
        // Empty optional bytes normalize to absent.
        let output = Some(r.unpack_bytes(NETWORK_SIZE_LIMIT)?).filter(|v| !v.is_empty());
        let warp_message = Some(r.unpack_bytes(NETWORK_SIZE_LIMIT)?).filter(|v| !v.is_empty());
        Ok(Self {
            success,
            units,
            output,
            warp_message,
        })
    }
}

pub fn marshal_results(results: &[TxResult]) -> Vec<u8> {
    let mut w = Writer::new(16 * results.len() + 4);
    w.pack_i32(results.len() as i32);
    for result in results {
        result.marshal(&mut w);
    }
    w.into_bytes()
}

pub fn unmarshal_results(raw: &[u8]) -> Result<Vec<TxResult>, CodecError> {
    let mut r = Reader::new(raw);
    let count = r.unpack_i32()?;
    if count < 0 {
        return Err(CodecError::EmptyField("results"));
    }
    let mut results = Vec::new();
    for _ in 0..count {
        results.push(TxResult::unmarshal(&mut r)?);
    }
    r.done()?;
    Ok(results)
}

/// Retained-height window a peer advertises via gossip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeChunks {
    pub min: Height,
    pub max: Height,
}

impl NodeChunks {
    pub fn marshal(&self) -> Vec<u8> {
        let mut w = Writer::new(16);
        w.pack_u64(self.min);
        w.pack_u64(self.max);
        w.into_bytes()
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(raw);
        let out = Self {
            min: r.unpack_u64()?,
            max: r.unpack_u64()?,
        };
        r.done()?;
        Ok(out)
    }

    pub fn covers(&self, height: Height) -> bool {
        height >= self.min && height <= self.max
    }
}

/// Block handed over by the host consensus engine once ordering is final.
/// Chunk payloads are not embedded; the dissemination layer resolves the
/// certificates on demand.
#[derive(Clone, Debug)]
pub struct AcceptedBlock {
    pub height: Height,
    pub timestamp: i64,
    pub available_chunks: Vec<ChunkCertificate>,
}
