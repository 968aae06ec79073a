// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Block acceptance engine.
//!
//! A single-writer loop drains ordered accepted blocks from a backlog,
//! drives a processor over each block's chunk stream, produces filtered
//! chunks, layers the chain metadata keys on top of the block state, exports
//! the new merkle view, and kicks off background root generation. All
//! execute-time parallelism lives inside the processor; heights commit
//! strictly in increasing order.

use crate::fees::FeeManager;
use crate::host::{Mempool, Rules, ValidatorSet};
use crate::metrics::Metrics;
use crate::processor::{Processor, ProcessorContext, ProcessorError};
use crate::state::{
    decode_stored, Keys, Permissions, RootId, StateDatabase, StateError, StateManager,
};
use crate::types::{AcceptedBlock, Chunk, FilteredChunk, Height};
use ahash::AHashMap;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid block height {got}, expected {expected}")]
    InvalidBlockHeight { expected: Height, got: Height },
    #[error("block delivered {got} chunks, certificates name {expected}")]
    ChunkCountMismatch { expected: usize, got: usize },
    #[error("processor: {0}")]
    Processor(#[from] ProcessorError),
    #[error("state: {0}")]
    State(#[from] StateError),
}

/// Execution artifacts retained per accepted height.
pub struct BlockOutput {
    /// Root of the pre-block state.
    pub start_root: RootId,
    pub filtered_chunks: Vec<FilteredChunk>,
    /// Filled by the background root task once generation completes.
    pub root: Arc<OnceLock<RootId>>,
}

pub struct EngineContext {
    pub db: Arc<dyn StateDatabase>,
    pub rules: Arc<dyn Rules>,
    pub state_manager: Arc<dyn StateManager>,
    pub validators: Arc<dyn ValidatorSet>,
    pub mempool: Arc<dyn Mempool>,
    pub concurrency: usize,
    pub tx_capacity_hint: usize,
    pub metrics: Arc<Metrics>,
}

struct EngineJob {
    block: AcceptedBlock,
    chunks: Receiver<(usize, Chunk)>,
}

pub struct Engine {
    backlog: Mutex<Option<Sender<EngineJob>>>,
    outputs: Arc<RwLock<AHashMap<Height, Arc<BlockOutput>>>>,
    worker: Mutex<Option<thread::JoinHandle<Result<(), EngineError>>>>,
}

impl Engine {
    pub fn new(ctx: EngineContext, max_backlog: usize) -> Self {
        let (backlog_tx, backlog_rx) = bounded(max_backlog.max(1));
        let outputs: Arc<RwLock<AHashMap<Height, Arc<BlockOutput>>>> = Default::default();
        let loop_outputs = outputs.clone();
        let worker = thread::spawn(move || run(ctx, loop_outputs, backlog_rx));
        Self {
            backlog: Mutex::new(Some(backlog_tx)),
            outputs,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an accepted block. The returned sender is fed `(index,
    /// chunk)` pairs as the dissemination layer resolves the block's
    /// certificates; dropping it marks the stream complete. Execution starts
    /// before all chunks have arrived.
    pub fn execute(&self, block: AcceptedBlock) -> Sender<(usize, Chunk)> {
        let (chunks_tx, chunks_rx) = bounded(block.available_chunks.len().max(1));
        if let Some(backlog) = self.backlog.lock().as_ref() {
            let _ = backlog.send(EngineJob {
                block,
                chunks: chunks_rx,
            });
        }
        chunks_tx
    }

    pub fn output(&self, height: Height) -> Option<Arc<BlockOutput>> {
        self.outputs.read().get(&height).cloned()
    }

    /// Drop retained output for heights at or below `height`.
    pub fn clear(&self, height: Height) {
        self.outputs.write().retain(|h, _| *h > height);
    }

    /// Close the backlog and wait for the loop; surfaces the fatal error
    /// that stopped it, if any.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.backlog.lock().take();
        let worker = self.worker.lock().take().expect("shutdown called once");
        worker.join().expect("engine thread panicked")
    }
}

fn run(
    ctx: EngineContext,
    outputs: Arc<RwLock<AHashMap<Height, Arc<BlockOutput>>>>,
    backlog: Receiver<EngineJob>,
) -> Result<(), EngineError> {
    while let Ok(job) = backlog.recv() {
        if let Err(err) = accept_block(&ctx, &outputs, job) {
            tracing::error!(%err, "block acceptance failed, stopping engine");
            return Err(err);
        }
    }
    Ok(())
}

fn read_metadata(db: &dyn StateDatabase, key: &[u8]) -> Result<Vec<u8>, StateError> {
    let stored = db.get_value(key)?;
    Ok(decode_stored(&stored)?.0)
}

fn accept_block(
    ctx: &EngineContext,
    outputs: &RwLock<AHashMap<Height, Arc<BlockOutput>>>,
    job: EngineJob,
) -> Result<(), EngineError> {
    let block = job.block;
    let sm = &*ctx.state_manager;
    let height_key = sm.height_key();
    let timestamp_key = sm.timestamp_key();
    let fee_key = sm.fee_key();

    // Heights must be contiguous; anything else is fatal to acceptance.
    let parent_height_raw = read_metadata(&*ctx.db, &height_key)?;
    let parent_height = u64::from_le_bytes(
        parent_height_raw
            .as_slice()
            .try_into()
            .map_err(|_| StateError::InvalidKeyValue)?,
    );
    if block.height != parent_height + 1 {
        return Err(EngineError::InvalidBlockHeight {
            expected: parent_height + 1,
            got: block.height,
        });
    }
    let parent_timestamp_raw = read_metadata(&*ctx.db, &timestamp_key)?;
    let parent_timestamp = i64::from_le_bytes(
        parent_timestamp_raw
            .as_slice()
            .try_into()
            .map_err(|_| StateError::InvalidKeyValue)?,
    );

    // Advance the fee window across the block gap.
    let parent_fee_raw = read_metadata(&*ctx.db, &fee_key)?;
    let parent_fee = FeeManager::from_bytes(&parent_fee_raw);
    let fee_manager = parent_fee.compute_next(parent_timestamp, block.timestamp, &*ctx.rules);

    // Execute the chunk stream; arrival order is the network's business.
    let expected = block.available_chunks.len();
    let processor = Processor::new(
        ProcessorContext {
            timestamp: block.timestamp,
            parent: ctx.db.clone(),
            fee_manager,
            rules: ctx.rules.clone(),
            state_manager: ctx.state_manager.clone(),
            validators: ctx.validators.clone(),
            validator_height: block.height,
            concurrency: ctx.concurrency,
            tx_capacity_hint: ctx.tx_capacity_hint,
        },
        expected,
        ctx.metrics.clone(),
    );
    for (index, chunk) in job.chunks.iter() {
        processor.add(index, chunk);
    }
    let output = processor.wait()?;
    if output.chunks.len() != expected {
        return Err(EngineError::ChunkCountMismatch {
            expected,
            got: output.chunks.len(),
        });
    }
    if !output.restorable.is_empty() {
        let restored = ctx.mempool.restore(output.restorable);
        tracing::debug!(restored, "returned retriable transactions to mempool");
    }

    // Filtered chunks drop invalid transactions and record warp outcomes in
    // the original transaction order.
    let mut tx_count = 0usize;
    let filtered_chunks: Vec<FilteredChunk> = output
        .chunks
        .iter()
        .zip(&block.available_chunks)
        .map(|(processed, cert)| {
            let mut txs = Vec::with_capacity(processed.outcomes.len());
            let mut warp_results = 0u64;
            let mut warp_count = 0u32;
            for (tx, outcome) in processed.chunk.txs.iter().zip(&processed.outcomes) {
                if !outcome.valid {
                    continue;
                }
                txs.push(tx.clone());
                if tx.warp_message.is_some() {
                    if outcome.warp_verified {
                        warp_results |= 1 << warp_count;
                    }
                    warp_count += 1;
                }
            }
            tx_count += txs.len();
            FilteredChunk {
                chunk: cert.chunk,
                producer: processed.chunk.producer,
                txs,
                warp_results,
            }
        })
        .collect();

    // Chain metadata lands in a view scoped to exactly these keys.
    let mut scope = Keys::new();
    scope.add(height_key.clone(), Permissions::WRITE);
    scope.add(timestamp_key.clone(), Permissions::WRITE);
    scope.add(fee_key.clone(), Permissions::WRITE);
    let mut storage = AHashMap::new();
    storage.insert(height_key.clone(), parent_height_raw);
    storage.insert(timestamp_key.clone(), parent_timestamp_raw);
    storage.insert(fee_key.clone(), parent_fee_raw);
    let mut tsv = output.tstate.new_view(scope, storage);
    tsv.insert(&height_key, block.height.to_le_bytes().to_vec())?;
    tsv.insert(&timestamp_key, block.timestamp.to_le_bytes().to_vec())?;
    tsv.insert(&fee_key, output.fee_manager.bytes())?;
    tsv.commit();

    // Root of the parent revision, captured before the block's changes land.
    let start_root = (ctx.db.prepare_commit())()?;
    let changes = output.tstate.export_view(&*ctx.db);

    // Root generation is telemetry; it must not stall acceptance.
    let compute_root = ctx.db.prepare_commit();
    let root = Arc::new(OnceLock::new());
    {
        let root = root.clone();
        let height = block.height;
        thread::spawn(move || {
            let started = Instant::now();
            match compute_root() {
                Ok(generated) => {
                    tracing::info!(height, root = %generated, elapsed = ?started.elapsed(), "merkle root generated");
                    let _ = root.set(generated);
                }
                Err(err) => tracing::error!(height, %err, "merkle root generation failed"),
            }
        });
    }

    outputs.write().insert(
        block.height,
        Arc::new(BlockOutput {
            start_root,
            filtered_chunks,
            root,
        }),
    );
    ctx.metrics.blocks_accepted.inc();
    tracing::info!(
        height = block.height,
        chunks = expected,
        txs = tx_count,
        changes,
        "block executed"
    );
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::seed_genesis;
    use super::*;
    use crate::crypto::Digest;
    use crate::host::testing::{TestMempool, TestRules, TestValidators};
    use crate::state::testing::{MemState, TestStateManager};
    use crate::state::{encode_chunks, ImmutableState};
    use crate::transaction::testing::set_tx;
    use crate::transaction::{Transaction, WarpMessage};
    use crate::types::{
        quantize_slot, BlsSignature, ChunkCertificate, NodeId, SignerBits,
    };
    use std::sync::Arc;
    use std::time::Duration;

    const GENESIS_TS: i64 = 1_000;

    struct Harness {
        db: Arc<MemState>,
        mempool: Arc<TestMempool>,
        engine: Engine,
    }

    fn harness() -> Harness {
        let db = Arc::new(MemState::new());
        seed_genesis(&db, &TestStateManager, GENESIS_TS);
        let mempool = Arc::new(TestMempool::default());
        let engine = Engine::new(
            EngineContext {
                db: db.clone(),
                rules: Arc::new(TestRules::default()),
                state_manager: Arc::new(TestStateManager),
                validators: Arc::new(TestValidators),
                mempool: mempool.clone(),
                concurrency: 4,
                tx_capacity_hint: 1_024,
                metrics: Metrics::new_for_tests(),
            },
            8,
        );
        Harness {
            db,
            mempool,
            engine,
        }
    }

    fn seed_balance(db: &MemState, actor: &[u8]) {
        db.seed(
            TestStateManager.balance_key(actor),
            1_000_000u64.to_le_bytes().to_vec(),
        );
    }

    fn chunk_of(slot: i64, txs: Vec<Transaction>) -> Chunk {
        Chunk {
            slot: quantize_slot(slot),
            txs,
            producer: NodeId([7; 20]),
            signer: Default::default(),
            signature: Default::default(),
        }
    }

    fn cert_for(chunk: &Chunk) -> ChunkCertificate {
        ChunkCertificate {
            chunk: chunk.id(),
            slot: chunk.slot,
            signers: SignerBits::new(),
            signature: BlsSignature::default(),
        }
    }

    fn block_with(height: Height, timestamp: i64, chunks: &[Chunk]) -> AcceptedBlock {
        AcceptedBlock {
            height,
            timestamp,
            available_chunks: chunks.iter().map(cert_for).collect(),
        }
    }

    fn await_output(engine: &Engine, height: Height) -> Arc<BlockOutput> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(output) = engine.output(height) {
                return output;
            }
            assert!(Instant::now() < deadline, "no output for height {height}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn read_meta_u64(db: &MemState, key: &[u8]) -> u64 {
        let stored = db.get_value(key).unwrap();
        let (payload, _) = decode_stored(&stored).unwrap();
        u64::from_le_bytes(payload.try_into().unwrap())
    }

    #[test]
    fn accepts_block_and_advances_metadata() {
        let h = harness();
        seed_balance(&h.db, b"alice");
        seed_balance(&h.db, b"bob");

        let ts = GENESIS_TS + 500;
        let chunk = chunk_of(
            ts,
            vec![
                set_tx(b"alice", b"k1", b"v1", ts + 1_000),
                set_tx(b"bob", b"k2", b"v2", ts + 1_000),
            ],
        );
        let feed = h.engine.execute(block_with(1, ts, &[chunk.clone()]));
        feed.send((0, chunk)).unwrap();
        drop(feed);

        let output = await_output(&h.engine, 1);
        assert_eq!(output.filtered_chunks.len(), 1);
        assert_eq!(output.filtered_chunks[0].txs.len(), 2);

        let sm = TestStateManager;
        assert_eq!(read_meta_u64(&h.db, &sm.height_key()), 1);
        assert_eq!(read_meta_u64(&h.db, &sm.timestamp_key()) as i64, ts);

        // Executed writes are in the exported view.
        let stored = h.db.get_value(&encode_chunks(b"k1".to_vec(), 4)).unwrap();
        assert_eq!(decode_stored(&stored).unwrap().0, b"v1");

        // Background root generation lands and differs from the start root.
        let deadline = Instant::now() + Duration::from_secs(5);
        let root = loop {
            if let Some(root) = output.root.get() {
                break *root;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(10));
        };
        assert_ne!(root, output.start_root);

        h.engine.shutdown().unwrap();
    }

    #[test]
    fn sequential_blocks_build_on_each_other() {
        let h = harness();
        seed_balance(&h.db, b"alice");

        let ts1 = GENESIS_TS + 500;
        let c1 = chunk_of(ts1, vec![set_tx(b"alice", b"k", b"one", ts1 + 1_000)]);
        let feed = h.engine.execute(block_with(1, ts1, &[c1.clone()]));
        feed.send((0, c1)).unwrap();
        drop(feed);
        await_output(&h.engine, 1);

        let ts2 = ts1 + 500;
        let c2 = chunk_of(ts2, vec![set_tx(b"alice", b"k", b"two", ts2 + 1_000)]);
        let feed = h.engine.execute(block_with(2, ts2, &[c2.clone()]));
        feed.send((0, c2)).unwrap();
        drop(feed);
        await_output(&h.engine, 2);

        assert_eq!(read_meta_u64(&h.db, &TestStateManager.height_key()), 2);
        let stored = h.db.get_value(&encode_chunks(b"k".to_vec(), 4)).unwrap();
        assert_eq!(decode_stored(&stored).unwrap().0, b"two");

        h.engine.clear(1);
        assert!(h.engine.output(1).is_none());
        assert!(h.engine.output(2).is_some());
        h.engine.shutdown().unwrap();
    }

    #[test]
    fn filtered_chunks_drop_invalid_and_record_warp_bits() {
        let h = harness();
        seed_balance(&h.db, b"alice");
        seed_balance(&h.db, b"bob");
        // carol has no balance; her tx is dropped.

        let ts = GENESIS_TS + 500;
        let mut warp_ok = set_tx(b"alice", b"k1", b"v", ts + 1_000);
        warp_ok.warp_message = Some(WarpMessage {
            source_chain_id: Digest::hash_of(b"src"),
            payload: b"ok".to_vec(),
        });
        let mut warp_bad = set_tx(b"bob", b"k2", b"v", ts + 1_000);
        warp_bad.warp_message = Some(WarpMessage {
            source_chain_id: Digest::hash_of(b"src"),
            payload: b"nope".to_vec(),
        });
        let invalid = set_tx(b"carol", b"k3", b"v", ts + 1_000);

        let chunk = chunk_of(ts, vec![warp_ok, invalid, warp_bad]);
        let feed = h.engine.execute(block_with(1, ts, &[chunk.clone()]));
        feed.send((0, chunk)).unwrap();
        drop(feed);

        let output = await_output(&h.engine, 1);
        let filtered = &output.filtered_chunks[0];
        assert_eq!(filtered.txs.len(), 2);
        // First warp tx verified, second did not: bitset 0b01.
        assert_eq!(filtered.warp_results, 0b01);
        h.engine.shutdown().unwrap();
    }

    #[test]
    fn wrong_height_is_fatal() {
        let h = harness();
        let ts = GENESIS_TS + 500;
        let feed = h.engine.execute(block_with(5, ts, &[]));
        drop(feed);
        assert!(matches!(
            h.engine.shutdown(),
            Err(EngineError::InvalidBlockHeight { expected: 1, got: 5 })
        ));
    }

    #[test]
    fn retriable_txs_return_to_mempool() {
        let h = harness();
        seed_balance(&h.db, b"alice");

        let ts = GENESIS_TS + 500;
        let rules = TestRules::default();
        let tx = set_tx(b"alice", b"k", b"v", ts + rules.validity_window() + 10);
        let chunk = chunk_of(ts, vec![tx]);
        let feed = h.engine.execute(block_with(1, ts, &[chunk.clone()]));
        feed.send((0, chunk)).unwrap();
        drop(feed);

        let output = await_output(&h.engine, 1);
        assert!(output.filtered_chunks[0].txs.is_empty());
        assert_eq!(h.mempool.restored.lock().len(), 1);
        h.engine.shutdown().unwrap();
    }
}
