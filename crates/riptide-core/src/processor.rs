// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-block chunk execution.
//!
//! The processor consumes a block's chunks as the dissemination layer
//! delivers them, tolerating network reordering but executing in the order
//! the block numbered them. Each transaction becomes an executor task keyed
//! by its declared state keys: the task assembles its storage from a shared
//! prefetch cache (the only place parent state is read for the block), opens
//! a fresh view, runs PreExecute/Execute, charges the fee window, and commits
//! into the block's accumulated state.

use crate::executor::{Executor, ExecutorError};
use crate::fees::FeeManager;
use crate::host::{Rules, ValidatorSet};
use crate::metrics::Metrics;
use crate::state::{decode_stored, ImmutableState, StateError, StateManager};
use crate::transaction::Transaction;
use crate::tstate::TState;
use crate::types::{Chunk, TxResult};
use ahash::AHashMap;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("consumed units exceed block maximum")]
    InvalidUnitsConsumed,
    #[error("execution stopped")]
    Stopped,
    #[error("chunk {0} never arrived")]
    MissingChunk(usize),
    #[error("state: {0}")]
    State(#[from] StateError),
}

/// Outcome slot for one transaction, in chunk order.
#[derive(Clone, Debug)]
pub struct TxOutcome {
    pub valid: bool,
    pub warp_verified: bool,
    pub result: Option<TxResult>,
}

pub struct ProcessedChunk {
    pub chunk: Chunk,
    pub outcomes: Vec<TxOutcome>,
}

pub struct ProcessorOutput {
    /// Accumulated block state; the engine layers chain metadata on top and
    /// exports it.
    pub tstate: Arc<TState>,
    pub chunks: Vec<ProcessedChunk>,
    /// Transactions that failed retriably and belong back in the mempool.
    pub restorable: Vec<Transaction>,
    pub fee_manager: FeeManager,
}

/// Everything the processor borrows from the host for one block.
pub struct ProcessorContext {
    pub timestamp: i64,
    pub parent: Arc<dyn ImmutableState>,
    pub fee_manager: FeeManager,
    pub rules: Arc<dyn Rules>,
    pub state_manager: Arc<dyn StateManager>,
    pub validators: Arc<dyn ValidatorSet>,
    /// Height pinning the validator set for warp verification.
    pub validator_height: u64,
    pub concurrency: usize,
    pub tx_capacity_hint: usize,
}

struct FetchData {
    value: Option<Vec<u8>>,
    chunks: u16,
}

struct Shared {
    ctx: ProcessorContext,
    /// Block-lifetime prefetch cache; values are stored decoded.
    cache: RwLock<AHashMap<Vec<u8>, FetchData>>,
    fees: Mutex<FeeManager>,
    tstate: Arc<TState>,
    restorable: Mutex<Vec<Transaction>>,
    metrics: Arc<Metrics>,
}

pub struct Processor {
    input: Mutex<Option<Sender<(usize, Chunk)>>>,
    worker: Mutex<Option<thread::JoinHandle<Result<ProcessorOutput, ProcessorError>>>>,
}

impl Processor {
    pub fn new(ctx: ProcessorContext, expected_chunks: usize, metrics: Arc<Metrics>) -> Self {
        let (input_tx, input_rx) = bounded(expected_chunks.max(1));
        let shared = Shared {
            fees: Mutex::new(ctx.fee_manager.clone()),
            tstate: Arc::new(TState::new(ctx.tx_capacity_hint * 2)),
            cache: RwLock::new(AHashMap::new()),
            restorable: Mutex::new(Vec::new()),
            metrics,
            ctx,
        };
        let worker = thread::spawn(move || run(shared, input_rx));
        Self {
            input: Mutex::new(Some(input_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Feed a numbered chunk; chunks may arrive in any order.
    pub fn add(&self, index: usize, chunk: Chunk) {
        if let Some(input) = self.input.lock().as_ref() {
            let _ = input.send((index, chunk));
        }
    }

    /// Signal end-of-block; no chunks may be added afterwards.
    pub fn done(&self) {
        self.input.lock().take();
    }

    /// Blocks until every chunk fed before [`done`](Self::done) has
    /// executed.
    pub fn wait(self) -> Result<ProcessorOutput, ProcessorError> {
        self.done();
        let worker = self
            .worker
            .lock()
            .take()
            .expect("wait called once");
        worker.join().expect("processor thread panicked")
    }
}

fn run(
    shared: Shared,
    input: Receiver<(usize, Chunk)>,
) -> Result<ProcessorOutput, ProcessorError> {
    let shared = Arc::new(shared);
    let executor: Executor<ProcessorError> = Executor::new(
        shared.ctx.tx_capacity_hint,
        shared.ctx.concurrency,
        shared.metrics.clone(),
    );

    let mut pending: BTreeMap<usize, Chunk> = BTreeMap::new();
    let mut next = 0usize;
    let mut in_flight: Vec<(Chunk, Arc<Mutex<Vec<Option<TxOutcome>>>>)> = Vec::new();
    while let Ok((index, chunk)) = input.recv() {
        pending.insert(index, chunk);
        while let Some(chunk) = pending.remove(&next) {
            let outcomes = process_chunk(&shared, &executor, &chunk);
            in_flight.push((chunk, outcomes));
            next += 1;
        }
    }

    match executor.wait() {
        Ok(()) => {}
        Err(ExecutorError::Task(err)) => return Err(err),
        Err(ExecutorError::Stopped) => return Err(ProcessorError::Stopped),
    }
    if let Some((&index, _)) = pending.iter().next() {
        return Err(ProcessorError::MissingChunk(index.min(next)));
    }

    let chunks = in_flight
        .into_iter()
        .map(|(chunk, outcomes)| ProcessedChunk {
            chunk,
            outcomes: outcomes
                .lock()
                .iter()
                .cloned()
                .map(|o| o.expect("all tasks executed"))
                .collect(),
        })
        .collect();
    let shared = Arc::try_unwrap(shared).unwrap_or_else(|_| panic!("tasks drained"));
    Ok(ProcessorOutput {
        tstate: shared.tstate,
        chunks,
        restorable: shared.restorable.into_inner(),
        fee_manager: shared.fees.into_inner(),
    })
}

/// Enqueue one executor task per transaction. Warp verification runs on the
/// rayon pool and reports through a one-shot channel the task waits on.
fn process_chunk(
    shared: &Arc<Shared>,
    executor: &Executor<ProcessorError>,
    chunk: &Chunk,
) -> Arc<Mutex<Vec<Option<TxOutcome>>>> {
    let outcomes = Arc::new(Mutex::new(vec![None; chunk.txs.len()]));
    let stop = executor.stop_signal();
    for (index, tx) in chunk.txs.iter().enumerate() {
        let warp_rx = tx.warp_message.as_ref().map(|warp| {
            let (verified_tx, verified_rx) = bounded(1);
            if shared.ctx.rules.is_warp_chain_enabled(&warp.source_chain_id) {
                let validators = shared.ctx.validators.clone();
                let message = warp.clone();
                let height = shared.ctx.validator_height;
                rayon::spawn(move || {
                    let _ = verified_tx.send(validators.verify_warp(&message, height));
                });
            } else {
                let _ = verified_tx.send(false);
            }
            verified_rx
        });

        let shared = shared.clone();
        let stop = stop.clone();
        let outcomes = outcomes.clone();
        let tx = tx.clone();
        let keys = tx.state_keys(&*shared.ctx.state_manager);
        executor.run(keys.clone(), move || {
            let outcome = execute_tx(&shared, &stop, keys, tx, warp_rx)?;
            outcomes.lock()[index] = Some(outcome);
            Ok(())
        });
    }
    outcomes
}

fn execute_tx(
    shared: &Shared,
    stop: &Receiver<()>,
    keys: crate::state::Keys,
    tx: Transaction,
    warp_rx: Option<Receiver<bool>>,
) -> Result<TxOutcome, ProcessorError> {
    let ctx = &shared.ctx;
    let invalid = |warp_verified| TxOutcome {
        valid: false,
        warp_verified,
        result: None,
    };

    // Acquire keys from the shared cache, falling back to the parent
    // snapshot exactly once per key for the whole block.
    let mut reads: AHashMap<Vec<u8>, u16> = AHashMap::with_capacity(keys.len());
    let mut storage: AHashMap<Vec<u8>, Vec<u8>> = AHashMap::with_capacity(keys.len());
    let mut to_lookup: Vec<Vec<u8>> = Vec::new();
    {
        let cache = shared.cache.read();
        for (key, _) in keys.iter() {
            match cache.get(key) {
                Some(fetched) => {
                    reads.insert(key.clone(), fetched.chunks);
                    if let Some(value) = &fetched.value {
                        storage.insert(key.clone(), value.clone());
                    }
                }
                None => to_lookup.push(key.clone()),
            }
        }
    }
    let mut to_cache: AHashMap<Vec<u8>, FetchData> = AHashMap::with_capacity(to_lookup.len());
    for key in to_lookup {
        match ctx.parent.get_value(&key) {
            Ok(stored) => match decode_stored(&stored) {
                Ok((payload, chunks)) => {
                    reads.insert(key.clone(), chunks);
                    storage.insert(key.clone(), payload.clone());
                    to_cache.insert(
                        key,
                        FetchData {
                            value: Some(payload),
                            chunks,
                        },
                    );
                }
                Err(_) => {
                    // Disk-corruption class: fault the transaction, not the
                    // block, and do not poison the cache.
                    tracing::warn!(tx = ?tx.id(), "stored value failed chunk decoding");
                    shared.metrics.txs_invalid.inc();
                    return Ok(invalid(false));
                }
            },
            Err(StateError::NotFound) => {
                reads.insert(key.clone(), 0);
                to_cache.insert(
                    key,
                    FetchData {
                        value: None,
                        chunks: 0,
                    },
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    // The scope is bound per transaction; nothing outside it is visible.
    let mut tsv = shared.tstate.new_view(keys, storage);
    let fee_snapshot = shared.fees.lock().clone();
    if let Err(err) = tx.pre_execute(
        &fee_snapshot,
        &*ctx.state_manager,
        &*ctx.rules,
        &tsv,
        ctx.timestamp,
    ) {
        tracing::debug!(tx = ?tx.id(), %err, "transaction dropped in pre-execute");
        if err.is_retriable() {
            shared.restorable.lock().push(tx);
        }
        shared.metrics.txs_invalid.inc();
        commit_cache(shared, to_cache);
        return Ok(invalid(false));
    }

    let mut warp_verified = false;
    if let Some(verified_rx) = warp_rx {
        select! {
            recv(verified_rx) -> verified => warp_verified = verified.unwrap_or(false),
            recv(stop) -> _ => return Err(ProcessorError::Stopped),
        }
    }

    let result = tx.execute(
        &fee_snapshot,
        &reads,
        &*ctx.state_manager,
        &*ctx.rules,
        &mut tsv,
        ctx.timestamp,
        warp_verified,
    )?;

    // Over-consumption is non-deterministic in the face of parallelism but
    // always fatal to the block.
    if !shared
        .fees
        .lock()
        .consume(result.units, ctx.rules.max_block_units())
    {
        return Err(ProcessorError::InvalidUnitsConsumed);
    }

    tsv.commit();
    commit_cache(shared, to_cache);
    shared.metrics.txs_executed.inc();
    Ok(TxOutcome {
        valid: true,
        warp_verified,
        result: Some(result),
    })
}

fn commit_cache(shared: &Shared, to_cache: AHashMap<Vec<u8>, FetchData>) {
    if to_cache.is_empty() {
        return;
    }
    shared.cache.write().extend(to_cache);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Digest;
    use crate::host::testing::{TestRules, TestValidators};
    use crate::state::testing::{MemState, TestStateManager};
    use crate::state::encode_chunks;
    use crate::transaction::testing::set_tx;
    use crate::transaction::WarpMessage;
    use crate::types::{quantize_slot, NodeId};

    const TS: i64 = 10_000;

    fn chunk_of(txs: Vec<Transaction>) -> Chunk {
        Chunk {
            slot: quantize_slot(TS),
            txs,
            producer: NodeId::default(),
            signer: Default::default(),
            signature: Default::default(),
        }
    }

    fn processor_on(state: Arc<MemState>, rules: TestRules, expected: usize) -> Processor {
        let fee_manager = FeeManager::from_bytes(&[]).compute_next(0, TS, &rules);
        Processor::new(
            ProcessorContext {
                timestamp: TS,
                parent: state,
                fee_manager,
                rules: Arc::new(rules),
                state_manager: Arc::new(TestStateManager),
                validators: Arc::new(TestValidators),
                validator_height: 1,
                concurrency: 4,
                tx_capacity_hint: 1_024,
            },
            expected,
            Metrics::new_for_tests(),
        )
    }

    fn seed_balance(state: &MemState, actor: &[u8]) {
        state.seed(
            TestStateManager.balance_key(actor),
            1_000_000u64.to_le_bytes().to_vec(),
        );
    }

    #[test]
    fn executes_independent_txs() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");
        seed_balance(&state, b"bob");

        let p = processor_on(state, TestRules::default(), 1);
        p.add(
            0,
            chunk_of(vec![
                set_tx(b"alice", b"k1", b"v1", TS + 1_000),
                set_tx(b"bob", b"k2", b"v2", TS + 1_000),
            ]),
        );
        let out = p.wait().unwrap();

        assert_eq!(out.chunks.len(), 1);
        let outcomes = &out.chunks[0].outcomes;
        assert!(outcomes.iter().all(|o| o.valid));
        assert!(out.restorable.is_empty());
        assert!(out.fee_manager.last_consumed() > 0);

        // Both writes landed in the block state.
        let scope: crate::state::Keys = [
            (encode_chunks(b"k1".to_vec(), 4), crate::state::Permissions::all()),
            (encode_chunks(b"k2".to_vec(), 4), crate::state::Permissions::all()),
        ]
        .into_iter()
        .collect();
        let tsv = out.tstate.new_view(scope, AHashMap::new());
        assert_eq!(tsv.get_value(&encode_chunks(b"k1".to_vec(), 4)).unwrap(), b"v1");
        assert_eq!(tsv.get_value(&encode_chunks(b"k2".to_vec(), 4)).unwrap(), b"v2");
    }

    #[test]
    fn conflicting_txs_serialize_last_write_wins() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");
        seed_balance(&state, b"bob");

        let p = processor_on(state, TestRules::default(), 1);
        p.add(
            0,
            chunk_of(vec![
                set_tx(b"alice", b"shared", b"first", TS + 1_000),
                set_tx(b"bob", b"shared", b"second", TS + 1_000),
            ]),
        );
        let out = p.wait().unwrap();
        assert!(out.chunks[0].outcomes.iter().all(|o| o.valid));

        let key = encode_chunks(b"shared".to_vec(), 4);
        let scope: crate::state::Keys =
            [(key.clone(), crate::state::Permissions::all())].into_iter().collect();
        let tsv = out.tstate.new_view(scope, AHashMap::new());
        assert_eq!(tsv.get_value(&key).unwrap(), b"second");
    }

    #[test]
    fn chunks_commit_in_numbered_order() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");
        seed_balance(&state, b"bob");

        let p = processor_on(state, TestRules::default(), 2);
        // Network reordering: chunk 1 lands before chunk 0.
        p.add(1, chunk_of(vec![set_tx(b"bob", b"k", b"from-1", TS + 1_000)]));
        p.add(0, chunk_of(vec![set_tx(b"alice", b"k", b"from-0", TS + 1_000)]));
        let out = p.wait().unwrap();

        assert_eq!(out.chunks.len(), 2);
        let key = encode_chunks(b"k".to_vec(), 4);
        let scope: crate::state::Keys =
            [(key.clone(), crate::state::Permissions::all())].into_iter().collect();
        let tsv = out.tstate.new_view(scope, AHashMap::new());
        // Chunk 1 executes after chunk 0 regardless of arrival order.
        assert_eq!(tsv.get_value(&key).unwrap(), b"from-1");
    }

    #[test]
    fn invalid_tx_is_dropped_not_fatal() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");
        // bob has no balance.

        let p = processor_on(state, TestRules::default(), 1);
        p.add(
            0,
            chunk_of(vec![
                set_tx(b"bob", b"k1", b"v", TS + 1_000),
                set_tx(b"alice", b"k2", b"v", TS + 1_000),
            ]),
        );
        let out = p.wait().unwrap();
        let outcomes = &out.chunks[0].outcomes;
        assert!(!outcomes[0].valid);
        assert!(outcomes[1].valid);
        // InvalidBalance is not retriable.
        assert!(out.restorable.is_empty());
    }

    #[test]
    fn retriable_tx_is_restored() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");

        let rules = TestRules::default();
        let far_future = TS + rules.validity_window() + 1;
        let p = processor_on(state, rules, 1);
        let tx = set_tx(b"alice", b"k", b"v", far_future);
        let id = tx.id();
        p.add(0, chunk_of(vec![tx]));
        let out = p.wait().unwrap();
        assert!(!out.chunks[0].outcomes[0].valid);
        assert_eq!(out.restorable.len(), 1);
        assert_eq!(out.restorable[0].id(), id);
    }

    #[test]
    fn warp_result_is_recorded() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");
        seed_balance(&state, b"bob");

        let mut good = set_tx(b"alice", b"k1", b"v", TS + 1_000);
        good.warp_message = Some(WarpMessage {
            source_chain_id: Digest::hash_of(b"src"),
            payload: b"ok-payload".to_vec(),
        });
        let mut bad = set_tx(b"bob", b"k2", b"v", TS + 1_000);
        bad.warp_message = Some(WarpMessage {
            source_chain_id: Digest::hash_of(b"src"),
            payload: b"bogus".to_vec(),
        });

        let p = processor_on(state, TestRules::default(), 1);
        p.add(0, chunk_of(vec![good, bad]));
        let out = p.wait().unwrap();
        let outcomes = &out.chunks[0].outcomes;
        assert!(outcomes[0].valid && outcomes[0].warp_verified);
        // Failed warp verification still bills and executes the tx.
        assert!(outcomes[1].valid && !outcomes[1].warp_verified);
    }

    #[test]
    fn unit_overflow_is_fatal() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");

        let p = processor_on(state, TestRules::default().with_max_units(5), 1);
        p.add(0, chunk_of(vec![set_tx(b"alice", b"k", b"v", TS + 1_000)]));
        assert!(matches!(
            p.wait(),
            Err(ProcessorError::InvalidUnitsConsumed)
        ));
    }

    #[test]
    fn corrupt_stored_value_faults_only_the_tx() {
        let state = Arc::new(MemState::new());
        seed_balance(&state, b"alice");
        seed_balance(&state, b"bob");
        // bob's target key holds a value with a bad chunk suffix.
        let mut corrupt = b"junk".to_vec();
        corrupt.extend_from_slice(&9u16.to_le_bytes());
        state.seed_raw(encode_chunks(b"k1".to_vec(), 4), corrupt);

        let p = processor_on(state, TestRules::default(), 1);
        p.add(
            0,
            chunk_of(vec![
                set_tx(b"bob", b"k1", b"v", TS + 1_000),
                set_tx(b"alice", b"k2", b"v", TS + 1_000),
            ]),
        );
        let out = p.wait().unwrap();
        let outcomes = &out.chunks[0].outcomes;
        assert!(!outcomes[0].valid);
        assert!(outcomes[1].valid);
    }

    #[test]
    fn missing_numbered_chunk_is_an_error() {
        let state = Arc::new(MemState::new());
        let p = processor_on(state, TestRules::default(), 2);
        p.add(1, chunk_of(vec![set_tx(b"alice", b"k", b"v", TS + 1_000)]));
        assert!(matches!(p.wait(), Err(ProcessorError::MissingChunk(0))));
    }
}
