// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Chunk building.
//!
//! Streams transactions out of the mempool against the current state view,
//! admits what fits under the fee ceiling, and signs the result as a chunk.
//! Retriable rejects go back to the mempool when streaming finishes; once
//! the consumed units reach the window target the build stops rather than
//! hunting the pool for a perfect fit.

use crate::crypto::ChunkSigner;
use crate::fees::FeeManager;
use crate::host::{Mempool, Rules, ValidatorSet};
use crate::metrics::Metrics;
use crate::state::{decode_stored, ImmutableState, StateError, StateManager};
use crate::transaction::Transaction;
use crate::tstate::TState;
use crate::types::{quantize_slot, Chunk, NodeId, TxResult};
use ahash::AHashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("timestamp too early: minimum block gap not met")]
    TimestampTooEarly,
    #[error("no transactions available")]
    NoTxs,
    #[error("consumed units exceed block maximum")]
    InvalidUnitsConsumed,
    #[error("state: {0}")]
    State(#[from] StateError),
}

pub struct BuilderContext {
    pub view: Arc<dyn ImmutableState>,
    pub rules: Arc<dyn Rules>,
    pub state_manager: Arc<dyn StateManager>,
    pub mempool: Arc<dyn Mempool>,
    pub validators: Arc<dyn ValidatorSet>,
    pub validator_height: u64,
    pub signer: Arc<dyn ChunkSigner>,
    pub producer: NodeId,
    /// Timestamp of the chunk being built; quantized into the slot.
    pub now_ms: i64,
    pub parent_timestamp: i64,
    pub parent_fee_state: Vec<u8>,
    pub target_duration: Duration,
    pub stream_batch: usize,
    pub metrics: Arc<Metrics>,
}

pub struct BuiltChunk {
    pub chunk: Chunk,
    pub results: Vec<TxResult>,
    /// Warp verification bitset in chunk transaction order.
    pub warp_results: u64,
    pub fee_manager: FeeManager,
}

struct Fetched {
    value: Option<Vec<u8>>,
    chunks: u16,
}

pub fn build_chunk(ctx: &BuilderContext) -> Result<BuiltChunk, BuildError> {
    let rules = &*ctx.rules;
    let sm = &*ctx.state_manager;
    let next_time = ctx.now_ms;
    if next_time < ctx.parent_timestamp + rules.min_block_gap() {
        return Err(BuildError::TimestampTooEarly);
    }

    let parent_fee = FeeManager::from_bytes(&ctx.parent_fee_state);
    let mut fee_manager = parent_fee.compute_next(ctx.parent_timestamp, next_time, rules);
    let max_units = rules.max_block_units();
    let target_units = rules.window_target_units();

    let ts = TState::new(ctx.stream_batch * 2);
    let mut txs: Vec<Transaction> = Vec::new();
    let mut results: Vec<TxResult> = Vec::new();
    let mut restorable: Vec<Transaction> = Vec::new();
    let mut already_fetched: AHashMap<Vec<u8>, Fetched> = AHashMap::new();
    let mut warp_results = 0u64;
    let mut warp_count = 0u32;
    let mut attempted = 0usize;

    let started = Instant::now();
    ctx.mempool.start_streaming();
    'stream: while started.elapsed() < ctx.target_duration {
        let batch = ctx.mempool.stream(ctx.stream_batch);
        if batch.is_empty() {
            break;
        }
        ctx.mempool.prepare_stream(ctx.stream_batch);

        // Anything already sequenced inside the validity window is skipped
        // outright.
        let oldest_allowed = next_time - rules.validity_window();
        let duplicate = ctx.mempool.is_repeat(&batch, oldest_allowed);

        let mut batch = batch.into_iter().zip(duplicate);
        'txs: while let Some((tx, is_duplicate)) = batch.next() {
            attempted += 1;

            if is_duplicate {
                tracing::debug!(tx = ?tx.id(), "skipping duplicate transaction");
                continue;
            }

            // Warp admission is capped per chunk.
            if tx.warp_message.is_some() && warp_count as usize >= rules.max_warp_messages() {
                tracing::debug!(tx = ?tx.id(), "warp message cap reached");
                restorable.push(tx);
                continue;
            }

            // Stop admitting once the worst case no longer fits; at or over
            // the target the whole build stops.
            let next_units = tx.max_units(rules);
            if !fee_manager.can_consume(next_units, max_units) {
                restorable.push(tx);
                if fee_manager.last_consumed() >= target_units {
                    tracing::debug!("chunk full, stopping build");
                    restorable.extend(batch.by_ref().map(|(tx, _)| tx));
                    break 'stream;
                }
                continue;
            }

            // Prefetch declared keys, reusing anything this build already
            // read.
            let keys = tx.state_keys(sm);
            let mut reads: AHashMap<Vec<u8>, u16> = AHashMap::with_capacity(keys.len());
            let mut storage: AHashMap<Vec<u8>, Vec<u8>> = AHashMap::with_capacity(keys.len());
            for (key, _) in keys.iter() {
                if let Some(fetched) = already_fetched.get(key) {
                    reads.insert(key.clone(), fetched.chunks);
                    if let Some(value) = &fetched.value {
                        storage.insert(key.clone(), value.clone());
                    }
                    continue;
                }
                match ctx.view.get_value(key) {
                    Ok(stored) => match decode_stored(&stored) {
                        Ok((payload, chunks)) => {
                            reads.insert(key.clone(), chunks);
                            storage.insert(key.clone(), payload.clone());
                            already_fetched.insert(
                                key.clone(),
                                Fetched {
                                    value: Some(payload),
                                    chunks,
                                },
                            );
                        }
                        Err(_) => {
                            tracing::warn!(tx = ?tx.id(), "dropping tx: stored value failed chunk decoding");
                            continue 'txs;
                        }
                    },
                    Err(StateError::NotFound) => {
                        reads.insert(key.clone(), 0);
                        already_fetched.insert(
                            key.clone(),
                            Fetched {
                                value: None,
                                chunks: 0,
                            },
                        );
                    }
                    Err(err) => {
                        // The underlying view is gone; restore everything.
                        restorable.push(tx);
                        restorable.extend(batch.by_ref().map(|(tx, _)| tx));
                        finish(ctx, txs, restorable);
                        return Err(err.into());
                    }
                }
            }

            let mut tsv = ts.new_view(keys, storage);
            if let Err(err) = tx.pre_execute(&fee_manager, sm, rules, &tsv, next_time) {
                tracing::debug!(tx = ?tx.id(), %err, "tx rejected in pre-execute");
                if err.is_retriable() {
                    restorable.push(tx);
                }
                continue;
            }

            // Invalid warp messages are not dropped: the work they caused is
            // billed, the result bit just stays clear.
            let has_warp = tx.warp_message.is_some();
            let mut warp_verified = false;
            if let Some(warp) = &tx.warp_message {
                if rules.is_warp_chain_enabled(&warp.source_chain_id) {
                    warp_verified = ctx.validators.verify_warp(warp, ctx.validator_height);
                }
                if !warp_verified {
                    tracing::warn!(tx = ?tx.id(), "warp verification failed");
                }
            }

            let result = match tx.execute(
                &fee_manager,
                &reads,
                sm,
                rules,
                &mut tsv,
                next_time,
                warp_verified,
            ) {
                Ok(result) => result,
                Err(err) => {
                    tracing::warn!(%err, "unexpected post-execution error");
                    restorable.push(tx);
                    restorable.extend(batch.by_ref().map(|(tx, _)| tx));
                    finish(ctx, txs, restorable);
                    return Err(err.into());
                }
            };
            if !fee_manager.consume(result.units, max_units) {
                restorable.extend(batch.by_ref().map(|(tx, _)| tx));
                finish(ctx, txs, restorable);
                return Err(BuildError::InvalidUnitsConsumed);
            }
            tsv.commit();

            if has_warp {
                if warp_verified {
                    warp_results |= 1 << warp_count;
                }
                warp_count += 1;
            }
            txs.push(tx);
            results.push(result);
        }
    }
    let restored = ctx.mempool.finish_streaming(restorable);
    tracing::debug!(restored, "transactions restored to mempool");

    if txs.is_empty() {
        return Err(BuildError::NoTxs);
    }

    let chunk = Chunk::new_signed(
        quantize_slot(next_time),
        txs,
        ctx.producer,
        &*ctx.signer,
        rules.network_id(),
        &rules.chain_id(),
    );
    ctx.metrics.chunks_built.inc();
    tracing::info!(
        slot = chunk.slot,
        attempted,
        added = chunk.txs.len(),
        state_changes = ts.pending_changes(),
        "built chunk"
    );
    Ok(BuiltChunk {
        chunk,
        results,
        warp_results,
        fee_manager,
    })
}

/// Fatal exit: hand the block's transactions and the restorable set back to
/// the mempool before surfacing the error.
fn finish(ctx: &BuilderContext, txs: Vec<Transaction>, mut restorable: Vec<Transaction>) {
    let mut all = txs;
    all.append(&mut restorable);
    ctx.mempool.finish_streaming(all);
}
