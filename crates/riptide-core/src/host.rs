// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Host collaborator seams.
//!
//! The execution core does not own consensus, transaction admission, or the
//! validator set; it consumes them through these traits.

use crate::crypto::Digest;
use crate::transaction::{Transaction, WarpMessage};

/// Per-network execution parameters. Timestamps are unix milliseconds.
pub trait Rules: Send + Sync {
    fn network_id(&self) -> u32;
    fn chain_id(&self) -> Digest;

    /// How far past its declared expiry window a transaction may still land.
    fn validity_window(&self) -> i64;
    fn min_block_gap(&self) -> i64;
    fn min_empty_block_gap(&self) -> i64;

    fn max_block_units(&self) -> u64;
    fn window_target_units(&self) -> u64;
    fn min_unit_price(&self) -> u64;
    /// Flat unit cost charged to every transaction before key accounting.
    fn base_units(&self) -> u64;

    fn max_warp_messages(&self) -> usize {
        4
    }

    fn is_action_activated(&self, _kind: u8, _timestamp: i64) -> bool {
        true
    }

    fn is_auth_activated(&self, _kind: u8, _timestamp: i64) -> bool {
        true
    }

    /// Whether warp messages from the given source chain are admitted.
    fn is_warp_chain_enabled(&self, _source_chain_id: &Digest) -> bool {
        true
    }
}

/// Transaction admission pool. Streaming hands batches to the builder;
/// whatever the builder cannot place is handed back.
pub trait Mempool: Send + Sync {
    fn start_streaming(&self);
    fn stream(&self, count: usize) -> Vec<Transaction>;
    fn prepare_stream(&self, count: usize);
    /// Ends the stream, returning the restorable transactions to the pool.
    /// Returns how many were restored.
    fn finish_streaming(&self, restorable: Vec<Transaction>) -> usize;
    /// Return retriable transactions observed outside a streaming session.
    fn restore(&self, txs: Vec<Transaction>) -> usize;
    /// Per-transaction flags marking what is already included in the chain
    /// within the validity window starting at `oldest_allowed`.
    fn is_repeat(&self, txs: &[Transaction], oldest_allowed: i64) -> Vec<bool>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validator-set facade used for warp signature validation. The height pins
/// which registered set signs; choosing it is the host's call.
pub trait ValidatorSet: Send + Sync {
    fn verify_warp(&self, message: &WarpMessage, height: u64) -> bool;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transaction::Transaction;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Clone)]
    pub struct TestRules {
        pub target_units: u64,
        pub max_units: u64,
        pub warp_enabled: bool,
    }

    impl Default for TestRules {
        fn default() -> Self {
            Self {
                target_units: 1_000_000,
                max_units: 10_000_000,
                warp_enabled: true,
            }
        }
    }

    impl TestRules {
        pub fn with_target_units(mut self, target: u64) -> Self {
            self.target_units = target;
            self
        }

        pub fn with_max_units(mut self, max: u64) -> Self {
            self.max_units = max;
            self
        }
    }

    impl Rules for TestRules {
        fn network_id(&self) -> u32 {
            1337
        }

        fn chain_id(&self) -> Digest {
            Digest::hash_of(b"test-chain")
        }

        fn validity_window(&self) -> i64 {
            60_000
        }

        fn min_block_gap(&self) -> i64 {
            100
        }

        fn min_empty_block_gap(&self) -> i64 {
            1_000
        }

        fn max_block_units(&self) -> u64 {
            self.max_units
        }

        fn window_target_units(&self) -> u64 {
            self.target_units
        }

        fn min_unit_price(&self) -> u64 {
            1
        }

        fn base_units(&self) -> u64 {
            10
        }

        fn is_warp_chain_enabled(&self, _source_chain_id: &Digest) -> bool {
            self.warp_enabled
        }
    }

    /// FIFO mempool capturing restored transactions for assertions.
    #[derive(Default)]
    pub struct TestMempool {
        pub queue: Mutex<VecDeque<Transaction>>,
        pub restored: Mutex<Vec<Transaction>>,
        pub repeats: Mutex<Vec<crate::transaction::TxId>>,
    }

    impl TestMempool {
        pub fn with_txs(txs: Vec<Transaction>) -> Self {
            Self {
                queue: Mutex::new(txs.into()),
                ..Default::default()
            }
        }
    }

    impl Mempool for TestMempool {
        fn start_streaming(&self) {}

        fn stream(&self, count: usize) -> Vec<Transaction> {
            let mut queue = self.queue.lock();
            let n = count.min(queue.len());
            queue.drain(..n).collect()
        }

        fn prepare_stream(&self, _count: usize) {}

        fn finish_streaming(&self, restorable: Vec<Transaction>) -> usize {
            let n = restorable.len();
            self.restored.lock().extend(restorable);
            n
        }

        fn restore(&self, txs: Vec<Transaction>) -> usize {
            let n = txs.len();
            self.restored.lock().extend(txs);
            n
        }

        fn is_repeat(&self, txs: &[Transaction], _oldest_allowed: i64) -> Vec<bool> {
            let repeats = self.repeats.lock();
            txs.iter().map(|tx| repeats.contains(&tx.id())).collect()
        }

        fn len(&self) -> usize {
            self.queue.lock().len()
        }
    }

    /// Validator set accepting warp payloads that start with `b"ok"`.
    pub struct TestValidators;

    impl ValidatorSet for TestValidators {
        fn verify_warp(&self, message: &WarpMessage, _height: u64) -> bool {
            message.payload.starts_with(b"ok")
        }
    }
}
