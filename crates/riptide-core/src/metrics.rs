// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};
use std::sync::Arc;

pub struct Metrics {
    pub executor_blocked: IntCounter,
    pub executor_executable: IntCounter,

    pub txs_executed: IntCounter,
    pub txs_invalid: IntCounter,
    pub blocks_accepted: IntCounter,
    pub chunks_built: IntCounter,

    pub chunks_fetched: IntCounter,
    pub chunk_fetch_attempts: IntCounter,
    pub chunk_fetch_failures: IntCounter,
    pub chunks_evicted: IntCounter,
    pub chunk_requests_served: IntCounter,
    pub chunk_requests_missed: IntCounter,
    pub optimistic_chunk_hits: IntCounter,
    pub gossip_sent: IntCounter,

    pub in_memory_chunks: IntGauge,
    pub outstanding_fetches: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            executor_blocked: register_int_counter_with_registry!(
                "executor_blocked",
                "Tasks enqueued with unresolved dependencies",
                registry,
            )
            .unwrap(),
            executor_executable: register_int_counter_with_registry!(
                "executor_executable",
                "Tasks enqueued with no dependencies",
                registry,
            )
            .unwrap(),
            txs_executed: register_int_counter_with_registry!(
                "txs_executed",
                "Transactions executed successfully",
                registry,
            )
            .unwrap(),
            txs_invalid: register_int_counter_with_registry!(
                "txs_invalid",
                "Transactions dropped during block processing",
                registry,
            )
            .unwrap(),
            blocks_accepted: register_int_counter_with_registry!(
                "blocks_accepted",
                "Blocks fully executed and exported",
                registry,
            )
            .unwrap(),
            chunks_built: register_int_counter_with_registry!(
                "chunks_built",
                "Chunks assembled from the local mempool",
                registry,
            )
            .unwrap(),
            chunks_fetched: register_int_counter_with_registry!(
                "chunks_fetched",
                "Chunks fetched from peers",
                registry,
            )
            .unwrap(),
            chunk_fetch_attempts: register_int_counter_with_registry!(
                "chunk_fetch_attempts",
                "Outgoing chunk fetch attempts",
                registry,
            )
            .unwrap(),
            chunk_fetch_failures: register_int_counter_with_registry!(
                "chunk_fetch_failures",
                "Chunk fetches that exhausted all retries",
                registry,
            )
            .unwrap(),
            chunks_evicted: register_int_counter_with_registry!(
                "chunks_evicted",
                "Chunks evicted after their referencing heights were pruned",
                registry,
            )
            .unwrap(),
            chunk_requests_served: register_int_counter_with_registry!(
                "chunk_requests_served",
                "Peer chunk requests answered with a payload",
                registry,
            )
            .unwrap(),
            chunk_requests_missed: register_int_counter_with_registry!(
                "chunk_requests_missed",
                "Peer chunk requests answered empty",
                registry,
            )
            .unwrap(),
            optimistic_chunk_hits: register_int_counter_with_registry!(
                "optimistic_chunk_hits",
                "Fetches served from the optimistic cache",
                registry,
            )
            .unwrap(),
            gossip_sent: register_int_counter_with_registry!(
                "gossip_sent",
                "Retained-window gossip messages sent",
                registry,
            )
            .unwrap(),
            in_memory_chunks: register_int_gauge_with_registry!(
                "in_memory_chunks",
                "Chunks currently pinned in memory",
                registry,
            )
            .unwrap(),
            outstanding_fetches: register_int_gauge_with_registry!(
                "outstanding_fetches",
                "Chunk ids with a fetch in flight",
                registry,
            )
            .unwrap(),
        })
    }

    pub fn new_for_tests() -> Arc<Self> {
        Self::new(&Registry::new())
    }
}
