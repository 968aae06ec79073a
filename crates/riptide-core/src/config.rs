// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Dissemination knobs. The timers are liveness tuning, not correctness;
/// defaults follow the protocol's coarse 100 ms / 50 ms cadence.
#[derive(Clone, Debug)]
pub struct ChunkManagerParameters {
    /// How often the retained-height window is gossiped when nothing
    /// changed locally.
    pub gossip_period: Duration,
    /// Sleep between failed fetch attempts.
    pub retry_backoff: Duration,
    /// Attempts before a fetch reports exhaustion to its listeners.
    pub max_fetch_attempts: usize,
    /// Per-attempt wait for a peer response.
    pub request_timeout: Duration,
    pub optimistic_cache_size: usize,
    pub cleared_cache_size: usize,
    pub tried_cache_size: usize,
}

impl Default for ChunkManagerParameters {
    fn default() -> Self {
        Self {
            gossip_period: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(50),
            max_fetch_attempts: 20,
            request_timeout: Duration::from_secs(2),
            optimistic_cache_size: 1024,
            cleared_cache_size: 1024,
            tried_cache_size: 1024,
        }
    }
}

/// Execution-side sizing.
#[derive(Clone, Debug)]
pub struct ExecutionParameters {
    /// Worker threads the per-block executor runs on.
    pub concurrency: usize,
    /// Expected transactions per block; sizes the executor queue and state
    /// maps.
    pub tx_capacity_hint: usize,
    /// Accepted blocks the engine will queue before back-pressuring.
    pub max_backlog: usize,
}

impl Default for ExecutionParameters {
    fn default() -> Self {
        Self {
            concurrency: 4,
            tx_capacity_hint: 50_000,
            max_backlog: 16,
        }
    }
}

/// Chunk building limits.
#[derive(Clone, Debug)]
pub struct BuilderParameters {
    /// Transactions pulled from the mempool per stream call.
    pub stream_batch: usize,
    /// Wall-clock budget for one build attempt (host-provided in
    /// production).
    pub target_duration: Duration,
}

impl Default for BuilderParameters {
    fn default() -> Self {
        Self {
            stream_batch: 256,
            target_duration: Duration::from_millis(100),
        }
    }
}
