// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Moving-window fee tracking.
//!
//! The fee manager carries the unit price, a rolling window of recent slot
//! consumption, and the units consumed by the block being processed. It is
//! persisted under the chain's fee metadata key and advanced once per block.

use crate::codec::{Reader, Writer};
use crate::host::Rules;

pub const FEE_WINDOW_SLOTS: usize = 10;

/// Serialized width: price, window slots, last consumed.
const FEE_STATE_SIZE: usize = 8 * (FEE_WINDOW_SLOTS + 2);

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FeeManager {
    unit_price: u64,
    window: [u64; FEE_WINDOW_SLOTS],
    last_consumed: u64,
}

impl FeeManager {
    /// Decode persisted fee state. Anything malformed (notably the empty
    /// genesis value) yields the zero state; `compute_next` clamps the price
    /// up to the rules minimum.
    pub fn from_bytes(raw: &[u8]) -> Self {
        if raw.len() != FEE_STATE_SIZE {
            return Self::default();
        }
        let mut r = Reader::new(raw);
        let unit_price = r.unpack_u64().expect("sized above");
        let mut window = [0u64; FEE_WINDOW_SLOTS];
        for slot in window.iter_mut() {
            *slot = r.unpack_u64().expect("sized above");
        }
        let last_consumed = r.unpack_u64().expect("sized above");
        Self {
            unit_price,
            window,
            last_consumed,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut w = Writer::new(FEE_STATE_SIZE);
        w.pack_u64(self.unit_price);
        for slot in &self.window {
            w.pack_u64(*slot);
        }
        w.pack_u64(self.last_consumed);
        w.into_bytes()
    }

    /// Advance the window across the gap between two block timestamps and
    /// re-price units against the rules target.
    pub fn compute_next(&self, parent_timestamp: i64, next_timestamp: i64, rules: &dyn Rules) -> Self {
        let elapsed = (next_timestamp - parent_timestamp) / crate::types::SLOT_DURATION_MS;
        let shift = (elapsed.max(1) as usize).min(FEE_WINDOW_SLOTS);

        let mut window = [0u64; FEE_WINDOW_SLOTS];
        window[..FEE_WINDOW_SLOTS - shift].copy_from_slice(&self.window[shift..]);
        window[FEE_WINDOW_SLOTS - 1] =
            window[FEE_WINDOW_SLOTS - 1].saturating_add(self.last_consumed);

        let usage: u64 = window.iter().fold(0, |acc, slot| acc.saturating_add(*slot));
        let step = (self.unit_price / 8).max(1);
        let unit_price = if usage >= rules.window_target_units() {
            self.unit_price.saturating_add(step)
        } else {
            self.unit_price.saturating_sub(step)
        }
        .max(rules.min_unit_price());

        Self {
            unit_price,
            window,
            last_consumed: 0,
        }
    }

    /// Record consumption for the current block; `false` when the block
    /// ceiling would be exceeded (the caller latches the fatal error).
    pub fn consume(&mut self, units: u64, max_block_units: u64) -> bool {
        match self.last_consumed.checked_add(units) {
            Some(total) if total <= max_block_units => {
                self.last_consumed = total;
                true
            }
            _ => false,
        }
    }

    pub fn can_consume(&self, units: u64, max_block_units: u64) -> bool {
        self.last_consumed
            .checked_add(units)
            .is_some_and(|total| total <= max_block_units)
    }

    pub fn last_consumed(&self) -> u64 {
        self.last_consumed
    }

    pub fn unit_price(&self) -> u64 {
        self.unit_price
    }
}
