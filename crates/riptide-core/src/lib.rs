// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

pub mod builder;
pub mod chunk_manager;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod executor;
pub mod fees;
pub mod host;
pub mod metrics;
pub mod processor;
pub mod state;
pub mod transaction;
pub mod tstate;
pub mod types;
