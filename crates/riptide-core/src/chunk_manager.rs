// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Chunk dissemination.
//!
//! Tracks which height window each peer retains, serves chunk requests from
//! memory or the persistent store, fetches missing chunks with retries
//! across peers, optimistically caches pushed chunks, and evicts chunks once
//! every height that referenced them has been pruned. The main loop only
//! multiplexes the gossip timer and the update signal; all handlers run on
//! caller tasks.

use crate::config::ChunkManagerParameters;
use crate::crypto::Digest;
use crate::metrics::Metrics;
use crate::types::{ChunkId, Height, NodeChunks, NodeId};
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::select;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Gossip payload tags.
pub const GOSSIP_NODE_CHUNKS: u8 = 0x00;
pub const GOSSIP_CHUNK_PUSH: u8 = 0x01;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("exhausted retries")]
    ExhaustedRetries,
    #[error("fetch cancelled")]
    Cancelled,
}

/// Outbound side of the host's app-level messaging.
pub trait ChunkSender: Send + Sync {
    fn send_request(&self, peer: NodeId, request_id: u32, payload: Vec<u8>) -> eyre::Result<()>;
    fn send_response(&self, peer: NodeId, request_id: u32, payload: Vec<u8>) -> eyre::Result<()>;
    fn send_gossip(&self, peers: &[NodeId], payload: Vec<u8>) -> eyre::Result<()>;
}

/// Read access to chunks persisted with accepted blocks.
pub trait ChunkStore: Send + Sync {
    fn get_chunk(&self, id: &ChunkId) -> Option<Bytes>;
}

/// Height-bucketed chunk retention. The count per id is the number of
/// distinct heights referencing it; `set_min` pops whole buckets below the
/// floor and reports an id exactly once, when its count reaches zero.
pub struct ChunkMap {
    counts: AHashMap<ChunkId, usize>,
    heights: AHashMap<Height, AHashSet<ChunkId>>,
    heap: BinaryHeap<Reverse<Height>>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self {
            counts: AHashMap::new(),
            heights: AHashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    pub fn add(&mut self, height: Height, id: ChunkId) {
        let new_bucket = !self.heights.contains_key(&height);
        let bucket = self.heights.entry(height).or_default();
        if !bucket.insert(id) {
            // Already registered at this height.
            return;
        }
        if new_bucket {
            self.heap.push(Reverse(height));
        }
        *self.counts.entry(id).or_insert(0) += 1;
    }

    /// Evict every bucket below `min`, returning the ids whose last
    /// referencing height was pruned.
    pub fn set_min(&mut self, min: Height) -> Vec<ChunkId> {
        let mut evicted = Vec::new();
        while let Some(Reverse(height)) = self.heap.peek().copied() {
            if height >= min {
                break;
            }
            self.heap.pop();
            let bucket = self.heights.remove(&height).expect("heap tracks buckets");
            for id in bucket {
                let count = self.counts.get_mut(&id).expect("bucket member counted");
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&id);
                    evicted.push(id);
                }
            }
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for ChunkMap {
    fn default() -> Self {
        Self::new()
    }
}

struct ChunkInner {
    /// Chunks pinned by at least one height reference (or an in-flight
    /// fetch that supplied one).
    fetched: AHashMap<ChunkId, Bytes>,
    chunks: ChunkMap,
    min: Height,
    max: Height,
}

#[derive(Default)]
struct PeerIndex {
    /// Advertised retention windows; keys are a subset of the connected
    /// set.
    windows: AHashMap<NodeId, NodeChunks>,
    connected: AHashSet<NodeId>,
}

#[derive(Default)]
struct RequestMux {
    next_id: u32,
    pending: AHashMap<u32, oneshot::Sender<Vec<u8>>>,
}

type FetchListener = oneshot::Sender<Result<Bytes, FetchError>>;

pub struct ChunkManager {
    sender: Arc<dyn ChunkSender>,
    store: Arc<dyn ChunkStore>,
    parameters: ChunkManagerParameters,
    inner: RwLock<ChunkInner>,
    optimistic: Mutex<LruCache<ChunkId, Bytes>>,
    /// Ids evicted after acceptance; suppresses redundant optimistic
    /// refetches.
    cleared: Mutex<LruCache<ChunkId, ()>>,
    tried_optimistic: Mutex<LruCache<ChunkId, ()>>,
    peers: RwLock<PeerIndex>,
    requests: Mutex<RequestMux>,
    outstanding: Mutex<AHashMap<ChunkId, Vec<FetchListener>>>,
    update: Notify,
    metrics: Arc<Metrics>,
}

impl ChunkManager {
    pub fn new(
        sender: Arc<dyn ChunkSender>,
        store: Arc<dyn ChunkStore>,
        parameters: ChunkManagerParameters,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        fn cache<K: std::hash::Hash + Eq, V>(size: usize) -> LruCache<K, V> {
            LruCache::new(NonZeroUsize::new(size.max(1)).unwrap())
        }
        Arc::new(Self {
            sender,
            store,
            inner: RwLock::new(ChunkInner {
                fetched: AHashMap::new(),
                chunks: ChunkMap::new(),
                min: 0,
                max: 0,
            }),
            optimistic: Mutex::new(cache(parameters.optimistic_cache_size)),
            cleared: Mutex::new(cache(parameters.cleared_cache_size)),
            tried_optimistic: Mutex::new(cache(parameters.tried_cache_size)),
            peers: RwLock::new(PeerIndex::default()),
            requests: Mutex::new(RequestMux::default()),
            outstanding: Mutex::new(AHashMap::new()),
            update: Notify::new(),
            metrics,
            parameters,
        })
    }

    /// Gossip loop: advertises the local `[min, max]` window every period,
    /// or sooner when local state changes. Abort the returned handle to
    /// stop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<Option<()>> {
        let manager = self.clone();
        tokio::spawn(async move {
            tracing::info!("starting chunk manager");
            loop {
                select! {
                    _ = sleep(manager.parameters.gossip_period) => {}
                    _ = manager.update.notified() => {}
                }
                manager.gossip_window(None);
            }
        })
    }

    fn current_window(&self) -> NodeChunks {
        let inner = self.inner.read();
        NodeChunks {
            min: inner.min,
            max: inner.max,
        }
    }

    fn gossip_window(&self, only: Option<NodeId>) {
        let recipients: Vec<NodeId> = match only {
            Some(peer) => vec![peer],
            None => self.peers.read().connected.iter().copied().collect(),
        };
        if recipients.is_empty() {
            return;
        }
        let mut payload = vec![GOSSIP_NODE_CHUNKS];
        payload.extend_from_slice(&self.current_window().marshal());
        if let Err(err) = self.sender.send_gossip(&recipients, payload) {
            tracing::warn!(%err, "unable to send chunk gossip");
            return;
        }
        self.metrics.gossip_sent.inc();
    }

    /// Pin locally produced (or verified) chunks under a height.
    pub fn register_chunks(&self, height: Height, chunks: Vec<Bytes>) {
        {
            let mut inner = self.inner.write();
            for chunk in chunks {
                let id = Digest::hash_of(&chunk);
                inner.fetched.insert(id, chunk);
                inner.chunks.add(height, id);
            }
            self.metrics.in_memory_chunks.set(inner.fetched.len() as i64);
        }
        self.update.notify_one();
    }

    /// Raise the accepted ceiling and evict chunks no retained height
    /// references anymore. Chunks must be persisted before this is called;
    /// the returned ids are reported exactly once.
    pub fn accept(&self, height: Height) -> Vec<ChunkId> {
        let (evicted, remaining) = {
            let mut inner = self.inner.write();
            inner.max = height;
            let evicted = inner.chunks.set_min(height + 1);
            for id in &evicted {
                inner.fetched.remove(id);
                self.cleared.lock().put(*id, ());
                self.optimistic.lock().pop(id);
            }
            self.metrics.in_memory_chunks.set(inner.fetched.len() as i64);
            (evicted, inner.fetched.len())
        };
        self.metrics.chunks_evicted.inc_by(evicted.len() as u64);
        self.update.notify_one();
        tracing::info!(evicted = evicted.len(), remaining, "evicted chunks from memory");
        evicted
    }

    /// Lower bound of heights this node still serves.
    pub fn set_min(&self, min: Height) {
        self.inner.write().min = min;
        self.update.notify_one();
    }

    /// Fetch a chunk, deduplicating concurrent calls per id: only the first
    /// caller issues network traffic, later callers attach as listeners and
    /// every listener observes exactly one result.
    pub async fn request_chunk(
        self: &Arc<Self>,
        height: Option<Height>,
        hint: Option<NodeId>,
        id: ChunkId,
    ) -> Result<Bytes, FetchError> {
        let (listener_tx, listener_rx) = oneshot::channel();
        let first = {
            let mut outstanding = self.outstanding.lock();
            match outstanding.entry(id) {
                Entry::Occupied(mut listeners) => {
                    listeners.get_mut().push(listener_tx);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![listener_tx]);
                    true
                }
            }
        };
        if first {
            self.metrics.outstanding_fetches.inc();
            let manager = self.clone();
            // Detached so a cancelled caller does not starve the other
            // listeners.
            tokio::spawn(async move { manager.fetch(height, hint, id).await });
        }
        match listener_rx.await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Cancelled),
        }
    }

    async fn fetch(self: Arc<Self>, height: Option<Height>, hint: Option<NodeId>, id: ChunkId) {
        // Already pinned in memory.
        {
            let mut inner = self.inner.write();
            if let Some(chunk) = inner.fetched.get(&id).cloned() {
                if let Some(height) = height {
                    inner.chunks.add(height, id);
                }
                drop(inner);
                self.notify_listeners(id, Ok(chunk));
                return;
            }
        }
        // Optimistically cached; a supplied height promotes the bytes into
        // the pinned set.
        let cached = self.optimistic.lock().get(&id).cloned();
        if let Some(chunk) = cached {
            self.metrics.optimistic_chunk_hits.inc();
            if let Some(height) = height {
                let mut inner = self.inner.write();
                inner.fetched.insert(id, chunk.clone());
                inner.chunks.add(height, id);
            }
            self.notify_listeners(id, Ok(chunk));
            return;
        }

        for attempt in 0..self.parameters.max_fetch_attempts {
            let peer = match hint {
                // Trust the hint for the first two attempts.
                Some(hint) if attempt <= 1 => Some(hint),
                _ => self.pick_peer(height),
            };
            let Some(peer) = peer else {
                // Nobody connected yet.
                sleep(self.parameters.retry_backoff).await;
                continue;
            };
            match self.issue_request(peer, id).await {
                Ok(chunk) => {
                    match height {
                        Some(height) => {
                            let mut inner = self.inner.write();
                            inner.fetched.insert(id, chunk.clone());
                            inner.chunks.add(height, id);
                        }
                        None => {
                            tracing::debug!(%id, size = chunk.len(), "optimistically fetched chunk");
                            self.optimistic.lock().put(id, chunk.clone());
                        }
                    }
                    self.metrics.chunks_fetched.inc();
                    self.notify_listeners(id, Ok(chunk));
                    return;
                }
                Err(()) => {
                    sleep(self.parameters.retry_backoff).await;
                }
            }
        }
        self.metrics.chunk_fetch_failures.inc();
        self.notify_listeners(id, Err(FetchError::ExhaustedRetries));
    }

    /// Prefer peers whose advertised window covers the height; otherwise
    /// any connected peer.
    fn pick_peer(&self, height: Option<Height>) -> Option<NodeId> {
        let peers = self.peers.read();
        let mut rng = rand::thread_rng();
        if let Some(height) = height {
            let qualifying: Vec<NodeId> = peers
                .windows
                .iter()
                .filter(|(_, window)| window.covers(height))
                .map(|(peer, _)| *peer)
                .collect();
            if let Some(peer) = qualifying.choose(&mut rng) {
                return Some(*peer);
            }
        }
        let connected: Vec<NodeId> = peers.connected.iter().copied().collect();
        connected.choose(&mut rng).copied()
    }

    /// One app-request round-trip. Empty responses mean the peer does not
    /// have the chunk; a hash mismatch is an invalid chunk (the host should
    /// penalize the sender). Both count as failed attempts.
    async fn issue_request(&self, peer: NodeId, id: ChunkId) -> Result<Bytes, ()> {
        let (response_tx, response_rx) = oneshot::channel();
        let request_id = {
            let mut mux = self.requests.lock();
            let request_id = mux.next_id;
            mux.next_id = mux.next_id.wrapping_add(1);
            mux.pending.insert(request_id, response_tx);
            request_id
        };
        self.metrics.chunk_fetch_attempts.inc();
        if let Err(err) = self
            .sender
            .send_request(peer, request_id, id.as_ref().to_vec())
        {
            tracing::warn!(%id, %err, "chunk fetch request failed");
            self.requests.lock().pending.remove(&request_id);
            return Err(());
        }
        let response = match timeout(self.parameters.request_timeout, response_rx).await {
            Ok(Ok(response)) => response,
            _ => {
                self.requests.lock().pending.remove(&request_id);
                return Err(());
            }
        };
        if response.is_empty() {
            tracing::warn!(%id, %peer, "chunk fetch returned empty");
            return Err(());
        }
        if Digest::hash_of(&response) != id {
            tracing::warn!(%peer, "received incorrect chunk");
            return Err(());
        }
        Ok(Bytes::from(response))
    }

    fn notify_listeners(&self, id: ChunkId, result: Result<Bytes, FetchError>) {
        let Some(listeners) = self.outstanding.lock().remove(&id) else {
            return;
        };
        self.metrics.outstanding_fetches.dec();
        for listener in listeners {
            let _ = listener.send(result.clone());
        }
    }

    /// Serve a peer's chunk request from memory, then the persistent store;
    /// an empty payload tells the peer to retry elsewhere.
    pub fn handle_request(&self, peer: NodeId, request_id: u32, request: &[u8]) {
        let Some(id) = Digest::from_slice(request) else {
            tracing::warn!(%peer, "unable to parse chunk request");
            return;
        };
        let chunk = self
            .inner
            .read()
            .fetched
            .get(&id)
            .cloned()
            .or_else(|| self.store.get_chunk(&id));
        let payload = match chunk {
            Some(chunk) => {
                self.metrics.chunk_requests_served.inc();
                chunk.to_vec()
            }
            None => {
                tracing::debug!(%id, "unable to find requested chunk");
                self.metrics.chunk_requests_missed.inc();
                Vec::new()
            }
        };
        if let Err(err) = self.sender.send_response(peer, request_id, payload) {
            tracing::warn!(%peer, %err, "unable to send chunk response");
        }
    }

    /// Route a peer's response to the waiting fetch attempt.
    pub fn handle_response(&self, request_id: u32, response: Vec<u8>) {
        let Some(waiter) = self.requests.lock().pending.remove(&request_id) else {
            tracing::warn!(request_id, "got unexpected response");
            return;
        };
        let _ = waiter.send(response);
    }

    /// A failed app-request counts as an empty (not-found) response.
    pub fn handle_request_failed(&self, request_id: u32) {
        let Some(waiter) = self.requests.lock().pending.remove(&request_id) else {
            tracing::warn!(request_id, "unexpected request failure");
            return;
        };
        let _ = waiter.send(Vec::new());
    }

    /// Gossip: `0x00` retained-window announcements, `0x01` chunk pushes
    /// into the optimistic cache.
    pub fn handle_gossip(&self, peer: NodeId, message: &[u8]) {
        match message.split_first() {
            Some((&GOSSIP_NODE_CHUNKS, rest)) => {
                let window = match NodeChunks::unmarshal(rest) {
                    Ok(window) => window,
                    Err(err) => {
                        tracing::warn!(%peer, %err, "unable to parse window gossip");
                        return;
                    }
                };
                let mut peers = self.peers.write();
                if peers.connected.contains(&peer) {
                    peers.windows.insert(peer, window);
                }
            }
            Some((&GOSSIP_CHUNK_PUSH, rest)) => {
                let id = Digest::hash_of(rest);
                if self.inner.read().fetched.contains_key(&id) {
                    return;
                }
                if self.cleared.lock().contains(&id) {
                    return;
                }
                self.optimistic.lock().put(id, Bytes::copy_from_slice(rest));
            }
            Some((tag, _)) => {
                tracing::warn!(%peer, tag = *tag, "unexpected gossip message type");
            }
            None => {}
        }
    }

    /// Optimistically fetch chunk ids referenced by a not-yet-verified
    /// block. Each id is attempted at most once and known-evicted ids are
    /// skipped.
    pub fn prefetch(self: &Arc<Self>, ids: Vec<ChunkId>, hint: Option<NodeId>) {
        for id in ids {
            if self.cleared.lock().contains(&id) {
                continue;
            }
            {
                let mut tried = self.tried_optimistic.lock();
                if tried.contains(&id) {
                    continue;
                }
                tried.put(id, ());
            }
            let manager = self.clone();
            tokio::spawn(async move {
                let _ = manager.request_chunk(None, hint, id).await;
            });
        }
    }

    /// Resolve a block's certificates into `(index, bytes)` pairs for the
    /// engine, fetching concurrently. The sender is dropped when every
    /// chunk has been delivered (or the first fetch fails), which closes
    /// the processor's input stream.
    pub fn fetch_block_chunks(
        self: &Arc<Self>,
        height: Height,
        ids: Vec<ChunkId>,
        hint: Option<NodeId>,
        out: crossbeam_channel::Sender<(usize, Bytes)>,
    ) -> JoinHandle<Result<(), FetchError>> {
        let manager = self.clone();
        tokio::spawn(async move {
            let fetches = ids.into_iter().enumerate().map(|(index, id)| {
                let manager = manager.clone();
                let out = out.clone();
                async move {
                    let chunk = manager.request_chunk(Some(height), hint, id).await?;
                    let _ = out.send((index, chunk));
                    Ok::<(), FetchError>(())
                }
            });
            let results = futures::future::join_all(fetches).await;
            manager.update.notify_one();
            results.into_iter().collect()
        })
    }

    /// Handshake: advertise our window to the new peer and start tracking
    /// it.
    pub fn handle_connect(&self, peer: NodeId) {
        self.peers.write().connected.insert(peer);
        self.gossip_window(Some(peer));
    }

    /// Disconnected peers are no longer valid fetch targets.
    pub fn handle_disconnect(&self, peer: NodeId) {
        let mut peers = self.peers.write();
        peers.windows.remove(&peer);
        peers.connected.remove(&peer);
    }

    pub fn retained_chunks(&self) -> usize {
        self.inner.read().fetched.len()
    }
}
