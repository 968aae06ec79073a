// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Conflict-aware parallel task executor.
//!
//! Tasks declare the state keys they touch with permission bits; the executor
//! sequences conflicting tasks in enqueue order and runs everything else in
//! parallel on a fixed pool of worker threads. Per key it tracks the last
//! allocate/write claimant and the cohort of readers admitted since: a reader
//! only waits for the cohort's writer, so readers of the same key run in
//! parallel, while a new writer waits for every still-live cohort member.

use crate::metrics::Metrics;
use crate::state::Keys;
use ahash::{AHashMap, AHashSet};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::thread;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError<E> {
    #[error("{0}")]
    Task(E),
    #[error("executor stopped")]
    Stopped,
}

type TaskFn<E> = Box<dyn FnOnce() -> Result<(), E> + Send + 'static>;

struct TaskState<E> {
    f: Option<TaskFn<E>>,
    /// Downstream task ids to signal on completion.
    blocking: AHashSet<usize>,
    dependencies: Arc<AtomicI64>,
    executed: bool,
}

#[derive(Default)]
struct KeyNode {
    last_writer: Option<usize>,
    /// Readers admitted since `last_writer` claimed the key.
    readers: Vec<usize>,
}

struct Graph<E> {
    tasks: Vec<TaskState<E>>,
    nodes: AHashMap<Vec<u8>, KeyNode>,
    completed: usize,
    done: bool,
}

struct Inner<E> {
    graph: Mutex<Graph<E>>,
    /// Dropped once every task has executed; workers drain then exit.
    ready_tx: Mutex<Option<Sender<usize>>>,
    /// Dropped on stop or first error; workers observe the closed channel.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    error: Mutex<Option<ExecutorError<E>>>,
    metrics: Arc<Metrics>,
}

impl<E: Send + 'static> Inner<E> {
    fn latch(&self, err: ExecutorError<E>) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
            drop(slot);
            self.stop_tx.lock().take();
        }
    }

    fn submit(&self, id: usize) {
        if let Some(tx) = self.ready_tx.lock().as_ref() {
            // The channel is sized by the caller's item hint, so this send
            // does not block for well-sized runs.
            let _ = tx.send(id);
        }
    }

    fn run_worker(self: &Arc<Self>, ready_rx: &Receiver<usize>) {
        loop {
            select! {
                recv(ready_rx) -> msg => {
                    let Ok(id) = msg else { return };
                    let f = {
                        let mut graph = self.graph.lock();
                        graph.tasks[id].f.take().expect("task enqueued once")
                    };
                    if let Err(err) = f() {
                        self.latch(ExecutorError::Task(err));
                        return;
                    }
                    self.complete(id);
                }
                recv(self.stop_rx) -> _ => return,
            }
        }
    }

    fn complete(&self, id: usize) {
        let downstream: Vec<(usize, Arc<AtomicI64>)> = {
            let mut guard = self.graph.lock();
            let graph = &mut *guard;
            let task = &mut graph.tasks[id];
            task.executed = true;
            let blocking = std::mem::take(&mut task.blocking);
            graph.completed += 1;
            if graph.done && graph.completed == graph.tasks.len() {
                self.ready_tx.lock().take();
            }
            blocking
                .into_iter()
                .map(|b| (b, graph.tasks[b].dependencies.clone()))
                .collect()
        };
        for (b, dependencies) in downstream {
            // The transition to zero happens exactly once, so the task is
            // submitted exactly once.
            if dependencies.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.submit(b);
            }
        }
    }
}

/// Sequences the concurrent execution of tasks with arbitrary key conflicts
/// discovered on the fly. Conflicting tasks execute in the order they were
/// enqueued; independent tasks execute immediately.
pub struct Executor<E> {
    inner: Arc<Inner<E>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<E: Send + 'static> Executor<E> {
    /// `items` hints the number of [`run`](Self::run) calls and sizes the
    /// ready queue; `concurrency` fixes the worker thread count.
    pub fn new(items: usize, concurrency: usize, metrics: Arc<Metrics>) -> Self {
        let (ready_tx, ready_rx) = bounded(items.max(1));
        let (stop_tx, stop_rx) = bounded(1);
        let inner = Arc::new(Inner {
            graph: Mutex::new(Graph {
                tasks: Vec::with_capacity(items),
                nodes: AHashMap::with_capacity(items * 2),
                completed: 0,
                done: false,
            }),
            ready_tx: Mutex::new(Some(ready_tx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx,
            error: Mutex::new(None),
            metrics,
        });
        let workers = (0..concurrency.max(1))
            .map(|_| {
                let inner = inner.clone();
                let ready_rx = ready_rx.clone();
                thread::spawn(move || inner.run_worker(&ready_rx))
            })
            .collect();
        Self { inner, workers }
    }

    /// Enqueue `f` to execute after every previously enqueued task with a
    /// conflicting key set has finished.
    pub fn run(&self, keys: Keys, f: impl FnOnce() -> Result<(), E> + Send + 'static) {
        let mut guard = self.inner.graph.lock();
        let graph = &mut *guard;
        let id = graph.tasks.len();
        graph.tasks.push(TaskState {
            f: Some(Box::new(f)),
            blocking: AHashSet::new(),
            dependencies: Arc::new(AtomicI64::new(0)),
            executed: false,
        });

        let mut dependencies = 0i64;
        for (key, permissions) in keys.iter() {
            let claims_write = permissions.is_allocate_write();
            let blockers: Vec<usize> = match graph.nodes.get(key.as_slice()) {
                None => Vec::new(),
                Some(node) if claims_write => {
                    if node.readers.is_empty() {
                        node.last_writer
                            .filter(|w| !graph.tasks[*w].executed)
                            .into_iter()
                            .collect()
                    } else {
                        node.readers
                            .iter()
                            .copied()
                            .filter(|r| !graph.tasks[*r].executed)
                            .collect()
                    }
                }
                Some(node) => node
                    .last_writer
                    .filter(|w| !graph.tasks[*w].executed)
                    .into_iter()
                    .collect(),
            };

            let node = graph.nodes.entry(key.clone()).or_default();
            if claims_write {
                node.last_writer = Some(id);
                node.readers.clear();
            } else {
                node.readers.push(id);
            }

            for blocker in blockers {
                if graph.tasks[blocker].blocking.insert(id) {
                    dependencies += 1;
                }
            }
        }

        if dependencies == 0 {
            drop(guard);
            self.inner.metrics.executor_executable.inc();
            self.inner.submit(id);
            return;
        }
        // Publish the count before releasing the lock: completions collect
        // their blocking sets under the same lock, so every edge recorded
        // above is decremented exactly once.
        graph.tasks[id].dependencies.store(dependencies, Ordering::Release);
        drop(guard);
        self.inner.metrics.executor_blocked.inc();
    }

    /// Latches [`ExecutorError::Stopped`] and drains the workers. Queued
    /// tasks that have not started are abandoned.
    pub fn stop(&self) {
        self.inner.latch(ExecutorError::Stopped);
    }

    /// Closed on [`stop`](Self::stop) or the first task error; tasks blocked
    /// on external events select on this to observe cancellation.
    pub fn stop_signal(&self) -> Receiver<()> {
        self.inner.stop_rx.clone()
    }

    /// Blocks until every enqueued task has executed, returning the first
    /// error. No [`run`](Self::run) calls are permitted afterwards.
    pub fn wait(mut self) -> Result<(), ExecutorError<E>> {
        {
            let mut graph = self.inner.graph.lock();
            graph.done = true;
            if graph.completed == graph.tasks.len() {
                self.inner.ready_tx.lock().take();
            }
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        match self.inner.error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
