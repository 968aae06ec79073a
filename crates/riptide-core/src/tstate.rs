// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Transactional state views.
//!
//! A [`TState`] accumulates the changes of one block. Each transaction runs
//! against its own [`TStateView`]: a scoped overlay that tracks pending
//! changes, an undo log, and per-key allocate/write counters, and merges into
//! the parent on commit. Counters reflect the net deviation from the view's
//! pre-state: re-inserting the value a key started with erases both the
//! pending change and its counters.

use crate::state::{
    max_chunks, num_chunks, verify_value, Keys, Permissions, StateDatabase, StateError, StateKey,
};
use ahash::AHashMap;
use parking_lot::RwLock;

#[derive(Default)]
struct TStateInner {
    /// Keys changed by committed views; `None` marks a delete.
    changed: AHashMap<StateKey, Option<Vec<u8>>>,
    ops: usize,
}

/// Per-block accumulated state changes, shared across the executing tasks.
pub struct TState {
    inner: RwLock<TStateInner>,
}

impl TState {
    pub fn new(change_hint: usize) -> Self {
        Self {
            inner: RwLock::new(TStateInner {
                changed: AHashMap::with_capacity(change_hint),
                ops: 0,
            }),
        }
    }

    /// Total operations committed into this state.
    pub fn op_index(&self) -> usize {
        self.inner.read().ops
    }

    pub fn pending_changes(&self) -> usize {
        self.inner.read().changed.len()
    }

    /// Open a view over [`storage`] restricted to [`scope`]. The scope must
    /// be set explicitly per transaction; nothing outside it is readable or
    /// writable.
    pub fn new_view(
        &self,
        scope: Keys,
        storage: AHashMap<StateKey, Vec<u8>>,
    ) -> TStateView<'_> {
        TStateView {
            parent: self,
            scope,
            storage,
            pending: AHashMap::new(),
            ops: Vec::new(),
            allocates: AHashMap::new(),
            writes: AHashMap::new(),
            can_allocate: true,
        }
    }

    fn changed_value(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.inner.read().changed.get(key).cloned()
    }

    fn absorb(&self, pending: AHashMap<StateKey, Option<Vec<u8>>>, ops: usize) {
        let mut inner = self.inner.write();
        inner.changed.extend(pending);
        inner.ops += ops;
    }

    /// Changed keys as a database batch, values re-encoded with their chunk
    /// suffix the way the host store persists them.
    pub fn export_batch(&self) -> Vec<(StateKey, Option<Vec<u8>>)> {
        self.inner
            .read()
            .changed
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_ref().map(|payload| crate::state::encode_stored(payload.clone())),
                )
            })
            .collect()
    }

    /// Apply the accumulated changes to the host database, producing the new
    /// merkle view. Returns the number of applied operations.
    pub fn export_view(&self, db: &dyn StateDatabase) -> usize {
        db.update(self.export_batch())
    }
}

/// Undo record for one mutating call.
struct Op {
    key: StateKey,
    /// Outer `None`: the key had no pending entry before this op.
    past_pending: Option<Option<Vec<u8>>>,
    past_allocates: Option<u16>,
    past_writes: Option<u16>,
}

pub struct TStateView<'a> {
    parent: &'a TState,
    scope: Keys,
    storage: AHashMap<StateKey, Vec<u8>>,
    pending: AHashMap<StateKey, Option<Vec<u8>>>,
    ops: Vec<Op>,
    allocates: AHashMap<StateKey, u16>,
    writes: AHashMap<StateKey, u16>,
    can_allocate: bool,
}

impl<'a> TStateView<'a> {
    fn permissions(&self, key: &[u8]) -> Permissions {
        self.scope.get(key).unwrap_or(Permissions::NONE)
    }

    /// Pre-state of a key as this view observes it: parent-committed changes
    /// shadow the scoped storage.
    fn baseline(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.parent.changed_value(key) {
            Some(changed) => changed,
            None => self.storage.get(key).cloned(),
        }
    }

    fn effective(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.get(key) {
            Some(pending) => pending.clone(),
            None => self.baseline(key),
        }
    }

    pub fn get_value(&self, key: &[u8]) -> Result<Vec<u8>, StateError> {
        if !self.permissions(key).has(Permissions::READ) {
            return Err(StateError::InvalidKeyOrPermission);
        }
        self.effective(key).ok_or(StateError::NotFound)
    }

    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StateError> {
        if !self.permissions(key).has(Permissions::WRITE) {
            return Err(StateError::InvalidKeyOrPermission);
        }
        if !verify_value(key, &value) {
            return Err(StateError::InvalidKeyValue);
        }
        let current = self.effective(key);
        if current.is_none() {
            if !self.permissions(key).has(Permissions::ALLOCATE) {
                return Err(StateError::InvalidKeyOrPermission);
            }
            if !self.can_allocate {
                return Err(StateError::AllocationDisabled);
            }
        }
        if current.as_deref() == Some(value.as_slice()) {
            // Writing the value already in place is not an operation.
            return Ok(());
        }

        self.log_op(key);
        let baseline = self.baseline(key);
        match baseline {
            Some(ref base) if *base == value => {
                // Back to the pre-state: the deviation disappears.
                self.pending.remove(key);
                self.allocates.remove(key);
                self.writes.remove(key);
            }
            Some(_) => {
                self.pending.insert(key.to_vec(), Some(value.clone()));
                self.allocates.remove(key);
                self.writes.insert(key.to_vec(), num_chunks(&value));
            }
            None => {
                self.pending.insert(key.to_vec(), Some(value.clone()));
                self.allocates
                    .insert(key.to_vec(), max_chunks(key).expect("verified above"));
                self.writes.insert(key.to_vec(), num_chunks(&value));
            }
        }
        Ok(())
    }

    /// Removing an absent key is a no-op: nothing is logged and no counter
    /// moves.
    pub fn remove(&mut self, key: &[u8]) -> Result<(), StateError> {
        if !self.permissions(key).has(Permissions::WRITE) {
            return Err(StateError::InvalidKeyOrPermission);
        }
        if self.effective(key).is_none() {
            return Ok(());
        }

        self.log_op(key);
        if self.baseline(key).is_none() {
            // The key only existed as a pending allocation.
            self.pending.remove(key);
            self.allocates.remove(key);
            self.writes.remove(key);
        } else {
            self.pending.insert(key.to_vec(), None);
            self.allocates.remove(key);
            self.writes.insert(key.to_vec(), 0);
        }
        Ok(())
    }

    fn log_op(&mut self, key: &[u8]) {
        self.ops.push(Op {
            key: key.to_vec(),
            past_pending: self.pending.get(key).cloned(),
            past_allocates: self.allocates.get(key).copied(),
            past_writes: self.writes.get(key).copied(),
        });
    }

    pub fn disable_allocation(&mut self) {
        self.can_allocate = false;
    }

    pub fn enable_allocation(&mut self) {
        self.can_allocate = true;
    }

    pub fn op_index(&self) -> usize {
        self.ops.len()
    }

    pub fn pending_changes(&self) -> usize {
        self.pending.len()
    }

    /// Undo every operation at index `n` and above by replaying the log in
    /// reverse.
    pub fn rollback(&mut self, n: usize) {
        while self.ops.len() > n {
            let op = self.ops.pop().expect("len > n >= 0");
            match op.past_pending {
                Some(past) => {
                    self.pending.insert(op.key.clone(), past);
                }
                None => {
                    self.pending.remove(&op.key);
                }
            }
            match op.past_allocates {
                Some(past) => {
                    self.allocates.insert(op.key.clone(), past);
                }
                None => {
                    self.allocates.remove(&op.key);
                }
            }
            match op.past_writes {
                Some(past) => {
                    self.writes.insert(op.key.clone(), past);
                }
                None => {
                    self.writes.remove(&op.key);
                }
            }
        }
    }

    /// Net allocate/write chunk counts, billed by the fee model.
    pub fn key_operations(&self) -> (AHashMap<StateKey, u16>, AHashMap<StateKey, u16>) {
        (self.allocates.clone(), self.writes.clone())
    }

    /// Merge pending changes into the parent state in one step. The op log
    /// is discarded; there is no rollback across a commit.
    pub fn commit(self) {
        self.parent.absorb(self.pending, self.ops.len());
    }
}
