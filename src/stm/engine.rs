// Copyright 2025 Occlite Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transaction engine
//!
//! The engine owns the epoch clock and the registry of containers, runs the
//! commit state machine, and provides the retry scope. Containers plug in
//! through [`StmObject`]: the engine walks a transaction's items and
//! dispatches lock / check / install / unlock / cleanup to each item's
//! owner, which matches on the item key variant.
//!
//! # Commit protocol
//!
//! 1. Sort write items by (owner, key) and lock each record.
//! 2. Allocate the commit tid.
//! 3. Validate every read-set observation.
//! 4. Install write items with the commit tid (release-ordered publication).
//! 5. Clean up and release; failures at any step roll back in reverse.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::core::{AbortReason, Epoch, Error, Result, TableId};
use crate::stm::epoch::{EpochClock, ThreadSlot};
use crate::stm::item::TxnItem;
use crate::stm::rcu::RcuSet;
use crate::stm::transaction::{Transaction, TxnState};

/// Commit-time callbacks a container implements for the items it owns.
///
/// Each method receives an item whose key names an entity of this
/// container; the container switches on the key variant.
pub trait StmObject: Send + Sync {
    /// Acquire the record lock for a write item. Returning false aborts
    /// the commit with lock contention.
    fn lock_item(&self, item: &mut TxnItem) -> bool;

    /// Validate a read-set observation against the entity's current
    /// version.
    fn check_item(&self, item: &TxnItem) -> bool;

    /// Publish a write item under the given commit tid. The record lock is
    /// held on entry and released by the publication itself.
    fn install_item(&self, item: &mut TxnItem, commit_tid: u64);

    /// Release a lock still held for an item (abort path).
    fn unlock_item(&self, item: &mut TxnItem);

    /// Post-commit / post-abort structural cleanup: unlink records that
    /// are gone (committed delete, aborted insert) and defer their slot
    /// reclamation through the thread's RCU set at the given epoch.
    fn cleanup_item(&self, item: &mut TxnItem, committed: bool, rcu: &mut RcuSet, epoch: Epoch);
}

/// Engine tunables.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Attempt bound for the retry runner.
    pub max_retries: u32,
    /// Entry capacity of each RCU group.
    pub rcu_group_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 64,
            rcu_group_capacity: 256,
        }
    }
}

/// Outcome of a single transaction attempt.
pub enum TxnOutcome<T> {
    /// The attempt committed.
    Committed(T),
    /// The attempt aborted for a retryable reason.
    AbortRetry,
    /// The attempt failed for a reason retrying cannot fix.
    AbortFinal(Error),
}

/// The transaction engine.
pub struct Engine {
    clock: Arc<EpochClock>,
    tables: RwLock<Vec<Arc<dyn StmObject>>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            clock: Arc::new(EpochClock::new()),
            tables: RwLock::new(Vec::new()),
            config,
        }
    }

    /// The global epoch clock, for applications driving their own advance
    /// cadence.
    #[inline]
    pub fn epoch_clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Register a container; called by index constructors. The closure
    /// receives the assigned table id and builds the container with it.
    pub(crate) fn attach_with<T: StmObject + 'static>(
        &self,
        make: impl FnOnce(TableId) -> Arc<T>,
    ) -> Arc<T> {
        let mut tables = self.tables.write();
        let id = tables.len() as TableId;
        let table = make(id);
        tables.push(Arc::clone(&table) as Arc<dyn StmObject>);
        table
    }

    #[inline]
    fn table(&self, id: TableId) -> Arc<dyn StmObject> {
        Arc::clone(&self.tables.read()[id as usize])
    }

    /// One-time per-thread registration. The returned context carries the
    /// thread's descriptor, RCU set, and epoch slot; dropping it
    /// deregisters the thread and drains its deferred reclamations.
    pub fn register_thread(&self) -> ThreadContext {
        let slot = self.clock.register_slot();
        let id = slot.id;
        debug!(thread_id = id, "thread registered");
        ThreadContext {
            slot,
            clock: Arc::clone(&self.clock),
            txn: Transaction::new(),
            rcu: RcuSet::new(self.config.rcu_group_capacity),
            last_commit_tid: 0,
        }
    }

    /// Open a transaction scope on the context.
    pub fn begin(&self, ctx: &mut ThreadContext) {
        let epoch = self.clock.current();
        ctx.slot.observe(epoch);
        ctx.txn.begin(epoch);
    }

    /// Commit the context's active transaction. On a retryable failure the
    /// transaction is fully rolled back before the error returns.
    pub fn commit(&self, ctx: &mut ThreadContext) -> Result<()> {
        if ctx.txn.state != TxnState::Active {
            return Err(Error::NoActiveTransaction);
        }
        ctx.txn.state = TxnState::Committing;

        let write_idx = ctx.txn.write_indices_sorted();

        // Phase 1: lock, in the global (owner, key) order.
        for &i in write_idx.iter() {
            let owner = self.table(ctx.txn.items[i].key.table());
            if !owner.lock_item(&mut ctx.txn.items[i]) {
                self.rollback(ctx);
                return Err(Error::abort(AbortReason::LockContention));
            }
        }
        fence(Ordering::SeqCst);

        // Phase 2: commit tid.
        let tid = ctx.txn.allocate_commit_tid(ctx.last_commit_tid);

        // Phase 3: validate the read set.
        for i in 0..ctx.txn.items.len() {
            if !ctx.txn.items[i].has_read() {
                continue;
            }
            let owner = self.table(ctx.txn.items[i].key.table());
            if !owner.check_item(&ctx.txn.items[i]) {
                self.rollback(ctx);
                return Err(Error::abort(AbortReason::ReadValidation));
            }
        }

        // Phase 4: install. Publication releases each record lock.
        for &i in write_idx.iter() {
            let owner = self.table(ctx.txn.items[i].key.table());
            owner.install_item(&mut ctx.txn.items[i], tid);
        }

        // Phase 5: cleanup, then release anything still held.
        ctx.txn.state = TxnState::Committed;
        let epoch = ctx.txn.epoch;
        for i in 0..ctx.txn.items.len() {
            let owner = self.table(ctx.txn.items[i].key.table());
            owner.cleanup_item(&mut ctx.txn.items[i], true, &mut ctx.rcu, epoch);
            if ctx.txn.items[i].locked {
                owner.unlock_item(&mut ctx.txn.items[i]);
            }
        }

        ctx.last_commit_tid = tid;
        trace!(tid, items = ctx.txn.len(), "transaction committed");
        self.clock.advance();
        ctx.finish();
        Ok(())
    }

    /// Abort the context's active transaction, cleaning up speculative
    /// state. A no-op if nothing is active.
    pub fn abort(&self, ctx: &mut ThreadContext) {
        if !matches!(ctx.txn.state, TxnState::Active | TxnState::Committing) {
            return;
        }
        self.rollback(ctx);
        ctx.finish();
    }

    /// Roll back: reverse-walk the write set for cleanup, release held
    /// locks, mark the descriptor aborted.
    fn rollback(&self, ctx: &mut ThreadContext) {
        let epoch = ctx.txn.epoch;
        for i in (0..ctx.txn.items.len()).rev() {
            if !ctx.txn.items[i].has_write && !ctx.txn.items[i].locked {
                continue;
            }
            let owner = self.table(ctx.txn.items[i].key.table());
            owner.cleanup_item(&mut ctx.txn.items[i], false, &mut ctx.rcu, epoch);
            if ctx.txn.items[i].locked {
                owner.unlock_item(&mut ctx.txn.items[i]);
            }
        }
        ctx.txn.state = TxnState::Aborted;
        trace!("transaction aborted");
    }

    /// Run one transaction attempt: begin, execute the body, commit.
    pub fn run_once<T>(
        &self,
        ctx: &mut ThreadContext,
        body: &mut dyn FnMut(&mut ThreadContext) -> Result<T>,
    ) -> TxnOutcome<T> {
        self.begin(ctx);
        match body(ctx) {
            Ok(value) => match self.commit(ctx) {
                Ok(()) => TxnOutcome::Committed(value),
                Err(e) if e.is_retryable() => TxnOutcome::AbortRetry,
                Err(e) => TxnOutcome::AbortFinal(e),
            },
            Err(e) => {
                self.abort(ctx);
                if e.is_retryable() {
                    TxnOutcome::AbortRetry
                } else {
                    TxnOutcome::AbortFinal(e)
                }
            }
        }
    }

    /// The transaction scope: re-invokes the closure while attempts abort
    /// for retryable reasons, up to the configured bound.
    pub fn run<T>(
        &self,
        ctx: &mut ThreadContext,
        mut body: impl FnMut(&mut ThreadContext) -> Result<T>,
    ) -> Result<T> {
        let attempts = self.config.max_retries.max(1);
        for attempt in 0..attempts {
            match self.run_once(ctx, &mut body) {
                TxnOutcome::Committed(value) => return Ok(value),
                TxnOutcome::AbortRetry => {
                    trace!(attempt, "retrying transaction");
                }
                TxnOutcome::AbortFinal(e) => return Err(e),
            }
        }
        Err(Error::RetriesExhausted { attempts })
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread execution context: thread id, epoch slot, transaction
/// descriptor, and the RCU set. Obtained once per thread from
/// [`Engine::register_thread`] and passed by mutable reference into every
/// container operation.
pub struct ThreadContext {
    pub(crate) slot: Arc<ThreadSlot>,
    clock: Arc<EpochClock>,
    pub(crate) txn: Transaction,
    pub(crate) rcu: RcuSet,
    last_commit_tid: u64,
}

impl ThreadContext {
    /// This thread's engine-assigned id.
    #[inline]
    pub fn thread_id(&self) -> u32 {
        self.slot.id
    }

    /// State of the current (or last) transaction.
    #[inline]
    pub fn txn_state(&self) -> TxnState {
        self.txn.state()
    }

    /// Epoch the active transaction observed at begin.
    #[inline]
    pub(crate) fn epoch(&self) -> Epoch {
        self.txn.epoch
    }

    /// Deferred reclamations not yet fired.
    #[inline]
    pub fn pending_reclaims(&self) -> usize {
        self.rcu.pending()
    }

    pub(crate) fn require_active(&self) -> Result<()> {
        if self.txn.state() == TxnState::Active {
            Ok(())
        } else {
            Err(Error::NoActiveTransaction)
        }
    }

    /// Leave the transaction scope: quiesce the epoch slot and drain the
    /// RCU set up to the safe bound.
    fn finish(&mut self) {
        self.slot.quiesce();
        let bound = self.clock.reclaim_bound();
        self.rcu.clean_until(bound);
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.slot.retire();
        self.clock.prune_retired();
        // Deregistration drains everything this thread still owes.
        self.rcu.clean_until(Epoch::MAX);
        debug!(thread_id = self.slot.id, "thread deregistered");
    }
}
