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

//! Transaction descriptor
//!
//! Per-thread record of everything a transaction has touched: an
//! insertion-ordered item array with a hash lookup by item key. Read-set
//! membership is an item with an observed version; write-set membership is
//! an item with a staged write. Items are created lazily by container
//! operations and consumed by the commit state machine in
//! [`crate::stm::engine`].

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::core::Epoch;
use crate::stm::item::{ItemKey, TxnItem};
use crate::stm::version::{COUNTER_STEP, FLAG_MASK};

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// No transaction in flight on this descriptor.
    Idle,
    /// Operations may append to the read and write sets.
    Active,
    /// Commit phases are running.
    Committing,
    /// Commit finished; changes are visible.
    Committed,
    /// Rolled back; speculative state has been cleaned up.
    Aborted,
}

/// Per-thread transaction descriptor, reused across transactions.
pub struct Transaction {
    pub(crate) items: Vec<TxnItem>,
    lookup: FxHashMap<ItemKey, usize>,
    pub(crate) state: TxnState,
    /// Epoch observed when the transaction began.
    pub(crate) epoch: Epoch,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        Self {
            items: Vec::new(),
            lookup: FxHashMap::default(),
            state: TxnState::Idle,
            epoch: 0,
        }
    }

    /// Reset for a fresh transaction, keeping allocations.
    pub(crate) fn begin(&mut self, epoch: Epoch) {
        self.items.clear();
        self.lookup.clear();
        self.state = TxnState::Active;
        self.epoch = epoch;
    }

    #[inline]
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Number of items touched so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find or create the item for an entity.
    pub(crate) fn item(&mut self, key: ItemKey) -> &mut TxnItem {
        debug_assert_eq!(self.state, TxnState::Active);
        let idx = match self.lookup.get(&key) {
            Some(&i) => i,
            None => {
                let i = self.items.len();
                self.items.push(TxnItem::new(key));
                self.lookup.insert(key, i);
                i
            }
        };
        &mut self.items[idx]
    }

    /// Look up an existing item without creating one.
    pub(crate) fn find_item(&mut self, key: ItemKey) -> Option<&mut TxnItem> {
        let idx = *self.lookup.get(&key)?;
        Some(&mut self.items[idx])
    }

    /// Indices of write-set items, sorted by item key. The total order
    /// across transactions is what makes the commit lock phase
    /// deadlock-free.
    pub(crate) fn write_indices_sorted(&self) -> SmallVec<[usize; 16]> {
        let mut idx: SmallVec<[usize; 16]> = (0..self.items.len())
            .filter(|&i| self.items[i].has_write)
            .collect();
        idx.sort_unstable_by_key(|&i| self.items[i].key);
        idx
    }

    /// Allocate the commit tid: one counter step beyond both the thread's
    /// previous commit tid and every version observed by this transaction,
    /// with all flag bits clear.
    pub(crate) fn allocate_commit_tid(&self, last_commit_tid: u64) -> u64 {
        let mut max = last_commit_tid & !FLAG_MASK;
        for item in &self.items {
            if let Some(v) = item.read_version {
                max = max.max(v & !FLAG_MASK);
            }
            if let Some(v) = item.locked_version {
                max = max.max(v & !FLAG_MASK);
            }
        }
        max + COUNTER_STEP
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stm::version::NONOPAQUE_BIT;

    #[test]
    fn test_item_lookup_is_stable() {
        let mut txn = Transaction::new();
        txn.begin(1);
        let key = ItemKey::Record { table: 0, slot: 7 };
        txn.item(key).observe_version(8);
        txn.item(ItemKey::Bucket { table: 0, bucket: 1 });
        assert_eq!(txn.len(), 2);
        // Same key resolves to the same item.
        assert_eq!(txn.item(key).read_version, Some(8));
        assert_eq!(txn.len(), 2);
    }

    #[test]
    fn test_begin_resets_state() {
        let mut txn = Transaction::new();
        txn.begin(1);
        txn.item(ItemKey::Record { table: 0, slot: 0 })
            .set_write_intent();
        txn.begin(2);
        assert!(txn.is_empty());
        assert_eq!(txn.state(), TxnState::Active);
        assert_eq!(txn.epoch, 2);
    }

    #[test]
    fn test_write_indices_sorted_by_owner_and_key() {
        let mut txn = Transaction::new();
        txn.begin(1);
        txn.item(ItemKey::Record { table: 1, slot: 5 })
            .set_write_intent();
        txn.item(ItemKey::Record { table: 0, slot: 9 })
            .set_write_intent();
        txn.item(ItemKey::Record { table: 0, slot: 2 })
            .set_write_intent();
        // A read-only item does not join the write set.
        txn.item(ItemKey::Bucket { table: 0, bucket: 0 })
            .observe_version(8);
        let order: Vec<ItemKey> = txn
            .write_indices_sorted()
            .iter()
            .map(|&i| txn.items[i].key)
            .collect();
        assert_eq!(
            order,
            vec![
                ItemKey::Record { table: 0, slot: 2 },
                ItemKey::Record { table: 0, slot: 9 },
                ItemKey::Record { table: 1, slot: 5 },
            ]
        );
    }

    #[test]
    fn test_commit_tid_exceeds_observations() {
        let mut txn = Transaction::new();
        txn.begin(1);
        txn.item(ItemKey::Record { table: 0, slot: 0 })
            .observe_version(5 * COUNTER_STEP | NONOPAQUE_BIT);
        let tid = txn.allocate_commit_tid(2 * COUNTER_STEP);
        assert_eq!(tid, 6 * COUNTER_STEP);
        // Flag bits never leak into a tid.
        assert_eq!(tid & FLAG_MASK, 0);

        // The thread's own tid sequence dominates when it is larger.
        let tid2 = txn.allocate_commit_tid(9 * COUNTER_STEP);
        assert_eq!(tid2, 10 * COUNTER_STEP);
    }
}
