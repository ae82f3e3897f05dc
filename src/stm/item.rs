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

//! Transaction items
//!
//! An item is one protected entity a transaction has touched: a record, a
//! hash bucket's version, or an ordered-index node's version. The entity is
//! named by a tagged key rather than a pointer with flag bits smuggled into
//! its low bits; container dispatch is a `match` on the variant.
//!
//! An item carries a read-set observation (the version snapshot seen when
//! the entity was first read), a write-set entry (a staged value, or a bare
//! write intent for select-for-update), or both.

use std::any::Any;

use crate::core::TableId;

/// Item carries a speculative insert.
pub const INSERT_FLAG: u8 = 1 << 0;
/// Item carries a pending delete.
pub const DELETE_FLAG: u8 = 1 << 1;

/// Names the entity an item protects.
///
/// `Ord` drives commit-time lock ordering; only `Record` items are ever
/// locked, and they sort by (table, slot) across all transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemKey {
    /// A record slot in a container's arena.
    Record { table: TableId, slot: u32 },
    /// A hash bucket's version word, observed when a key was found absent.
    Bucket { table: TableId, bucket: u32 },
    /// An ordered-index node's version word.
    Internode { table: TableId, node: u32 },
}

impl ItemKey {
    /// The owning container.
    #[inline]
    pub fn table(&self) -> TableId {
        match *self {
            ItemKey::Record { table, .. }
            | ItemKey::Bucket { table, .. }
            | ItemKey::Internode { table, .. } => table,
        }
    }

    /// Whether this names a record (the only lockable entity kind).
    #[inline]
    pub fn is_record(&self) -> bool {
        matches!(self, ItemKey::Record { .. })
    }
}

/// Staged write value. The payload is type-erased because a descriptor
/// holds items for containers of different value types; each owner
/// downcasts to its own row type.
pub struct TxnItem {
    /// Entity this item protects.
    pub key: ItemKey,
    /// INSERT / DELETE flags.
    pub flags: u8,
    /// First version snapshot observed for the entity, lock bit cleared.
    pub read_version: Option<u64>,
    /// Whether the item is in the write set.
    pub has_write: bool,
    /// Staged new value, if the write carries one. A bare write intent
    /// (select-for-update with no update yet) leaves this empty.
    pub write_value: Option<Box<dyn Any + Send>>,
    /// The entity's lock is held on behalf of this item.
    pub locked: bool,
    /// Version snapshot taken when the lock was acquired.
    pub locked_version: Option<u64>,
}

impl TxnItem {
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            flags: 0,
            read_version: None,
            has_write: false,
            write_value: None,
            locked: false,
            locked_version: None,
        }
    }

    #[inline]
    pub fn has_insert(&self) -> bool {
        self.flags & INSERT_FLAG != 0
    }

    #[inline]
    pub fn has_delete(&self) -> bool {
        self.flags & DELETE_FLAG != 0
    }

    #[inline]
    pub fn has_read(&self) -> bool {
        self.read_version.is_some()
    }

    #[inline]
    pub fn add_flags(&mut self, flags: u8) {
        self.flags |= flags;
    }

    #[inline]
    pub fn clear_flags(&mut self, flags: u8) {
        self.flags &= !flags;
    }

    /// Record an observation. Only the first observation is kept: a later
    /// change relative to it is exactly what validation must detect.
    #[inline]
    pub fn observe_version(&mut self, v: u64) {
        if self.read_version.is_none() {
            self.read_version = Some(v);
        }
    }

    /// Upgrade an observation from `prev` to `next`, if and only if the
    /// recorded observation is exactly `prev`. Used when the transaction
    /// itself moved the observed version (own insert into an observed
    /// bucket or leaf). Returns whether an upgrade happened.
    #[inline]
    pub fn update_read(&mut self, prev: u64, next: u64) -> bool {
        if self.read_version == Some(prev) {
            self.read_version = Some(next);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn remove_read(&mut self) {
        self.read_version = None;
    }

    /// Join the write set without staging a value.
    #[inline]
    pub fn set_write_intent(&mut self) {
        self.has_write = true;
    }

    /// Join the write set with a staged value, replacing any earlier one.
    #[inline]
    pub fn add_write(&mut self, value: Box<dyn Any + Send>) {
        self.has_write = true;
        self.write_value = Some(value);
    }

    #[inline]
    pub fn clear_write(&mut self) {
        self.has_write = false;
        self.write_value = None;
    }

    /// Borrow the staged value as the owner's row type.
    #[inline]
    pub fn write_ref<V: 'static>(&self) -> Option<&V> {
        self.write_value.as_ref().and_then(|b| b.downcast_ref())
    }

    /// Whether the item still participates in commit at all. Items can be
    /// neutralized in place (delete of an own insert) rather than removed,
    /// keeping sibling indices stable.
    #[inline]
    pub fn is_inert(&self) -> bool {
        !self.has_write && self.read_version.is_none()
    }
}

impl std::fmt::Debug for TxnItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnItem")
            .field("key", &self.key)
            .field("flags", &self.flags)
            .field("read_version", &self.read_version)
            .field("has_write", &self.has_write)
            .field("staged", &self.write_value.is_some())
            .field("locked", &self.locked)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_key_ordering_by_table_then_slot() {
        let a = ItemKey::Record { table: 0, slot: 9 };
        let b = ItemKey::Record { table: 1, slot: 0 };
        let c = ItemKey::Record { table: 1, slot: 4 };
        assert!(a < b && b < c);
    }

    #[test]
    fn test_first_observation_wins() {
        let mut item = TxnItem::new(ItemKey::Record { table: 0, slot: 0 });
        item.observe_version(8);
        item.observe_version(16);
        assert_eq!(item.read_version, Some(8));
    }

    #[test]
    fn test_update_read_requires_exact_prev() {
        let mut item = TxnItem::new(ItemKey::Bucket { table: 0, bucket: 3 });
        item.observe_version(8);
        assert!(!item.update_read(16, 24));
        assert_eq!(item.read_version, Some(8));
        assert!(item.update_read(8, 24));
        assert_eq!(item.read_version, Some(24));
    }

    #[test]
    fn test_write_downcast() {
        let mut item = TxnItem::new(ItemKey::Record { table: 0, slot: 0 });
        item.add_write(Box::new(42u64));
        assert_eq!(item.write_ref::<u64>(), Some(&42));
        assert_eq!(item.write_ref::<String>(), None);
        item.clear_write();
        assert!(item.is_inert());
    }
}
