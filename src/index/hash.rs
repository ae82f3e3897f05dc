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

//! Unordered transactional index
//!
//! A chained hash table over an arena of record slots, with a version word
//! per bucket. The bucket version is the phantom interlock: a transaction
//! that looks up an absent key observes the bucket version, and any insert
//! into that bucket bumps it under the bucket lock, so the absence is
//! revalidated at commit.
//!
//! Record-level conflicts are caught by per-record version words; the
//! chain structure itself is walked optimistically, with a full fence
//! between the bucket-version snapshot and the walk.
//!
//! Hashing uses `ahash` with fixed seeds so bucket placement is
//! deterministic across the index's lifetime.

use std::hash::Hash;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::{AbortReason, Epoch, Error, Result, RowId, TableId};
use crate::index::arena::{Arena, Slot, NIL};
use crate::stm::engine::{Engine, StmObject, ThreadContext};
use crate::stm::glue::{is_phantom, observe, observe_value, select_for_overwrite, select_for_update};
use crate::stm::item::{ItemKey, TxnItem, DELETE_FLAG, INSERT_FLAG};
use crate::stm::rcu::RcuSet;
use crate::stm::version::{
    is_invalid, unlocked, VersionPolicy, VersionWord, COUNTER_STEP, NONOPAQUE_BIT,
};

/// Fixed seeds for deterministic bucket hashing.
const HASH_SEEDS: [u64; 4] = [
    0x243f6a8885a308d3,
    0x13198a2e03707344,
    0xa4093822299f31d0,
    0x082efa98ec4e6c89,
];

/// Configuration of an unordered index.
#[derive(Debug, Clone, Copy)]
pub struct HashIndexConfig {
    /// Bucket count, fixed at construction.
    pub buckets: usize,
    /// Version validation policy for records in this index.
    pub policy: VersionPolicy,
    /// Whether a transaction's own pending writes are visible to its later
    /// reads.
    pub read_my_writes: bool,
}

impl Default for HashIndexConfig {
    fn default() -> Self {
        Self {
            buckets: 1024,
            policy: VersionPolicy::Opaque,
            read_my_writes: true,
        }
    }
}

struct Bucket {
    /// Chain head slot id, NIL when empty.
    head: AtomicU32,
    /// Bumped under the bucket lock on every structural chain change.
    version: VersionWord,
}

/// Chained hash table with transactional select / insert / update / delete.
pub struct UnorderedIndex<K, V> {
    table_id: TableId,
    config: HashIndexConfig,
    buckets: Box<[Bucket]>,
    arena: Arc<Arena<K, V>>,
    key_gen: AtomicU64,
    hasher: ahash::RandomState,
}

impl<K, V> UnorderedIndex<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create and register an unordered index with the engine.
    pub fn new(engine: &Engine, config: HashIndexConfig) -> Arc<Self> {
        assert!(config.buckets > 0, "bucket count must be nonzero");
        engine.attach_with(|table_id| {
            let buckets = (0..config.buckets)
                .map(|_| Bucket {
                    head: AtomicU32::new(NIL),
                    version: VersionWord::new(NONOPAQUE_BIT),
                })
                .collect();
            Arc::new(Self {
                table_id,
                config,
                buckets,
                arena: Arc::new(Arena::new()),
                key_gen: AtomicU64::new(0),
                hasher: ahash::RandomState::with_seeds(
                    HASH_SEEDS[0],
                    HASH_SEEDS[1],
                    HASH_SEEDS[2],
                    HASH_SEEDS[3],
                ),
            })
        })
    }

    /// Monotonically increasing key-id generator for callers that derive
    /// keys from a sequence.
    #[inline]
    pub fn gen_key(&self) -> u64 {
        self.key_gen.fetch_add(1, Ordering::AcqRel)
    }

    #[inline]
    pub fn nbuckets(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_of(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) as usize) % self.buckets.len()
    }

    /// Walk a bucket chain looking for key equality. Includes invalid and
    /// deleted records; the caller applies phantom and deletion rules.
    fn find_in_bucket(&self, slots: &[Slot<K, V>], bucket: &Bucket, key: &K) -> Option<u32> {
        let mut cur = bucket.head.load(Ordering::Acquire);
        while cur != NIL {
            let slot = &slots[cur as usize];
            if slot.key == *key {
                return Some(cur);
            }
            cur = slot.next.load(Ordering::Acquire);
        }
        None
    }

    /// Transactional point lookup.
    ///
    /// `Ok(None)` is a validated absence: the bucket version (key not
    /// present) or the record version (record deleted) is in the read set
    /// and will be revalidated at commit. With `for_update` the record
    /// joins the write set, which is the precondition for
    /// [`update_row`](Self::update_row).
    pub fn select_row(
        &self,
        ctx: &mut ThreadContext,
        key: &K,
        for_update: bool,
    ) -> Result<Option<(RowId, V)>> {
        ctx.require_active()?;
        let b = self.bucket_of(key);
        let bucket = &self.buckets[b];
        let buck_vers = bucket.version.snapshot();
        fence(Ordering::SeqCst);

        let slots = self.arena.read();
        if let Some(sid) = self.find_in_bucket(&slots, bucket, key) {
            let slot = &slots[sid as usize];
            let vsnap = slot.version.snapshot();
            let item = ctx.txn.item(ItemKey::Record {
                table: self.table_id,
                slot: sid,
            });
            if is_phantom(vsnap, item) {
                return Err(Error::abort(AbortReason::Phantom));
            }
            if self.config.read_my_writes {
                if item.has_delete() {
                    return Ok(None);
                }
                if item.has_write {
                    let value = if item.has_insert() {
                        slot.value.clone()
                    } else {
                        match item.write_ref::<V>() {
                            Some(v) => v.clone(),
                            None => slot.value.clone(),
                        }
                    };
                    return Ok(Some((RowId(sid), value)));
                }
            }
            if for_update {
                select_for_update(item, &slot.version, self.config.policy)?;
            } else {
                observe(item, &slot.version, self.config.policy)?;
            }
            // A committed delete whose unlink has not fired yet reads as
            // absent; the record observation keeps the absence stable.
            if slot.deleted.load(Ordering::Acquire) {
                return Ok(None);
            }
            Ok(Some((RowId(sid), slot.value.clone())))
        } else {
            drop(slots);
            let item = ctx.txn.item(ItemKey::Bucket {
                table: self.table_id,
                bucket: b as u32,
            });
            observe_value(item, buck_vers, self.config.policy)?;
            Ok(None)
        }
    }

    /// Stage a new value for a row previously opened with
    /// `select_row(key, true)` in the same transaction.
    pub fn update_row(&self, ctx: &mut ThreadContext, rid: RowId, new_value: V) -> Result<()> {
        ctx.require_active()?;
        let item = ctx
            .txn
            .find_item(ItemKey::Record {
                table: self.table_id,
                slot: rid.0,
            })
            .ok_or(Error::InvalidRowHandle)?;
        if !item.has_write || item.has_insert() {
            return Err(Error::InvalidRowHandle);
        }
        item.add_write(Box::new(new_value));
        Ok(())
    }

    /// Transactional insert.
    ///
    /// Returns `found`: whether a row with this key already existed. With
    /// `overwrite` an existing row is staged for replacement; without it
    /// the existing row's version is merely observed.
    pub fn insert_row(
        &self,
        ctx: &mut ThreadContext,
        key: K,
        value: V,
        overwrite: bool,
    ) -> Result<bool> {
        ctx.require_active()?;
        let b = self.bucket_of(&key);
        let bucket = &self.buckets[b];
        bucket.version.lock();

        let slots = self.arena.read();
        if let Some(sid) = self.find_in_bucket(&slots, bucket, &key) {
            bucket.version.unlock();
            let slot = &slots[sid as usize];
            let vsnap = slot.version.snapshot();
            let item = ctx.txn.item(ItemKey::Record {
                table: self.table_id,
                slot: sid,
            });
            if is_phantom(vsnap, item) {
                return Err(Error::abort(AbortReason::Phantom));
            }
            if self.config.read_my_writes && item.has_delete() {
                // Re-arm our own pending delete as a write of the new value.
                item.clear_flags(DELETE_FLAG);
                item.clear_write();
                item.add_write(Box::new(value));
                return Ok(false);
            }
            if slot.deleted.load(Ordering::Acquire) {
                // Concurrent delete installed; let the retry re-insert.
                return Err(Error::abort(AbortReason::ReadValidation));
            }
            if overwrite {
                select_for_overwrite(item, &slot.version, Box::new(value), self.config.policy)?;
                if self.config.read_my_writes && item.has_insert() {
                    // Overwriting our own speculative insert: refresh the
                    // record in place, it is what later reads return.
                    let staged = item.write_ref::<V>().cloned();
                    item.clear_write();
                    item.set_write_intent();
                    drop(slots);
                    if let Some(v) = staged {
                        self.arena.write()[sid as usize].value = v;
                    }
                }
            } else {
                observe(item, &slot.version, self.config.policy)?;
            }
            Ok(true)
        } else {
            // Splice a new invalid record at the chain head.
            drop(slots);
            let sid = self.arena.alloc(key, value, false);
            let slots = self.arena.read();
            slots[sid as usize]
                .next
                .store(bucket.head.load(Ordering::Acquire), Ordering::Release);
            let v0 = unlocked(bucket.version.snapshot());
            bucket.head.store(sid, Ordering::Release);
            bucket.version.inc_nonopaque();
            let v1 = unlocked(bucket.version.snapshot());
            bucket.version.unlock();
            drop(slots);

            // If this transaction had observed the bucket (absent lookup),
            // move the observation past our own change.
            if let Some(bitem) = ctx.txn.find_item(ItemKey::Bucket {
                table: self.table_id,
                bucket: b as u32,
            }) {
                bitem.update_read(v0, v1);
            }

            let item = ctx.txn.item(ItemKey::Record {
                table: self.table_id,
                slot: sid,
            });
            item.set_write_intent();
            item.add_flags(INSERT_FLAG);
            Ok(false)
        }
    }

    /// Transactional delete.
    ///
    /// For rows not inserted by this transaction the physical removal
    /// happens at commit; a delete of the transaction's own speculative
    /// insert unlinks it immediately.
    pub fn delete_row(&self, ctx: &mut ThreadContext, key: &K) -> Result<bool> {
        ctx.require_active()?;
        let b = self.bucket_of(key);
        let bucket = &self.buckets[b];
        let buck_vers = bucket.version.snapshot();
        fence(Ordering::SeqCst);

        let slots = self.arena.read();
        if let Some(sid) = self.find_in_bucket(&slots, bucket, key) {
            let slot = &slots[sid as usize];
            let vsnap = slot.version.snapshot();
            let item = ctx.txn.item(ItemKey::Record {
                table: self.table_id,
                slot: sid,
            });
            if is_phantom(vsnap, item) {
                return Err(Error::abort(AbortReason::Phantom));
            }
            if self.config.read_my_writes {
                if is_invalid(vsnap) && item.has_insert() {
                    // Deleting something we inserted: neutralize the item
                    // and remove the record now.
                    item.remove_read();
                    item.clear_write();
                    item.clear_flags(INSERT_FLAG | DELETE_FLAG);
                    drop(slots);
                    let (v0, v1) = self.unlink(sid);
                    let arena = Arc::clone(&self.arena);
                    let epoch = ctx.epoch();
                    ctx.rcu.defer(epoch, move || arena.free_slot(sid));
                    // Keep the key's absence stable for the rest of the
                    // transaction.
                    let bitem = ctx.txn.item(ItemKey::Bucket {
                        table: self.table_id,
                        bucket: b as u32,
                    });
                    if bitem.has_read() {
                        bitem.update_read(v0, v1);
                    } else {
                        observe_value(bitem, v1, self.config.policy)?;
                    }
                    return Ok(true);
                }
                if item.has_delete() {
                    return Ok(false);
                }
            }
            // The observation added here is what catches a change of the
            // record's deleted status at commit.
            select_for_update(item, &slot.version, self.config.policy)?;
            fence(Ordering::SeqCst);
            if slot.deleted.load(Ordering::Acquire) {
                return Err(Error::abort(AbortReason::ReadValidation));
            }
            item.add_flags(DELETE_FLAG);
            Ok(true)
        } else {
            drop(slots);
            let item = ctx.txn.item(ItemKey::Bucket {
                table: self.table_id,
                bucket: b as u32,
            });
            observe_value(item, buck_vers, self.config.policy)?;
            Ok(false)
        }
    }

    /// Non-transactional upsert under the bucket lock. For loader-phase
    /// population; bypasses the STM entirely.
    pub fn nontrans_put(&self, key: K, value: V) {
        let b = self.bucket_of(&key);
        let bucket = &self.buckets[b];
        bucket.version.lock();
        let found = {
            let slots = self.arena.read();
            self.find_in_bucket(&slots, bucket, &key)
        };
        match found {
            Some(sid) => {
                self.arena.write()[sid as usize].value = value;
            }
            None => {
                let sid = self.arena.alloc(key, value, true);
                let slots = self.arena.read();
                slots[sid as usize]
                    .next
                    .store(bucket.head.load(Ordering::Acquire), Ordering::Release);
                bucket.head.store(sid, Ordering::Release);
                bucket.version.inc_nonopaque();
            }
        }
        bucket.version.unlock();
    }

    /// Non-transactional read. Takes no bucket lock and provides no
    /// isolation against concurrent writers; only meaningful during
    /// loader-phase quiescence.
    pub fn nontrans_get(&self, key: &K) -> Option<V> {
        let b = self.bucket_of(key);
        let slots = self.arena.read();
        let sid = self.find_in_bucket(&slots, &self.buckets[b], key)?;
        let slot = &slots[sid as usize];
        if is_invalid(slot.version.snapshot()) || slot.deleted.load(Ordering::Acquire) {
            return None;
        }
        Some(slot.value.clone())
    }

    /// Unlink a record from its bucket under the bucket lock, bumping the
    /// bucket version. Returns the (pre, post) unlocked bucket versions.
    ///
    /// The bucket lock is taken before the arena guard; every writer path
    /// orders bucket before arena.
    fn unlink(&self, sid: u32) -> (u64, u64) {
        let b = {
            let slots = self.arena.read();
            self.bucket_of(&slots[sid as usize].key)
        };
        let bucket = &self.buckets[b];
        bucket.version.lock();
        let slots = self.arena.read();
        let v0 = unlocked(bucket.version.snapshot());

        let mut prev = NIL;
        let mut cur = bucket.head.load(Ordering::Acquire);
        while cur != NIL && cur != sid {
            prev = cur;
            cur = slots[cur as usize].next.load(Ordering::Acquire);
        }
        assert_eq!(cur, sid, "record to unlink is not on its bucket chain");
        let next = slots[sid as usize].next.load(Ordering::Acquire);
        if prev == NIL {
            bucket.head.store(next, Ordering::Release);
        } else {
            slots[prev as usize].next.store(next, Ordering::Release);
        }
        bucket.version.inc_nonopaque();
        let v1 = unlocked(bucket.version.snapshot());
        bucket.version.unlock();
        (v0, v1)
    }

    #[cfg(test)]
    fn bucket_version(&self, key: &K) -> u64 {
        unlocked(self.buckets[self.bucket_of(key)].version.snapshot())
    }
}

impl<K, V> StmObject for UnorderedIndex<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn lock_item(&self, item: &mut TxnItem) -> bool {
        let ItemKey::Record { slot, .. } = item.key else {
            // Bucket items are never in the write set.
            return false;
        };
        if item.locked {
            return true;
        }
        let slots = self.arena.read();
        match slots[slot as usize].version.try_lock_bounded() {
            Some(prev) => {
                item.locked = true;
                item.locked_version = Some(prev);
                true
            }
            None => false,
        }
    }

    fn check_item(&self, item: &TxnItem) -> bool {
        let Some(observed) = item.read_version else {
            return true;
        };
        match item.key {
            ItemKey::Bucket { bucket, .. } => {
                self.buckets[bucket as usize].version.check(observed, false)
            }
            ItemKey::Record { slot, .. } => {
                let slots = self.arena.read();
                slots[slot as usize].version.check(observed, item.locked)
            }
            ItemKey::Internode { .. } => false,
        }
    }

    fn install_item(&self, item: &mut TxnItem, commit_tid: u64) {
        let ItemKey::Record { slot, .. } = item.key else {
            return;
        };
        debug_assert!(item.locked);

        if item.has_delete() {
            let slots = self.arena.read();
            let s = &slots[slot as usize];
            s.deleted.store(true, Ordering::Release);
            fence(Ordering::SeqCst);
            let v = s.version.snapshot();
            s.version.unlock_install(unlocked(v) + COUNTER_STEP);
            item.locked = false;
            return;
        }

        // Updates carry a payload; inserts already hold their value in the
        // record, and a bare write intent publishes the tid alone.
        if !item.has_insert() {
            if let Some(boxed) = item.write_value.take() {
                if let Ok(v) = boxed.downcast::<V>() {
                    self.arena.write()[slot as usize].value = *v;
                }
            }
        }
        {
            let slots = self.arena.read();
            slots[slot as usize].version.unlock_install(commit_tid);
        }
        item.locked = false;

        // Opaque mode: an insert promotes a still-non-opaque bucket
        // counter to the commit tid under the bucket lock.
        if self.config.policy == VersionPolicy::Opaque && item.has_insert() {
            let b = {
                let slots = self.arena.read();
                self.bucket_of(&slots[slot as usize].key)
            };
            let bucket = &self.buckets[b];
            let v = bucket.version.lock();
            if v & NONOPAQUE_BIT != 0 {
                bucket.version.unlock_install(commit_tid);
            } else {
                bucket.version.unlock();
            }
        }
    }

    fn unlock_item(&self, item: &mut TxnItem) {
        if let ItemKey::Record { slot, .. } = item.key {
            if item.locked {
                self.arena.read()[slot as usize].version.unlock();
                item.locked = false;
            }
        }
    }

    fn cleanup_item(&self, item: &mut TxnItem, committed: bool, rcu: &mut RcuSet, epoch: Epoch) {
        let gone = if committed {
            item.has_delete()
        } else {
            item.has_insert()
        };
        if !gone {
            return;
        }
        let ItemKey::Record { slot, .. } = item.key else {
            return;
        };
        self.unlink(slot);
        let arena = Arc::clone(&self.arena);
        rcu.defer(epoch, move || arena.free_slot(slot));
    }
}
