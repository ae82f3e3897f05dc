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

//! Record arena
//!
//! Container-owned slot storage for records. Indexes refer to records by
//! small integer slot ids instead of raw pointers, which makes deferred
//! reclamation a free-list return and makes stale handles detectable: a
//! freed slot keeps its version counter (bumped) and regains the invalid
//! marker, so any transaction still holding an observation of the old
//! record fails validation instead of reading recycled state.
//!
//! # Lock design
//!
//! One RwLock guards the slot vector; the free list sits behind a separate
//! mutex so reclamation does not touch the read path. Slot version words
//! and chain links are atomics, so structural walks run under the read
//! guard concurrently with other readers and with chain relinks. The
//! transactional interlocks live entirely in the version words; the guard
//! only keeps slot storage memory-safe.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::stm::version::{VersionWord, COUNTER_STEP, FLAG_MASK, USER_BIT};

/// Null slot / node id.
pub(crate) const NIL: u32 = u32::MAX;

/// One record slot.
pub(crate) struct Slot<K, V> {
    /// Record version word. The invalid (user) bit marks a speculative
    /// insert that has not committed.
    pub version: VersionWord,
    /// Set by a committed delete, before the version bump that publishes
    /// it.
    pub deleted: AtomicBool,
    /// Intrusive chain link (unordered index buckets).
    pub next: AtomicU32,
    pub key: K,
    pub value: V,
}

/// Arena of record slots with epoch-deferred reuse.
pub(crate) struct Arena<K, V> {
    slots: RwLock<Vec<Slot<K, V>>>,
    free: Mutex<Vec<u32>>,
}

impl<K, V> Arena<K, V> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocate a slot for a record. Invalid records carry the user bit
    /// until commit install clears it. Fresh slots start at counter zero;
    /// reused slots continue from their bumped counter so version
    /// monotonicity holds per slot across reuse.
    pub fn alloc(&self, key: K, value: V, valid: bool) -> u32 {
        let reuse = self.free.lock().pop();
        let mut slots = self.slots.write();
        let invalid_bit = if valid { 0 } else { USER_BIT };
        match reuse {
            Some(idx) => {
                let slot = &mut slots[idx as usize];
                let counter = slot.version.snapshot() & !FLAG_MASK;
                slot.version = VersionWord::new(counter | invalid_bit);
                slot.deleted = AtomicBool::new(false);
                slot.next = AtomicU32::new(NIL);
                slot.key = key;
                slot.value = value;
                idx
            }
            None => {
                let idx = slots.len() as u32;
                slots.push(Slot {
                    version: VersionWord::new(invalid_bit),
                    deleted: AtomicBool::new(false),
                    next: AtomicU32::new(NIL),
                    key,
                    value,
                });
                idx
            }
        }
    }

    /// Return an unlinked slot to the free list. Only reachable through
    /// the RCU queue, after the safe epoch has passed the unlink. The
    /// counter bump plus the invalid marker make any stale observation of
    /// the old record fail validation.
    pub fn free_slot(&self, idx: u32) {
        {
            let slots = self.slots.read();
            let slot = &slots[idx as usize];
            let v = slot.version.lock();
            slot.version
                .unlock_install(((v & !FLAG_MASK) + COUNTER_STEP) | USER_BIT);
            slot.next.store(NIL, Ordering::Release);
        }
        self.free.lock().push(idx);
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, Vec<Slot<K, V>>> {
        self.slots.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<Slot<K, V>>> {
        self.slots.write()
    }

    /// Slots currently on the free list.
    #[cfg(test)]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}
