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

//! Global epoch clock
//!
//! A monotonically advancing counter plus a registry of per-thread observed
//! epochs. A thread publishes the epoch it saw when its transaction began;
//! the safe epoch is the minimum over all live, non-quiescent threads.
//! Reclamation deferred at epoch `e` may fire only once the safe epoch
//! exceeds `e`.
//!
//! The clock does not run itself: advancing is driven by the transaction
//! runtime (once per commit) or by the embedding application on its own
//! cadence.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::Epoch;

/// Observed-epoch value of a thread with no transaction in flight.
const EPOCH_QUIESCENT: u64 = u64::MAX;

/// Per-thread epoch publication slot.
pub(crate) struct ThreadSlot {
    pub(crate) id: u32,
    /// Epoch observed at transaction begin; EPOCH_QUIESCENT between
    /// transactions.
    observed: AtomicU64,
    live: AtomicBool,
}

impl ThreadSlot {
    #[inline]
    pub(crate) fn observe(&self, epoch: Epoch) {
        self.observed.store(epoch, Ordering::Release);
    }

    #[inline]
    pub(crate) fn quiesce(&self) {
        self.observed.store(EPOCH_QUIESCENT, Ordering::Release);
    }

    #[inline]
    pub(crate) fn retire(&self) {
        self.live.store(false, Ordering::Release);
        self.quiesce();
    }
}

/// The global epoch clock and thread registry.
pub struct EpochClock {
    global: AtomicU64,
    slots: Mutex<Vec<Arc<ThreadSlot>>>,
    next_thread_id: AtomicU64,
}

impl EpochClock {
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
            next_thread_id: AtomicU64::new(0),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn current(&self) -> Epoch {
        self.global.load(Ordering::Acquire)
    }

    /// Advance the global epoch, returning the new value.
    #[inline]
    pub fn advance(&self) -> Epoch {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The minimum epoch any live thread may still be operating in. With
    /// every thread quiescent this is the current global epoch.
    pub fn safe_epoch(&self) -> Epoch {
        let mut safe = self.current();
        for slot in self.slots.lock().iter() {
            if !slot.live.load(Ordering::Acquire) {
                continue;
            }
            let observed = slot.observed.load(Ordering::Acquire);
            if observed != EPOCH_QUIESCENT && observed < safe {
                safe = observed;
            }
        }
        safe
    }

    /// The highest epoch whose deferred callbacks may fire now.
    #[inline]
    pub fn reclaim_bound(&self) -> Epoch {
        self.safe_epoch().saturating_sub(1)
    }

    pub(crate) fn register_slot(&self) -> Arc<ThreadSlot> {
        let slot = Arc::new(ThreadSlot {
            id: self.next_thread_id.fetch_add(1, Ordering::AcqRel) as u32,
            observed: AtomicU64::new(EPOCH_QUIESCENT),
            live: AtomicBool::new(true),
        });
        self.slots.lock().push(Arc::clone(&slot));
        slot
    }

    /// Drop retired slots so a long-lived clock does not accumulate them.
    pub(crate) fn prune_retired(&self) {
        self.slots
            .lock()
            .retain(|s| s.live.load(Ordering::Acquire));
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let clock = EpochClock::new();
        let e0 = clock.current();
        let e1 = clock.advance();
        let e2 = clock.advance();
        assert!(e0 < e1 && e1 < e2);
        assert_eq!(clock.current(), e2);
    }

    #[test]
    fn test_safe_epoch_tracks_slowest_thread() {
        let clock = EpochClock::new();
        let a = clock.register_slot();
        let b = clock.register_slot();
        assert_ne!(a.id, b.id);

        clock.advance(); // epoch 2
        a.observe(2);
        clock.advance(); // epoch 3
        b.observe(3);
        assert_eq!(clock.safe_epoch(), 2);

        a.quiesce();
        assert_eq!(clock.safe_epoch(), 3);

        b.quiesce();
        assert_eq!(clock.safe_epoch(), clock.current());
    }

    #[test]
    fn test_retired_threads_do_not_hold_the_epoch() {
        let clock = EpochClock::new();
        let a = clock.register_slot();
        clock.advance();
        a.observe(1);
        assert_eq!(clock.safe_epoch(), 1);
        a.retire();
        assert_eq!(clock.safe_epoch(), clock.current());
        clock.prune_retired();
        assert_eq!(clock.slots.lock().len(), 0);
    }

    #[test]
    fn test_reclaim_bound_trails_safe_epoch() {
        let clock = EpochClock::new();
        let a = clock.register_slot();
        clock.advance();
        clock.advance(); // epoch 3
        a.observe(3);
        assert_eq!(clock.safe_epoch(), 3);
        assert_eq!(clock.reclaim_bound(), 2);
    }
}
