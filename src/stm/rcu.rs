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

//! Epoch-ordered deferred-reclamation queue
//!
//! A thread-local FIFO of callbacks tagged by the epoch at which they were
//! deferred. Entries live in a chain of fixed-capacity groups. Consecutive
//! deferrals at the same epoch are compressed: a group stores one epoch
//! marker followed by the run of actions it governs, and a new marker is
//! written only when the enqueued epoch differs from the group's most
//! recent one.
//!
//! Draining fires, in FIFO order, every action whose governing marker is at
//! or below the requested bound, and stops at the first marker beyond it.
//! The queue never decides safety: the bound is supplied by the caller.

use std::collections::VecDeque;

use crate::core::Epoch;

/// Default per-group entry capacity.
pub const DEFAULT_GROUP_CAPACITY: usize = 256;

type RcuCallback = Box<dyn FnOnce() + Send>;

enum RcuEntry {
    /// Epoch marker governing the actions that follow it.
    Mark(Epoch),
    /// Deferred action.
    Action(RcuCallback),
}

/// One fixed-capacity ring of entries.
struct RcuGroup {
    entries: VecDeque<RcuEntry>,
    capacity: usize,
    /// Most recent epoch enqueued into this group.
    epoch: Epoch,
}

impl RcuGroup {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            epoch: 0,
        }
    }

    /// Room for a marker plus an action.
    #[inline]
    fn has_room(&self) -> bool {
        self.entries.len() + 2 <= self.capacity
    }

    fn add(&mut self, epoch: Epoch, callback: RcuCallback) {
        debug_assert!(self.has_room());
        if self.entries.is_empty() || self.epoch != epoch {
            self.entries.push_back(RcuEntry::Mark(epoch));
            self.epoch = epoch;
        }
        self.entries.push_back(RcuEntry::Action(callback));
    }

    /// Fire actions governed by markers `<= max_epoch`. Returns false when
    /// a marker beyond the bound stops the walk with entries remaining.
    fn clean_until(&mut self, max_epoch: Epoch) -> bool {
        while let Some(front) = self.entries.front() {
            if let RcuEntry::Mark(e) = front {
                if *e > max_epoch {
                    return false;
                }
            }
            match self.entries.pop_front() {
                Some(RcuEntry::Action(f)) => f(),
                Some(RcuEntry::Mark(_)) | None => {}
            }
        }
        true
    }
}

impl Drop for RcuGroup {
    /// Residual actions run unconditionally: a dying queue must not leak
    /// the resources its callbacks own.
    fn drop(&mut self) {
        while let Some(entry) = self.entries.pop_front() {
            if let RcuEntry::Action(f) = entry {
                f();
            }
        }
    }
}

/// A thread-local deferred-reclamation queue.
///
/// Not `Sync`: each registered thread owns one set. Epochs passed to
/// [`defer`](RcuSet::defer) must be non-decreasing, which holds because a
/// thread defers at its currently observed epoch and epochs only advance.
pub struct RcuSet {
    /// Groups in FIFO order; the back group is the one accepting entries.
    groups: VecDeque<RcuGroup>,
    group_capacity: usize,
    /// Bound of the last completed drain.
    clean_epoch: Epoch,
}

impl RcuSet {
    pub fn new(group_capacity: usize) -> Self {
        assert!(group_capacity >= 4, "group capacity too small");
        let mut groups = VecDeque::new();
        groups.push_back(RcuGroup::new(group_capacity));
        Self {
            groups,
            group_capacity,
            clean_epoch: 0,
        }
    }

    /// Enqueue a callback against the given (current) epoch.
    pub fn defer(&mut self, epoch: Epoch, callback: impl FnOnce() + Send + 'static) {
        debug_assert!(epoch >= self.groups.back().map_or(0, |g| g.epoch));
        if self.groups.back().map_or(true, |g| !g.has_room()) {
            self.grow();
        }
        if let Some(group) = self.groups.back_mut() {
            group.add(epoch, Box::new(callback));
        }
    }

    /// Fire all callbacks whose epoch is `<= max_epoch`, in FIFO order.
    pub fn clean_until(&mut self, max_epoch: Epoch) {
        if self.clean_epoch != max_epoch {
            self.hard_clean_until(max_epoch);
        }
        self.clean_epoch = max_epoch;
    }

    /// Bound of the last completed drain.
    #[inline]
    pub fn clean_epoch(&self) -> Epoch {
        self.clean_epoch
    }

    /// Whether any deferred action is still queued.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| {
            g.entries
                .iter()
                .all(|e| matches!(e, RcuEntry::Mark(_)))
        })
    }

    /// Number of deferred actions still queued.
    pub fn pending(&self) -> usize {
        self.groups
            .iter()
            .map(|g| {
                g.entries
                    .iter()
                    .filter(|e| matches!(e, RcuEntry::Action(_)))
                    .count()
            })
            .sum()
    }

    fn grow(&mut self) {
        self.groups.push_back(RcuGroup::new(self.group_capacity));
    }

    fn hard_clean_until(&mut self, max_epoch: Epoch) {
        while let Some(front) = self.groups.front_mut() {
            if !front.clean_until(max_epoch) {
                // Stopped at a marker beyond the bound.
                return;
            }
            // Group exhausted: free it unless it is the only (current) one.
            if self.groups.len() == 1 {
                return;
            }
            self.groups.pop_front();
        }
    }
}

impl Default for RcuSet {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_CAPACITY)
    }
}
