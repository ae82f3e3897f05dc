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

//! Packed atomic version words
//!
//! A version word is a 64-bit atomic integer carrying the per-entity lock,
//! a non-opaque marker, one user bit, and a monotonic counter:
//!
//! ```text
//!  63 ................................ 3 | 2    | 1         | 0
//!  counter (step = 8)                    | USER | NONOPAQUE | LOCK
//! ```
//!
//! The counter strictly increases across every committing write to the
//! entity, so an unchanged counter proves the entity was not modified
//! between an observation and commit-time validation.
//!
//! Three validation policies share this layout (see [`VersionPolicy`]):
//! opaque observation aborts on a locked word, non-opaque observation
//! tolerates it and revalidates at commit, and lock-coupled writes take the
//! lock at the first write intent and hold it to commit.
//!
//! Memory ordering is the hot path of the whole protocol and is explicit
//! everywhere: snapshots are acquire loads, publication is a release store,
//! lock acquisition is an acquire-release CAS.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock bit: the entity is being installed or structurally mutated.
pub const LOCK_BIT: u64 = 1 << 0;

/// Non-opaque bit: the counter is a local change count, not a commit tid.
pub const NONOPAQUE_BIT: u64 = 1 << 1;

/// User bit. Containers use it as the "invalid, not yet committed" marker
/// on freshly inserted records.
pub const USER_BIT: u64 = 1 << 2;

/// Counter increment step; everything below is flag space.
pub const COUNTER_STEP: u64 = 1 << 3;

/// Mask of all flag bits below the counter.
pub const FLAG_MASK: u64 = COUNTER_STEP - 1;

/// Bound on spin attempts when acquiring a record lock at commit time.
/// Bucket and node locks protect short critical sections and spin
/// unboundedly instead.
pub(crate) const LOCK_SPIN_BOUND: u32 = 64;

/// Validation policy applied by observations and write intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionPolicy {
    /// Observing a locked word is an immediate abort; committed state is
    /// the only state a reader can ever act on.
    #[default]
    Opaque,
    /// Locked snapshots may be observed; the commit-time check catches any
    /// interleaved install.
    Nonopaque,
    /// Write intents acquire the record lock eagerly and hold it until
    /// commit; reads behave as non-opaque.
    LockCoupled,
}

/// Exponential backoff for version-word spin loops.
struct Backoff {
    count: u32,
}

impl Backoff {
    #[inline(always)]
    const fn new() -> Self {
        Self { count: 0 }
    }

    /// Spin `count + 1` pause iterations, then double the count (capped).
    #[inline]
    fn spin(&mut self) {
        for _ in 0..=self.count {
            std::hint::spin_loop();
        }
        self.count = ((self.count << 1) | 1) & 15;
    }
}

/// Whether a version word value carries the lock bit.
#[inline(always)]
pub fn is_locked(v: u64) -> bool {
    v & LOCK_BIT != 0
}

/// Version value with the lock bit cleared.
#[inline(always)]
pub fn unlocked(v: u64) -> u64 {
    v & !LOCK_BIT
}

/// Whether a record version value carries the invalid marker.
#[inline(always)]
pub fn is_invalid(v: u64) -> bool {
    v & USER_BIT != 0
}

/// A packed atomic version word.
pub struct VersionWord(AtomicU64);

impl VersionWord {
    /// Create a word with the given initial value. Records are published
    /// with a zero counter; flag bits are the caller's business.
    #[inline]
    pub const fn new(v: u64) -> Self {
        Self(AtomicU64::new(v))
    }

    /// Atomic load with acquire ordering, flags included.
    #[inline(always)]
    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Attempt one lock acquisition. Returns the pre-lock value on success.
    ///
    /// The CAS succeeds only against the exact snapshot taken here, so the
    /// counter is guaranteed unchanged between snapshot and acquisition.
    #[inline]
    pub fn try_lock(&self) -> Option<u64> {
        let v = self.snapshot();
        if is_locked(v) {
            return None;
        }
        self.0
            .compare_exchange(v, v | LOCK_BIT, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
    }

    /// Bounded lock acquisition with backoff. Returns the pre-lock value,
    /// or `None` once the spin budget is exhausted.
    pub fn try_lock_bounded(&self) -> Option<u64> {
        let mut backoff = Backoff::new();
        for _ in 0..LOCK_SPIN_BOUND {
            if let Some(prev) = self.try_lock() {
                return Some(prev);
            }
            backoff.spin();
        }
        None
    }

    /// Unbounded spin acquisition. Only for bucket and node locks, whose
    /// critical sections never block. Returns the pre-lock value.
    pub fn lock(&self) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            if let Some(prev) = self.try_lock() {
                return prev;
            }
            backoff.spin();
        }
    }

    /// Release the lock without changing the counter.
    ///
    /// Precondition: the caller owns the lock.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(is_locked(self.snapshot()));
        self.0.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    /// Publish a new value and release the lock in one release store.
    ///
    /// Precondition: the caller owns the lock and `new` has the lock bit
    /// clear.
    #[inline]
    pub fn unlock_install(&self, new: u64) {
        debug_assert!(is_locked(self.snapshot()));
        debug_assert!(!is_locked(new));
        self.0.store(new, Ordering::Release);
    }

    /// Bump the counter while the word is locked. Structural bucket
    /// changes live in non-opaque space, so the non-opaque bit is set even
    /// if an earlier opaque install had promoted the word to a commit tid.
    #[inline]
    pub fn inc_nonopaque(&self) {
        let v = self.snapshot();
        debug_assert!(is_locked(v));
        self.0
            .store((v + COUNTER_STEP) | NONOPAQUE_BIT, Ordering::Release);
    }

    /// Commit-time validation of an observed snapshot.
    ///
    /// Passes iff the counter and flag bits (lock excluded) are unchanged
    /// and the word is either unlocked or locked by the validating
    /// transaction itself.
    #[inline]
    pub fn check(&self, observed: u64, locked_by_me: bool) -> bool {
        let cur = self.snapshot();
        if unlocked(cur) != unlocked(observed) {
            return false;
        }
        !is_locked(cur) || locked_by_me
    }
}

impl std::fmt::Debug for VersionWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.snapshot();
        f.debug_struct("VersionWord")
            .field("counter", &(v & !FLAG_MASK))
            .field("locked", &is_locked(v))
            .field("nonopaque", &(v & NONOPAQUE_BIT != 0))
            .field("user", &(v & USER_BIT != 0))
            .finish()
    }
}

// =============================================================================
// Node versions (ordered index)
// =============================================================================

/// Lock bit of a node version.
pub const NV_LOCK_BIT: u64 = 1 << 0;
/// The node is having an entry inserted.
pub const NV_INSERTING_BIT: u64 = 1 << 1;
/// The node is being split.
pub const NV_SPLITTING_BIT: u64 = 1 << 2;
/// Either mid-mutation marker.
pub const NV_DIRTY_MASK: u64 = NV_INSERTING_BIT | NV_SPLITTING_BIT;
/// Node version counter step.
pub const NV_STEP: u64 = 1 << 3;

/// Version word of an ordered-index node.
///
/// Same discipline as [`VersionWord`], with two extra bits marking what kind
/// of structural change is in flight. The word is written only by the
/// node's current mutator but read lock-free by everyone else: commit-time
/// validators and descending lookups see the LOCK and dirty bits of an
/// in-flight mutation and treat the node as changed. Any completed insert
/// or split bumps the counter, so an internode observation taken before
/// the change fails validation after it.
pub struct NodeVersion(AtomicU64);

impl NodeVersion {
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Acquire-ordered load.
    #[inline(always)]
    pub fn snapshot(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Spin-acquire the node lock. Returns the pre-lock value.
    pub fn lock(&self) -> u64 {
        let mut backoff = Backoff::new();
        loop {
            let v = self.snapshot();
            if v & NV_LOCK_BIT == 0
                && self
                    .0
                    .compare_exchange(v, v | NV_LOCK_BIT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return v;
            }
            backoff.spin();
        }
    }

    /// Mark an in-flight entry insert. Precondition: locked.
    #[inline]
    pub fn mark_inserting(&self) {
        let v = self.snapshot();
        debug_assert!(v & NV_LOCK_BIT != 0);
        self.0.store(v | NV_INSERTING_BIT, Ordering::Release);
    }

    /// Mark an in-flight split. Precondition: locked.
    #[inline]
    pub fn mark_splitting(&self) {
        let v = self.snapshot();
        debug_assert!(v & NV_LOCK_BIT != 0);
        self.0.store(v | NV_SPLITTING_BIT, Ordering::Release);
    }

    /// Release the lock, clearing transient bits and bumping the counter if
    /// any mutation marker was set. Returns the published value.
    #[inline]
    pub fn unlock(&self) -> u64 {
        let v = self.snapshot();
        debug_assert!(v & NV_LOCK_BIT != 0);
        let changed = v & NV_DIRTY_MASK != 0;
        let mut new = v & !(NV_LOCK_BIT | NV_DIRTY_MASK);
        if changed {
            new += NV_STEP;
        }
        self.0.store(new, Ordering::Release);
        new
    }

    /// Commit-time validation. A locked or mid-mutation node fails: the
    /// observation cannot be proven stable across the commit point.
    #[inline]
    pub fn check(&self, observed: u64) -> bool {
        self.snapshot() == observed
    }
}

impl std::fmt::Debug for NodeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let v = self.snapshot();
        f.debug_struct("NodeVersion")
            .field("counter", &(v >> 3))
            .field("locked", &(v & NV_LOCK_BIT != 0))
            .field("inserting", &(v & NV_INSERTING_BIT != 0))
            .field("splitting", &(v & NV_SPLITTING_BIT != 0))
            .finish()
    }
}
