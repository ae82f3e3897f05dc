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

//! Container-to-STM glue
//!
//! Small helpers shared by both indexes that translate container events
//! (a record was read, a key was absent, a row is about to be updated)
//! into item state under the container's version policy.

use std::any::Any;
use std::sync::atomic::{fence, Ordering};

use crate::core::{AbortReason, Error, Result};
use crate::stm::item::TxnItem;
use crate::stm::version::{is_invalid, is_locked, unlocked, VersionPolicy, VersionWord};

/// Record an observation of a version snapshot taken by the caller.
///
/// Under the opaque policy a locked snapshot is not observable: the reader
/// cannot tell which side of the in-flight install it saw.
#[inline]
pub(crate) fn observe_value(item: &mut TxnItem, v: u64, policy: VersionPolicy) -> Result<()> {
    if is_locked(v) && policy == VersionPolicy::Opaque {
        return Err(Error::abort(AbortReason::LockContention));
    }
    item.observe_version(unlocked(v));
    Ok(())
}

/// Snapshot a version word and record the observation.
#[inline]
pub(crate) fn observe(item: &mut TxnItem, vers: &VersionWord, policy: VersionPolicy) -> Result<()> {
    observe_value(item, vers.snapshot(), policy)
}

/// Open a row for update: observe its version and join the write set.
///
/// Under the lock-coupled policy the record lock is taken here and held to
/// commit; the occ policies defer locking to the commit phase.
pub(crate) fn select_for_update(
    item: &mut TxnItem,
    vers: &VersionWord,
    policy: VersionPolicy,
) -> Result<()> {
    match policy {
        VersionPolicy::LockCoupled => {
            if !item.locked {
                let prev = vers
                    .try_lock_bounded()
                    .ok_or(Error::abort(AbortReason::LockContention))?;
                item.locked = true;
                item.locked_version = Some(prev);
                item.observe_version(unlocked(prev));
            }
            item.set_write_intent();
            Ok(())
        }
        _ => {
            let v = vers.snapshot();
            fence(Ordering::SeqCst);
            observe_value(item, v, policy)?;
            item.set_write_intent();
            Ok(())
        }
    }
}

/// Stage an overwrite of a row without observing it: the caller does not
/// care what the current value is, only that the write installs.
pub(crate) fn select_for_overwrite(
    item: &mut TxnItem,
    vers: &VersionWord,
    value: Box<dyn Any + Send>,
    policy: VersionPolicy,
) -> Result<()> {
    if policy == VersionPolicy::LockCoupled && !item.locked {
        let prev = vers
            .try_lock_bounded()
            .ok_or(Error::abort(AbortReason::LockContention))?;
        item.locked = true;
        item.locked_version = Some(prev);
    }
    item.add_write(value);
    Ok(())
}

/// A record is a phantom for this transaction if it carries the invalid
/// marker and the transaction is not the one inserting it.
#[inline]
pub(crate) fn is_phantom(version_snapshot: u64, item: &TxnItem) -> bool {
    is_invalid(version_snapshot) && !item.has_insert()
}
