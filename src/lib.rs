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

//! # Occlite - embedded in-memory transactional indexing core
//!
//! Occlite is the transactional heart of an in-memory OLTP engine: a pair
//! of associative containers (a chained hash table and an ordered tree)
//! sharing one optimistic, multi-version STM protocol, plus an epoch-based
//! deferred-reclamation queue that makes unlinked records safe to reclaim
//! under concurrent readers.
//!
//! ## Architecture
//!
//! - Per-record **version words**: packed atomic integers carrying a lock
//!   bit, an opacity marker, an invalid marker, and a monotonic counter.
//! - **Transaction descriptors**: per-thread read and write sets validated
//!   at commit (lock, allocate tid, validate, install, cleanup).
//! - **Phantom interlocks**: absent lookups observe bucket or tree-node
//!   versions, so a concurrent insert of the missing key aborts the
//!   observer.
//! - **Epoch reclamation**: unlinked records are freed only after every
//!   registered thread has moved past the unlink epoch.
//!
//! ## Quick start
//!
//! ```rust
//! use occlite::{Engine, HashIndexConfig, UnorderedIndex};
//!
//! let engine = Engine::new();
//! let accounts = UnorderedIndex::<u64, u64>::new(&engine, HashIndexConfig::default());
//!
//! let mut ctx = engine.register_thread();
//! engine.run(&mut ctx, |ctx| {
//!     accounts.insert_row(ctx, 1, 100, false)?;
//!     let row = accounts.select_row(ctx, &1, false)?;
//!     assert_eq!(row.map(|(_, v)| v), Some(100));
//!     Ok(())
//! }).unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`core`] - errors and shared identifiers
//! - [`stm`] - version words, items, descriptors, engine, epochs, RCU
//! - [`index`] - the transactional containers

pub mod core;
pub mod index;
pub mod stm;

// Re-export the main types for convenience
pub use crate::core::{AbortReason, Epoch, Error, Result, RowId, TableId};

pub use crate::stm::{
    Engine, EngineConfig, EpochClock, ItemKey, RcuSet, ThreadContext, TxnOutcome, TxnState,
    VersionPolicy, VersionWord,
};

pub use crate::index::{HashIndexConfig, OrderedIndex, OrderedIndexConfig, UnorderedIndex};
