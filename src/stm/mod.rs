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

//! Software transactional memory core
//!
//! This module provides the protocol surface shared by all containers:
//!
//! - [`version`] - packed atomic version words and validation policies
//! - [`item`] - transaction items with tagged entity keys
//! - [`transaction`] - the per-thread descriptor
//! - [`engine`] - commit state machine, retry scope, container registry
//! - [`epoch`] - the global epoch clock
//! - [`rcu`] - the epoch-ordered deferred-reclamation queue

pub mod engine;
pub mod epoch;
pub(crate) mod glue;
pub mod item;
pub mod rcu;
pub mod transaction;
pub mod version;

pub use engine::{Engine, EngineConfig, StmObject, ThreadContext, TxnOutcome};
pub use epoch::EpochClock;
pub use item::{ItemKey, TxnItem, DELETE_FLAG, INSERT_FLAG};
pub use rcu::{RcuSet, DEFAULT_GROUP_CAPACITY};
pub use transaction::{Transaction, TxnState};
pub use version::{
    NodeVersion, VersionPolicy, VersionWord, COUNTER_STEP, LOCK_BIT, NONOPAQUE_BIT, USER_BIT,
};
