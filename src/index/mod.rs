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

//! Transactional indexing containers
//!
//! - [`hash`] - chained hash table with per-bucket version interlocks
//! - [`ordered`] - tree of fan-out-limited leaves with per-node versions
//!
//! Both store records in a slot [`arena`] and implement the
//! [`crate::stm::StmObject`] commit callbacks.

pub(crate) mod arena;
pub mod hash;
pub mod ordered;

pub use hash::{HashIndexConfig, UnorderedIndex};
pub use ordered::{OrderedIndex, OrderedIndexConfig};
