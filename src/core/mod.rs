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

//! Core shared types: errors and small identifiers used across the crate.

pub mod error;

pub use error::{AbortReason, Error, Result};

/// Identifies a registered container within an [`crate::stm::Engine`].
pub type TableId = u32;

/// Epoch number used by the reclamation queue and the epoch clock.
pub type Epoch = u64;

/// Opaque handle to a record slot inside a container's arena.
///
/// Handles are only meaningful to the container that produced them, and only
/// for the duration of the transaction that obtained them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowId(pub(crate) u32);

impl RowId {
    /// Raw slot index, exposed for diagnostics only.
    #[inline]
    pub fn index(&self) -> u32 {
        self.0
    }
}
