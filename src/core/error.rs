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

//! Error types for Occlite
//!
//! Transaction aborts are ordinary error values: a failed observation or a
//! commit-time validation failure surfaces as [`Error::TransactionAborted`]
//! and short-circuits to the enclosing retry scope via `?`. Only
//! [`Error::Internal`] indicates corrupted state and is never retried.

use thiserror::Error;

/// Result type alias for Occlite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Why a transaction had to abort.
///
/// All reasons are retryable: the enclosing retry loop may re-run the
/// transaction body from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A read-set observation no longer matches the current version.
    ReadValidation,
    /// A record, bucket, or node lock could not be acquired in time.
    LockContention,
    /// The operation touched a record inserted but not yet committed by
    /// another transaction.
    Phantom,
    /// A tree node's version moved between an observation and a structural
    /// operation that depended on it.
    NodeVersionChanged,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AbortReason::ReadValidation => "read validation failed",
            AbortReason::LockContention => "lock contention",
            AbortReason::Phantom => "phantom record",
            AbortReason::NodeVersionChanged => "node version changed",
        };
        f.write_str(s)
    }
}

/// Main error type for Occlite operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Transaction errors
    // =========================================================================
    /// Transaction was aborted and should be retried by the enclosing scope
    #[error("transaction aborted: {reason}")]
    TransactionAborted { reason: AbortReason },

    /// The retry loop gave up after the configured number of attempts
    #[error("transaction retry budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// An operation ran outside an active transaction scope
    #[error("no active transaction")]
    NoActiveTransaction,

    // =========================================================================
    // Usage errors
    // =========================================================================
    /// A row handle was used without a prior select-for-update in the same
    /// transaction
    #[error("row handle is not open for update in this transaction")]
    InvalidRowHandle,

    /// The calling thread never registered with the engine
    #[error("thread not registered with the engine")]
    ThreadNotRegistered,

    // =========================================================================
    // Fatal errors
    // =========================================================================
    /// Structural invariant violation; state is corrupted and the error is
    /// not recoverable
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Shorthand for a transaction abort with the given reason
    #[inline]
    pub fn abort(reason: AbortReason) -> Self {
        Error::TransactionAborted { reason }
    }

    /// Whether the enclosing retry scope may re-run the transaction
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransactionAborted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_is_retryable() {
        assert!(Error::abort(AbortReason::ReadValidation).is_retryable());
        assert!(Error::abort(AbortReason::Phantom).is_retryable());
        assert!(!Error::RetriesExhausted { attempts: 10 }.is_retryable());
        assert!(!Error::Internal("broken chain").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::abort(AbortReason::LockContention);
        assert_eq!(err.to_string(), "transaction aborted: lock contention");
    }
}
