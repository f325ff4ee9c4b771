//! Transaction-specific error types.
//!
//! Structured error handling for the locking and recovery subsystems using
//! `thiserror`.
//!
//! Two families live here. Lock-protocol errors are caller-facing and
//! synchronous: they are detected before any state mutation and the
//! requesting transaction may retry with a different type or abort. Recovery
//! errors are fatal: a corrupt log or a failed redo/undo aborts the restart
//! and the database refuses to open.

use std::io;

use thiserror::Error;

use crate::common::{Lsn, TransactionId};

use super::types::TransactionStatus;

/// Result type alias for transaction operations.
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Error type for the locking and recovery subsystems.
#[derive(Debug, Error)]
pub enum TransactionError {
    // =========================================================================
    // Lock-protocol errors
    // =========================================================================

    /// The transaction already holds a lock on the resource.
    #[error("Duplicate lock request: transaction {txn_id} already holds a lock on '{resource}'")]
    DuplicateLockRequest {
        txn_id: TransactionId,
        resource: String,
    },

    /// The transaction holds no lock on the resource.
    #[error("No lock held: transaction {txn_id} holds no lock on '{resource}'")]
    NoLockHeld {
        txn_id: TransactionId,
        resource: String,
    },

    /// The request violates the lock lattice or the multigranularity
    /// discipline.
    #[error("Invalid lock request: {0}")]
    InvalidLock(String),

    /// The operation is not supported on this context (readonly).
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    // =========================================================================
    // Transaction state errors
    // =========================================================================

    /// Transaction not found in the transaction table.
    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),

    /// Invalid lifecycle transition.
    #[error("Invalid state transition: transaction {txn_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        txn_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Savepoint not found.
    #[error("Savepoint '{name}' not found in transaction {txn_id}")]
    SavepointNotFound { txn_id: TransactionId, name: String },

    // =========================================================================
    // Log I/O and recovery errors
    // =========================================================================

    /// WAL write failed.
    #[error("Failed to write to WAL: {0}")]
    WalWriteError(#[source] io::Error),

    /// WAL read failed.
    #[error("Failed to read from WAL: {0}")]
    WalReadError(#[source] io::Error),

    /// Log record (de)serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// No log record lives at the given LSN.
    #[error("No log record at LSN {0}")]
    LogRecordNotFound(Lsn),

    /// The log is structurally damaged.
    #[error("Corrupt log at LSN {lsn}: {reason}")]
    CorruptLog { lsn: Lsn, reason: String },

    /// Restart recovery failed.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Redo of a record failed.
    #[error("Redo failed at LSN {lsn}: {reason}")]
    RedoFailed { lsn: Lsn, reason: String },

    /// Undo of a record failed.
    #[error("Undo failed at LSN {lsn}: {reason}")]
    UndoFailed { lsn: Lsn, reason: String },
}

impl TransactionError {
    /// Creates a duplicate lock request error.
    pub fn duplicate_lock_request(
        txn_id: TransactionId,
        resource: impl ToString,
    ) -> Self {
        TransactionError::DuplicateLockRequest {
            txn_id,
            resource: resource.to_string(),
        }
    }

    /// Creates a no-lock-held error.
    pub fn no_lock_held(txn_id: TransactionId, resource: impl ToString) -> Self {
        TransactionError::NoLockHeld {
            txn_id,
            resource: resource.to_string(),
        }
    }

    /// Creates an invalid lock error.
    pub fn invalid_lock(reason: impl Into<String>) -> Self {
        TransactionError::InvalidLock(reason.into())
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(reason: impl Into<String>) -> Self {
        TransactionError::UnsupportedOperation(reason.into())
    }

    /// Creates an invalid state transition error.
    pub fn invalid_state(
        txn_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    ) -> Self {
        TransactionError::InvalidStateTransition { txn_id, from, to }
    }

    /// Creates a savepoint not found error.
    pub fn savepoint_not_found(txn_id: TransactionId, name: impl Into<String>) -> Self {
        TransactionError::SavepointNotFound {
            txn_id,
            name: name.into(),
        }
    }

    /// Creates a corrupt log error.
    pub fn corrupt_log(lsn: Lsn, reason: impl Into<String>) -> Self {
        TransactionError::CorruptLog {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates a redo failure.
    pub fn redo_failed(lsn: Lsn, reason: impl Into<String>) -> Self {
        TransactionError::RedoFailed {
            lsn,
            reason: reason.into(),
        }
    }

    /// Creates an undo failure.
    pub fn undo_failed(lsn: Lsn, reason: impl Into<String>) -> Self {
        TransactionError::UndoFailed {
            lsn,
            reason: reason.into(),
        }
    }

    /// Returns true if this is a synchronous lock-protocol error.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            TransactionError::DuplicateLockRequest { .. }
                | TransactionError::NoLockHeld { .. }
                | TransactionError::InvalidLock(_)
                | TransactionError::UnsupportedOperation(_)
        )
    }

    /// Returns the transaction ID if this error is associated with one.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            TransactionError::DuplicateLockRequest { txn_id, .. } => Some(*txn_id),
            TransactionError::NoLockHeld { txn_id, .. } => Some(*txn_id),
            TransactionError::TransactionNotFound(id) => Some(*id),
            TransactionError::InvalidStateTransition { txn_id, .. } => Some(*txn_id),
            TransactionError::SavepointNotFound { txn_id, .. } => Some(*txn_id),
            _ => None,
        }
    }
}

impl From<io::Error> for TransactionError {
    fn from(err: io::Error) -> Self {
        TransactionError::WalWriteError(err)
    }
}

impl From<bincode::error::EncodeError> for TransactionError {
    fn from(err: bincode::error::EncodeError) -> Self {
        TransactionError::SerializationError(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for TransactionError {
    fn from(err: bincode::error::DecodeError) -> Self {
        TransactionError::SerializationError(err.to_string())
    }
}
