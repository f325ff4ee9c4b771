// Core transaction types.
//
// This module defines the transaction status state machine and the
// `Transaction` handle shared between the lock manager (which parks and
// unparks the transaction's thread) and the recovery manager (which drives
// status transitions while logging).

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::common::TransactionId;

use super::error::{TransactionError, TransactionResult};

/// Transaction lifecycle status.
///
/// Transitions only move forward:
///
/// ```text
/// Running -> {Committing, Aborting, RecoveryAborting} -> Complete
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Actively executing operations.
    Running,
    /// Commit record written; waiting to finish.
    Committing,
    /// Abort requested during forward processing; rollback pending.
    Aborting,
    /// Loser transaction being rolled back by restart recovery.
    RecoveryAborting,
    /// Finished; no further log records may be written.
    Complete,
}

impl TransactionStatus {
    fn rank(&self) -> u8 {
        match self {
            TransactionStatus::Running => 0,
            TransactionStatus::Committing
            | TransactionStatus::Aborting
            | TransactionStatus::RecoveryAborting => 1,
            TransactionStatus::Complete => 2,
        }
    }

    /// Returns true if the status may move to `next`. Forward-only; sibling
    /// states at the same stage are unreachable from each other.
    pub fn can_transition_to(&self, next: &TransactionStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Returns true once the transaction can accept no further operations.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Complete)
    }

    /// Returns true for both abort flavors.
    #[inline]
    pub fn is_aborting(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Aborting | TransactionStatus::RecoveryAborting
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Running => write!(f, "RUNNING"),
            TransactionStatus::Committing => write!(f, "COMMITTING"),
            TransactionStatus::Aborting => write!(f, "ABORTING"),
            TransactionStatus::RecoveryAborting => write!(f, "RECOVERY_ABORTING"),
            TransactionStatus::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// Handle for a single transaction.
///
/// The handle is shared between the transaction's own thread, the lock
/// manager, and the recovery manager. The parking slot is how the lock
/// manager blocks the transaction's thread outside its monitor: the slot is
/// primed under the monitor (`prepare_block`), the thread parks after the
/// monitor is released (`block`), and a grant wakes it (`unblock`). Priming
/// before parking means a grant that races the park is never lost.
pub struct Transaction {
    num: TransactionId,
    status: Mutex<TransactionStatus>,
    parked: Mutex<bool>,
    wakeup: Condvar,
}

impl Transaction {
    /// Creates a new running transaction with the given number.
    pub fn new(num: TransactionId) -> Arc<Self> {
        Arc::new(Self {
            num,
            status: Mutex::new(TransactionStatus::Running),
            parked: Mutex::new(false),
            wakeup: Condvar::new(),
        })
    }

    /// The transaction number.
    #[inline]
    pub fn number(&self) -> TransactionId {
        self.num
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    /// Moves the transaction to `next`, enforcing the forward-only state
    /// machine.
    pub fn set_status(&self, next: TransactionStatus) -> TransactionResult<()> {
        let mut status = self.status.lock();
        if !status.can_transition_to(&next) {
            return Err(TransactionError::invalid_state(self.num, *status, next));
        }
        *status = next;
        Ok(())
    }

    /// True while the transaction's thread is parked (or about to park) on a
    /// lock request.
    pub fn is_blocked(&self) -> bool {
        *self.parked.lock()
    }

    /// Primes the parking slot. Must be called before the lock manager's
    /// monitor is released.
    pub(crate) fn prepare_block(&self) {
        *self.parked.lock() = true;
    }

    /// Parks the calling thread until `unblock` clears the slot. Returns
    /// immediately if the grant already happened.
    pub(crate) fn block(&self) {
        let mut parked = self.parked.lock();
        while *parked {
            self.wakeup.wait(&mut parked);
        }
    }

    /// Clears the parking slot and wakes the transaction's thread.
    pub(crate) fn unblock(&self) {
        let mut parked = self.parked.lock();
        *parked = false;
        self.wakeup.notify_all();
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("num", &self.num)
            .field("status", &self.status())
            .field("blocked", &self.is_blocked())
            .finish()
    }
}
