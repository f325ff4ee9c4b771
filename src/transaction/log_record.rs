// Log record model.
//
// A single tagged enum covers every record the engine writes, with accessor
// methods instead of an inheritance tree. Records that change pages or the
// allocation state know how to redo themselves idempotently and how to
// build their compensation (CLR) counterpart for rollback.
//
// `prev_lsn` and `undo_next_lsn` use 0 as the chain terminator; no real
// record ever lives at offset 0 (the master record slot).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferManager;
use crate::common::{Lsn, PageNum, PartNum, TransactionId, EFFECTIVE_PAGE_SIZE};
use crate::storage::disk::DiskSpaceManager;

use super::error::{TransactionError, TransactionResult};
use super::types::TransactionStatus;

// Conservative serialized sizes used by the checkpoint packing predicate.
const CHECKPOINT_HEADER_BYTES: usize = 64;
const DPT_ENTRY_BYTES: usize = 18;
const TXN_ENTRY_BYTES: usize = 20;
const TOUCHED_KEY_BYTES: usize = 14;
const TOUCHED_PAGE_BYTES: usize = 9;

/// A log record together with the LSN it was appended or fetched at.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub record: LogRecord,
}

/// Every record type written to the write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Mutable record at LSN 0 pointing at the most recent complete begin
    /// checkpoint.
    Master { last_checkpoint_lsn: Lsn },

    /// Start of a fuzzy checkpoint; carries the transaction counter so
    /// restart can continue numbering past crashed transactions.
    BeginCheckpoint { max_transaction_num: TransactionId },

    /// Checkpoint payload. Large tables are split across several of these,
    /// packed greedily under `fits_in_one_record`.
    EndCheckpoint {
        dirty_page_table: BTreeMap<PageNum, Lsn>,
        transaction_table: BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
        touched_pages: BTreeMap<TransactionId, Vec<PageNum>>,
    },

    CommitTransaction {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
    },
    AbortTransaction {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
    },
    EndTransaction {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
    },

    /// Page write. `before` absent makes the record redo-only, `after`
    /// absent makes it undo-only (the two halves of a split write).
    UpdatePage {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        offset: u16,
        before: Option<Vec<u8>>,
        after: Option<Vec<u8>>,
    },
    /// CLR for `UpdatePage`: writes the before-image back.
    UndoUpdatePage {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        undo_next_lsn: Lsn,
        offset: u16,
        after: Vec<u8>,
    },

    AllocPage {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
    },
    UndoAllocPage {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        undo_next_lsn: Lsn,
    },
    FreePage {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
    },
    UndoFreePage {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        page_num: PageNum,
        undo_next_lsn: Lsn,
    },

    AllocPart {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
    },
    UndoAllocPart {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
        undo_next_lsn: Lsn,
    },
    FreePart {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
    },
    UndoFreePart {
        transaction_num: TransactionId,
        prev_lsn: Lsn,
        part_num: PartNum,
        undo_next_lsn: Lsn,
    },
}

impl LogRecord {
    /// Short tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            LogRecord::Master { .. } => "MASTER",
            LogRecord::BeginCheckpoint { .. } => "BEGIN_CHECKPOINT",
            LogRecord::EndCheckpoint { .. } => "END_CHECKPOINT",
            LogRecord::CommitTransaction { .. } => "COMMIT",
            LogRecord::AbortTransaction { .. } => "ABORT",
            LogRecord::EndTransaction { .. } => "END",
            LogRecord::UpdatePage { .. } => "UPDATE_PAGE",
            LogRecord::UndoUpdatePage { .. } => "UNDO_UPDATE_PAGE",
            LogRecord::AllocPage { .. } => "ALLOC_PAGE",
            LogRecord::UndoAllocPage { .. } => "UNDO_ALLOC_PAGE",
            LogRecord::FreePage { .. } => "FREE_PAGE",
            LogRecord::UndoFreePage { .. } => "UNDO_FREE_PAGE",
            LogRecord::AllocPart { .. } => "ALLOC_PART",
            LogRecord::UndoAllocPart { .. } => "UNDO_ALLOC_PART",
            LogRecord::FreePart { .. } => "FREE_PART",
            LogRecord::UndoFreePart { .. } => "UNDO_FREE_PART",
        }
    }

    /// The transaction that wrote this record, if it is transaction-tagged.
    pub fn transaction_num(&self) -> Option<TransactionId> {
        match self {
            LogRecord::CommitTransaction { transaction_num, .. }
            | LogRecord::AbortTransaction { transaction_num, .. }
            | LogRecord::EndTransaction { transaction_num, .. }
            | LogRecord::UpdatePage { transaction_num, .. }
            | LogRecord::UndoUpdatePage { transaction_num, .. }
            | LogRecord::AllocPage { transaction_num, .. }
            | LogRecord::UndoAllocPage { transaction_num, .. }
            | LogRecord::FreePage { transaction_num, .. }
            | LogRecord::UndoFreePage { transaction_num, .. }
            | LogRecord::AllocPart { transaction_num, .. }
            | LogRecord::UndoAllocPart { transaction_num, .. }
            | LogRecord::FreePart { transaction_num, .. }
            | LogRecord::UndoFreePart { transaction_num, .. } => Some(*transaction_num),
            _ => None,
        }
    }

    /// The previous LSN in the transaction's chain (0 terminates).
    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            LogRecord::CommitTransaction { prev_lsn, .. }
            | LogRecord::AbortTransaction { prev_lsn, .. }
            | LogRecord::EndTransaction { prev_lsn, .. }
            | LogRecord::UpdatePage { prev_lsn, .. }
            | LogRecord::UndoUpdatePage { prev_lsn, .. }
            | LogRecord::AllocPage { prev_lsn, .. }
            | LogRecord::UndoAllocPage { prev_lsn, .. }
            | LogRecord::FreePage { prev_lsn, .. }
            | LogRecord::UndoFreePage { prev_lsn, .. }
            | LogRecord::AllocPart { prev_lsn, .. }
            | LogRecord::UndoAllocPart { prev_lsn, .. }
            | LogRecord::FreePart { prev_lsn, .. }
            | LogRecord::UndoFreePart { prev_lsn, .. } => Some(*prev_lsn),
            _ => None,
        }
    }

    /// The page this record touches, if any.
    pub fn page_num(&self) -> Option<PageNum> {
        match self {
            LogRecord::UpdatePage { page_num, .. }
            | LogRecord::UndoUpdatePage { page_num, .. }
            | LogRecord::AllocPage { page_num, .. }
            | LogRecord::UndoAllocPage { page_num, .. }
            | LogRecord::FreePage { page_num, .. }
            | LogRecord::UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    /// The partition this record touches, if any.
    pub fn part_num(&self) -> Option<PartNum> {
        match self {
            LogRecord::AllocPart { part_num, .. }
            | LogRecord::UndoAllocPart { part_num, .. }
            | LogRecord::FreePart { part_num, .. }
            | LogRecord::UndoFreePart { part_num, .. } => Some(*part_num),
            _ => None,
        }
    }

    /// For CLRs, where rollback continues (0 means the chain is done).
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            LogRecord::UndoUpdatePage { undo_next_lsn, .. }
            | LogRecord::UndoAllocPage { undo_next_lsn, .. }
            | LogRecord::UndoFreePage { undo_next_lsn, .. }
            | LogRecord::UndoAllocPart { undo_next_lsn, .. }
            | LogRecord::UndoFreePart { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    /// True if restart redo may replay this record.
    pub fn is_redoable(&self) -> bool {
        match self {
            LogRecord::UpdatePage { after, .. } => after.is_some(),
            LogRecord::UndoUpdatePage { .. }
            | LogRecord::AllocPage { .. }
            | LogRecord::UndoAllocPage { .. }
            | LogRecord::FreePage { .. }
            | LogRecord::UndoFreePage { .. }
            | LogRecord::AllocPart { .. }
            | LogRecord::UndoAllocPart { .. }
            | LogRecord::FreePart { .. }
            | LogRecord::UndoFreePart { .. } => true,
            _ => false,
        }
    }

    /// True if rollback must compensate this record.
    pub fn is_undoable(&self) -> bool {
        match self {
            LogRecord::UpdatePage { before, .. } => before.is_some(),
            LogRecord::AllocPage { .. }
            | LogRecord::FreePage { .. }
            | LogRecord::AllocPart { .. }
            | LogRecord::FreePart { .. } => true,
            _ => false,
        }
    }

    /// Builds the CLR compensating this record.
    ///
    /// `clr_prev_lsn` is the emitting transaction's current last LSN; the
    /// CLR's `undo_next_lsn` is this record's own `prev_lsn`, so rollback
    /// resumes before this record. The second value is true when the log
    /// must be flushed through the CLR before its redo runs (compensations
    /// whose effect is immediately visible on disk).
    pub fn undo(&self, clr_prev_lsn: Lsn) -> TransactionResult<(LogRecord, bool)> {
        match self {
            LogRecord::UpdatePage {
                transaction_num,
                prev_lsn,
                page_num,
                offset,
                before: Some(before),
                ..
            } => Ok((
                LogRecord::UndoUpdatePage {
                    transaction_num: *transaction_num,
                    prev_lsn: clr_prev_lsn,
                    page_num: *page_num,
                    undo_next_lsn: *prev_lsn,
                    offset: *offset,
                    after: before.clone(),
                },
                false,
            )),
            LogRecord::AllocPage {
                transaction_num,
                prev_lsn,
                page_num,
            } => Ok((
                LogRecord::UndoAllocPage {
                    transaction_num: *transaction_num,
                    prev_lsn: clr_prev_lsn,
                    page_num: *page_num,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            LogRecord::FreePage {
                transaction_num,
                prev_lsn,
                page_num,
            } => Ok((
                LogRecord::UndoFreePage {
                    transaction_num: *transaction_num,
                    prev_lsn: clr_prev_lsn,
                    page_num: *page_num,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            LogRecord::AllocPart {
                transaction_num,
                prev_lsn,
                part_num,
            } => Ok((
                LogRecord::UndoAllocPart {
                    transaction_num: *transaction_num,
                    prev_lsn: clr_prev_lsn,
                    part_num: *part_num,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            LogRecord::FreePart {
                transaction_num,
                prev_lsn,
                part_num,
            } => Ok((
                LogRecord::UndoFreePart {
                    transaction_num: *transaction_num,
                    prev_lsn: clr_prev_lsn,
                    part_num: *part_num,
                    undo_next_lsn: *prev_lsn,
                },
                true,
            )),
            _ => Err(TransactionError::undo_failed(
                clr_prev_lsn,
                format!("{} records are not undoable", self.kind()),
            )),
        }
    }

    /// Idempotently re-applies this record's effect. `lsn` is the record's
    /// own LSN, stamped onto the page for page writes. Allocation records
    /// consult the disk manager's state first so replays of already-applied
    /// changes are no-ops.
    pub fn redo(
        &self,
        lsn: Lsn,
        disk: &dyn DiskSpaceManager,
        buffer: &BufferManager,
    ) -> TransactionResult<()> {
        let fail = |reason: String| TransactionError::redo_failed(lsn, reason);
        match self {
            LogRecord::UpdatePage {
                page_num,
                offset,
                after: Some(after),
                ..
            } => {
                let page = buffer
                    .get_page(*page_num)
                    .map_err(|e| fail(e.to_string()))?;
                page.write(*offset as usize, after)
                    .map_err(|e| fail(e.to_string()))?;
                page.set_page_lsn(lsn);
                Ok(())
            }
            LogRecord::UndoUpdatePage {
                page_num,
                offset,
                after,
                ..
            } => {
                let page = buffer
                    .get_page(*page_num)
                    .map_err(|e| fail(e.to_string()))?;
                page.write(*offset as usize, after)
                    .map_err(|e| fail(e.to_string()))?;
                page.set_page_lsn(lsn);
                Ok(())
            }
            LogRecord::AllocPage { page_num, .. } | LogRecord::UndoFreePage { page_num, .. } => {
                if !disk.is_page_allocated(*page_num) {
                    disk.alloc_page_at(*page_num)
                        .map_err(|e| fail(e.to_string()))?;
                }
                Ok(())
            }
            LogRecord::FreePage { page_num, .. } | LogRecord::UndoAllocPage { page_num, .. } => {
                if disk.is_page_allocated(*page_num) {
                    buffer.discard(*page_num);
                    disk.free_page(*page_num).map_err(|e| fail(e.to_string()))?;
                }
                Ok(())
            }
            LogRecord::AllocPart { part_num, .. } | LogRecord::UndoFreePart { part_num, .. } => {
                if !disk.is_part_allocated(*part_num) {
                    disk.alloc_part_at(*part_num)
                        .map_err(|e| fail(e.to_string()))?;
                }
                Ok(())
            }
            LogRecord::FreePart { part_num, .. } | LogRecord::UndoAllocPart { part_num, .. } => {
                if disk.is_part_allocated(*part_num) {
                    disk.free_part(*part_num).map_err(|e| fail(e.to_string()))?;
                }
                Ok(())
            }
            _ => Err(fail(format!("{} records are not redoable", self.kind()))),
        }
    }

    /// Bounds an END_CHECKPOINT payload: `n_dpt` dirty page entries,
    /// `n_txns` transaction table entries, `n_touched_txns` touched-page
    /// keys holding `n_touched_pages` page numbers in total.
    pub fn fits_in_one_record(
        n_dpt: usize,
        n_txns: usize,
        n_touched_txns: usize,
        n_touched_pages: usize,
    ) -> bool {
        CHECKPOINT_HEADER_BYTES
            + n_dpt * DPT_ENTRY_BYTES
            + n_txns * TXN_ENTRY_BYTES
            + n_touched_txns * TOUCHED_KEY_BYTES
            + n_touched_pages * TOUCHED_PAGE_BYTES
            <= EFFECTIVE_PAGE_SIZE
    }
}
