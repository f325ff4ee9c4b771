// ARIES recovery manager.
//
// Forward processing keeps the transaction table and dirty page table
// current while writing log records for every change, under steal/no-force
// buffer management. Restart runs the three ARIES phases: analysis rebuilds
// the tables from the last checkpoint (re-acquiring X locks on touched
// pages), redo repeats history from the earliest recLSN, and undo rolls the
// losers back with compensation records.
//
// Lock order: the table monitor may be taken while appending to the log,
// but never while calling into the buffer manager; the buffer's flush hooks
// take the log mutex and the table monitor.

use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::buffer::{BufferManager, FlushListener};
use crate::common::{
    page_index, partition, Lsn, PageNum, PartNum, TransactionId, EFFECTIVE_PAGE_SIZE,
    LOG_PARTITION,
};
use crate::storage::disk::DiskSpaceManager;

use super::error::{TransactionError, TransactionResult};
use super::lock_context::LockContext;
use super::lock_type::LockType;
use super::lock_util;
use super::log_manager::LogManager;
use super::log_record::{LogEntry, LogRecord};
use super::types::{Transaction, TransactionStatus};

/// Factory used during analysis to materialize handles for transactions
/// discovered in the log.
pub type TransactionFactory = Box<dyn Fn(TransactionId) -> Arc<Transaction> + Send + Sync>;

/// Per-transaction bookkeeping.
pub struct TransactionTableEntry {
    pub transaction: Arc<Transaction>,
    /// LSN of the transaction's most recent log record.
    pub last_lsn: Lsn,
    /// Pages this transaction has written.
    pub touched_pages: HashSet<PageNum>,
    /// Named savepoints; rollback targets are non-inclusive.
    pub savepoints: HashMap<String, Lsn>,
}

impl TransactionTableEntry {
    fn new(transaction: Arc<Transaction>) -> Self {
        Self {
            transaction,
            last_lsn: 0,
            touched_pages: HashSet::new(),
            savepoints: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct RecoveryTables {
    dirty_page_table: HashMap<PageNum, Lsn>,
    transaction_table: HashMap<TransactionId, TransactionTableEntry>,
}

/// ARIES-style recovery manager.
pub struct AriesRecoveryManager {
    log: Arc<LogManager>,
    disk: Arc<dyn DiskSpaceManager>,
    buffer: Arc<BufferManager>,
    db_context: Arc<LockContext>,
    tables: Mutex<RecoveryTables>,
    new_transaction: TransactionFactory,
    transaction_counter: AtomicU64,
}

impl AriesRecoveryManager {
    pub fn new(
        log: Arc<LogManager>,
        disk: Arc<dyn DiskSpaceManager>,
        buffer: Arc<BufferManager>,
        db_context: Arc<LockContext>,
        new_transaction: TransactionFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            disk,
            buffer,
            db_context,
            tables: Mutex::new(RecoveryTables::default()),
            new_transaction,
            transaction_counter: AtomicU64::new(0),
        })
    }

    /// Current transaction counter (restored across restarts via the begin
    /// checkpoint record).
    pub fn transaction_counter(&self) -> u64 {
        self.transaction_counter.load(Ordering::SeqCst)
    }

    /// Raises the transaction counter to at least `value`.
    pub fn update_transaction_counter(&self, value: u64) {
        self.transaction_counter.fetch_max(value, Ordering::SeqCst);
    }

    /// Sets up a fresh database: writes an empty checkpoint and points the
    /// master record at it. A log that already has a master pointer is left
    /// alone.
    pub fn initialize(&self) -> TransactionResult<()> {
        if self.log.fetch_master()? != 0 {
            return Ok(());
        }
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint {
            max_transaction_num: self.transaction_counter(),
        })?;
        self.log.append(LogRecord::EndCheckpoint {
            dirty_page_table: BTreeMap::new(),
            transaction_table: BTreeMap::new(),
            touched_pages: BTreeMap::new(),
        })?;
        self.log.flush_all()?;
        self.log.rewrite_master_record(begin_lsn)?;
        info!("initialized fresh log");
        Ok(())
    }

    /// Registers a new running transaction in the table.
    pub fn start_transaction(&self, transaction: Arc<Transaction>) {
        let txn_num = transaction.number();
        self.update_transaction_counter(txn_num);
        let mut tables = self.tables.lock();
        tables
            .transaction_table
            .entry(txn_num)
            .or_insert_with(|| TransactionTableEntry::new(transaction));
    }

    /// Logs a page write. Writes whose after-image exceeds half a page are
    /// split into an undo-only record chained to a redo-only record so each
    /// fits comfortably in a log page. Returns the transaction's new last
    /// LSN; nothing is flushed (no-force).
    pub fn log_page_write(
        &self,
        txn_num: TransactionId,
        page_num: PageNum,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> TransactionResult<Lsn> {
        assert_ne!(
            partition(page_num),
            LOG_PARTITION,
            "log pages are never logged as page writes"
        );
        assert_eq!(before.len(), after.len(), "page write images must align");

        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        let prev_lsn = entry.last_lsn;

        let (first_lsn, last_lsn) = if after.len() > EFFECTIVE_PAGE_SIZE / 2 {
            let undo_half = self.log.append(LogRecord::UpdatePage {
                transaction_num: txn_num,
                prev_lsn,
                page_num,
                offset,
                before: Some(before.to_vec()),
                after: None,
            })?;
            let redo_half = self.log.append(LogRecord::UpdatePage {
                transaction_num: txn_num,
                prev_lsn: undo_half,
                page_num,
                offset,
                before: None,
                after: Some(after.to_vec()),
            })?;
            (undo_half, redo_half)
        } else {
            let lsn = self.log.append(LogRecord::UpdatePage {
                transaction_num: txn_num,
                prev_lsn,
                page_num,
                offset,
                before: Some(before.to_vec()),
                after: Some(after.to_vec()),
            })?;
            (lsn, lsn)
        };

        entry.last_lsn = last_lsn;
        entry.touched_pages.insert(page_num);
        tables
            .dirty_page_table
            .entry(page_num)
            .or_insert(first_lsn);
        Ok(last_lsn)
    }

    /// Logs a page allocation. The allocation is visible on disk as soon as
    /// the disk manager performs it, so the log is flushed through the
    /// record before returning.
    pub fn log_alloc_page(
        &self,
        txn_num: TransactionId,
        page_num: PageNum,
    ) -> TransactionResult<Lsn> {
        self.log_page_op(txn_num, page_num, |transaction_num, prev_lsn| {
            LogRecord::AllocPage {
                transaction_num,
                prev_lsn,
                page_num,
            }
        })
    }

    /// Logs a page free; also drops the page from the dirty page table.
    pub fn log_free_page(
        &self,
        txn_num: TransactionId,
        page_num: PageNum,
    ) -> TransactionResult<Lsn> {
        let lsn = self.log_page_op(txn_num, page_num, |transaction_num, prev_lsn| {
            LogRecord::FreePage {
                transaction_num,
                prev_lsn,
                page_num,
            }
        })?;
        self.tables.lock().dirty_page_table.remove(&page_num);
        Ok(lsn)
    }

    /// Logs a partition allocation; flushed before returning.
    pub fn log_alloc_part(
        &self,
        txn_num: TransactionId,
        part_num: PartNum,
    ) -> TransactionResult<Lsn> {
        self.log_part_op(txn_num, |transaction_num, prev_lsn| LogRecord::AllocPart {
            transaction_num,
            prev_lsn,
            part_num,
        })
    }

    /// Logs a partition free; flushed before returning.
    pub fn log_free_part(
        &self,
        txn_num: TransactionId,
        part_num: PartNum,
    ) -> TransactionResult<Lsn> {
        self.log_part_op(txn_num, |transaction_num, prev_lsn| LogRecord::FreePart {
            transaction_num,
            prev_lsn,
            part_num,
        })
    }

    fn log_page_op(
        &self,
        txn_num: TransactionId,
        page_num: PageNum,
        build: impl FnOnce(TransactionId, Lsn) -> LogRecord,
    ) -> TransactionResult<Lsn> {
        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        let lsn = self.log.append(build(txn_num, entry.last_lsn))?;
        entry.last_lsn = lsn;
        entry.touched_pages.insert(page_num);
        self.log.flush_to_lsn(lsn)?;
        Ok(lsn)
    }

    fn log_part_op(
        &self,
        txn_num: TransactionId,
        build: impl FnOnce(TransactionId, Lsn) -> LogRecord,
    ) -> TransactionResult<Lsn> {
        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        let lsn = self.log.append(build(txn_num, entry.last_lsn))?;
        entry.last_lsn = lsn;
        self.log.flush_to_lsn(lsn)?;
        Ok(lsn)
    }

    /// Commits: the commit record is durable before this returns.
    pub fn commit(&self, txn_num: TransactionId) -> TransactionResult<Lsn> {
        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        let status = entry.transaction.status();
        if !status.can_transition_to(&TransactionStatus::Committing) {
            return Err(TransactionError::invalid_state(
                txn_num,
                status,
                TransactionStatus::Committing,
            ));
        }
        let lsn = self.log.append(LogRecord::CommitTransaction {
            transaction_num: txn_num,
            prev_lsn: entry.last_lsn,
        })?;
        self.log.flush_to_lsn(lsn)?;
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Committing)?;
        Ok(lsn)
    }

    /// Aborts: writes the abort record and marks the transaction; the
    /// rollback itself happens in `end`.
    pub fn abort(&self, txn_num: TransactionId) -> TransactionResult<Lsn> {
        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        let status = entry.transaction.status();
        if !status.can_transition_to(&TransactionStatus::Aborting) {
            return Err(TransactionError::invalid_state(
                txn_num,
                status,
                TransactionStatus::Aborting,
            ));
        }
        let lsn = self.log.append(LogRecord::AbortTransaction {
            transaction_num: txn_num,
            prev_lsn: entry.last_lsn,
        })?;
        entry.last_lsn = lsn;
        entry.transaction.set_status(TransactionStatus::Aborting)?;
        Ok(lsn)
    }

    /// Ends the transaction. An aborting transaction is first rolled back
    /// to the start of its chain, emitting CLRs.
    pub fn end(&self, txn_num: TransactionId) -> TransactionResult<Lsn> {
        let status = {
            let tables = self.tables.lock();
            tables
                .transaction_table
                .get(&txn_num)
                .ok_or(TransactionError::TransactionNotFound(txn_num))?
                .transaction
                .status()
        };
        if status.is_aborting() {
            self.rollback_to(txn_num, 0)?;
        }
        self.finish_transaction(txn_num)
    }

    /// Records the transaction's current position under `name`,
    /// overwriting any previous savepoint with that name.
    pub fn savepoint(&self, txn_num: TransactionId, name: &str) -> TransactionResult<()> {
        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        let last_lsn = entry.last_lsn;
        entry.savepoints.insert(name.to_string(), last_lsn);
        Ok(())
    }

    /// Drops a savepoint.
    pub fn release_savepoint(&self, txn_num: TransactionId, name: &str) -> TransactionResult<()> {
        let mut tables = self.tables.lock();
        let entry = tables
            .transaction_table
            .get_mut(&txn_num)
            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
        entry
            .savepoints
            .remove(name)
            .ok_or_else(|| TransactionError::savepoint_not_found(txn_num, name))?;
        Ok(())
    }

    /// Rolls the transaction back to the savepoint (exclusive), undoing
    /// everything logged after it.
    pub fn rollback_to_savepoint(
        &self,
        txn_num: TransactionId,
        name: &str,
    ) -> TransactionResult<()> {
        let stop = {
            let tables = self.tables.lock();
            let entry = tables
                .transaction_table
                .get(&txn_num)
                .ok_or(TransactionError::TransactionNotFound(txn_num))?;
            *entry
                .savepoints
                .get(name)
                .ok_or_else(|| TransactionError::savepoint_not_found(txn_num, name))?
        };
        self.rollback_to(txn_num, stop)
    }

    /// Takes a fuzzy checkpoint: begin record, end-checkpoint records
    /// packed greedily (dirty pages, then transaction table, then touched
    /// pages), master record updated last.
    pub fn checkpoint(&self) -> TransactionResult<Lsn> {
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint {
            max_transaction_num: self.transaction_counter(),
        })?;

        let (dpt_snapshot, txn_snapshot, touched_snapshot) = {
            let tables = self.tables.lock();
            let mut dpt: Vec<(PageNum, Lsn)> = tables
                .dirty_page_table
                .iter()
                .map(|(page, lsn)| (*page, *lsn))
                .collect();
            dpt.sort_unstable();
            let mut txns: Vec<(TransactionId, (TransactionStatus, Lsn))> = tables
                .transaction_table
                .iter()
                .map(|(num, e)| (*num, (e.transaction.status(), e.last_lsn)))
                .collect();
            txns.sort_unstable_by_key(|(num, _)| *num);
            let mut touched: Vec<(TransactionId, Vec<PageNum>)> = tables
                .transaction_table
                .iter()
                .map(|(num, e)| {
                    let mut pages: Vec<PageNum> = e.touched_pages.iter().copied().collect();
                    pages.sort_unstable();
                    (*num, pages)
                })
                .collect();
            touched.sort_unstable_by_key(|(num, _)| *num);
            (dpt, txns, touched)
        };

        let mut chunk_dpt = BTreeMap::new();
        let mut chunk_txns = BTreeMap::new();
        let mut chunk_touched: BTreeMap<TransactionId, Vec<PageNum>> = BTreeMap::new();
        let mut touched_keys = 0usize;
        let mut touched_pages = 0usize;

        for (page, rec_lsn) in dpt_snapshot {
            if !LogRecord::fits_in_one_record(chunk_dpt.len() + 1, 0, 0, 0) {
                self.emit_checkpoint(&mut chunk_dpt, &mut chunk_txns, &mut chunk_touched)?;
                touched_keys = 0;
                touched_pages = 0;
            }
            chunk_dpt.insert(page, rec_lsn);
        }
        for (txn_num, state) in txn_snapshot {
            if !LogRecord::fits_in_one_record(chunk_dpt.len(), chunk_txns.len() + 1, 0, 0) {
                self.emit_checkpoint(&mut chunk_dpt, &mut chunk_txns, &mut chunk_touched)?;
                touched_keys = 0;
                touched_pages = 0;
            }
            chunk_txns.insert(txn_num, state);
        }
        for (txn_num, pages) in touched_snapshot {
            if pages.is_empty() {
                continue;
            }
            if !LogRecord::fits_in_one_record(
                chunk_dpt.len(),
                chunk_txns.len(),
                touched_keys + 1,
                touched_pages,
            ) {
                self.emit_checkpoint(&mut chunk_dpt, &mut chunk_txns, &mut chunk_touched)?;
                touched_keys = 0;
                touched_pages = 0;
            }
            touched_keys += 1;
            chunk_touched.insert(txn_num, Vec::new());
            for page in pages {
                if !LogRecord::fits_in_one_record(
                    chunk_dpt.len(),
                    chunk_txns.len(),
                    touched_keys,
                    touched_pages + 1,
                ) {
                    self.emit_checkpoint(&mut chunk_dpt, &mut chunk_txns, &mut chunk_touched)?;
                    touched_pages = 0;
                    touched_keys = 1;
                    chunk_touched.insert(txn_num, Vec::new());
                }
                chunk_touched
                    .get_mut(&txn_num)
                    .expect("key inserted above")
                    .push(page);
                touched_pages += 1;
            }
        }
        self.emit_checkpoint(&mut chunk_dpt, &mut chunk_txns, &mut chunk_touched)?;

        self.log.rewrite_master_record(begin_lsn)?;
        debug!(begin_lsn, "checkpoint complete");
        Ok(begin_lsn)
    }

    fn emit_checkpoint(
        &self,
        dpt: &mut BTreeMap<PageNum, Lsn>,
        txns: &mut BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
        touched: &mut BTreeMap<TransactionId, Vec<PageNum>>,
    ) -> TransactionResult<()> {
        let record = LogRecord::EndCheckpoint {
            dirty_page_table: std::mem::take(dpt),
            transaction_table: std::mem::take(txns),
            touched_pages: std::mem::take(touched),
        };
        self.log.append_and_flush(record)?;
        Ok(())
    }

    /// Flushes the log and checkpoints; the last thing a clean shutdown
    /// does.
    pub fn close(&self) -> TransactionResult<()> {
        self.checkpoint()?;
        self.log.flush_all()
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// Undoes the transaction's records down to (not including) `stop`.
    fn rollback_to(&self, txn_num: TransactionId, stop: Lsn) -> TransactionResult<()> {
        let mut current = {
            let tables = self.tables.lock();
            tables
                .transaction_table
                .get(&txn_num)
                .ok_or(TransactionError::TransactionNotFound(txn_num))?
                .last_lsn
        };
        while current > stop {
            current = self.rollback_step(txn_num, current)?;
        }
        Ok(())
    }

    /// One step of rollback: compensates the record at `at` if it is
    /// undoable and returns the LSN to continue from (0 when the chain is
    /// exhausted).
    fn rollback_step(&self, txn_num: TransactionId, at: Lsn) -> TransactionResult<Lsn> {
        let entry = self.log.fetch(at)?;
        if entry.record.is_undoable() {
            let last_lsn = {
                let tables = self.tables.lock();
                tables
                    .transaction_table
                    .get(&txn_num)
                    .ok_or(TransactionError::TransactionNotFound(txn_num))?
                    .last_lsn
            };
            let (clr, must_flush) = entry.record.undo(last_lsn)?;
            let clr_lsn = self.log.append(clr.clone())?;
            if must_flush {
                self.log.flush_to_lsn(clr_lsn)?;
            }
            {
                let mut tables = self.tables.lock();
                if let Some(e) = tables.transaction_table.get_mut(&txn_num) {
                    e.last_lsn = clr_lsn;
                }
                match &clr {
                    LogRecord::UndoUpdatePage { page_num, .. } => {
                        tables
                            .dirty_page_table
                            .entry(*page_num)
                            .or_insert(clr_lsn);
                    }
                    LogRecord::UndoAllocPage { page_num, .. } => {
                        tables.dirty_page_table.remove(page_num);
                    }
                    _ => {}
                }
            }
            clr.redo(clr_lsn, self.disk.as_ref(), &self.buffer)?;
        }
        Ok(entry
            .record
            .undo_next_lsn()
            .or(entry.record.prev_lsn())
            .unwrap_or(0))
    }

    /// Removes the table entry, writes the END record, completes the
    /// transaction, and releases its locks. Rollback, if any, must already
    /// have happened.
    fn finish_transaction(&self, txn_num: TransactionId) -> TransactionResult<Lsn> {
        let (lsn, transaction) = {
            let mut tables = self.tables.lock();
            let entry = tables
                .transaction_table
                .remove(&txn_num)
                .ok_or(TransactionError::TransactionNotFound(txn_num))?;
            let lsn = self.log.append(LogRecord::EndTransaction {
                transaction_num: txn_num,
                prev_lsn: entry.last_lsn,
            })?;
            entry.transaction.set_status(TransactionStatus::Complete)?;
            (lsn, entry.transaction)
        };
        self.db_context.release_all(&transaction)?;
        Ok(lsn)
    }

    // =========================================================================
    // Restart recovery
    // =========================================================================

    /// Runs analysis and redo, then returns a continuation that performs
    /// undo and a final checkpoint. The engine may start serving once this
    /// returns, running the continuation in the background.
    pub fn restart(
        self: &Arc<Self>,
    ) -> TransactionResult<Box<dyn FnOnce() -> TransactionResult<()> + Send>> {
        info!("restart recovery: analysis");
        self.restart_analysis()?;
        info!("restart recovery: redo");
        self.restart_redo()?;

        // Only pages still dirty in memory stay in the DPT for undo.
        let resident: Vec<PageNum> = {
            let tables = self.tables.lock();
            tables.dirty_page_table.keys().copied().collect()
        };
        let still_dirty: HashSet<PageNum> = resident
            .into_iter()
            .filter(|page| self.buffer.is_dirty(*page))
            .collect();
        self.tables
            .lock()
            .dirty_page_table
            .retain(|page, _| still_dirty.contains(page));

        let this = Arc::clone(self);
        Ok(Box::new(move || {
            info!("restart recovery: undo");
            this.restart_undo()?;
            this.checkpoint()?;
            Ok(())
        }))
    }

    fn restart_analysis(&self) -> TransactionResult<()> {
        let master = self.log.fetch_master()?;
        let mut ended: HashSet<TransactionId> = HashSet::new();
        for entry in self.log.scan_from(master) {
            let entry = entry?;
            self.analyze_record(&entry, &mut ended)?;
        }

        let survivors: Vec<(TransactionId, TransactionStatus)> = {
            let tables = self.tables.lock();
            tables
                .transaction_table
                .iter()
                .map(|(num, e)| (*num, e.transaction.status()))
                .collect()
        };
        for (txn_num, status) in survivors {
            match status {
                TransactionStatus::Committing => {
                    self.finish_transaction(txn_num)?;
                }
                TransactionStatus::Running => {
                    let mut tables = self.tables.lock();
                    let entry = tables
                        .transaction_table
                        .get_mut(&txn_num)
                        .ok_or(TransactionError::TransactionNotFound(txn_num))?;
                    let lsn = self.log.append(LogRecord::AbortTransaction {
                        transaction_num: txn_num,
                        prev_lsn: entry.last_lsn,
                    })?;
                    entry.last_lsn = lsn;
                    entry
                        .transaction
                        .set_status(TransactionStatus::RecoveryAborting)?;
                }
                TransactionStatus::Complete => {
                    self.tables.lock().transaction_table.remove(&txn_num);
                }
                TransactionStatus::Aborting | TransactionStatus::RecoveryAborting => {}
            }
        }
        Ok(())
    }

    fn analyze_record(
        &self,
        entry: &LogEntry,
        ended: &mut HashSet<TransactionId>,
    ) -> TransactionResult<()> {
        match &entry.record {
            LogRecord::Master { .. } => Ok(()),
            LogRecord::BeginCheckpoint {
                max_transaction_num,
            } => {
                self.update_transaction_counter(*max_transaction_num);
                Ok(())
            }
            LogRecord::EndCheckpoint {
                dirty_page_table,
                transaction_table,
                touched_pages,
            } => self.merge_checkpoint(dirty_page_table, transaction_table, touched_pages, ended),
            record => {
                let Some(txn_num) = record.transaction_num() else {
                    return Ok(());
                };
                if ended.contains(&txn_num) {
                    return Ok(());
                }
                let transaction = self.table_entry_handle(txn_num);
                {
                    let mut tables = self.tables.lock();
                    let table_entry = tables
                        .transaction_table
                        .get_mut(&txn_num)
                        .ok_or(TransactionError::TransactionNotFound(txn_num))?;
                    table_entry.last_lsn = table_entry.last_lsn.max(entry.lsn);
                }

                if let Some(page_num) = record.page_num() {
                    {
                        let mut tables = self.tables.lock();
                        let table_entry = tables
                            .transaction_table
                            .get_mut(&txn_num)
                            .ok_or(TransactionError::TransactionNotFound(txn_num))?;
                        table_entry.touched_pages.insert(page_num);
                        match record {
                            LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                                tables
                                    .dirty_page_table
                                    .entry(page_num)
                                    .or_insert(entry.lsn);
                            }
                            LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                                tables.dirty_page_table.remove(&page_num);
                            }
                            _ => {}
                        }
                    }
                    self.reacquire_page_lock(&transaction, page_num)?;
                }

                match record {
                    LogRecord::CommitTransaction { .. } => {
                        self.advance_status(&transaction, TransactionStatus::Committing)
                    }
                    LogRecord::AbortTransaction { .. } => {
                        self.advance_status(&transaction, TransactionStatus::RecoveryAborting)
                    }
                    LogRecord::EndTransaction { .. } => {
                        self.advance_status(&transaction, TransactionStatus::Complete)?;
                        self.tables.lock().transaction_table.remove(&txn_num);
                        // Drops any locks re-acquired for it during this scan.
                        self.db_context.release_all(&transaction)?;
                        ended.insert(txn_num);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    fn merge_checkpoint(
        &self,
        dirty_page_table: &BTreeMap<PageNum, Lsn>,
        transaction_table: &BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
        touched_pages: &BTreeMap<TransactionId, Vec<PageNum>>,
        ended: &HashSet<TransactionId>,
    ) -> TransactionResult<()> {
        {
            let mut tables = self.tables.lock();
            for (page, rec_lsn) in dirty_page_table {
                tables.dirty_page_table.insert(*page, *rec_lsn);
            }
        }
        for (txn_num, (status, last_lsn)) in transaction_table {
            if ended.contains(txn_num) {
                continue;
            }
            let transaction = self.table_entry_handle(*txn_num);
            {
                let mut tables = self.tables.lock();
                let entry = tables
                    .transaction_table
                    .get_mut(txn_num)
                    .ok_or(TransactionError::TransactionNotFound(*txn_num))?;
                entry.last_lsn = entry.last_lsn.max(*last_lsn);
            }
            // A checkpointed forward abort resumes as a recovery abort.
            let desired = match status {
                TransactionStatus::Aborting => TransactionStatus::RecoveryAborting,
                other => *other,
            };
            let current = transaction.status();
            if current != desired && current.can_transition_to(&desired) {
                transaction.set_status(desired)?;
            }
        }
        for (txn_num, pages) in touched_pages {
            if ended.contains(txn_num) {
                continue;
            }
            let transaction = {
                let tables = self.tables.lock();
                match tables.transaction_table.get(txn_num) {
                    Some(entry) => Arc::clone(&entry.transaction),
                    None => continue,
                }
            };
            for page in pages {
                {
                    let mut tables = self.tables.lock();
                    if let Some(entry) = tables.transaction_table.get_mut(txn_num) {
                        entry.touched_pages.insert(*page);
                    }
                }
                self.reacquire_page_lock(&transaction, *page)?;
            }
        }
        Ok(())
    }

    fn restart_redo(&self) -> TransactionResult<()> {
        let start = {
            let tables = self.tables.lock();
            tables.dirty_page_table.values().min().copied()
        };
        let Some(start) = start else {
            debug!("redo skipped: dirty page table is empty");
            return Ok(());
        };
        for entry in self.log.scan_from(start) {
            let entry = entry?;
            if !entry.record.is_redoable() {
                continue;
            }
            let page_gated = matches!(
                entry.record,
                LogRecord::UpdatePage { .. }
                    | LogRecord::UndoUpdatePage { .. }
                    | LogRecord::FreePage { .. }
                    | LogRecord::UndoAllocPage { .. }
            );
            if page_gated {
                let Some(page_num) = entry.record.page_num() else {
                    continue;
                };
                let in_dpt = {
                    let tables = self.tables.lock();
                    matches!(tables.dirty_page_table.get(&page_num), Some(&rec_lsn) if rec_lsn <= entry.lsn)
                };
                if !in_dpt {
                    continue;
                }
                let page_lsn = {
                    let page = self
                        .buffer
                        .get_page(page_num)
                        .map_err(|e| TransactionError::redo_failed(entry.lsn, e.to_string()))?;
                    page.page_lsn()
                };
                if page_lsn >= entry.lsn {
                    continue;
                }
            }
            entry
                .record
                .redo(entry.lsn, self.disk.as_ref(), &self.buffer)?;
        }
        Ok(())
    }

    fn restart_undo(&self) -> TransactionResult<()> {
        let mut heap: BinaryHeap<(Lsn, TransactionId)> = {
            let tables = self.tables.lock();
            tables
                .transaction_table
                .iter()
                .filter(|(_, e)| {
                    e.transaction.status() == TransactionStatus::RecoveryAborting
                })
                .map(|(num, e)| (e.last_lsn, *num))
                .collect()
        };
        while let Some((lsn, txn_num)) = heap.pop() {
            let next = self.rollback_step(txn_num, lsn)?;
            if next == 0 {
                self.finish_transaction(txn_num)?;
            } else {
                heap.push((next, txn_num));
            }
        }
        Ok(())
    }

    /// Looks up (or creates, via the factory) the handle for a transaction
    /// discovered in the log.
    fn table_entry_handle(&self, txn_num: TransactionId) -> Arc<Transaction> {
        {
            let tables = self.tables.lock();
            if let Some(entry) = tables.transaction_table.get(&txn_num) {
                return Arc::clone(&entry.transaction);
            }
        }
        let transaction = (self.new_transaction)(txn_num);
        self.update_transaction_counter(txn_num);
        let mut tables = self.tables.lock();
        Arc::clone(
            &tables
                .transaction_table
                .entry(txn_num)
                .or_insert_with(|| TransactionTableEntry::new(Arc::clone(&transaction)))
                .transaction,
        )
    }

    fn advance_status(
        &self,
        transaction: &Arc<Transaction>,
        desired: TransactionStatus,
    ) -> TransactionResult<()> {
        let current = transaction.status();
        if current == desired {
            return Ok(());
        }
        transaction.set_status(desired)
    }

    fn reacquire_page_lock(
        &self,
        transaction: &Arc<Transaction>,
        page_num: PageNum,
    ) -> TransactionResult<()> {
        let context = self
            .db_context
            .child("part", partition(page_num) as u64)
            .child("page", page_index(page_num) as u64);
        lock_util::ensure_sufficient(transaction, &context, LockType::X)
    }

    // =========================================================================
    // Read-only views (tests, drivers)
    // =========================================================================

    /// Snapshot of the dirty page table.
    pub fn dirty_page_table(&self) -> HashMap<PageNum, Lsn> {
        self.tables.lock().dirty_page_table.clone()
    }

    /// Transactions currently in the table.
    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.tables.lock().transaction_table.keys().copied().collect()
    }

    /// The transaction's last LSN, if it is in the table.
    pub fn last_lsn(&self, txn_num: TransactionId) -> Option<Lsn> {
        self.tables
            .lock()
            .transaction_table
            .get(&txn_num)
            .map(|e| e.last_lsn)
    }

    /// The pages the transaction has touched, if it is in the table.
    pub fn touched_pages(&self, txn_num: TransactionId) -> Option<Vec<PageNum>> {
        self.tables.lock().transaction_table.get(&txn_num).map(|e| {
            let mut pages: Vec<PageNum> = e.touched_pages.iter().copied().collect();
            pages.sort_unstable();
            pages
        })
    }
}

impl FlushListener for AriesRecoveryManager {
    /// WAL: the log must be durable through the page's LSN before the page
    /// itself is.
    fn page_flush_hook(&self, page_lsn: Lsn) -> crate::Result<()> {
        self.log.flush_to_lsn(page_lsn)?;
        Ok(())
    }

    fn disk_io_hook(&self, page_num: PageNum) -> crate::Result<()> {
        self.tables.lock().dirty_page_table.remove(&page_num);
        Ok(())
    }
}
