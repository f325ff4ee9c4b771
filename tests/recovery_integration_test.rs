// Integration tests for the WAL and ARIES restart recovery: durability
// ordering, rollback completeness, fuzzy checkpoints, and crash/restart
// scenarios. A "crash" drops the buffer pool and recovery manager while
// keeping the disk manager and log file, losing exactly the unflushed state.

use std::sync::Arc;

use rand::RngCore;
use tempfile::TempDir;

use ferrodb::buffer::{BufferConfig, BufferManager, FlushListener};
use ferrodb::common::{Lsn, PageNum, TransactionId, EFFECTIVE_PAGE_SIZE};
use ferrodb::storage::disk::{DiskSpaceManager, MemDiskManager};
use ferrodb::transaction::{
    AriesRecoveryManager, LockContext, LockManager, LogManager, LogRecord, Transaction,
};

struct Engine {
    log: Arc<LogManager>,
    buffer: Arc<BufferManager>,
    recovery: Arc<AriesRecoveryManager>,
}

impl Engine {
    fn boot(dir: &TempDir, disk: &Arc<MemDiskManager>) -> Engine {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let log = LogManager::open(&dir.path().join("wal.log")).unwrap();
        let buffer = BufferManager::new(
            Arc::clone(disk) as Arc<dyn DiskSpaceManager>,
            BufferConfig { num_frames: 512 },
        );
        let db_context = LockContext::root(LockManager::new());
        let recovery = AriesRecoveryManager::new(
            Arc::clone(&log),
            Arc::clone(disk) as Arc<dyn DiskSpaceManager>,
            Arc::clone(&buffer),
            db_context,
            Box::new(Transaction::new),
        );
        buffer.set_listener(Arc::clone(&recovery) as Arc<dyn FlushListener>);
        recovery.initialize().unwrap();
        Engine {
            log,
            buffer,
            recovery,
        }
    }

    fn begin(&self, num: TransactionId) -> Arc<Transaction> {
        let txn = Transaction::new(num);
        self.recovery.start_transaction(Arc::clone(&txn));
        txn
    }

    /// Logs a page write and applies it to the buffered page, the way the
    /// executor does.
    fn update(&self, txn: TransactionId, page: PageNum, offset: u16, bytes: &[u8]) -> Lsn {
        let before = {
            let handle = self.buffer.get_page(page).unwrap();
            handle.read(offset as usize, bytes.len()).unwrap()
        };
        let lsn = self
            .recovery
            .log_page_write(txn, page, offset, &before, bytes)
            .unwrap();
        let handle = self.buffer.get_page(page).unwrap();
        handle.write(offset as usize, bytes).unwrap();
        handle.set_page_lsn(lsn);
        lsn
    }

    fn page_bytes(&self, page: PageNum, offset: usize, len: usize) -> Vec<u8> {
        self.buffer.get_page(page).unwrap().read(offset, len).unwrap()
    }

    /// Full restart: analysis + redo, then the undo/checkpoint continuation.
    fn restart(&self) {
        let undo = self.recovery.restart().unwrap();
        undo().unwrap();
    }

    fn log_records(&self) -> Vec<(Lsn, LogRecord)> {
        self.log
            .scan_from(0)
            .map(|e| e.unwrap())
            .map(|e| (e.lsn, e.record))
            .collect()
    }
}

fn fixture() -> (TempDir, Arc<MemDiskManager>, Vec<PageNum>) {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(MemDiskManager::new());
    let part = disk.alloc_part().unwrap();
    let pages = (0..4).map(|_| disk.alloc_page(part).unwrap()).collect();
    (dir, disk, pages)
}

// =============================================================================
// Forward processing
// =============================================================================

#[test]
fn test_wal_page_eviction_flushes_log_first() {
    let (dir, disk, pages) = fixture();
    let engine = Engine::boot(&dir, &disk);
    engine.begin(1);

    let lsn = engine.update(1, pages[0], 0, &[1, 2, 3, 4]);
    assert!(engine.log.flushed_lsn() <= lsn, "no-force: update not flushed");

    engine.buffer.flush_page(pages[0]).unwrap();
    assert!(
        engine.log.flushed_lsn() > lsn,
        "log must be durable through the page LSN before the page is written"
    );
    // The flushed page leaves the dirty page table.
    assert!(!engine.recovery.dirty_page_table().contains_key(&pages[0]));
}

#[test]
fn test_abort_restores_pre_transaction_bytes() {
    let (dir, disk, pages) = fixture();
    let engine = Engine::boot(&dir, &disk);
    engine.begin(1);

    engine.update(1, pages[0], 0, &[0xAA; 16]);
    engine.update(1, pages[0], 64, &[0xBB; 8]);
    engine.update(1, pages[1], 0, &[0xCC; 4]);

    engine.recovery.abort(1).unwrap();
    engine.recovery.end(1).unwrap();

    assert_eq!(engine.page_bytes(pages[0], 0, 16), vec![0; 16]);
    assert_eq!(engine.page_bytes(pages[0], 64, 8), vec![0; 8]);
    assert_eq!(engine.page_bytes(pages[1], 0, 4), vec![0; 4]);

    // Three updates produced three CLRs and an END record.
    let records = engine.log_records();
    let clrs = records
        .iter()
        .filter(|(_, r)| matches!(r, LogRecord::UndoUpdatePage { .. }))
        .count();
    assert_eq!(clrs, 3);
    assert!(records
        .iter()
        .any(|(_, r)| matches!(r, LogRecord::EndTransaction { transaction_num: 1, .. })));
    assert!(engine.recovery.active_transactions().is_empty());
}

#[test]
fn test_rollback_to_savepoint_is_partial_and_non_inclusive() {
    let (dir, disk, pages) = fixture();
    let engine = Engine::boot(&dir, &disk);
    engine.begin(1);

    engine.update(1, pages[0], 0, &[1; 4]);
    engine.recovery.savepoint(1, "mid").unwrap();
    engine.update(1, pages[0], 8, &[2; 4]);
    engine.update(1, pages[1], 0, &[3; 4]);

    engine.recovery.rollback_to_savepoint(1, "mid").unwrap();

    // Work before the savepoint survives, work after it is undone.
    assert_eq!(engine.page_bytes(pages[0], 0, 4), vec![1; 4]);
    assert_eq!(engine.page_bytes(pages[0], 8, 4), vec![0; 4]);
    assert_eq!(engine.page_bytes(pages[1], 0, 4), vec![0; 4]);

    // The transaction can keep going and commit.
    engine.update(1, pages[2], 0, &[4; 4]);
    engine.recovery.commit(1).unwrap();
    engine.recovery.end(1).unwrap();
    assert_eq!(engine.page_bytes(pages[2], 0, 4), vec![4; 4]);
}

#[test]
fn test_large_write_splits_into_undo_and_redo_halves() {
    let (dir, disk, pages) = fixture();
    let engine = Engine::boot(&dir, &disk);
    engine.begin(1);

    let len = EFFECTIVE_PAGE_SIZE / 2 + 1;
    let last = engine.update(1, pages[0], 0, &vec![9u8; len]);

    let redo_half = engine.log.fetch(last).unwrap().record;
    let first = redo_half.prev_lsn().unwrap();
    let undo_half = engine.log.fetch(first).unwrap().record;
    assert!(redo_half.is_redoable() && !redo_half.is_undoable());
    assert!(undo_half.is_undoable() && !undo_half.is_redoable());

    // recLSN is the undo-only record's LSN.
    assert_eq!(engine.recovery.dirty_page_table().get(&pages[0]), Some(&first));

    // And the split write still rolls back cleanly.
    engine.recovery.abort(1).unwrap();
    engine.recovery.end(1).unwrap();
    assert_eq!(engine.page_bytes(pages[0], 0, len), vec![0u8; len]);
}

#[test]
fn test_checkpoint_packing_respects_record_budget() {
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(MemDiskManager::new());
    let part = disk.alloc_part().unwrap();
    let engine = Engine::boot(&dir, &disk);
    engine.begin(1);

    // Enough dirty pages that one END_CHECKPOINT cannot carry them all.
    let mut pages = Vec::new();
    for _ in 0..300 {
        pages.push(disk.alloc_page(part).unwrap());
    }
    for page in &pages {
        engine.update(1, *page, 0, &[1; 2]);
    }

    engine.recovery.checkpoint().unwrap();

    let mut end_checkpoints = 0;
    for (_, record) in engine.log_records() {
        if let LogRecord::EndCheckpoint {
            dirty_page_table,
            transaction_table,
            touched_pages,
        } = record
        {
            end_checkpoints += 1;
            let touched_total: usize = touched_pages.values().map(Vec::len).sum();
            assert!(
                LogRecord::fits_in_one_record(
                    dirty_page_table.len(),
                    transaction_table.len(),
                    touched_pages.len(),
                    touched_total,
                ),
                "an END_CHECKPOINT record exceeded the budget"
            );
        }
    }
    assert!(end_checkpoints > 2, "large tables must split the checkpoint");
}

// =============================================================================
// Crash and restart
// =============================================================================

#[test]
fn test_restart_reverts_loser_and_keeps_winner() {
    let (dir, disk, pages) = fixture();
    let (p1, p2) = (pages[0], pages[1]);
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(1);
        engine.begin(2);
        engine.update(1, p1, 0, &[0xAA; 8]);
        engine.update(2, p2, 0, &[0xBB; 8]);
        engine.recovery.commit(2).unwrap();
        engine.recovery.end(2).unwrap();
        // Crash: nothing in the buffer pool was flushed.
    }

    let engine = Engine::boot(&dir, &disk);
    engine.restart();

    // The winner's update is redone, the loser's reverted.
    assert_eq!(engine.page_bytes(p2, 0, 8), vec![0xBB; 8]);
    assert_eq!(engine.page_bytes(p1, 0, 8), vec![0; 8]);

    let records = engine.log_records();
    // T1 was rolled back with a CLR chained to the start of its history.
    let clr = records
        .iter()
        .find_map(|(_, r)| match r {
            LogRecord::UndoUpdatePage {
                transaction_num: 1,
                undo_next_lsn,
                ..
            } => Some(*undo_next_lsn),
            _ => None,
        })
        .expect("loser must produce a CLR");
    assert_eq!(clr, 0);
    // Both transactions have END records.
    for txn in [1u64, 2] {
        assert!(
            records.iter().any(|(_, r)| matches!(
                r,
                LogRecord::EndTransaction { transaction_num, .. } if *transaction_num == txn
            )),
            "transaction {txn} must be ended"
        );
    }
    assert!(engine.recovery.active_transactions().is_empty());

    // A clean shutdown empties the dirty page table.
    engine.buffer.flush_all().unwrap();
    engine.recovery.close().unwrap();
    assert!(engine.recovery.dirty_page_table().is_empty());
}

#[test]
fn test_committed_work_survives_crash_without_page_flush() {
    let (dir, disk, pages) = fixture();
    let page = pages[0];
    let mut payload = [0u8; 32];
    rand::rng().fill_bytes(&mut payload);
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(7);
        engine.update(7, page, 100, &payload);
        engine.recovery.commit(7).unwrap();
        // Crash before end() and before any page flush.
    }

    let engine = Engine::boot(&dir, &disk);
    engine.restart();
    assert_eq!(engine.page_bytes(page, 100, 32), payload.to_vec());
    assert!(engine.recovery.active_transactions().is_empty());
}

#[test]
fn test_restart_is_idempotent() {
    let (dir, disk, pages) = fixture();
    let page = pages[0];
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(1);
        engine.begin(2);
        engine.update(1, page, 0, &[1; 4]);
        engine.update(2, pages[1], 0, &[2; 4]);
        engine.recovery.commit(1).unwrap();
    }

    let engine = Engine::boot(&dir, &disk);
    engine.restart();
    let bytes_after_first = engine.page_bytes(page, 0, 4);
    engine.buffer.flush_all().unwrap();
    engine.recovery.close().unwrap();
    drop(engine);

    // Recovering an already-recovered database changes nothing.
    let engine = Engine::boot(&dir, &disk);
    engine.restart();
    assert_eq!(engine.page_bytes(page, 0, 4), bytes_after_first);
    assert_eq!(engine.page_bytes(pages[1], 0, 4), vec![0; 4]);
    assert!(engine.recovery.active_transactions().is_empty());
    assert!(engine.recovery.dirty_page_table().is_empty());
}

#[test]
fn test_checkpoint_bounds_the_analysis_scan() {
    let (dir, disk, pages) = fixture();
    let (p1, p2) = (pages[0], pages[1]);
    let update_lsn;
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(1);
        update_lsn = engine.update(1, p1, 0, &[3; 4]);
        // Flush the page: its update is durable and it leaves the DPT.
        engine.buffer.flush_page(p1).unwrap();
        engine.recovery.checkpoint().unwrap();
        engine.update(1, p2, 0, &[4; 4]);
        engine.recovery.commit(1).unwrap();
    }

    let engine = Engine::boot(&dir, &disk);
    engine.restart();

    // p1 was clean at the checkpoint; redo starts past its update and the
    // page keeps its original page LSN.
    let handle = engine.buffer.get_page(p1).unwrap();
    assert_eq!(handle.page_lsn(), update_lsn);
    drop(handle);
    assert_eq!(engine.page_bytes(p1, 0, 4), vec![3; 4]);
    assert_eq!(engine.page_bytes(p2, 0, 4), vec![4; 4]);
}

#[test]
fn test_restart_undo_walks_lsns_in_descending_order() {
    let (dir, disk, pages) = fixture();
    let (p1, p2) = (pages[0], pages[1]);
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(1);
        engine.begin(2);
        // Interleave: p1, p2, p1, p2 - ascending LSNs alternate txns.
        engine.update(1, p1, 0, &[1; 2]);
        engine.update(2, p2, 0, &[2; 2]);
        engine.update(1, p1, 8, &[3; 2]);
        engine.update(2, p2, 8, &[4; 2]);
        engine.log.flush_all().unwrap();
    }

    let engine = Engine::boot(&dir, &disk);
    engine.restart();

    // Undo across both losers proceeds by descending original LSN, so the
    // CLRs alternate pages in reverse write order.
    let clr_pages: Vec<PageNum> = engine
        .log_records()
        .into_iter()
        .filter_map(|(_, r)| match r {
            LogRecord::UndoUpdatePage { page_num, .. } => Some(page_num),
            _ => None,
        })
        .collect();
    assert_eq!(clr_pages, vec![p2, p1, p2, p1]);

    assert_eq!(engine.page_bytes(p1, 0, 2), vec![0; 2]);
    assert_eq!(engine.page_bytes(p1, 8, 2), vec![0; 2]);
    assert_eq!(engine.page_bytes(p2, 0, 2), vec![0; 2]);
    assert_eq!(engine.page_bytes(p2, 8, 2), vec![0; 2]);
}

#[test]
fn test_crashed_abort_resumes_as_recovery_abort() {
    let (dir, disk, pages) = fixture();
    let page = pages[0];
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(1);
        engine.update(1, page, 0, &[6; 4]);
        engine.recovery.abort(1).unwrap();
        // A checkpoint captures the transaction mid-abort.
        engine.recovery.checkpoint().unwrap();
        engine.log.flush_all().unwrap();
        // Crash before end() performs the rollback.
    }

    let engine = Engine::boot(&dir, &disk);
    let undo = engine.recovery.restart().unwrap();
    let statuses: Vec<TransactionId> = engine.recovery.active_transactions();
    assert_eq!(statuses, vec![1]);
    undo().unwrap();

    assert_eq!(engine.page_bytes(page, 0, 4), vec![0; 4]);
    assert!(engine.recovery.active_transactions().is_empty());
}

#[test]
fn test_transaction_counter_survives_restart() {
    let (dir, disk, _pages) = fixture();
    {
        let engine = Engine::boot(&dir, &disk);
        engine.begin(41);
        engine.recovery.commit(41).unwrap();
        engine.recovery.end(41).unwrap();
        engine.recovery.checkpoint().unwrap();
    }

    let engine = Engine::boot(&dir, &disk);
    engine.restart();
    assert!(engine.recovery.transaction_counter() >= 41);
}
