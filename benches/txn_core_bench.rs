use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use ferrodb::transaction::{
    lock_util, LockContext, LockManager, LockType, LogManager, LogRecord, ResourceName,
    Transaction,
};

fn bench_lock_acquire_release(c: &mut Criterion) {
    let lm = LockManager::new();
    let txn = Transaction::new(1);
    let name = ResourceName::new("database", 0).child("table", 1);

    c.bench_function("lock_acquire_release_uncontended", |b| {
        b.iter(|| {
            lm.acquire(&txn, &name, LockType::X).unwrap();
            lm.release(&txn, &name).unwrap();
        })
    });
}

fn bench_ensure_sufficient_covered(c: &mut Criterion) {
    let db = LockContext::root(LockManager::new());
    let txn = Transaction::new(1);
    let page = db.child("table", 0).child("page", 0);
    lock_util::ensure_sufficient(&txn, &page, LockType::X).unwrap();

    c.bench_function("ensure_sufficient_already_covered", |b| {
        b.iter(|| lock_util::ensure_sufficient(&txn, &page, LockType::X).unwrap())
    });
}

fn bench_log_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(&dir.path().join("wal.log")).unwrap();
    let record = LogRecord::UpdatePage {
        transaction_num: 1,
        prev_lsn: 0,
        page_num: 1 << 32,
        offset: 0,
        before: Some(vec![0u8; 64]),
        after: Some(vec![1u8; 64]),
    };

    c.bench_function("log_append_64b_update", |b| {
        b.iter(|| log.append(record.clone()).unwrap())
    });
}

fn bench_log_append_and_flush(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let log = LogManager::open(&dir.path().join("wal.log")).unwrap();

    c.bench_function("log_commit_append_and_flush", |b| {
        b.iter(|| {
            log.append_and_flush(LogRecord::CommitTransaction {
                transaction_num: 1,
                prev_lsn: 0,
            })
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_lock_acquire_release,
    bench_ensure_sufficient_covered,
    bench_log_append,
    bench_log_append_and_flush,
);
criterion_main!(benches);
