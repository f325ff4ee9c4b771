// Comprehensive tests for the multigranularity lock stack: FIFO queue
// behavior under contention, hierarchy discipline, SIX handling, escalation,
// and the declarative ensure façade.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ferrodb::transaction::{
    lock_util, Lock, LockContext, LockManager, LockType, ResourceName, Transaction,
    TransactionError,
};

fn database() -> ResourceName {
    ResourceName::new("database", 0)
}

/// Polls until `cond` holds; panics after ~2 seconds.
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for: {what}");
}

#[test]
fn test_acquire_then_release_leaves_no_locks() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let tbl = database().child("table", 0);

    lm.acquire(&t0, &tbl, LockType::S).unwrap();
    assert_eq!(
        lm.locks_on_resource(&tbl),
        vec![Lock {
            name: tbl.clone(),
            lock_type: LockType::S,
            transaction_num: 0
        }]
    );
    lm.release(&t0, &tbl).unwrap();
    assert_eq!(lm.locks_on_resource(&tbl), vec![]);
}

#[test]
fn test_conflicting_acquire_blocks_until_release() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let db = database();

    lm.acquire(&t0, &db, LockType::X).unwrap();

    let waiter = {
        let lm = Arc::clone(&lm);
        let t1 = Arc::clone(&t1);
        let db = db.clone();
        thread::spawn(move || lm.acquire(&t1, &db, LockType::X))
    };
    wait_until("T1 to block", || t1.is_blocked());
    assert_eq!(lm.get_lock_type(1, &db), LockType::NL);

    lm.release(&t0, &db).unwrap();
    waiter.join().unwrap().unwrap();
    assert!(!t1.is_blocked());
    assert_eq!(lm.get_lock_type(1, &db), LockType::X);
}

#[test]
fn test_fifo_compatible_request_does_not_overtake() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let t2 = Transaction::new(2);
    let db = database();

    lm.acquire(&t0, &db, LockType::X).unwrap();

    let w1 = {
        let (lm, t1, db) = (Arc::clone(&lm), Arc::clone(&t1), db.clone());
        thread::spawn(move || lm.acquire(&t1, &db, LockType::X))
    };
    wait_until("T1 to queue", || t1.is_blocked());

    // T2 queues behind T1 regardless of what it asks for.
    let w2 = {
        let (lm, t2, db) = (Arc::clone(&lm), Arc::clone(&t2), db.clone());
        thread::spawn(move || lm.acquire(&t2, &db, LockType::S))
    };
    wait_until("T2 to queue", || t2.is_blocked());
    assert_eq!(lm.queue_length(&db), 2);

    lm.release(&t0, &db).unwrap();
    w1.join().unwrap().unwrap();
    assert_eq!(lm.get_lock_type(1, &db), LockType::X);

    // T2 stays blocked behind T1's X.
    thread::sleep(Duration::from_millis(50));
    assert!(t2.is_blocked());
    assert_eq!(lm.get_lock_type(2, &db), LockType::NL);

    lm.release(&t1, &db).unwrap();
    w2.join().unwrap().unwrap();
    assert_eq!(lm.get_lock_type(2, &db), LockType::S);
}

#[test]
fn test_release_grants_compatible_prefix_together() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let t2 = Transaction::new(2);
    let t3 = Transaction::new(3);
    let db = database();

    lm.acquire(&t0, &db, LockType::X).unwrap();

    let mut waiters = Vec::new();
    for (txn, lock_type) in [
        (Arc::clone(&t1), LockType::S),
        (Arc::clone(&t2), LockType::S),
        (Arc::clone(&t3), LockType::X),
    ] {
        let (lm, db) = (Arc::clone(&lm), db.clone());
        let handle = {
            let txn = Arc::clone(&txn);
            thread::spawn(move || lm.acquire(&txn, &db, lock_type))
        };
        wait_until("request to queue", || txn.is_blocked());
        waiters.push(handle);
    }
    assert_eq!(lm.queue_length(&db), 3);

    lm.release(&t0, &db).unwrap();

    // Both shared requests leave the queue together; the X stays.
    wait_until("T1 and T2 to be granted", || {
        lm.get_lock_type(1, &db) == LockType::S && lm.get_lock_type(2, &db) == LockType::S
    });
    thread::sleep(Duration::from_millis(50));
    assert!(t3.is_blocked());
    assert_eq!(lm.queue_length(&db), 1);

    lm.release(&t1, &db).unwrap();
    lm.release(&t2, &db).unwrap();
    for w in waiters {
        w.join().unwrap().unwrap();
    }
    assert_eq!(lm.get_lock_type(3, &db), LockType::X);
}

#[test]
fn test_duplicate_and_missing_lock_errors() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let db = database();

    lm.acquire(&t0, &db, LockType::S).unwrap();
    assert!(matches!(
        lm.acquire(&t0, &db, LockType::S).unwrap_err(),
        TransactionError::DuplicateLockRequest { .. }
    ));
    lm.release(&t0, &db).unwrap();
    assert!(matches!(
        lm.release(&t0, &db).unwrap_err(),
        TransactionError::NoLockHeld { .. }
    ));
}

#[test]
fn test_blocked_promotion_waits_at_queue_head() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let t2 = Transaction::new(2);
    let db = database();

    lm.acquire(&t0, &db, LockType::S).unwrap();
    lm.acquire(&t1, &db, LockType::S).unwrap();

    // T2 queues for X first.
    let w2 = {
        let (lm, t2, db) = (Arc::clone(&lm), Arc::clone(&t2), db.clone());
        thread::spawn(move || lm.acquire(&t2, &db, LockType::X))
    };
    wait_until("T2 to queue", || t2.is_blocked());

    // T0's promotion to SIX conflicts with T1's S, so it waits, but ahead
    // of T2.
    let w0 = {
        let (lm, t0, db) = (Arc::clone(&lm), Arc::clone(&t0), db.clone());
        thread::spawn(move || lm.promote(&t0, &db, LockType::SIX))
    };
    wait_until("T0 promotion to queue", || t0.is_blocked());
    assert_eq!(lm.queue_length(&db), 2);

    lm.release(&t1, &db).unwrap();
    w0.join().unwrap().unwrap();
    assert_eq!(lm.get_lock_type(0, &db), LockType::SIX);

    thread::sleep(Duration::from_millis(50));
    assert!(t2.is_blocked());

    lm.release(&t0, &db).unwrap();
    w2.join().unwrap().unwrap();
    assert_eq!(lm.get_lock_type(2, &db), LockType::X);
}

#[test]
fn test_atomic_replacement_is_processed_at_the_front() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let tbl = database().child("table", 0);
    let page = tbl.child("page", 1);

    lm.acquire(&t0, &tbl, LockType::IX).unwrap();
    lm.acquire(&t0, &page, LockType::X).unwrap();

    let w1 = {
        let (lm, t1, tbl) = (Arc::clone(&lm), Arc::clone(&t1), tbl.clone());
        thread::spawn(move || lm.acquire(&t1, &tbl, LockType::X))
    };
    wait_until("T1 to queue", || t1.is_blocked());

    // Escalation-style replacement is checked against granted locks only;
    // the queued X does not delay it.
    lm.acquire_and_release(&t0, &tbl, LockType::X, &[tbl.clone(), page.clone()])
        .unwrap();
    assert_eq!(lm.get_lock_type(0, &tbl), LockType::X);
    assert_eq!(lm.get_lock_type(0, &page), LockType::NL);
    assert!(t1.is_blocked());

    lm.release(&t0, &tbl).unwrap();
    w1.join().unwrap().unwrap();
    assert_eq!(lm.get_lock_type(1, &tbl), LockType::X);
}

#[test]
fn test_cancelled_waiter_returns_error() {
    let lm = LockManager::new();
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let db = database();

    lm.acquire(&t0, &db, LockType::X).unwrap();
    let w1 = {
        let (lm, t1, db) = (Arc::clone(&lm), Arc::clone(&t1), db.clone());
        thread::spawn(move || lm.acquire(&t1, &db, LockType::S))
    };
    wait_until("T1 to queue", || t1.is_blocked());

    lm.cancel_requests(&t1);
    let result = w1.join().unwrap();
    assert!(matches!(result, Err(TransactionError::InvalidLock(_))));
    assert_eq!(lm.get_lock_type(1, &db), LockType::NL);
    assert_eq!(lm.queue_length(&db), 0);
}

// =============================================================================
// Hierarchy discipline
// =============================================================================

#[test]
fn test_child_lock_requires_parent_intent() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let table = db.child("table", 0);

    assert!(matches!(
        table.acquire(&t0, LockType::S).unwrap_err(),
        TransactionError::InvalidLock(_)
    ));
    db.acquire(&t0, LockType::IS).unwrap();
    table.acquire(&t0, LockType::S).unwrap();
}

#[test]
fn test_six_at_database_blocks_descendant_reads() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let table = db.child("table", 2);
    let page = table.child("page", 7);

    db.acquire(&t0, LockType::SIX).unwrap();
    for (ctx, lock_type) in [
        (&table, LockType::S),
        (&table, LockType::IS),
        (&page, LockType::S),
    ] {
        assert!(
            matches!(
                ctx.acquire(&t0, lock_type).unwrap_err(),
                TransactionError::InvalidLock(_)
            ),
            "{lock_type} under a SIX ancestor must be rejected"
        );
    }
}

#[test]
fn test_promote_to_six_releases_shared_descendants() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let table = db.child("table", 0);
    let page = table.child("page", 0);

    db.acquire(&t0, LockType::IX).unwrap();
    table.acquire(&t0, LockType::IX).unwrap();
    page.acquire(&t0, LockType::S).unwrap();

    table.promote(&t0, LockType::SIX).unwrap();
    assert_eq!(table.get_explicit_lock_type(0), LockType::SIX);
    assert_eq!(page.get_explicit_lock_type(0), LockType::NL);
    assert_eq!(table.num_child_locks(0), 0);
}

#[test]
fn test_escalate_collapses_subtree() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let table = db.child("table", 0);
    let p1 = table.child("page", 1);
    let p2 = table.child("page", 2);

    db.acquire(&t0, LockType::IX).unwrap();
    table.acquire(&t0, LockType::IX).unwrap();
    p1.acquire(&t0, LockType::S).unwrap();
    p2.acquire(&t0, LockType::X).unwrap();

    table.escalate(&t0).unwrap();
    assert_eq!(table.get_explicit_lock_type(0), LockType::X);
    assert_eq!(p1.get_explicit_lock_type(0), LockType::NL);
    assert_eq!(p2.get_explicit_lock_type(0), LockType::NL);

    // Second escalation is a no-op.
    table.escalate(&t0).unwrap();
    assert_eq!(table.get_explicit_lock_type(0), LockType::X);
}

#[test]
fn test_escalate_sweeps_locks_from_unmaterialized_contexts() {
    let lm = LockManager::new();
    let db = LockContext::root(Arc::clone(&lm));
    let t0 = Transaction::new(0);
    let table = db.child("table", 0);

    db.acquire(&t0, LockType::IS).unwrap();
    table.acquire(&t0, LockType::IS).unwrap();
    // Take a page lock straight through the lock manager, bypassing any
    // child context materialization.
    let page_name = table.name().child("page", 9);
    lm.acquire(&t0, &page_name, LockType::S).unwrap();

    table.escalate(&t0).unwrap();
    assert_eq!(table.get_explicit_lock_type(0), LockType::S);
    assert_eq!(lm.get_lock_type(0, &page_name), LockType::NL);
}

#[test]
fn test_num_child_locks_counts_descendants() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let table = db.child("table", 0);
    let p1 = table.child("page", 1);
    let p2 = table.child("page", 2);

    db.acquire(&t0, LockType::IX).unwrap();
    table.acquire(&t0, LockType::IX).unwrap();
    p1.acquire(&t0, LockType::X).unwrap();
    p2.acquire(&t0, LockType::X).unwrap();

    assert_eq!(db.num_child_locks(0), 3);
    assert_eq!(table.num_child_locks(0), 2);

    p1.release(&t0).unwrap();
    assert_eq!(db.num_child_locks(0), 2);
    assert_eq!(table.num_child_locks(0), 1);
}

// =============================================================================
// ensure_sufficient
// =============================================================================

#[test]
fn test_ensure_sufficient_round_trip() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let page = db.child("table", 0).child("page", 0);

    for requested in [LockType::S, LockType::X] {
        lock_util::ensure_sufficient(&t0, &page, requested).unwrap();
        assert!(
            page.get_effective_lock_type(0).substitutes(&requested),
            "effective lock must cover {requested}"
        );
    }
    // Idempotent.
    let snapshot = page.get_explicit_lock_type(0);
    lock_util::ensure_sufficient(&t0, &page, LockType::X).unwrap();
    assert_eq!(page.get_explicit_lock_type(0), snapshot);
}

#[test]
fn test_ensure_sufficient_escalates_intent_context() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let table = db.child("table", 0);
    let p1 = table.child("page", 1);
    let p2 = table.child("page", 2);

    lock_util::ensure_sufficient(&t0, &p1, LockType::X).unwrap();
    lock_util::ensure_sufficient(&t0, &p2, LockType::S).unwrap();
    assert_eq!(table.get_explicit_lock_type(0), LockType::IX);

    lock_util::ensure_sufficient(&t0, &table, LockType::X).unwrap();
    assert_eq!(table.get_explicit_lock_type(0), LockType::X);
    assert_eq!(p1.get_explicit_lock_type(0), LockType::NL);
    assert_eq!(p2.get_explicit_lock_type(0), LockType::NL);
}

#[test]
fn test_two_readers_share_the_hierarchy() {
    let db = LockContext::root(LockManager::new());
    let t0 = Transaction::new(0);
    let t1 = Transaction::new(1);
    let page = db.child("table", 0).child("page", 0);

    lock_util::ensure_sufficient(&t0, &page, LockType::S).unwrap();
    lock_util::ensure_sufficient(&t1, &page, LockType::S).unwrap();
    assert!(!t0.is_blocked());
    assert!(!t1.is_blocked());
    assert_eq!(page.get_effective_lock_type(0), LockType::S);
    assert_eq!(page.get_effective_lock_type(1), LockType::S);
}
