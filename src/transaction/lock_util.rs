// Declarative lock acquisition.
//
// `ensure_sufficient` is the entry point the executor and recovery use:
// "make sure this transaction can do S/X at this level", with all the
// ancestor intents, promotions, SIX upgrades, and escalations that implies.

use std::sync::Arc;

use super::error::TransactionResult;
use super::lock_context::LockContext;
use super::lock_type::LockType;
use super::types::Transaction;

/// Ensures the transaction's effective lock on `context` substitutes
/// `requested`, acquiring or reshaping locks along the path as needed.
///
/// `requested` must be NL, S, or X. NL requests are trivially satisfied.
/// Idempotent: calling twice with the same arguments leaves the lock state
/// unchanged.
pub fn ensure_sufficient(
    txn: &Arc<Transaction>,
    context: &Arc<LockContext>,
    requested: LockType,
) -> TransactionResult<()> {
    debug_assert!(
        matches!(requested, LockType::NL | LockType::S | LockType::X),
        "ensure_sufficient takes a real privilege, not an intent",
    );
    if requested == LockType::NL {
        return Ok(());
    }
    let txn_num = txn.number();
    if context.get_effective_lock_type(txn_num).substitutes(&requested) {
        return Ok(());
    }

    // Ancestors need IS for an S request, IX for an X request, topmost
    // first so each acquisition sees its own parent already prepared.
    let needed_intent = requested.parent_intent();
    let mut ancestors = Vec::new();
    let mut cur = context.parent();
    while let Some(ancestor) = cur {
        cur = ancestor.parent();
        ancestors.push(ancestor);
    }
    for ancestor in ancestors.into_iter().rev() {
        let held = ancestor.get_explicit_lock_type(txn_num);
        if held == LockType::NL {
            ancestor.acquire(txn, needed_intent)?;
        } else if !held.substitutes(&needed_intent) {
            // Only reachable for an X request over an S-or-IS ancestor: S
            // cannot become IX directly, so it goes to SIX instead.
            if needed_intent == LockType::IX && held == LockType::S {
                ancestor.promote(txn, LockType::SIX)?;
            } else {
                ancestor.promote(txn, needed_intent)?;
            }
        }
    }

    match context.get_explicit_lock_type(txn_num) {
        LockType::IX if requested == LockType::S => context.promote(txn, LockType::SIX),
        held if held.is_intent() => {
            context.escalate(txn)?;
            if !context
                .get_explicit_lock_type(txn_num)
                .substitutes(&requested)
            {
                context.promote(txn, requested)?;
            }
            Ok(())
        }
        LockType::NL => context.acquire(txn, requested),
        _ => context.promote(txn, requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::lock_manager::LockManager;

    fn setup() -> (Arc<LockContext>, Arc<Transaction>) {
        (LockContext::root(LockManager::new()), Transaction::new(0))
    }

    #[test]
    fn test_acquires_ancestor_intents() {
        let (db, t0) = setup();
        let page = db.child("table", 0).child("page", 0);

        ensure_sufficient(&t0, &page, LockType::S).unwrap();
        assert_eq!(db.get_explicit_lock_type(0), LockType::IS);
        assert_eq!(db.child("table", 0).get_explicit_lock_type(0), LockType::IS);
        assert_eq!(page.get_explicit_lock_type(0), LockType::S);
    }

    #[test]
    fn test_idempotent() {
        let (db, t0) = setup();
        let page = db.child("table", 0).child("page", 0);

        ensure_sufficient(&t0, &page, LockType::X).unwrap();
        let before: Vec<_> = [
            db.get_explicit_lock_type(0),
            db.child("table", 0).get_explicit_lock_type(0),
            page.get_explicit_lock_type(0),
        ]
        .to_vec();
        ensure_sufficient(&t0, &page, LockType::X).unwrap();
        let after: Vec<_> = [
            db.get_explicit_lock_type(0),
            db.child("table", 0).get_explicit_lock_type(0),
            page.get_explicit_lock_type(0),
        ]
        .to_vec();
        assert_eq!(before, after);
        assert_eq!(page.get_effective_lock_type(0), LockType::X);
    }

    #[test]
    fn test_read_then_write_upgrades_path() {
        let (db, t0) = setup();
        let table = db.child("table", 0);

        ensure_sufficient(&t0, &table, LockType::S).unwrap();
        assert_eq!(db.get_explicit_lock_type(0), LockType::IS);

        ensure_sufficient(&t0, &table, LockType::X).unwrap();
        assert_eq!(db.get_explicit_lock_type(0), LockType::IX);
        assert_eq!(table.get_explicit_lock_type(0), LockType::X);
    }

    #[test]
    fn test_ix_with_read_request_becomes_six() {
        let (db, t0) = setup();
        let table = db.child("table", 0);
        let page = table.child("page", 0);

        ensure_sufficient(&t0, &page, LockType::X).unwrap();
        assert_eq!(table.get_explicit_lock_type(0), LockType::IX);

        // Reading the whole table under IX upgrades the table to SIX and
        // keeps the page X.
        ensure_sufficient(&t0, &table, LockType::S).unwrap();
        assert_eq!(table.get_explicit_lock_type(0), LockType::SIX);
        assert_eq!(page.get_explicit_lock_type(0), LockType::X);
        assert!(table.get_effective_lock_type(0).substitutes(&LockType::S));
    }

    #[test]
    fn test_intent_only_context_escalates() {
        let (db, t0) = setup();
        let table = db.child("table", 0);
        let page = table.child("page", 0);

        ensure_sufficient(&t0, &page, LockType::S).unwrap();
        // Requesting S on the table itself collapses the subtree.
        ensure_sufficient(&t0, &table, LockType::S).unwrap();
        assert_eq!(table.get_explicit_lock_type(0), LockType::S);
        assert_eq!(page.get_explicit_lock_type(0), LockType::NL);
    }

    #[test]
    fn test_effective_coverage_short_circuits() {
        let (db, t0) = setup();
        let page = db.child("table", 0).child("page", 0);

        ensure_sufficient(&t0, &db, LockType::X).unwrap();
        assert_eq!(db.get_explicit_lock_type(0), LockType::X);

        // Page is already covered; nothing new is acquired.
        ensure_sufficient(&t0, &page, LockType::S).unwrap();
        assert_eq!(page.get_explicit_lock_type(0), LockType::NL);
    }
}
