// Hierarchical lock contexts.
//
// A `LockContext` wraps one level of the resource hierarchy (database,
// table, page) over the flat `LockManager` and enforces the
// multigranularity discipline: intent locks on ancestors before real locks
// below, bottom-up release, redundancy rejection under SIX. Contexts form a
// tree with weak parent links; children are materialized lazily.
//
// Per-transaction child-lock counters track how many locks the transaction
// holds strictly below each node, which gates release order and lets
// escalation verify it swept the subtree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::common::TransactionId;

use super::error::{TransactionError, TransactionResult};
use super::lock_manager::{Lock, LockManager};
use super::lock_type::LockType;
use super::resource::ResourceName;
use super::types::Transaction;

/// One node of the lock hierarchy.
pub struct LockContext {
    lock_manager: Arc<LockManager>,
    parent: Option<Weak<LockContext>>,
    name: ResourceName,
    readonly: bool,
    child_locks_disabled: AtomicBool,
    children: Mutex<HashMap<(String, u64), Arc<LockContext>>>,
    child_lock_counts: Mutex<HashMap<TransactionId, usize>>,
}

impl LockContext {
    /// Creates the root context, named `database#0`.
    pub fn root(lock_manager: Arc<LockManager>) -> Arc<Self> {
        Arc::new(Self {
            lock_manager,
            parent: None,
            name: ResourceName::new("database", 0),
            readonly: false,
            child_locks_disabled: AtomicBool::new(false),
            children: Mutex::new(HashMap::new()),
            child_lock_counts: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the child context for `(label, id)`, creating it on first
    /// use. Children of a context with disabled child locks are readonly.
    pub fn child(self: &Arc<Self>, label: &str, id: u64) -> Arc<LockContext> {
        let mut children = self.children.lock();
        Arc::clone(
            children
                .entry((label.to_string(), id))
                .or_insert_with(|| {
                    Arc::new(LockContext {
                        lock_manager: Arc::clone(&self.lock_manager),
                        parent: Some(Arc::downgrade(self)),
                        name: self.name.child(label, id),
                        readonly: self.readonly
                            || self.child_locks_disabled.load(Ordering::Relaxed),
                        child_locks_disabled: AtomicBool::new(false),
                        children: Mutex::new(HashMap::new()),
                        child_lock_counts: Mutex::new(HashMap::new()),
                    })
                }),
        )
    }

    /// This context's resource name.
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// The parent context, if any.
    pub fn parent(&self) -> Option<Arc<LockContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Marks children of this context readonly from now on. Used for
    /// hierarchies the engine manages itself (indexes, temporary tables).
    pub fn disable_child_locks(&self) {
        self.child_locks_disabled.store(true, Ordering::Relaxed);
    }

    /// Number of locks the transaction holds strictly below this node.
    pub fn num_child_locks(&self, txn: TransactionId) -> usize {
        self.child_lock_counts.lock().get(&txn).copied().unwrap_or(0)
    }

    /// Acquires `lock_type` on this resource after checking the
    /// multigranularity preconditions against the parent and ancestors.
    pub fn acquire(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
        lock_type: LockType,
    ) -> TransactionResult<()> {
        self.check_writable("acquire")?;
        if lock_type == LockType::NL {
            return Err(TransactionError::invalid_lock(
                "cannot acquire an NL lock; release the held lock instead",
            ));
        }
        self.check_hierarchy(txn.number(), lock_type)?;
        self.lock_manager.acquire(txn, &self.name, lock_type)?;
        self.increment_ancestor_counts(txn.number());
        Ok(())
    }

    /// Releases this resource's lock. Locks must be released bottom-up:
    /// releasing while the transaction still holds locks below this node is
    /// invalid.
    pub fn release(self: &Arc<Self>, txn: &Arc<Transaction>) -> TransactionResult<()> {
        self.check_writable("release")?;
        let txn_num = txn.number();
        if self.num_child_locks(txn_num) > 0 {
            return Err(TransactionError::invalid_lock(format!(
                "cannot release '{}': transaction {} still holds locks below it",
                self.name, txn_num
            )));
        }
        self.lock_manager.release(txn, &self.name)?;
        self.decrement_ancestor_counts(txn_num);
        Ok(())
    }

    /// Promotes this resource's lock to `new_type`.
    ///
    /// A SIX target atomically releases every descendant S/IS lock the
    /// transaction holds (they become redundant) in the same operation that
    /// upgrades this node.
    pub fn promote(
        self: &Arc<Self>,
        txn: &Arc<Transaction>,
        new_type: LockType,
    ) -> TransactionResult<()> {
        self.check_writable("promote")?;
        let txn_num = txn.number();
        if new_type == LockType::SIX {
            if self.ancestor_holds_six(txn_num) {
                return Err(TransactionError::invalid_lock(format!(
                    "an ancestor of '{}' already holds SIX; the promotion is redundant",
                    self.name
                )));
            }
            if let Some(parent) = self.parent() {
                let parent_type = parent.explicit_lock_type(txn_num);
                if !matches!(parent_type, LockType::IX | LockType::SIX) {
                    return Err(TransactionError::invalid_lock(format!(
                        "parent '{}' holds {parent_type}, which does not permit SIX children",
                        parent.name
                    )));
                }
            }
            let held = self.explicit_lock_type(txn_num);
            if held == LockType::NL {
                return Err(TransactionError::no_lock_held(txn_num, &self.name));
            }
            if held == LockType::SIX {
                return Err(TransactionError::duplicate_lock_request(txn_num, &self.name));
            }
            if !matches!(held, LockType::IS | LockType::IX | LockType::S) {
                return Err(TransactionError::invalid_lock(format!(
                    "cannot promote from {held} to SIX on '{}'",
                    self.name
                )));
            }
            let redundant: Vec<ResourceName> = self
                .descendant_locks(txn_num)
                .into_iter()
                .filter(|l| matches!(l.lock_type, LockType::S | LockType::IS))
                .map(|l| l.name)
                .collect();
            let mut release_names = redundant.clone();
            release_names.push(self.name.clone());
            self.lock_manager
                .acquire_and_release(txn, &self.name, LockType::SIX, &release_names)?;
            for released in &redundant {
                self.descendant_context(released)
                    .decrement_ancestor_counts(txn_num);
            }
            trace!(txn = txn_num, resource = %self.name, "promoted to SIX, released {} descendants", redundant.len());
        } else {
            self.check_hierarchy(txn_num, new_type)?;
            self.lock_manager.promote(txn, &self.name, new_type)?;
        }
        Ok(())
    }

    /// Escalates this subtree's locks into a single lock at this level.
    ///
    /// The replacement is S when S covers this lock and every descendant
    /// lock (only IS/S in the subtree), X otherwise. Already-escalated
    /// contexts (holding S or X) are a no-op. Descendants are enumerated
    /// through the lock manager's per-transaction index so that locks
    /// acquired through never-materialized child contexts are still swept.
    pub fn escalate(self: &Arc<Self>, txn: &Arc<Transaction>) -> TransactionResult<()> {
        self.check_writable("escalate")?;
        let txn_num = txn.number();
        let held = self.explicit_lock_type(txn_num);
        if held == LockType::NL {
            return Err(TransactionError::no_lock_held(txn_num, &self.name));
        }
        if matches!(held, LockType::S | LockType::X) {
            return Ok(());
        }
        let descendants = self.descendant_locks(txn_num);
        let target = if std::iter::once(held)
            .chain(descendants.iter().map(|l| l.lock_type))
            .all(|t| LockType::S.substitutes(&t))
        {
            LockType::S
        } else {
            LockType::X
        };
        let mut release_names: Vec<ResourceName> =
            descendants.iter().map(|l| l.name.clone()).collect();
        release_names.push(self.name.clone());
        self.lock_manager
            .acquire_and_release(txn, &self.name, target, &release_names)?;
        for lock in &descendants {
            self.descendant_context(&lock.name)
                .decrement_ancestor_counts(txn_num);
        }
        trace!(txn = txn_num, resource = %self.name, target = %target, "escalated {} descendant locks", descendants.len());
        Ok(())
    }

    /// Releases every lock the transaction holds at or below this context,
    /// deepest first. Used when a transaction finishes.
    pub fn release_all(self: &Arc<Self>, txn: &Arc<Transaction>) -> TransactionResult<()> {
        let txn_num = txn.number();
        let mut locks: Vec<Lock> = self
            .lock_manager
            .locks_held_by(txn_num)
            .into_iter()
            .filter(|l| l.name == self.name || self.name.is_ancestor_of(&l.name))
            .collect();
        locks.sort_by_key(|l| std::cmp::Reverse(l.name.depth()));
        for lock in locks {
            let context = if lock.name == self.name {
                Arc::clone(self)
            } else {
                self.descendant_context(&lock.name)
            };
            context.release(txn)?;
        }
        Ok(())
    }

    /// The lock explicitly held on this resource, or NL.
    pub fn get_explicit_lock_type(&self, txn: TransactionId) -> LockType {
        self.explicit_lock_type(txn)
    }

    /// The privilege the transaction effectively has at this level: the
    /// explicit lock when it is a real (non-intent) lock, otherwise the
    /// nearest real lock on an ancestor. A SIX on this node or an ancestor
    /// yields S; intent-only paths yield NL.
    pub fn get_effective_lock_type(&self, txn: TransactionId) -> LockType {
        let explicit = self.explicit_lock_type(txn);
        if explicit == LockType::SIX {
            return LockType::S;
        }
        if explicit != LockType::NL && !explicit.is_intent() {
            return explicit;
        }
        let mut cur = self.parent();
        while let Some(ancestor) = cur {
            let held = ancestor.explicit_lock_type(txn);
            if held == LockType::SIX {
                return LockType::S;
            }
            if held != LockType::NL && !held.is_intent() {
                return held;
            }
            cur = ancestor.parent();
        }
        LockType::NL
    }

    fn explicit_lock_type(&self, txn: TransactionId) -> LockType {
        self.lock_manager.get_lock_type(txn, &self.name)
    }

    fn check_writable(&self, op: &str) -> TransactionResult<()> {
        if self.readonly {
            return Err(TransactionError::unsupported(format!(
                "cannot {op} on readonly context '{}'",
                self.name
            )));
        }
        Ok(())
    }

    /// Multigranularity preconditions for acquiring or promoting to
    /// `lock_type` at this level. The root has no parent check.
    fn check_hierarchy(&self, txn: TransactionId, lock_type: LockType) -> TransactionResult<()> {
        let Some(parent) = self.parent() else {
            return Ok(());
        };
        let parent_type = parent.explicit_lock_type(txn);
        match lock_type {
            LockType::S | LockType::IS => {
                if !matches!(parent_type, LockType::IS | LockType::IX) {
                    return Err(TransactionError::invalid_lock(format!(
                        "parent '{}' holds {parent_type}, which does not permit {lock_type} children",
                        parent.name
                    )));
                }
                if self.ancestor_holds_six(txn) {
                    return Err(TransactionError::invalid_lock(format!(
                        "an ancestor of '{}' holds SIX; {lock_type} here is redundant",
                        self.name
                    )));
                }
            }
            LockType::X | LockType::IX | LockType::SIX => {
                if !matches!(parent_type, LockType::IX | LockType::SIX) {
                    return Err(TransactionError::invalid_lock(format!(
                        "parent '{}' holds {parent_type}, which does not permit {lock_type} children",
                        parent.name
                    )));
                }
            }
            LockType::NL => {}
        }
        Ok(())
    }

    fn ancestor_holds_six(&self, txn: TransactionId) -> bool {
        let mut cur = self.parent();
        while let Some(ancestor) = cur {
            if ancestor.explicit_lock_type(txn) == LockType::SIX {
                return true;
            }
            cur = ancestor.parent();
        }
        false
    }

    /// Locks the transaction holds strictly below this node, found through
    /// the lock manager's reverse index filtered by path prefix.
    fn descendant_locks(&self, txn: TransactionId) -> Vec<Lock> {
        self.lock_manager
            .locks_held_by(txn)
            .into_iter()
            .filter(|l| self.name.is_ancestor_of(&l.name))
            .collect()
    }

    /// Materializes the context at a descendant resource name.
    fn descendant_context(self: &Arc<Self>, name: &ResourceName) -> Arc<LockContext> {
        let mut ctx = Arc::clone(self);
        for (label, id) in &name.segments()[self.name.depth()..] {
            ctx = ctx.child(label, *id);
        }
        ctx
    }

    fn increment_ancestor_counts(&self, txn: TransactionId) {
        let mut cur = self.parent();
        while let Some(ancestor) = cur {
            *ancestor.child_lock_counts.lock().entry(txn).or_insert(0) += 1;
            cur = ancestor.parent();
        }
    }

    fn decrement_ancestor_counts(&self, txn: TransactionId) {
        let mut cur = self.parent();
        while let Some(ancestor) = cur {
            let mut counts = ancestor.child_lock_counts.lock();
            if let Some(count) = counts.get_mut(&txn) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&txn);
                }
            }
            drop(counts);
            cur = ancestor.parent();
        }
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("name", &self.name.to_string())
            .field("readonly", &self.readonly)
            .finish()
    }
}
