// Lock manager with strict-FIFO wait queues.
//
// Per-resource state is a granted set plus a FIFO queue of pending requests.
// One process-wide mutex serializes all mutations; blocked callers park on
// their transaction's condvar outside the monitor. A request leaves the
// queue only through the head gate: a compatible later request never
// overtakes a blocked earlier one. Promotions and atomic replacements enter
// at the head instead of the tail but still respect the granted set.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::common::TransactionId;

use super::error::{TransactionError, TransactionResult};
use super::lock_type::LockType;
use super::resource::ResourceName;
use super::types::Transaction;

/// A granted lock on a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub name: ResourceName,
    pub lock_type: LockType,
    pub transaction_num: TransactionId,
}

/// Pending request parked on a resource queue.
///
/// `released_names` are released in the same critical section that grants
/// the request; until then the requester keeps holding them.
struct LockRequest {
    transaction: Arc<Transaction>,
    lock_type: LockType,
    released_names: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    granted: Vec<Lock>,
    queue: VecDeque<LockRequest>,
}

impl ResourceEntry {
    /// Compatibility of `lock_type` with every lock granted to other
    /// transactions on this resource.
    fn compatible(&self, lock_type: LockType, except: TransactionId) -> bool {
        self.granted
            .iter()
            .all(|l| l.transaction_num == except || l.lock_type.is_compatible(&lock_type))
    }
}

#[derive(Default)]
struct LockManagerState {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Reverse index: transaction -> resource -> held type.
    transaction_locks: HashMap<TransactionId, BTreeMap<ResourceName, LockType>>,
}

impl LockManagerState {
    fn lock_type_of(&self, txn: TransactionId, name: &ResourceName) -> LockType {
        self.transaction_locks
            .get(&txn)
            .and_then(|locks| locks.get(name))
            .copied()
            .unwrap_or(LockType::NL)
    }

    /// Inserts a lock, replacing any lock the transaction already holds on
    /// the resource.
    fn insert_lock(&mut self, txn: TransactionId, name: &ResourceName, lock_type: LockType) {
        let entry = self.resources.entry(name.clone()).or_default();
        match entry.granted.iter_mut().find(|l| l.transaction_num == txn) {
            Some(lock) => lock.lock_type = lock_type,
            None => entry.granted.push(Lock {
                name: name.clone(),
                lock_type,
                transaction_num: txn,
            }),
        }
        self.transaction_locks
            .entry(txn)
            .or_default()
            .insert(name.clone(), lock_type);
    }

    fn remove_lock(&mut self, txn: TransactionId, name: &ResourceName) {
        if let Some(entry) = self.resources.get_mut(name) {
            entry.granted.retain(|l| l.transaction_num != txn);
            if entry.granted.is_empty() && entry.queue.is_empty() {
                self.resources.remove(name);
            }
        }
        if let Some(locks) = self.transaction_locks.get_mut(&txn) {
            locks.remove(name);
            if locks.is_empty() {
                self.transaction_locks.remove(&txn);
            }
        }
    }
}

/// Lock manager for multigranularity two-phase locking.
///
/// All operations validate synchronously before mutating: `DuplicateLockRequest`,
/// `NoLockHeld` and `InvalidLock` are raised before any state changes.
/// Blocking is never an error; a caller that cannot be granted parks until a
/// release drains its request from the queue.
pub struct LockManager {
    state: Mutex<LockManagerState>,
}

impl LockManager {
    /// Creates a new lock manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockManagerState::default()),
        })
    }

    /// Acquires `lock_type` on `name` for the transaction, blocking until
    /// granted.
    ///
    /// The request is granted immediately only when it is compatible with
    /// every granted lock of other transactions *and* the queue is empty;
    /// otherwise it joins the back of the queue.
    pub fn acquire(
        &self,
        txn: &Arc<Transaction>,
        name: &ResourceName,
        lock_type: LockType,
    ) -> TransactionResult<()> {
        if lock_type == LockType::NL {
            return Err(TransactionError::invalid_lock(
                "cannot acquire an NL lock; release the held lock instead",
            ));
        }
        let mut blocked = false;
        {
            let mut st = self.state.lock();
            if st.lock_type_of(txn.number(), name) != LockType::NL {
                return Err(TransactionError::duplicate_lock_request(txn.number(), name));
            }
            let grant_now = {
                let entry = st.resources.entry(name.clone()).or_default();
                entry.queue.is_empty() && entry.compatible(lock_type, txn.number())
            };
            if grant_now {
                st.insert_lock(txn.number(), name, lock_type);
                trace!(txn = txn.number(), resource = %name, lock = %lock_type, "lock granted");
            } else {
                let entry = st.resources.get_mut(name).expect("entry exists");
                entry.queue.push_back(LockRequest {
                    transaction: Arc::clone(txn),
                    lock_type,
                    released_names: Vec::new(),
                });
                txn.prepare_block();
                blocked = true;
                trace!(txn = txn.number(), resource = %name, lock = %lock_type, "lock request queued");
            }
        }
        if blocked {
            txn.block();
            self.verify_held(txn.number(), name)?;
        }
        Ok(())
    }

    /// Releases the transaction's lock on `name`, then drains the queue head
    /// for as long as the next pending request is compatible with the
    /// updated granted set.
    pub fn release(&self, txn: &Arc<Transaction>, name: &ResourceName) -> TransactionResult<()> {
        let mut st = self.state.lock();
        if st.lock_type_of(txn.number(), name) == LockType::NL {
            return Err(TransactionError::no_lock_held(txn.number(), name));
        }
        st.remove_lock(txn.number(), name);
        trace!(txn = txn.number(), resource = %name, "lock released");
        Self::drain_queues(&mut st, vec![name.clone()]);
        Ok(())
    }

    /// Atomically acquires `lock_type` on `name` while releasing every lock
    /// in `release_names`.
    ///
    /// The new request is processed at the front: it is checked only against
    /// other transactions' granted locks, never placed behind the queue. On
    /// conflict it parks at the queue head and the releases happen when the
    /// grant does. Listing `name` itself in `release_names` makes the call a
    /// promotion rather than a duplicate request.
    pub fn acquire_and_release(
        &self,
        txn: &Arc<Transaction>,
        name: &ResourceName,
        lock_type: LockType,
        release_names: &[ResourceName],
    ) -> TransactionResult<()> {
        if lock_type == LockType::NL {
            return Err(TransactionError::invalid_lock(
                "cannot acquire an NL lock; release the held lock instead",
            ));
        }
        let mut blocked = false;
        {
            let mut st = self.state.lock();
            let held = st.lock_type_of(txn.number(), name);
            if held != LockType::NL && !release_names.contains(name) {
                return Err(TransactionError::duplicate_lock_request(txn.number(), name));
            }
            for released in release_names {
                if st.lock_type_of(txn.number(), released) == LockType::NL {
                    return Err(TransactionError::no_lock_held(txn.number(), released));
                }
            }
            let grant_now = {
                let entry = st.resources.entry(name.clone()).or_default();
                entry.compatible(lock_type, txn.number())
            };
            if grant_now {
                let mut touched = Vec::new();
                for released in release_names {
                    if released != name {
                        st.remove_lock(txn.number(), released);
                        touched.push(released.clone());
                    }
                }
                st.insert_lock(txn.number(), name, lock_type);
                trace!(txn = txn.number(), resource = %name, lock = %lock_type, "lock replaced");
                touched.push(name.clone());
                Self::drain_queues(&mut st, touched);
            } else {
                let entry = st.resources.get_mut(name).expect("entry exists");
                entry.queue.push_front(LockRequest {
                    transaction: Arc::clone(txn),
                    lock_type,
                    released_names: release_names.to_vec(),
                });
                txn.prepare_block();
                blocked = true;
            }
        }
        if blocked {
            txn.block();
            self.verify_type(txn.number(), name, lock_type)?;
        }
        Ok(())
    }

    /// Promotes the transaction's lock on `name` to a strictly stronger
    /// type. A blocked promotion waits at the queue head, not the tail.
    ///
    /// Promotion to SIX is valid from IS, IX, and S even though the
    /// substitutability relation alone would not admit the S upgrade.
    pub fn promote(
        &self,
        txn: &Arc<Transaction>,
        name: &ResourceName,
        new_type: LockType,
    ) -> TransactionResult<()> {
        if new_type == LockType::NL {
            return Err(TransactionError::invalid_lock("cannot promote to NL"));
        }
        let mut blocked = false;
        {
            let mut st = self.state.lock();
            let old = st.lock_type_of(txn.number(), name);
            if old == LockType::NL {
                return Err(TransactionError::no_lock_held(txn.number(), name));
            }
            if old == new_type {
                return Err(TransactionError::duplicate_lock_request(txn.number(), name));
            }
            let valid = if new_type == LockType::SIX {
                matches!(old, LockType::IS | LockType::IX | LockType::S)
            } else {
                new_type.substitutes(&old)
            };
            if !valid {
                return Err(TransactionError::invalid_lock(format!(
                    "cannot promote from {old} to {new_type} on '{name}'"
                )));
            }
            let entry = st.resources.get_mut(name).expect("held lock implies entry");
            if entry.compatible(new_type, txn.number()) {
                st.insert_lock(txn.number(), name, new_type);
                trace!(txn = txn.number(), resource = %name, lock = %new_type, "lock promoted");
            } else {
                entry.queue.push_front(LockRequest {
                    transaction: Arc::clone(txn),
                    lock_type: new_type,
                    released_names: vec![name.clone()],
                });
                txn.prepare_block();
                blocked = true;
            }
        }
        if blocked {
            txn.block();
            self.verify_type(txn.number(), name, new_type)?;
        }
        Ok(())
    }

    /// Removes every queued request of the transaction and unparks it.
    ///
    /// The lock manager has no wait timeouts; the transaction driver calls
    /// this to unilaterally abort a blocked transaction. The parked
    /// operation then returns an `InvalidLock` cancellation error.
    pub fn cancel_requests(&self, txn: &Arc<Transaction>) {
        let mut st = self.state.lock();
        let mut touched = Vec::new();
        for (name, entry) in st.resources.iter_mut() {
            let before = entry.queue.len();
            entry
                .queue
                .retain(|r| r.transaction.number() != txn.number());
            if entry.queue.len() != before {
                touched.push(name.clone());
            }
        }
        Self::drain_queues(&mut st, touched);
        drop(st);
        txn.unblock();
    }

    /// The type the transaction holds on `name`, or NL.
    pub fn get_lock_type(&self, txn: TransactionId, name: &ResourceName) -> LockType {
        self.state.lock().lock_type_of(txn, name)
    }

    /// Every lock granted on `name`.
    pub fn locks_on_resource(&self, name: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|e| e.granted.clone())
            .unwrap_or_default()
    }

    /// Every lock the transaction holds, in resource-path order.
    pub fn locks_held_by(&self, txn: TransactionId) -> Vec<Lock> {
        self.state
            .lock()
            .transaction_locks
            .get(&txn)
            .map(|locks| {
                locks
                    .iter()
                    .map(|(name, lock_type)| Lock {
                        name: name.clone(),
                        lock_type: *lock_type,
                        transaction_num: txn,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of requests waiting on `name`.
    pub fn queue_length(&self, name: &ResourceName) -> usize {
        self.state
            .lock()
            .resources
            .get(name)
            .map(|e| e.queue.len())
            .unwrap_or(0)
    }

    /// Grants queued requests starting at each touched resource's head,
    /// stopping at the first incompatible request. Granting a request
    /// releases its release set, which may make further resources drainable;
    /// those are processed in the same pass.
    fn drain_queues(st: &mut LockManagerState, mut pending: Vec<ResourceName>) {
        while let Some(name) = pending.pop() {
            loop {
                let grantable = match st.resources.get(&name) {
                    Some(entry) => match entry.queue.front() {
                        Some(req) => entry.compatible(req.lock_type, req.transaction.number()),
                        None => false,
                    },
                    None => false,
                };
                if !grantable {
                    break;
                }
                let req = st
                    .resources
                    .get_mut(&name)
                    .expect("checked above")
                    .queue
                    .pop_front()
                    .expect("checked above");
                let txn_num = req.transaction.number();
                for released in &req.released_names {
                    if *released != name {
                        st.remove_lock(txn_num, released);
                        pending.push(released.clone());
                    }
                }
                st.insert_lock(txn_num, &name, req.lock_type);
                trace!(txn = txn_num, resource = %name, lock = %req.lock_type, "queued lock granted");
                req.transaction.unblock();
            }
        }
    }

    fn verify_held(&self, txn: TransactionId, name: &ResourceName) -> TransactionResult<()> {
        if self.get_lock_type(txn, name) == LockType::NL {
            return Err(TransactionError::invalid_lock(
                "lock request cancelled while waiting",
            ));
        }
        Ok(())
    }

    fn verify_type(
        &self,
        txn: TransactionId,
        name: &ResourceName,
        expected: LockType,
    ) -> TransactionResult<()> {
        if self.get_lock_type(txn, name) != expected {
            return Err(TransactionError::invalid_lock(
                "lock request cancelled while waiting",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("LockManager")
            .field("resources", &st.resources.len())
            .field("transactions", &st.transaction_locks.len())
            .finish()
    }
}
