// Transaction Management Module
//
// Concurrency control and crash recovery for the storage engine:
//
// - **Multigranularity locking**: hierarchical intent locks (IS/IX/S/SIX/X)
//   with strict-FIFO wait queues.
// - **WAL**: append-only write-ahead log with LSN-addressed records.
// - **ARIES recovery**: steal/no-force forward processing and
//   analysis/redo/undo restart.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | `Transaction` handle and the status state machine |
// | [`error`] | Transaction-specific error types |
// | [`lock_type`] | Lock lattice: compatibility, substitutability, intents |
// | [`resource`] | Hierarchical resource names |
// | [`lock_manager`] | Lock acquisition, release, promotion, FIFO queues |
// | [`lock_context`] | Multigranularity discipline over the lock manager |
// | [`lock_util`] | Declarative "ensure this access is legal" façade |
// | [`log_record`] | Log record model with redo/undo semantics |
// | [`log_manager`] | Append-only LSN-assigning log |
// | [`recovery_manager`] | ARIES forward processing and restart |
//
// # Quick Start
//
// ```rust,ignore
// use ferrodb::transaction::{LockContext, LockManager, LockType, Transaction, lock_util};
//
// let lock_manager = LockManager::new();
// let db = LockContext::root(lock_manager);
// let txn = Transaction::new(1);
//
// // Declaratively lock a page for writing (ancestor intents included).
// let page = db.child("table", 0).child("page", 4);
// lock_util::ensure_sufficient(&txn, &page, LockType::X)?;
// ```

// Core types and errors
pub mod error;
pub mod types;

// Locking
pub mod lock_context;
pub mod lock_manager;
pub mod lock_type;
pub mod lock_util;
pub mod resource;

// Durability and recovery
pub mod log_manager;
pub mod log_record;
pub mod recovery_manager;

// =============================================================================
// Re-exports for convenient access
// =============================================================================

pub use error::{TransactionError, TransactionResult};
pub use lock_context::LockContext;
pub use lock_manager::{Lock, LockManager};
pub use lock_type::LockType;
pub use log_manager::{LogIterator, LogManager};
pub use log_record::{LogEntry, LogRecord};
pub use recovery_manager::{AriesRecoveryManager, TransactionFactory, TransactionTableEntry};
pub use resource::ResourceName;
pub use types::{Transaction, TransactionStatus};
