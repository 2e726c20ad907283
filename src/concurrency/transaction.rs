use std::collections::HashSet;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{
    Page, PageId, PageReadGuard, PageWriteGuard, Rid, RootReadGuard, RootWriteGuard, TxnId,
};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states. Two-phase locking moves a transaction from Growing
/// to Shrinking on its first unlock; the deadlock detector or an explicit
/// abort can move it to Aborted from either phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    SharedOnReadUncommitted,
    UpgradeConflict,
    Deadlock,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            AbortReason::LockOnShrinking => "lock requested in shrinking phase",
            AbortReason::SharedOnReadUncommitted => "shared lock under READ UNCOMMITTED",
            AbortReason::UpgradeConflict => "another upgrade is in progress",
            AbortReason::Deadlock => "chosen as deadlock victim",
        };
        write!(f, "{}", reason)
    }
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {txn_id} aborted: {reason}")]
    Aborted { txn_id: TxnId, reason: AbortReason },

    #[error("transaction {txn_id} does not hold a lock on {rid}")]
    LockNotHeld { txn_id: TxnId, rid: Rid },
}

/// Hold on the B+-tree's root latch, released in the correct mode on drop.
pub enum RootLatchGuard {
    Read(RootReadGuard),
    Write(RootWriteGuard),
}

/// One entry of a transaction's page set: either the root-latch sentinel or
/// a latched, pinned tree page. Dropping an entry releases the latch; the
/// owner is responsible for the matching unpin.
pub enum LatchedPage {
    Root(RootLatchGuard),
    Read {
        page_id: PageId,
        guard: PageReadGuard,
    },
    Write {
        page_id: PageId,
        guard: PageWriteGuard,
    },
}

impl LatchedPage {
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            LatchedPage::Root(_) => None,
            LatchedPage::Read { page_id, .. } | LatchedPage::Write { page_id, .. } => {
                Some(*page_id)
            }
        }
    }

    pub fn page(&self) -> Option<&Page> {
        match self {
            LatchedPage::Root(_) => None,
            LatchedPage::Read { guard, .. } => Some(&**guard),
            LatchedPage::Write { guard, .. } => Some(&**guard),
        }
    }

    pub fn page_mut(&mut self) -> Option<&mut Page> {
        match self {
            LatchedPage::Write { guard, .. } => Some(&mut **guard),
            _ => None,
        }
    }
}

/// Transaction - represents an active database transaction
///
/// State and the lock sets are shared with the lock manager's deadlock
/// detector, which may transition the transaction to Aborted from another
/// thread; everything is therefore behind interior mutability.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    page_set: Mutex<Vec<LatchedPage>>,
    deleted_page_set: Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            page_set: Mutex::new(Vec::new()),
            deleted_page_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// Rids this transaction holds shared locks on.
    pub fn shared_lock_set(&self) -> &Mutex<HashSet<Rid>> {
        &self.shared_lock_set
    }

    /// Rids this transaction holds exclusive locks on.
    pub fn exclusive_lock_set(&self) -> &Mutex<HashSet<Rid>> {
        &self.exclusive_lock_set
    }

    /// Latch chain scratch space used by the B+-tree while descending.
    /// Cleared whenever latches are released.
    pub fn page_set(&self) -> &Mutex<Vec<LatchedPage>> {
        &self.page_set
    }

    /// Pages merged away during a remove, deallocated after the latches on
    /// them are released.
    pub fn deleted_page_set(&self) -> &Mutex<HashSet<PageId>> {
        &self.deleted_page_set
    }
}
