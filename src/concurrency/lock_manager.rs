use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TxnId};
use crate::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// How often the background detector scans for deadlocks by default.
pub const CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

/// Per-rid lock queue. `shared_count` and `exclusive_count` always equal
/// the number of granted requests of each mode.
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    shared_count: usize,
    exclusive_count: usize,
    upgrading: bool,
    cv: Arc<Condvar>,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            requests: VecDeque::new(),
            shared_count: 0,
            exclusive_count: 0,
            upgrading: false,
            cv: Arc::new(Condvar::new()),
        }
    }
}

impl LockRequestQueue {
    /// A request is granted once it is compatible with every granted
    /// request and with every request queued ahead of it. Shared requests
    /// pass waiting shared requests but queue behind an earlier waiting
    /// exclusive, which keeps writers from starving.
    fn can_grant(&self, txn_id: TxnId) -> bool {
        let Some(pos) = self.requests.iter().position(|r| r.txn_id == txn_id) else {
            return false;
        };
        let mode = self.requests[pos].mode;

        for (i, req) in self.requests.iter().enumerate() {
            if i == pos {
                continue;
            }
            let compatible = req.mode == LockMode::Shared && mode == LockMode::Shared;
            if compatible {
                continue;
            }
            if req.granted || i < pos {
                return false;
            }
        }
        true
    }

    fn grant(&mut self, txn_id: TxnId) {
        if let Some(req) = self.requests.iter_mut().find(|r| r.txn_id == txn_id) {
            req.granted = true;
            match req.mode {
                LockMode::Shared => self.shared_count += 1,
                LockMode::Exclusive => self.exclusive_count += 1,
            }
        }
    }
}

#[derive(Default)]
struct LockTable {
    queues: HashMap<Rid, LockRequestQueue>,
}

/// Row-granularity shared/exclusive lock table enforcing two-phase locking,
/// with a background wait-for graph deadlock detector.
///
/// All operations synchronize on the table mutex; each queue has its own
/// condition variable for wake-ups. The detector thread is joined when the
/// lock manager is dropped.
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
    txns: Arc<Mutex<HashMap<TxnId, Arc<Transaction>>>>,
    enable_cycle_detection: Arc<AtomicBool>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_detection_interval(CYCLE_DETECTION_INTERVAL)
    }

    pub fn with_detection_interval(interval: Duration) -> Self {
        let table = Arc::new(Mutex::new(LockTable::default()));
        let txns = Arc::new(Mutex::new(HashMap::new()));
        let enable = Arc::new(AtomicBool::new(true));

        let detector = {
            let table = table.clone();
            let txns = txns.clone();
            let enable = enable.clone();
            thread::Builder::new()
                .name("cycle-detector".to_string())
                .spawn(move || run_cycle_detection(table, txns, enable, interval))
                .ok()
        };

        Self {
            table,
            txns,
            enable_cycle_detection: enable,
            detector,
        }
    }

    /// Acquire a shared lock on `rid`, blocking until granted or aborted.
    pub fn lock_shared(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        let mut table = self.table.lock();

        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            return Err(self.abort(txn, AbortReason::SharedOnReadUncommitted));
        }
        self.register(txn);

        let cv = {
            let queue = table.queues.entry(rid).or_default();
            queue
                .requests
                .push_back(LockRequest::new(txn.id(), LockMode::Shared));
            queue.cv.clone()
        };

        self.wait_for_grant(&mut table, &cv, txn, rid)?;

        let queue = table.queues.entry(rid).or_default();
        queue.grant(txn.id());
        txn.shared_lock_set().lock().insert(rid);
        Ok(())
    }

    /// Acquire an exclusive lock on `rid`, blocking until granted or aborted.
    pub fn lock_exclusive(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        let mut table = self.table.lock();

        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }
        self.register(txn);

        let cv = {
            let queue = table.queues.entry(rid).or_default();
            queue
                .requests
                .push_back(LockRequest::new(txn.id(), LockMode::Exclusive));
            queue.cv.clone()
        };

        self.wait_for_grant(&mut table, &cv, txn, rid)?;

        let queue = table.queues.entry(rid).or_default();
        queue.grant(txn.id());
        txn.exclusive_lock_set().lock().insert(rid);
        Ok(())
    }

    /// Upgrade a held shared lock to exclusive. The request keeps its queue
    /// position; only one upgrade may be in flight per rid.
    pub fn lock_upgrade(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        let mut table = self.table.lock();

        if txn.state() == TransactionState::Shrinking {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }

        let cv = {
            let Some(queue) = table.queues.get_mut(&rid) else {
                return Err(TransactionError::LockNotHeld {
                    txn_id: txn.id(),
                    rid,
                });
            };
            if queue.upgrading {
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            let Some(req) = queue
                .requests
                .iter_mut()
                .find(|r| r.txn_id == txn.id() && r.granted && r.mode == LockMode::Shared)
            else {
                return Err(TransactionError::LockNotHeld {
                    txn_id: txn.id(),
                    rid,
                });
            };

            // Flip in place so the upgrade keeps its slot in the queue.
            req.mode = LockMode::Exclusive;
            req.granted = false;
            queue.shared_count -= 1;
            queue.upgrading = true;
            queue.cv.clone()
        };
        txn.shared_lock_set().lock().remove(&rid);

        if let Err(e) = self.wait_for_grant(&mut table, &cv, txn, rid) {
            if let Some(queue) = table.queues.get_mut(&rid) {
                queue.upgrading = false;
            }
            return Err(e);
        }

        let queue = table.queues.entry(rid).or_default();
        queue.grant(txn.id());
        queue.upgrading = false;
        txn.exclusive_lock_set().lock().insert(rid);
        Ok(())
    }

    /// Release a lock on `rid`. The first unlock moves a growing
    /// transaction into its shrinking phase.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<(), TransactionError> {
        let mut table = self.table.lock();

        if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let was_shared = txn.shared_lock_set().lock().remove(&rid);
        let was_exclusive = txn.exclusive_lock_set().lock().remove(&rid);

        if let Some(queue) = table.queues.get_mut(&rid) {
            let mut notify = false;
            if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
                let req = queue.requests.remove(pos);
                match req {
                    Some(req) if req.granted => match req.mode {
                        LockMode::Shared => {
                            queue.shared_count -= 1;
                            if queue.shared_count == 0 {
                                notify = true;
                            }
                        }
                        LockMode::Exclusive => {
                            queue.exclusive_count -= 1;
                            notify = true;
                        }
                    },
                    // A waiting request leaving the queue can unblock
                    // requests queued behind it.
                    _ => notify = true,
                }
            }
            let cv = queue.cv.clone();
            if queue.requests.is_empty() {
                table.queues.remove(&rid);
            }
            if notify {
                cv.notify_all();
            }
        }
        drop(table);

        if (was_shared || was_exclusive)
            && txn.shared_lock_set().lock().is_empty()
            && txn.exclusive_lock_set().lock().is_empty()
        {
            self.txns.lock().remove(&txn.id());
        }
        Ok(())
    }

    /// Block until this transaction's request on `rid` is grantable or the
    /// transaction is aborted. On abort the request is withdrawn.
    fn wait_for_grant(
        &self,
        table: &mut parking_lot::MutexGuard<'_, LockTable>,
        cv: &Condvar,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<(), TransactionError> {
        loop {
            if txn.state() == TransactionState::Aborted {
                break;
            }
            let grantable = table
                .queues
                .get(&rid)
                .map(|q| q.can_grant(txn.id()))
                .unwrap_or(false);
            if grantable {
                return Ok(());
            }
            cv.wait(table);
        }

        // Aborted while waiting: withdraw the request and wake anyone the
        // withdrawal may unblock.
        if let Some(queue) = table.queues.get_mut(&rid) {
            if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
                queue.requests.remove(pos);
            }
            queue.cv.notify_all();
        }
        Err(TransactionError::Aborted {
            txn_id: txn.id(),
            reason: AbortReason::Deadlock,
        })
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::Aborted {
            txn_id: txn.id(),
            reason,
        }
    }

    fn register(&self, txn: &Arc<Transaction>) {
        self.txns.lock().insert(txn.id(), txn.clone());
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.enable_cycle_detection.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
    }
}

/// Background deadlock detector. Each pass rebuilds the wait-for graph from
/// the lock table (an edge per ungranted request toward each granted holder
/// on the same queue), aborts the youngest transaction of every cycle, and
/// wakes the queues that transaction appears in so its wait loops observe
/// the abort.
fn run_cycle_detection(
    table: Arc<Mutex<LockTable>>,
    txns: Arc<Mutex<HashMap<TxnId, Arc<Transaction>>>>,
    enable: Arc<AtomicBool>,
    interval: Duration,
) {
    while enable.load(Ordering::SeqCst) {
        thread::sleep(interval);

        let table = table.lock();
        let mut graph: BTreeMap<TxnId, Vec<TxnId>> = BTreeMap::new();
        for queue in table.queues.values() {
            for waiter in queue.requests.iter().filter(|r| !r.granted) {
                for holder in queue.requests.iter().filter(|r| r.granted) {
                    graph.entry(waiter.txn_id).or_default().push(holder.txn_id);
                }
            }
        }

        while let Some(victim) = find_cycle_victim(&graph) {
            debug!("deadlock detected, aborting txn {}", victim);
            if let Some(txn) = txns.lock().get(&victim).cloned() {
                txn.set_state(TransactionState::Aborted);
            }
            for queue in table.queues.values() {
                if queue.requests.iter().any(|r| r.txn_id == victim) {
                    queue.cv.notify_all();
                }
            }
            graph.remove(&victim);
            for targets in graph.values_mut() {
                targets.retain(|&t| t != victim);
            }
        }
    }
}

/// Search the wait-for graph for a cycle. Sources are tried in ascending
/// txn id order and adjacency lists are visited in ascending order, so the
/// answer is deterministic: the youngest (maximum id) transaction seen on
/// the cycle's search path.
fn find_cycle_victim(graph: &BTreeMap<TxnId, Vec<TxnId>>) -> Option<TxnId> {
    for &start in graph.keys() {
        let mut visited = BTreeSet::new();
        if dfs(graph, start, &mut visited) {
            return visited.iter().next_back().copied();
        }
    }
    None
}

fn dfs(graph: &BTreeMap<TxnId, Vec<TxnId>>, node: TxnId, visited: &mut BTreeSet<TxnId>) -> bool {
    let Some(neighbors) = graph.get(&node) else {
        return false;
    };
    let mut ordered: Vec<TxnId> = neighbors.clone();
    ordered.sort_unstable();
    ordered.dedup();

    for next in ordered {
        if visited.contains(&next) {
            return true;
        }
        visited.insert(next);
        if dfs(graph, next, visited) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(edges: &[(TxnId, TxnId)]) -> BTreeMap<TxnId, Vec<TxnId>> {
        let mut graph: BTreeMap<TxnId, Vec<TxnId>> = BTreeMap::new();
        for &(from, to) in edges {
            graph.entry(from).or_default().push(to);
        }
        graph
    }

    #[test]
    fn test_no_cycle() {
        let graph = graph_of(&[(1, 2), (2, 3), (1, 3)]);
        assert_eq!(find_cycle_victim(&graph), None);
    }

    #[test]
    fn test_two_cycle_aborts_youngest() {
        let graph = graph_of(&[(1, 2), (2, 1)]);
        assert_eq!(find_cycle_victim(&graph), Some(2));
    }

    #[test]
    fn test_three_cycle_aborts_youngest() {
        let graph = graph_of(&[(1, 2), (2, 3), (3, 1)]);
        assert_eq!(find_cycle_victim(&graph), Some(3));
    }

    #[test]
    fn test_can_grant_compatibility() {
        let mut queue = LockRequestQueue::default();
        queue.requests.push_back(LockRequest::new(1, LockMode::Shared));
        queue.grant(1);
        queue
            .requests
            .push_back(LockRequest::new(2, LockMode::Exclusive));
        queue.requests.push_back(LockRequest::new(3, LockMode::Shared));

        // Exclusive waits behind the granted shared holder
        assert!(!queue.can_grant(2));
        // Shared waits behind the earlier ungranted exclusive
        assert!(!queue.can_grant(3));

        // Two shared requests pass each other
        let mut queue = LockRequestQueue::default();
        queue.requests.push_back(LockRequest::new(1, LockMode::Shared));
        queue.grant(1);
        queue.requests.push_back(LockRequest::new(2, LockMode::Shared));
        assert!(queue.can_grant(2));
    }
}
