//! Per-request exclusive locks.
//!
//! Locks are created on first use and dropped from the table as soon as no
//! submission holds or waits for them, so the table only ever contains the
//! requests currently being merged into.

use buildmerge_core::BuildRequestId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    /// Submissions holding or waiting for this lock.
    refs: usize,
}

type LockMap = Arc<Mutex<HashMap<BuildRequestId, LockEntry>>>;

fn table(map: &LockMap) -> MutexGuard<'_, HashMap<BuildRequestId, LockEntry>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counted reference to a table entry; removes the entry with the last reference.
struct LockRef {
    brid: BuildRequestId,
    table: LockMap,
}

impl Drop for LockRef {
    fn drop(&mut self) {
        let mut map = table(&self.table);
        if let Some(entry) = map.get_mut(&self.brid) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(&self.brid);
                trace!(brid = %self.brid, "Reclaimed request lock");
            }
        }
    }
}

/// Exclusive hold on one request. Released on drop, on every exit path.
pub struct RequestLockGuard {
    // Field order matters: the mutex is released before the reference is
    // counted down.
    _guard: OwnedMutexGuard<()>,
    _ref: LockRef,
    brid: BuildRequestId,
}

impl RequestLockGuard {
    pub fn brid(&self) -> BuildRequestId {
        self.brid
    }
}

impl std::fmt::Debug for RequestLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestLockGuard").field("brid", &self.brid).finish()
    }
}

/// Table of lazily created per-request locks.
#[derive(Clone, Default)]
pub struct RequestLocks {
    table: LockMap,
}

impl RequestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `brid`.
    ///
    /// Cancelling the returned future leaves no trace in the table.
    pub async fn lock(&self, brid: BuildRequestId) -> RequestLockGuard {
        let (lock, lock_ref) = {
            let mut map = table(&self.table);
            let entry = map.entry(brid).or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            (
                entry.lock.clone(),
                LockRef {
                    brid,
                    table: self.table.clone(),
                },
            )
        };

        let guard = lock.lock_owned().await;
        RequestLockGuard {
            _guard: guard,
            _ref: lock_ref,
            brid,
        }
    }

    /// Lock every distinct request in ascending id order.
    ///
    /// Every caller takes overlapping locks in the same order, so two
    /// submissions cannot deadlock on each other.
    pub async fn lock_all(&self, brids: impl IntoIterator<Item = BuildRequestId>) -> Vec<RequestLockGuard> {
        let ordered: BTreeSet<BuildRequestId> = brids.into_iter().collect();
        let mut guards = Vec::with_capacity(ordered.len());
        for brid in ordered {
            guards.push(self.lock(brid).await);
        }
        guards
    }

    /// Number of requests with a live lock.
    pub fn len(&self) -> usize {
        table(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
