use crate::lock_order::{track_lock_acquisition, track_lock_release, LockId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Host-wide gate between supervisor operations and whole-host maintenance.
///
/// Launch, stop and reset hold it shared, so they run in parallel with each
/// other. The pruner and shutdown hold it exclusively, which both waits for
/// every in-flight operation and keeps new ones out until they finish.
#[derive(Debug, Default)]
pub struct OperationGate {
    lock: RwLock<()>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shared(&self) -> SharedGate<'_> {
        track_lock_acquisition(LockId::OperationGate);
        SharedGate {
            _guard: self.lock.read().await,
        }
    }

    pub async fn exclusive(&self) -> ExclusiveGate<'_> {
        track_lock_acquisition(LockId::OperationGate);
        ExclusiveGate {
            _guard: self.lock.write().await,
        }
    }
}

pub struct SharedGate<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

impl Drop for SharedGate<'_> {
    fn drop(&mut self) {
        track_lock_release(LockId::OperationGate);
    }
}

pub struct ExclusiveGate<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for ExclusiveGate<'_> {
    fn drop(&mut self) {
        track_lock_release(LockId::OperationGate);
    }
}

/// One async mutex per workspace id, created on first use.
#[derive(Debug, Default)]
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(id.to_string()).or_default())
    }

    pub async fn lock(&self, id: &str) -> WorkspaceGuard {
        let mutex = self.entry(id);
        track_lock_acquisition(LockId::WorkspaceMutex);
        WorkspaceGuard {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_lock(&self, id: &str) -> Option<WorkspaceGuard> {
        let mutex = self.entry(id);
        let guard = mutex.try_lock_owned().ok()?;
        track_lock_acquisition(LockId::WorkspaceMutex);
        Some(WorkspaceGuard { _guard: guard })
    }

    /// Drop mutexes nobody holds or waits on. Guards and waiters keep a
    /// clone of the `Arc`, so a count of one means idle.
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct WorkspaceGuard {
    _guard: OwnedMutexGuard<()>,
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        track_lock_release(LockId::WorkspaceMutex);
    }
}
