//! Lock ordering checks for deadlock prevention.
//!
//! Debug builds record, per task, which tracked locks are currently held and
//! panic when one is acquired out of order. Release builds compile the
//! tracking away.
//!
//! # Lock Ordering Hierarchy
//!
//! Locks MUST be acquired in this order:
//! 1. `operation_gate` (RwLock) - host-wide gate, exclusive for the pruner and shutdown
//! 2. `workspace_mutex` (Mutex) - per-workspace launch/stop/reset lock
//! 3. `flush_lock` (Mutex) - per-container log flush lock
//! 4. `port_table` (Mutex) - port allocator availability table
//!
//! # Usage
//!
//! Tracking is scoped to a task. Supervisor operations wrap their future in
//! [`scope`]; acquisitions outside any scope are not checked.
//!
//! ```ignore
//! use crate::lock_order::{self, LockId, track_lock_acquisition, track_lock_release};
//!
//! lock_order::scope(async {
//!     track_lock_acquisition(LockId::WorkspaceMutex);
//!     let guard = mutex.lock().await;
//!     // ...
//!     drop(guard);
//!     track_lock_release(LockId::WorkspaceMutex);
//! })
//! .await;
//! ```
#[cfg(debug_assertions)]
use std::cell::RefCell;
use std::future::Future;

/// Identifiers for tracked locks.
///
/// The order of variants defines the required acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockId {
    /// Host-wide operation gate (acquire first)
    OperationGate = 1,
    /// Per-workspace supervisor mutex
    WorkspaceMutex = 2,
    /// Per-container log flush lock
    FlushLock = 3,
    /// Port allocator table (acquire last)
    PortTable = 4,
}

impl LockId {
    pub fn name(&self) -> &'static str {
        match self {
            LockId::OperationGate => "operation_gate",
            LockId::WorkspaceMutex => "workspace_mutex",
            LockId::FlushLock => "flush_lock",
            LockId::PortTable => "port_table",
        }
    }
}

#[cfg(debug_assertions)]
tokio::task_local! {
    /// Stack of locks held by the current task. Task-local rather than
    /// thread-local because async guards are held across `.await` points and
    /// the task may resume on another worker thread.
    static LOCK_STACK: RefCell<Vec<LockId>>;
}

/// Run `fut` with lock tracking enabled for its duration.
#[cfg(debug_assertions)]
pub async fn scope<F: Future>(fut: F) -> F::Output {
    if LOCK_STACK.try_with(|_| ()).is_ok() {
        // Already inside a scope (e.g. reset calling launch)
        return fut.await;
    }
    LOCK_STACK.scope(RefCell::new(Vec::new()), fut).await
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub async fn scope<F: Future>(fut: F) -> F::Output {
    fut.await
}

/// Record acquisition of `lock` in debug mode.
///
/// # Panics
///
/// Panics if a lock that must come later in the hierarchy is already held
/// by this task.
#[cfg(debug_assertions)]
pub fn track_lock_acquisition(lock: LockId) {
    let _ = LOCK_STACK.try_with(|stack| {
        let mut stack = stack.borrow_mut();

        for held_lock in stack.iter() {
            if *held_lock > lock {
                panic!(
                    "Lock ordering violation: attempted to acquire '{}' (priority {}) \
                     while holding '{}' (priority {}). \
                     Locks must be acquired in order: OperationGate < WorkspaceMutex < FlushLock < PortTable",
                    lock.name(),
                    lock as u8,
                    held_lock.name(),
                    *held_lock as u8
                );
            }
        }

        stack.push(lock);
    });
}

/// Record release of `lock` in debug mode.
///
/// # Panics
///
/// Panics if `lock` is not the most recently acquired lock of this task.
#[cfg(debug_assertions)]
pub fn track_lock_release(lock: LockId) {
    let _ = LOCK_STACK.try_with(|stack| {
        let mut stack = stack.borrow_mut();

        match stack.pop() {
            Some(top_lock) if top_lock == lock => {}
            Some(top_lock) => {
                panic!(
                    "Lock release order violation: attempted to release '{}' \
                     but most recently acquired lock was '{}'. \
                     Locks must be released in LIFO order.",
                    lock.name(),
                    top_lock.name()
                );
            }
            None => {
                panic!(
                    "Lock release without acquisition: attempted to release '{}' \
                     but no locks are currently held.",
                    lock.name()
                );
            }
        }
    });
}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn track_lock_acquisition(_lock: LockId) {}

#[cfg(not(debug_assertions))]
#[inline(always)]
pub fn track_lock_release(_lock: LockId) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(debug_assertions)]
    async fn test_valid_lock_order() {
        scope(async {
            track_lock_acquisition(LockId::OperationGate);
            track_lock_acquisition(LockId::WorkspaceMutex);
            track_lock_acquisition(LockId::FlushLock);
            track_lock_acquisition(LockId::PortTable);

            track_lock_release(LockId::PortTable);
            track_lock_release(LockId::FlushLock);
            track_lock_release(LockId::WorkspaceMutex);
            track_lock_release(LockId::OperationGate);
        })
        .await;
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    async fn test_port_table_before_workspace_mutex_panics() {
        scope(async {
            track_lock_acquisition(LockId::PortTable);
            track_lock_acquisition(LockId::WorkspaceMutex);
        })
        .await;
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock release order violation")]
    async fn test_invalid_release_order() {
        scope(async {
            track_lock_acquisition(LockId::OperationGate);
            track_lock_acquisition(LockId::WorkspaceMutex);
            track_lock_release(LockId::OperationGate);
        })
        .await;
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock release without acquisition")]
    async fn test_release_without_acquisition() {
        scope(async {
            track_lock_release(LockId::FlushLock);
        })
        .await;
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    async fn test_tracking_survives_await_points() {
        scope(async {
            track_lock_acquisition(LockId::WorkspaceMutex);
            tokio::task::yield_now().await;
            track_lock_acquisition(LockId::PortTable);
            track_lock_release(LockId::PortTable);
            track_lock_release(LockId::WorkspaceMutex);
        })
        .await;
    }

    #[test]
    fn test_untracked_outside_scope() {
        // No scope: nothing is recorded, nothing panics
        track_lock_acquisition(LockId::PortTable);
        track_lock_acquisition(LockId::OperationGate);
        track_lock_release(LockId::WorkspaceMutex);
    }

    #[tokio::test]
    #[cfg(debug_assertions)]
    async fn test_nested_scope_shares_stack() {
        scope(async {
            track_lock_acquisition(LockId::WorkspaceMutex);
            scope(async {
                track_lock_acquisition(LockId::FlushLock);
                track_lock_release(LockId::FlushLock);
            })
            .await;
            track_lock_release(LockId::WorkspaceMutex);
        })
        .await;
    }
}
