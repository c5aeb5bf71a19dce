//! System-wide action lock
//!
//! At most one lifecycle workflow runs at a time. The lock has no expiry: a
//! process that dies while holding it leaves it held until an operator clears
//! it with [`LockManager::force_release`].

use crate::backend::ParameterStore;
use crate::error::{Error, Result};
use crate::types::ActionLockRecord;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Mutual exclusion between lifecycle workflows
pub trait LockManager: Send + Sync {
    /// Take the lock for `action`, or fail with [`Error::LockConflict`]
    fn acquire(&self, action: &str) -> Result<()>;

    /// Give the lock back. Releasing a free lock is a no-op.
    fn release(&self) -> Result<()>;

    /// The record of the workflow currently holding the lock
    fn current(&self) -> Result<Option<ActionLockRecord>>;

    /// Clear the lock regardless of holder, returning what was cleared
    fn force_release(&self) -> Result<Option<ActionLockRecord>> {
        let current = self.current()?;
        self.release()?;
        if let Some(record) = &current {
            warn!(action = %record.action, "action lock cleared by operator");
        }
        Ok(current)
    }
}

/// Lock stored as a single JSON value in the shared parameter store
///
/// Acquisition is a conditional put, so two processes racing for the lock
/// cannot both succeed.
pub struct ParameterStoreLock {
    store: Arc<dyn ParameterStore>,
    key: String,
}

impl ParameterStoreLock {
    pub fn new(store: Arc<dyn ParameterStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    fn parse(&self, value: &str) -> ActionLockRecord {
        // A value we cannot parse still means the lock is held
        serde_json::from_str(value).unwrap_or_else(|_| ActionLockRecord {
            action: value.to_string(),
            acquired_at_epoch_millis: 0,
        })
    }
}

impl LockManager for ParameterStoreLock {
    fn acquire(&self, action: &str) -> Result<()> {
        let record = ActionLockRecord::new(action);
        let value = serde_json::to_string(&record)?;

        if self.store.put(&self.key, &value, false)? {
            info!(action, key = %self.key, "action lock acquired");
            return Ok(());
        }

        let holder = self
            .store
            .get(&self.key)?
            .map(|v| self.parse(&v).action)
            // Released between our put and get; report rather than retry
            .unwrap_or_else(|| "unknown".to_string());
        Err(Error::LockConflict { action: holder })
    }

    fn release(&self) -> Result<()> {
        self.store.delete(&self.key)?;
        info!(key = %self.key, "action lock released");
        Ok(())
    }

    fn current(&self) -> Result<Option<ActionLockRecord>> {
        Ok(self.store.get(&self.key)?.map(|v| self.parse(&v)))
    }
}

/// In-process lock for deployments with a single orchestrator process
#[derive(Debug, Default)]
pub struct LocalLock {
    held: Mutex<Option<ActionLockRecord>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for LocalLock {
    fn acquire(&self, action: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = held.as_ref() {
            return Err(Error::LockConflict {
                action: record.action.clone(),
            });
        }
        *held = Some(ActionLockRecord::new(action));
        info!(action, "action lock acquired");
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.held.lock().unwrap_or_else(|p| p.into_inner()).take();
        Ok(())
    }

    fn current(&self) -> Result<Option<ActionLockRecord>> {
        Ok(self.held.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryCloud;

    const KEY: &str = "/test/action-lock";

    fn store_lock() -> (Arc<InMemoryCloud>, ParameterStoreLock) {
        let cloud = Arc::new(InMemoryCloud::new());
        let lock = ParameterStoreLock::new(cloud.clone(), KEY);
        (cloud, lock)
    }

    fn assert_conflict(result: Result<()>, expected: &str) {
        match result {
            Err(Error::LockConflict { action }) => assert_eq!(action, expected),
            other => panic!("expected lock conflict, got {other:?}"),
        }
    }

    #[test]
    fn second_acquire_conflicts() {
        let (_, lock) = store_lock();
        lock.acquire("start").unwrap();
        assert_conflict(lock.acquire("stop"), "start");
        assert_conflict(lock.acquire("start"), "start");
    }

    #[test]
    fn release_then_acquire_succeeds() {
        let (cloud, lock) = store_lock();
        lock.acquire("hibernate").unwrap();
        lock.release().unwrap();
        assert!(cloud.parameter(KEY).is_none());
        lock.acquire("resume").unwrap();
        assert_eq!(lock.current().unwrap().unwrap().action, "resume");
    }

    #[test]
    fn release_is_idempotent() {
        let (_, lock) = store_lock();
        lock.release().unwrap();
        lock.acquire("backup").unwrap();
        lock.release().unwrap();
        lock.release().unwrap();
        assert!(lock.current().unwrap().is_none());
    }

    #[test]
    fn stored_value_is_json_record() {
        let (cloud, lock) = store_lock();
        lock.acquire("restore").unwrap();
        let stored: ActionLockRecord =
            serde_json::from_str(&cloud.parameter(KEY).unwrap()).unwrap();
        assert_eq!(stored.action, "restore");
        assert!(stored.acquired_at_epoch_millis > 0);
    }

    #[test]
    fn foreign_value_still_counts_as_held() {
        let (cloud, lock) = store_lock();
        cloud.put(KEY, "manual-maintenance", true).unwrap();
        assert_conflict(lock.acquire("start"), "manual-maintenance");
    }

    #[test]
    fn force_release_returns_cleared_record() {
        let (_, lock) = store_lock();
        assert!(lock.force_release().unwrap().is_none());
        lock.acquire("stop").unwrap();
        let cleared = lock.force_release().unwrap().unwrap();
        assert_eq!(cleared.action, "stop");
        lock.acquire("start").unwrap();
    }

    #[test]
    fn local_lock_behaves_the_same() {
        let lock = LocalLock::new();
        lock.acquire("start").unwrap();
        assert_conflict(lock.acquire("stop"), "start");
        lock.release().unwrap();
        lock.release().unwrap();
        lock.acquire("stop").unwrap();
    }
}
