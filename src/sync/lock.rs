//! Single-flight lock shared by sync cycles and queue drains.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Coarse device-wide sync lock
#[derive(Clone, Default)]
pub struct SyncLock {
    inner: Arc<Mutex<()>>,
}

/// Proof that the holder owns the sync lock; released on drop
pub struct SyncGuard {
    _guard: OwnedMutexGuard<()>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if nobody holds it
    pub fn try_acquire(&self) -> Option<SyncGuard> {
        self.inner
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| SyncGuard { _guard: guard })
    }

    /// Wait until the lock is free
    pub async fn acquire(&self) -> SyncGuard {
        SyncGuard {
            _guard: self.inner.clone().lock_owned().await,
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_acquire_is_exclusive() {
        let lock = SyncLock::new();

        let guard = lock.try_acquire().expect("lock should be free");
        assert!(lock.is_held());
        assert!(lock.clone().try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let lock = SyncLock::new();
        let guard = lock.try_acquire().unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
            })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
