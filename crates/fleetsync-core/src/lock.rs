// ── Per-entity mutual exclusion ──
//
// Every Device and ManagedSet owns one `EntityLock`; the firmware namespace
// shares one more. Holding the guard is holding the lock. The lock is not
// re-entrant: a second `lock_wait` from the same flow of control waits on
// itself forever, a second `lock_no_wait` reports `Busy`.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use crate::error::CoreError;

/// Binary gate guarding all state mutation on one entity.
#[derive(Clone)]
pub struct EntityLock {
    name: Arc<str>,
    inner: Arc<Mutex<()>>,
}

impl EntityLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the lock is acquired. For paths that must eventually
    /// succeed.
    pub async fn lock_wait(&self) -> LockGuard {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        trace!(lock = %self.name, "acquired (wait)");
        LockGuard {
            name: Arc::clone(&self.name),
            _guard: guard,
        }
    }

    /// Acquire immediately or fail with [`CoreError::Busy`]. Never retries.
    pub fn lock_no_wait(&self) -> Result<LockGuard, CoreError> {
        match Arc::clone(&self.inner).try_lock_owned() {
            Ok(guard) => {
                trace!(lock = %self.name, "acquired (no wait)");
                Ok(LockGuard {
                    name: Arc::clone(&self.name),
                    _guard: guard,
                })
            }
            Err(_) => Err(CoreError::Busy {
                entity: self.name.to_string(),
            }),
        }
    }

    /// Non-blocking probe. The answer may be stale by the time it is read.
    pub fn is_available(&self) -> bool {
        self.inner.try_lock().is_ok()
    }
}

impl fmt::Debug for EntityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityLock")
            .field("name", &self.name)
            .field("available", &self.is_available())
            .finish()
    }
}

/// Proof of holding an [`EntityLock`]. Dropping it releases the lock.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard {
    name: Arc<str>,
    _guard: OwnedMutexGuard<()>,
}

impl LockGuard {
    pub fn lock_name(&self) -> &str {
        &self.name
    }

    /// `true` if this guard was handed out by `lock`.
    pub fn guards(&self, lock: &EntityLock) -> bool {
        Arc::ptr_eq(&self.name, &lock.name)
    }

    /// Release the lock explicitly.
    pub fn unlock(self) {
        trace!(lock = %self.name, "released");
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn no_wait_fails_fast_while_held() {
        let lock = EntityLock::new("device A1");
        let guard = lock.lock_no_wait().unwrap();
        assert!(!lock.is_available());

        let err = lock.lock_no_wait().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        guard.unlock();
        assert!(lock.is_available());
        assert!(lock.lock_no_wait().is_ok());
    }

    #[test]
    fn guard_belongs_to_its_own_lock() {
        let lock = EntityLock::new("device A1");
        let namesake = EntityLock::new("device A1");
        let guard = lock.lock_no_wait().unwrap();

        assert!(guard.guards(&lock));
        assert!(guard.guards(&lock.clone()));
        assert!(!guard.guards(&namesake));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_serialized() {
        let lock = EntityLock::new("set s1");
        let guard = lock.lock_wait().await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _g = lock.lock_wait().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(lock.is_available());
    }

    #[tokio::test]
    async fn concurrent_mutations_never_overlap() {
        let lock = EntityLock::new("device A1");
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let lock = lock.clone();
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let _g = lock.lock_wait().await;
                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0, "two holders inside the critical section");
                tokio::task::yield_now().await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
