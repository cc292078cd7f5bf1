use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Single-holder gate serialising log mutation.
///
/// Waiters are served in FIFO order (tokio's mutex is fair). The lock is
/// released when the [`StateGuard`] is dropped, so every exit path of the
/// guarded section releases it exactly once.
#[derive(Clone, Default)]
pub struct StateLock {
    inner: Arc<Mutex<()>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    released: AtomicU64,
}

impl StateLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> StateGuard {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        StateGuard {
            _guard: guard,
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn try_acquire(&self) -> Option<StateGuard> {
        let guard = Arc::clone(&self.inner).try_lock_owned().ok()?;
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        Some(StateGuard {
            _guard: guard,
            counters: Arc::clone(&self.counters),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    pub fn acquisitions(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }
}

pub struct StateGuard {
    _guard: OwnedMutexGuard<()>,
    counters: Arc<Counters>,
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for StateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateGuard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let lock = StateLock::new();
        let guard = lock.acquire().await;
        assert!(lock.is_locked());
        assert!(lock.try_acquire().is_none());

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _g = lock.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.expect("waiter");
        assert!(!lock.is_locked());
        assert_eq!(lock.acquisitions(), 2);
        assert_eq!(lock.releases(), 2);
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let lock = StateLock::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let guard = lock.acquire().await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let lock = lock.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _g = lock.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(guard);
        for task in tasks {
            task.await.expect("task");
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn guard_is_released_on_error_paths() {
        async fn guarded(lock: &StateLock) -> Result<(), &'static str> {
            let _guard = lock.acquire().await;
            let write: Result<(), &'static str> = Err("log write failed");
            write?;
            Ok(())
        }

        let lock = StateLock::new();
        assert!(guarded(&lock).await.is_err());
        assert!(!lock.is_locked());
        assert_eq!(lock.acquisitions(), lock.releases());
    }
}
