use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// One-shot alarm delivered as an event on the node's channel.
///
/// Every arming gets a fresh token; the owner only acts on a firing whose
/// token is still current, so an alarm racing with `cancel` or a re-arm is
/// dropped instead of acting on a torn-down role.
#[derive(Debug, Default)]
pub struct Timer {
    token: Option<u64>,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    /// Cancels any pending alarm and arms a new one.
    pub fn arm<T, F>(&mut self, delay: Duration, tx: &mpsc::UnboundedSender<T>, make: F) -> u64
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T + Send + 'static,
    {
        self.cancel();
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let tx = tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The node may already be gone.
            let _ = tx.send(make(token));
        }));
        self.token = Some(token);
        token
    }

    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.token = None;
    }

    /// Consumes a firing. Returns false for stale or cancelled alarms.
    pub fn fired(&mut self, token: u64) -> bool {
        if self.token == Some(token) {
            self.token = None;
            self.task = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::default();
        let token = timer.arm(Duration::from_millis(100), &tx, |t| t);

        let fired = rx.recv().await.expect("alarm");
        assert_eq!(fired, token);
        assert!(timer.fired(fired));
        assert!(!timer.fired(fired));
        assert_eq!(timer.token, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        let mut timer = Timer::default();
        timer.arm(Duration::from_millis(100), &tx, |t| t);
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_invalidates_previous_token() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::default();
        let first = timer.arm(Duration::from_millis(100), &tx, |t| t);
        let second = timer.arm(Duration::from_millis(200), &tx, |t| t);
        assert_ne!(first, second);

        assert!(!timer.fired(first));
        let fired = rx.recv().await.expect("alarm");
        assert_eq!(fired, second);
        assert!(timer.fired(fired));
    }
}
