// ABOUTME: Cancellable one-shot deadline used by open/close/keep-alive timeouts

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Schedules `on_fire` to run after `duration` unless cancelled first.
/// Cancels itself on drop, so letting a `Timer` go out of scope (or
/// overwriting an `Option<Timer>` slot) is enough to tear it down.
pub struct Timer {
    cancel: Arc<Notify>,
}

impl Timer {
    pub fn arm<F, Fut>(duration: Duration, on_fire: F) -> Timer
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = Arc::new(Notify::new());
        let cancel_task = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    on_fire().await;
                }
                _ = cancel_task.notified() => {}
            }
        });
        Timer { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.notify_one();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn fires_after_duration() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let _timer = Timer::arm(Duration::from_millis(10), move || async move {
            fired2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let timer = Timer::arm(Duration::from_millis(30), move || async move {
            fired2.store(true, Ordering::SeqCst);
        });
        timer.cancel();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
