// ABOUTME: Bounded async permit gate used to cap remotely-opened streams awaiting accept

use std::sync::Mutex;
use tokio::sync::Notify;

/// A permit gate, not a general-purpose counting semaphore: `release()`
/// either wakes exactly one waiter or increments the permit count, never
/// both, so permits are never manufactured out of thin air by a race
/// between a waiter and a releaser.
pub struct Semaphore {
    permits: Mutex<usize>,
    notify: Notify,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Semaphore {
            permits: Mutex::new(permits),
            notify: Notify::new(),
        }
    }

    /// Suspends until a permit is available, then takes it.
    pub async fn acquire(&self) {
        loop {
            {
                let mut permits = self.permits.lock().expect("semaphore poisoned");
                if *permits > 0 {
                    *permits -= 1;
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Takes a permit only if one is immediately available; never suspends.
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock().expect("semaphore poisoned");
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    /// Returns a permit. A task blocked in `acquire` (if any) will observe
    /// it on its next wakeup.
    pub fn release(&self) {
        {
            let mut permits = self.permits.lock().expect("semaphore poisoned");
            *permits += 1;
        }
        self.notify.notify_one();
    }
}
