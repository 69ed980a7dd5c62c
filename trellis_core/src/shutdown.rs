use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Process-wide cancellation signal.
///
/// Cloning shares the same signal. Every suspension point of the engine
/// (startup delay, idle backoff) sleeps through [`Shutdown::sleep`], which
/// returns early as soon as the signal is triggered.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        condvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleeps for `duration` unless cancelled first.
    /// Returns `true` when the sleep was cut short by the signal.
    ///
    /// A duration too large to represent as a deadline waits for the signal.
    pub fn sleep(&self, duration: Duration) -> bool {
        let (lock, condvar) = &*self.inner;
        let deadline = Instant::now().checked_add(duration);
        let mut triggered = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !*triggered {
            triggered = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    condvar
                        .wait_timeout(triggered, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => condvar
                    .wait(triggered)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }
        true
    }
}
