use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Periodic timer driving an async callback.
///
/// The first invocation of the callback happens one `interval` after
/// construction, never synchronously. After each invocation the next
/// execution advances by `interval`, unless [`set_next_exec`] was called
/// from inside the callback, which overrides the advance for that tick.
///
/// A missed deadline is not caught up: the next invocation still targets
/// the stored time point, which may already be in the past, in which case
/// the callback runs immediately and the deadline advances once.
///
/// Dropping the timer cancels the pending invocation and stops the task.
///
/// [`set_next_exec`]: Timer::set_next_exec
pub struct Timer {
    next_exec: watch::Sender<Instant>,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Spawns a new timer. Must be called from within a tokio runtime.
    pub fn new<F, Fut>(interval: Duration, mut cb: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = watch::channel(Instant::now() + interval);

        let handle = tokio::spawn(async move {
            let mut next_exec = *rx.borrow_and_update();
            loop {
                tokio::select! {
                    _ = time::sleep_until(next_exec) => {
                        cb().await;
                        if rx.has_changed().unwrap_or(false) {
                            // Rescheduled from inside the callback
                            next_exec = *rx.borrow_and_update();
                        } else {
                            next_exec += interval;
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        next_exec = *rx.borrow_and_update();
                    }
                }
            }
        });

        Timer {
            next_exec: tx,
            handle,
        }
    }

    /// Reschedules the pending invocation to `at`.
    pub fn set_next_exec(&self, at: Instant) {
        let _ = self.next_exec.send(at);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
