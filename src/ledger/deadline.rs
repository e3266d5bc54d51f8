//! Cancellable deadline watchdog backing the ledger's time budget.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A one-shot monotonic timer running on its own watchdog thread.
///
/// The timer is armed at construction and fires its callback once the
/// timeout elapses, unless [`cancel`] is called first. Cancellation is
/// non-blocking and safe from any thread, including the watchdog's own
/// callback. Dropping a `Deadline` cancels it.
///
/// [`cancel`]: Deadline::cancel
pub(crate) struct Deadline {
    shared: Arc<Shared>,
}

struct Shared {
    canceled: Mutex<bool>,
    signal: Condvar,
}

impl Deadline {
    /// Arms the deadline: after `timeout`, `on_expire` runs unless canceled.
    pub(crate) fn arm<F>(timeout: Duration, on_expire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            canceled: Mutex::new(false),
            signal: Condvar::new(),
        });

        let watchdog = Arc::clone(&shared);
        thread::spawn(move || {
            let expires_at = Instant::now() + timeout;
            let mut canceled = watchdog.canceled.lock();
            while !*canceled {
                if watchdog.signal.wait_until(&mut canceled, expires_at).timed_out() {
                    break;
                }
            }
            let fire = !*canceled;
            // The lock must be released before the callback runs: the
            // callback may cancel this deadline from its own thread.
            drop(canceled);
            if fire {
                on_expire();
            }
        });

        Self { shared }
    }

    /// Cancels the deadline. The callback will not run after this returns,
    /// unless it was already running.
    pub(crate) fn cancel(&self) {
        *self.shared.canceled.lock() = true;
        self.shared.signal.notify_all();
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deadline")
            .field("canceled", &*self.shared.canceled.lock())
            .finish()
    }
}
