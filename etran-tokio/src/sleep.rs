use std::{sync::Arc, time::Duration};

use tokio::sync::Notify;

use crate::notify_once::NotifyOnce;

/// Why a [`PollSleep::sleep`] call returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SleepOutcome {
    /// The full duration elapsed.
    Expired,
    /// [`PollSleep::wake_all`] cut the wait short. The caller should carry on
    /// with its next iteration immediately.
    Woken,
    /// The shutdown channel fired. The caller must wind down.
    Terminated,
}

/// A timed wait that can be cut short from the outside.
///
/// Two distinct cancellation modes:
///
/// - *Wake*: [`wake_all`] resolves every in-flight [`sleep`] as
///   [`SleepOutcome::Woken`]. Used by the `/wakeup` control endpoint to make
///   the DB producer poll immediately without touching anything else.
/// - *Terminate*: the shutdown channel resolves every in-flight [`sleep`] as
///   [`SleepOutcome::Terminated`], at which point the sleeping loop exits.
///
/// A wake only affects sleeps that are already in flight; there is no stored
/// permit, so waking while nobody is sleeping is a no-op.
///
/// [`wake_all`]: PollSleep::wake_all
/// [`sleep`]: PollSleep::sleep
#[derive(Clone)]
pub struct PollSleep {
    wake: Arc<Notify>,
    shutdown: NotifyOnce,
}

impl PollSleep {
    pub fn new(shutdown: NotifyOnce) -> Self {
        Self {
            wake: Arc::new(Notify::new()),
            shutdown,
        }
    }

    /// Sleep for `duration`, or less if woken or terminated.
    pub async fn sleep(&self, duration: Duration) -> SleepOutcome {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            // If shutdown and wake race, shutdown must win.
            biased;
            () = shutdown.recv() => SleepOutcome::Terminated,
            () = self.wake.notified() => SleepOutcome::Woken,
            () = tokio::time::sleep(duration) => SleepOutcome::Expired,
        }
    }

    /// Resolve every in-flight [`sleep`](PollSleep::sleep) as
    /// [`SleepOutcome::Woken`].
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }
}
