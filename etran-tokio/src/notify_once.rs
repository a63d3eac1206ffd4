use std::sync::Arc;

use tokio::sync::Semaphore;

/// Sends a notification to all consumers *once*, most commonly used as a
/// shutdown channel.
///
/// - Multi-producer and multi-consumer - clone to get another handle.
/// - Every clone observes the signal at-most-once via [`recv`]; if the signal
///   has already been sent, new clones can still observe it once.
/// - Consumers can receive a signal that was sent before they 'subscribed'
///   (unlike [`tokio::sync::broadcast`]).
/// - Sending more than once is harmless.
///
/// Internally this (ab)uses a [`Semaphore`] with zero permits: [`acquire`]
/// only returns once the semaphore is closed, so closing it is "send" and
/// observing the [`AcquireError`] is "receive".
///
/// [`recv`]: NotifyOnce::recv
/// [`acquire`]: Semaphore::acquire
/// [`AcquireError`]: tokio::sync::AcquireError
#[derive(Debug)]
pub struct NotifyOnce {
    sem: Arc<Semaphore>,
    seen: bool,
}

impl NotifyOnce {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            sem: Arc::new(Semaphore::new(0)),
            seen: false,
        }
    }

    /// Send the signal, completing every pending and future call to [`recv`].
    ///
    /// [`recv`]: NotifyOnce::recv
    pub fn send(&self) {
        self.sem.close();
    }

    /// Wait for the signal.
    ///
    /// NOTE: if this handle has already observed the signal, this future
    /// never resolves. Intended for `loop { select! { ... } }` usage where
    /// observing the signal exits the loop.
    pub async fn recv(&mut self) {
        if self.seen {
            std::future::pending().await
        } else {
            self.sem
                .acquire()
                .await
                .map_err(|_| ())
                .expect_err("Acquired a permit from a zero-permit semaphore");
            self.seen = true;
        }
    }

    /// Wait for the signal, taking ownership of the handle. Useful for
    /// graceful shutdown APIs which require `impl Future<Output = ()> +
    /// 'static`.
    pub async fn recv_owned(mut self) {
        self.recv().await
    }

    /// Immediately returns whether the signal has been sent. Does NOT count
    /// as an observation for a later call to [`recv`](Self::recv).
    #[must_use]
    pub fn try_recv(&self) -> bool {
        self.sem.is_closed()
    }
}

impl Clone for NotifyOnce {
    fn clone(&self) -> Self {
        Self {
            sem: self.sem.clone(),
            // Every clone gets its own chance to observe the signal.
            seen: false,
        }
    }
}
