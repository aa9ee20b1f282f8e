//! Completion signals
//!
//! Named boolean flags with wait-with-timeout semantics, used by
//! device operations to signal completion to the controller. The
//! contract is strict: an operation clears its signal before starting
//! and sets it exactly once on every exit path (success, driver
//! error, or internal poll timeout), so a waiter can never block past
//! its own bound because a command failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// A resettable completion flag with async wait support.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    set: AtomicBool,
    notify: Notify,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the flag before an operation begins.
    pub fn clear(&self) {
        self.set.store(false, Ordering::SeqCst);
    }

    /// Set the flag and wake every current waiter.
    pub fn set(&self) {
        self.set.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the flag is set or `timeout` elapses. Returns
    /// whether the flag was observed set in time.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_unbounded())
            .await
            .is_ok()
    }

    /// Wait until the flag is set, with no bound. Reserved for waits
    /// whose producing operation is already guaranteed to set the
    /// signal on every exit path.
    pub async fn wait_unbounded(&self) {
        loop {
            // Register interest before checking the flag so a set()
            // between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.set.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}
