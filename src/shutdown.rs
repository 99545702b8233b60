//! One-shot terminal signal shared by cooperating tasks
//!
//! Once signaled it stays signaled; `wait` completes immediately for late
//! arrivals.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub struct Shutdown {
    signaled: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Signal termination. Idempotent.
    pub fn signal(&self) {
        if !self.signaled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::SeqCst)
    }

    /// Wait until the signal fires
    pub async fn wait(&self) {
        while !self.is_signaled() {
            let notified = self.notify.notified();
            // Re-check after registering so a signal racing with the
            // registration is not lost
            if self.is_signaled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
