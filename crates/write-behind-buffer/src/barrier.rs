//! Quiescence barrier for shutdown.
//!
//! Producers hold a [`BarrierGuard`] for the duration of an offer. Shutdown
//! flips its "stop accepting" flag first, then waits here until every guard
//! has been dropped. Producers must enter the barrier *before* reading the
//! shutdown flag: with both sides using `SeqCst`, either the producer sees
//! the flag or shutdown sees the registration.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct QuiescenceBarrier {
    active: AtomicUsize,
    generation: AtomicU64,
    idle: Notify,
}

impl QuiescenceBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight operation until the guard drops.
    pub fn enter(&self) -> BarrierGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        BarrierGuard { barrier: self }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Number of times the barrier has drained to zero.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Wait until no operation is registered. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                // Register interest before checking, so a leave between the
                // check and the await is not missed.
                notified.as_mut().enable();
                if self.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.generation.fetch_add(1, Ordering::SeqCst);
            self.idle.notify_waiters();
        }
    }
}

/// Deregisters on drop.
#[derive(Debug)]
pub struct BarrierGuard<'a> {
    barrier: &'a QuiescenceBarrier,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        self.barrier.leave();
    }
}
