// ── Connection admission ──
//
// Global cap on simultaneously held connection slots. Every session
// acquires a slot before opening a link and releases it when the link
// is gone. One controller is built by the fleet and shared explicitly,
// so several fleets in one process do not interfere.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::AdmissionError;

/// Bounded pool of connection slots with wait statistics.
#[derive(Debug)]
pub struct AdmissionController {
    max_slots: usize,
    semaphore: Arc<Semaphore>,
    counters: Counters,
}

#[derive(Debug, Default)]
struct Counters {
    acquire_total: AtomicU64,
    acquire_timeout: AtomicU64,
    acquire_error: AtomicU64,
    wait_micros: AtomicU64,
}

/// Point-in-time view of admission statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub max_slots: usize,
    pub in_use: usize,
    /// Every call to `acquire`, successful or not.
    pub acquire_total: u64,
    pub acquire_timeout: u64,
    pub acquire_error: u64,
    /// Mean wait of successful acquisitions.
    pub average_wait: Duration,
}

impl AdmissionStats {
    pub fn average_wait_ms(&self) -> f64 {
        self.average_wait.as_secs_f64() * 1000.0
    }

    /// Fraction of attempts that timed out; zero before any attempt.
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    pub fn timeout_ratio(&self) -> f64 {
        if self.acquire_total == 0 {
            0.0
        } else {
            self.acquire_timeout as f64 / self.acquire_total as f64
        }
    }

    pub fn is_saturated(&self) -> bool {
        self.in_use >= self.max_slots
    }
}

impl AdmissionController {
    /// A controller with `max_slots` slots; zero is raised to one.
    pub fn new(max_slots: usize) -> Self {
        let max_slots = max_slots.max(1);
        Self {
            max_slots,
            semaphore: Arc::new(Semaphore::new(max_slots)),
            counters: Counters::default(),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    pub fn in_use(&self) -> usize {
        self.max_slots
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Wait for a free slot, up to `timeout` when one is given.
    ///
    /// Dropping the returned guard releases the slot. Cancelling this
    /// future while it waits leaves the pool untouched.
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<SlotGuard, AdmissionError> {
        self.counters.acquire_total.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let pending = Arc::clone(&self.semaphore).acquire_owned();

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    self.counters.acquire_timeout.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        timeout_ms = limit.as_millis(),
                        in_use = self.in_use(),
                        "connection slot wait timed out"
                    );
                    return Err(AdmissionError::TimedOut { waited: limit });
                }
            },
            None => pending.await,
        };

        match outcome {
            Ok(permit) => {
                let waited = started.elapsed();
                self.counters.wait_micros.fetch_add(
                    u64::try_from(waited.as_micros()).unwrap_or(u64::MAX),
                    Ordering::Relaxed,
                );
                trace!(
                    waited_ms = waited.as_millis(),
                    in_use = self.in_use(),
                    "connection slot acquired"
                );
                Ok(SlotGuard {
                    permit: Some(permit),
                })
            }
            Err(_) => {
                self.counters.acquire_error.fetch_add(1, Ordering::Relaxed);
                Err(AdmissionError::Closed)
            }
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let total = self.counters.acquire_total.load(Ordering::Relaxed);
        let timeouts = self.counters.acquire_timeout.load(Ordering::Relaxed);
        let errors = self.counters.acquire_error.load(Ordering::Relaxed);
        let successes = total.saturating_sub(timeouts).saturating_sub(errors);
        let average_wait = if successes == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.counters.wait_micros.load(Ordering::Relaxed) / successes)
        };

        AdmissionStats {
            max_slots: self.max_slots,
            in_use: self.in_use(),
            acquire_total: total,
            acquire_timeout: timeouts,
            acquire_error: errors,
            average_wait,
        }
    }

    /// Refuse all further acquisitions. Slots already held stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

/// A held connection slot.
#[derive(Debug)]
pub struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
}

impl SlotGuard {
    /// Give the slot back. Returns `false` when it was already released.
    pub fn release(&mut self) -> bool {
        if self.permit.take().is_some() {
            true
        } else {
            debug!("duplicate connection slot release ignored");
            false
        }
    }

    pub fn is_held(&self) -> bool {
        self.permit.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_use_never_exceeds_max() {
        let ctl = AdmissionController::new(2);
        let a = ctl.acquire(None).await.unwrap();
        let _b = ctl.acquire(None).await.unwrap();
        assert_eq!(ctl.in_use(), 2);
        assert!(ctl.stats().is_saturated());

        drop(a);
        assert_eq!(ctl.in_use(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_exhausted() {
        let ctl = AdmissionController::new(1);
        let _held = ctl.acquire(None).await.unwrap();

        let err = ctl
            .acquire(Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::TimedOut {
                waited: Duration::from_secs(5)
            }
        );

        let stats = ctl.stats();
        assert_eq!(stats.acquire_total, 2);
        assert_eq!(stats.acquire_timeout, 1);
        assert!((stats.timeout_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(ctl.in_use(), 1);
    }

    #[tokio::test]
    async fn duplicate_release_is_ignored() {
        let ctl = AdmissionController::new(1);
        let mut guard = ctl.acquire(None).await.unwrap();
        assert!(guard.release());
        assert!(!guard.release());
        assert!(!guard.is_held());
        drop(guard);
        assert_eq!(ctl.in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_granted_slot_on_release() {
        let ctl = Arc::new(AdmissionController::new(1));
        let held = ctl.acquire(None).await.unwrap();

        let waiter = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.acquire(Some(Duration::from_secs(20))).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(held);

        let guard = waiter.await.unwrap().unwrap();
        assert!(guard.is_held());
        assert_eq!(ctl.in_use(), 1);
        assert!(ctl.stats().average_wait >= Duration::from_secs(1) / 2);
    }

    #[tokio::test]
    async fn closed_controller_rejects_acquire() {
        let ctl = AdmissionController::new(1);
        ctl.close();
        assert_eq!(ctl.acquire(None).await.unwrap_err(), AdmissionError::Closed);
        assert_eq!(ctl.stats().acquire_error, 1);
    }
}
