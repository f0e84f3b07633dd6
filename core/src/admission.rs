//! Admission control for provider calls.
//!
//! A fixed-size pool of permits guards every provider call. A request
//! first tries to take a permit without waiting; if none is free it joins
//! the wait queue, unless the queue already holds `overload_threshold`
//! requests, in which case it is shed immediately.
//!
//! A queued request waits at most `queue_timeout`. If it times out it is
//! never dispatched.
//!
//! # Load levels
//!
//! - **Normal**: fewer than 80% of permits in use.
//! - **Saturated**: at least 80% of permits in use; requests may queue.
//! - **Shedding**: the wait queue is at the threshold; new requests are
//!   rejected.
//!
//! Permits are RAII guards: dropping an [`AdmissionPermit`] on any exit
//! path (completion, error, timeout, cancelled stream) returns the slot.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::error::{ComplianceError, OverloadReason};

const SATURATION_PERCENT: usize = 80;

/// Coarse load indicator reported by `status()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum LoadLevel {
    /// Capacity available.
    #[default]
    Normal,
    /// Pool nearly or fully busy.
    Saturated,
    /// Queue full; new requests are shed.
    Shedding,
}

impl LoadLevel {
    /// Human-readable label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Saturated => "Saturated",
            Self::Shedding => "Shedding",
        }
    }

    /// `true` when new requests are admitted without being shed.
    #[must_use]
    pub const fn admits(&self) -> bool {
        matches!(self, Self::Normal | Self::Saturated)
    }
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the admission pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AdmissionStats {
    /// Pool size.
    pub max_concurrent: usize,
    /// Permits currently held.
    pub active: usize,
    /// Requests waiting for a permit.
    pub queue_depth: usize,
    /// Queue depth at which requests are shed.
    pub overload_threshold: usize,
    /// Derived load level.
    pub load_level: LoadLevel,
    /// Requests rejected because the queue was full.
    pub shed_total: u64,
    /// Requests that gave up waiting.
    pub timed_out_total: u64,
    /// EMA of time spent waiting for a permit, milliseconds.
    pub avg_wait_ms: f64,
}

/// Slot in the admission pool; released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

// Decrements the queue depth however the wait ends.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct WaitEma {
    samples: u64,
    avg_ms: f64,
}

/// Bounded pool with a bounded wait queue.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    overload_threshold: usize,
    queue_timeout: Duration,
    queue_depth: AtomicUsize,
    shed_total: AtomicU64,
    timed_out_total: AtomicU64,
    wait: Mutex<WaitEma>,
}

impl AdmissionController {
    /// Creates a pool of `max_concurrent` permits.
    #[must_use]
    pub fn new(max_concurrent: usize, overload_threshold: usize, queue_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            overload_threshold,
            queue_timeout,
            queue_depth: AtomicUsize::new(0),
            shed_total: AtomicU64::new(0),
            timed_out_total: AtomicU64::new(0),
            wait: Mutex::new(WaitEma::default()),
        }
    }

    /// Creates the pool described by `config`.
    #[must_use]
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(
            config.max_concurrent_requests,
            config.overload_threshold,
            config.request_timeout(),
        )
    }

    /// Takes a permit, queueing within the configured bounds.
    ///
    /// # Errors
    ///
    /// [`ComplianceError::Overloaded`] when shed or timed out,
    /// [`ComplianceError::ShuttingDown`] once the pool is closed. The
    /// returned errors carry no decision; the caller attaches it.
    pub async fn acquire(&self) -> Result<AdmissionPermit, ComplianceError> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.record_wait(Duration::ZERO);
                return Ok(AdmissionPermit { _permit: permit });
            }
            Err(TryAcquireError::Closed) => return Err(ComplianceError::ShuttingDown { decision: None }),
            Err(TryAcquireError::NoPermits) => {}
        }

        let ahead = self.queue_depth.fetch_add(1, Ordering::AcqRel);
        let _slot = QueueSlot(&self.queue_depth);
        if ahead >= self.overload_threshold {
            self.shed_total.fetch_add(1, Ordering::Relaxed);
            warn!(queue_depth = ahead, threshold = self.overload_threshold, "shedding request");
            return Err(ComplianceError::Overloaded {
                reason: OverloadReason::QueueFull { depth: ahead },
                decision: None,
            });
        }

        let started = Instant::now();
        match tokio::time::timeout(self.queue_timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => {
                let waited = started.elapsed();
                self.record_wait(waited);
                debug!(waited_ms = duration_to_ms(waited), "admitted after queueing");
                Ok(AdmissionPermit { _permit: permit })
            }
            Ok(Err(_closed)) => Err(ComplianceError::ShuttingDown { decision: None }),
            Err(_elapsed) => {
                let waited = started.elapsed();
                self.timed_out_total.fetch_add(1, Ordering::Relaxed);
                warn!(waited_ms = duration_to_ms(waited), "request timed out in admission queue");
                Err(ComplianceError::Overloaded {
                    reason: OverloadReason::QueueTimeout { waited },
                    decision: None,
                })
            }
        }
    }

    fn record_wait(&self, waited: Duration) {
        const ALPHA: f64 = 0.1;
        let ms = duration_to_ms(waited);
        let mut ema = self.wait.lock().unwrap_or_else(PoisonError::into_inner);
        ema.samples = ema.samples.saturating_add(1);
        ema.avg_ms = if ema.samples == 1 {
            ms
        } else {
            (1.0 - ALPHA).mul_add(ema.avg_ms, ALPHA * ms)
        };
    }

    /// Stops admitting; queued and future requests fail with `ShuttingDown`.
    /// Permits already held stay valid until dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// `true` after [`AdmissionController::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Permits currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Requests waiting for a permit.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    /// Current load level.
    #[must_use]
    pub fn load_level(&self) -> LoadLevel {
        if self.queue_depth() >= self.overload_threshold {
            LoadLevel::Shedding
        } else if self.active() * 100 >= self.max_concurrent * SATURATION_PERCENT {
            LoadLevel::Saturated
        } else {
            LoadLevel::Normal
        }
    }

    /// Pool snapshot.
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let avg_wait_ms = self.wait.lock().unwrap_or_else(PoisonError::into_inner).avg_ms;
        AdmissionStats {
            max_concurrent: self.max_concurrent,
            active: self.active(),
            queue_depth: self.queue_depth(),
            overload_threshold: self.overload_threshold,
            load_level: self.load_level(),
            shed_total: self.shed_total.load(Ordering::Relaxed),
            timed_out_total: self.timed_out_total.load(Ordering::Relaxed),
            avg_wait_ms,
        }
    }
}

/// Converts a [`Duration`] to milliseconds (f64).
pub(crate) fn duration_to_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_released_on_drop() {
        let pool = AdmissionController::new(2, 4, Duration::from_secs(1));
        let a = pool.acquire().await.expect("first");
        let _b = pool.acquire().await.expect("second");
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.load_level(), LoadLevel::Saturated);
        drop(a);
        assert_eq!(pool.active(), 1);
    }

    #[tokio::test]
    async fn queued_request_times_out() {
        let pool = AdmissionController::new(1, 4, Duration::from_millis(20));
        let _held = pool.acquire().await.expect("held");
        match pool.acquire().await {
            Err(ComplianceError::Overloaded { reason: OverloadReason::QueueTimeout { .. }, .. }) => {}
            other => panic!("expected queue timeout, got {other:?}"),
        }
        assert_eq!(pool.queue_depth(), 0);
        assert_eq!(pool.stats().timed_out_total, 1);
    }

    #[tokio::test]
    async fn full_queue_sheds_immediately() {
        let pool = Arc::new(AdmissionController::new(1, 1, Duration::from_secs(5)));
        let held = pool.acquire().await.expect("held");

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        while pool.queue_depth() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.load_level(), LoadLevel::Shedding);

        match pool.acquire().await {
            Err(ComplianceError::Overloaded { reason: OverloadReason::QueueFull { depth }, .. }) => assert_eq!(depth, 1),
            other => panic!("expected shed, got {other:?}"),
        }

        drop(held);
        assert!(waiter.await.expect("join").is_ok());
        assert_eq!(pool.stats().shed_total, 1);
    }

    #[tokio::test]
    async fn close_rejects_new_and_queued_requests() {
        let pool = Arc::new(AdmissionController::new(1, 4, Duration::from_secs(5)));
        let _held = pool.acquire().await.expect("held");
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };
        while pool.queue_depth() == 0 {
            tokio::task::yield_now().await;
        }
        pool.close();
        assert!(matches!(waiter.await.expect("join"), Err(ComplianceError::ShuttingDown { .. })));
        assert!(matches!(pool.acquire().await, Err(ComplianceError::ShuttingDown { .. })));
    }
}
