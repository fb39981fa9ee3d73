//! Token-bucket request budget shared by every fetch task in a run.
//!
//! The bucket holds up to `burst` units and refills continuously at
//! `requests_per_second`. Every request attempt, retries included, takes one
//! unit. Over any one-second window at most `burst + requests_per_second`
//! attempts can be issued.
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use wordtally_core::rate::RateBudget;
//!
//! # async fn run() -> Result<(), wordtally_core::AppError> {
//! let budget = RateBudget::new(5.0, 10)?;
//! let cancel = CancellationToken::new();
//! budget.acquire(&cancel).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared token bucket. Cloning yields another handle to the same bucket.
#[derive(Debug, Clone)]
pub struct RateBudget {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateBudget {
    /// Create a full bucket.
    pub fn new(requests_per_second: f64, burst: u32) -> Result<Self, AppError> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(AppError::ConfigError(format!(
                "requests per second must be positive, got {requests_per_second}"
            )));
        }
        if burst == 0 {
            return Err(AppError::ConfigError("burst must be at least 1".into()));
        }

        let capacity = f64::from(burst);
        Ok(Self {
            capacity,
            refill_per_sec: requests_per_second,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn requests_per_second(&self) -> f64 {
        self.refill_per_sec
    }

    /// Units currently available, after refilling.
    pub fn available(&self) -> f64 {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Take one unit if available without waiting.
    pub fn try_acquire(&self) -> bool {
        self.take_or_delay().is_none()
    }

    /// Take one unit, waiting for the bucket to refill if necessary.
    ///
    /// Returns [`AppError::Cancelled`] as soon as `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let Some(wait) = self.take_or_delay() else {
                return Ok(());
            };

            tracing::trace!(wait_ms = %wait.as_millis(), "Rate budget exhausted, waiting");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AppError::Cancelled),
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Either consume a unit (`None`) or report how long until one is due.
    ///
    /// The lock is never held across an await.
    fn take_or_delay(&self) -> Option<Duration> {
        let mut bucket = self.lock_bucket();
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return None;
        }

        let missing = 1.0 - bucket.tokens;
        // Very low rates overflow `Duration`; wait for as long as it allows.
        let wait = Duration::try_from_secs_f64(missing / self.refill_per_sec)
            .unwrap_or(Duration::MAX);
        Some(wait.max(Duration::from_millis(1)))
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Acquires the bucket lock, recovering from poison if necessary.
    fn lock_bucket(&self) -> MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate budget mutex");
            poisoned.into_inner()
        })
    }
}
