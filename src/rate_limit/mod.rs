//! Sliding-window rate limiting per provider resource
//!
//! Each named resource ("fred", "haver", ...) owns a [`RateWindow`] holding the
//! start times of recent operations. The limiter never blocks and never fails:
//! [`RateLimiter::acquire`] reports how long the caller should wait, and
//! [`RateLimiter::record_operation`] atomically claims a slot once the caller is
//! ready. Both run prune, check and (for recording) push under one mutex, so no
//! more than `max_operations` operations are ever counted within a window no
//! matter how many tasks race for the last slot.
//!
//! ```rust
//! use std::time::Duration;
//! use fedetl::rate_limit::{Admission, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::per_minute(120))
//!     .with_quota("haver", RateLimitConfig::per_second(10));
//!
//! assert_eq!(limiter.acquire("fred"), Duration::ZERO);
//! assert_eq!(limiter.record_operation("fred"), Admission::Admitted);
//! ```
//!
//! Windows are per process; sharing a quota across processes is not supported.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::ErrorRecord;

/// Quota for one resource: at most `max_operations` per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_operations: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a validated quota
    pub fn new(max_operations: u32, window: Duration) -> Result<Self, ErrorRecord> {
        if max_operations == 0 {
            return Err(ErrorRecord::configuration("Rate limit must allow at least one operation")
                .with_code("CONFIG_INVALID")
                .with_context("max_operations", max_operations));
        }
        if window.is_zero() {
            return Err(ErrorRecord::configuration("Rate limit window must be greater than 0")
                .with_code("CONFIG_INVALID")
                .with_context("window_secs", window.as_secs_f64()));
        }
        Ok(Self {
            max_operations,
            window,
        })
    }

    pub fn per_minute(max_operations: u32) -> Self {
        Self {
            max_operations: max_operations.max(1),
            window: Duration::from_secs(60),
        }
    }

    pub fn per_second(max_operations: u32) -> Self {
        Self {
            max_operations: max_operations.max(1),
            window: Duration::from_secs(1),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::per_minute(120)
    }
}

/// Outcome of trying to record an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A slot was taken; the operation may start now
    Admitted,
    /// The window is full; try again after the given duration
    Wait(Duration),
}

/// Sliding-window state for a single resource
#[derive(Debug)]
pub struct RateWindow {
    resource_name: String,
    max_operations: usize,
    window_duration: Duration,
    timestamps: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(resource_name: impl Into<String>, config: RateLimitConfig) -> Self {
        let max_operations = config.max_operations as usize;
        Self {
            resource_name: resource_name.into(),
            max_operations,
            window_duration: config.window,
            timestamps: VecDeque::with_capacity(max_operations),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    /// Drop entries that have aged out of the window
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window_duration {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until a slot frees up; zero when one is free now
    pub fn wait_time(&mut self, now: Instant) -> Duration {
        self.prune(now);
        if self.timestamps.len() < self.max_operations {
            return Duration::ZERO;
        }
        match self.timestamps.front() {
            Some(&oldest) => (oldest + self.window_duration).saturating_duration_since(now),
            None => self.window_duration,
        }
    }

    /// Claim a slot if one is free
    pub fn try_record(&mut self, now: Instant) -> Admission {
        let wait = self.wait_time(now);
        if wait.is_zero() {
            self.timestamps.push_back(now);
            Admission::Admitted
        } else {
            Admission::Wait(wait)
        }
    }

    /// Operations counted in the window as of `now`
    pub fn in_window(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.timestamps.len()
    }
}

/// Rate-limit wait aborted through the cancellation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate-limit wait cancelled")]
pub struct WaitCancelled;

/// Shared, per-process rate limiter keyed by resource name
#[derive(Debug)]
pub struct RateLimiter {
    default_quota: RateLimitConfig,
    quotas: HashMap<String, RateLimitConfig>,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    /// Create a limiter; resources without an explicit quota use `default_quota`
    pub fn new(default_quota: RateLimitConfig) -> Self {
        Self {
            default_quota,
            quotas: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Set the quota for one resource
    pub fn with_quota(mut self, resource: impl Into<String>, quota: RateLimitConfig) -> Self {
        self.quotas.insert(resource.into(), quota);
        self
    }

    pub fn quota_for(&self, resource: &str) -> RateLimitConfig {
        self.quotas
            .get(resource)
            .copied()
            .unwrap_or(self.default_quota)
    }

    fn with_window<R>(&self, resource: &str, f: impl FnOnce(&mut RateWindow) -> R) -> R {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows
            .entry(resource.to_string())
            .or_insert_with(|| RateWindow::new(resource, self.quota_for(resource)));
        f(window)
    }

    /// How long the caller must wait before `resource` has a free slot
    pub fn acquire(&self, resource: &str) -> Duration {
        let wait = self.with_window(resource, |window| window.wait_time(Instant::now()));
        trace!(resource = resource, wait_ms = wait.as_millis() as u64, "Rate limit check");
        wait
    }

    /// Atomically claim a slot for an operation starting now
    pub fn record_operation(&self, resource: &str) -> Admission {
        self.with_window(resource, |window| window.try_record(Instant::now()))
    }

    /// Operations currently counted against `resource`
    pub fn in_window(&self, resource: &str) -> usize {
        self.with_window(resource, |window| window.in_window(Instant::now()))
    }

    /// Wait until a slot for `resource` is claimed, returning the time spent waiting
    pub async fn admit(
        &self,
        resource: &str,
        cancel: &CancellationToken,
    ) -> Result<Duration, WaitCancelled> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(WaitCancelled);
            }

            let wait = self.acquire(resource);
            if !wait.is_zero() {
                debug!(
                    resource = resource,
                    wait_ms = wait.as_millis() as u64,
                    "⏸️ Rate limit window full, waiting"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(WaitCancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            // Another task may have taken the slot while we slept
            if let Admission::Admitted = self.record_operation(resource) {
                return Ok(started.elapsed());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(max, window).unwrap())
    }

    #[test]
    fn test_rate_limit_config_validation() {
        assert!(RateLimitConfig::new(0, Duration::from_secs(1)).is_err());
        assert!(RateLimitConfig::new(5, Duration::ZERO).is_err());
        assert!(RateLimitConfig::new(5, Duration::from_secs(1)).is_ok());
        assert_eq!(RateLimitConfig::per_minute(120).window, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_acquire_waits_for_oldest_entry() {
        let limiter = limiter(2, Duration::from_secs(1));

        assert_eq!(limiter.acquire("fred"), Duration::ZERO);
        assert_eq!(limiter.record_operation("fred"), Admission::Admitted);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(limiter.acquire("fred"), Duration::ZERO);
        assert_eq!(limiter.record_operation("fred"), Admission::Admitted);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(limiter.acquire("fred"), Duration::from_millis(800));
        assert_eq!(
            limiter.record_operation("fred"),
            Admission::Wait(Duration::from_millis(800))
        );
        assert_eq!(limiter.in_window("fred"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_age_out_of_window() {
        let limiter = limiter(1, Duration::from_secs(1));
        assert_eq!(limiter.record_operation("fred"), Admission::Admitted);
        assert_eq!(limiter.acquire("fred"), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.acquire("fred"), Duration::ZERO);
        assert_eq!(limiter.in_window("fred"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resources_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60))
            .with_quota("haver", RateLimitConfig::new(2, Duration::from_secs(1)).unwrap());

        assert_eq!(limiter.record_operation("fred"), Admission::Admitted);
        assert!(!limiter.acquire("fred").is_zero());

        assert_eq!(limiter.record_operation("haver"), Admission::Admitted);
        assert_eq!(limiter.record_operation("haver"), Admission::Admitted);
        assert!(!limiter.acquire("haver").is_zero());

        // Unconfigured resources fall back to the default quota
        assert_eq!(limiter.quota_for("other").max_operations, 1);
    }

    #[test]
    fn test_racing_threads_never_exceed_quota() {
        let limiter = Arc::new(limiter(5, Duration::from_secs(3600)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.record_operation("fred") == Admission::Admitted)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 5);
        assert_eq!(limiter.in_window("fred"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admissions_respect_sliding_window() {
        let limiter = Arc::new(limiter(3, Duration::from_secs(1)));
        let admitted_at = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let limiter = limiter.clone();
                let admitted_at = admitted_at.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    limiter.admit("fred", &cancel).await.unwrap();
                    admitted_at.lock().unwrap().push(Instant::now());
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut times = admitted_at.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 12);
        for pair in times.windows(4) {
            assert!(pair[3].duration_since(pair[0]) >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_is_cancellable() {
        let limiter = limiter(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        assert!(limiter.admit("fred", &cancel).await.is_ok());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        assert_eq!(limiter.admit("fred", &cancel).await, Err(WaitCancelled));
        assert_eq!(limiter.in_window("fred"), 1);
    }
}
