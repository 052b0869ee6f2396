//! Retry control for provider operations.
//!
//! Key components:
//! - `RetryPolicy`: attempt limits, exponential backoff with jitter and the set
//!   of error kinds worth retrying
//! - `OperationCall`: identity, parameters, timeout and cancellation of one call
//! - `RetryExecutor`: runs an operation through rate limiting, classification,
//!   backoff and exactly one emitted operation record
//! - `OperationContext`: per-operation attempt tracking (see [`context`])

pub mod context;

pub use context::OperationContext;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Classify, ContextMap, ErrorKind, ErrorRecord, EtlError};
use crate::rate_limit::RateLimiter;
use crate::telemetry::{Outcome, RecordSink};

/// Retry behavior for one provider
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
    retryable_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.1,
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

fn default_retryable_kinds() -> BTreeSet<ErrorKind> {
    ErrorKind::ALL
        .iter()
        .copied()
        .filter(|kind| kind.is_retryable())
        .collect()
}

impl RetryPolicy {
    /// Create a policy retrying connection and rate-limit failures
    ///
    /// Fails with a configuration error when `max_attempts` or `base_delay` is
    /// zero, `base_delay` exceeds `max_delay`, or `jitter_fraction` is outside `[0, 1]`.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_fraction: f64,
    ) -> Result<Self, ErrorRecord> {
        if max_attempts < 1 {
            return Err(ErrorRecord::configuration("max_attempts must be at least 1")
                .with_context("max_attempts", max_attempts));
        }
        if base_delay.is_zero() {
            return Err(ErrorRecord::configuration("base_delay must be greater than 0"));
        }
        if base_delay > max_delay {
            return Err(
                ErrorRecord::configuration("base_delay must not exceed max_delay")
                    .with_context("base_delay_secs", base_delay.as_secs_f64())
                    .with_context("max_delay_secs", max_delay.as_secs_f64()),
            );
        }
        if !(0.0..=1.0).contains(&jitter_fraction) {
            return Err(
                ErrorRecord::configuration("jitter_fraction must be within [0, 1]")
                    .with_context("jitter_fraction", jitter_fraction),
            );
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter_fraction,
            retryable_kinds: default_retryable_kinds(),
        })
    }

    /// Single attempt, no backoff
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Set the first backoff delay, raising `max_delay` to match if needed
    pub fn with_base_delay(mut self, base_delay: Duration) -> Result<Self, ErrorRecord> {
        if base_delay.is_zero() {
            return Err(ErrorRecord::configuration("base_delay must be greater than 0"));
        }
        self.base_delay = base_delay;
        self.max_delay = self.max_delay.max(base_delay);
        Ok(self)
    }

    /// Replace the retryable kinds
    ///
    /// Authentication, validation and configuration failures can never be retried.
    pub fn with_retryable_kinds(
        mut self,
        kinds: impl IntoIterator<Item = ErrorKind>,
    ) -> Result<Self, ErrorRecord> {
        let kinds: BTreeSet<ErrorKind> = kinds.into_iter().collect();
        if let Some(kind) = kinds.iter().find(|kind| kind.is_never_retryable()) {
            return Err(
                ErrorRecord::configuration(format!("{} errors cannot be retried", kind))
                    .with_context("retryable_kind", kind.as_str()),
            );
        }
        self.retryable_kinds = kinds;
        Ok(self)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter_fraction
    }

    pub fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_kinds
    }

    pub fn should_retry(&self, record: &ErrorRecord) -> bool {
        self.retryable_kinds.contains(&record.kind())
    }

    /// Delay after failed attempt `attempt` before jitter: `min(max, base * 2^(attempt-1))`
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Scale `delay` by a factor in `[1 - j, 1 + j)`; `unit` is a sample from `[0, 1)`
    pub fn jittered(&self, delay: Duration, unit: f64) -> Duration {
        if self.jitter_fraction == 0.0 {
            return delay;
        }
        let factor = 1.0 - self.jitter_fraction + unit.clamp(0.0, 1.0) * 2.0 * self.jitter_fraction;
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }

    /// Backoff before the attempt following `attempt`
    ///
    /// A server-provided retry hint on `record` wins when it is longer.
    pub fn delay_for(&self, attempt: u32, record: &ErrorRecord, unit: f64) -> Duration {
        let delay = self.jittered(self.base_delay_for(attempt), unit);
        match record.retry_after() {
            Some(hint) if hint > delay => hint,
            _ => delay,
        }
    }
}

/// One invocation handed to [`RetryExecutor::execute`]
#[derive(Debug, Clone)]
pub struct OperationCall {
    name: String,
    resource: String,
    parameters: ContextMap,
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl OperationCall {
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            parameters: ContextMap::new(),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key, value);
        self
    }

    pub fn with_parameters(mut self, parameters: ContextMap) -> Self {
        self.parameters = parameters;
        self
    }

    /// Bound each attempt; an attempt that runs over counts as a connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn parameters(&self) -> &ContextMap {
        &self.parameters
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Runs operations with rate limiting, classification and backoff
#[derive(Clone)]
pub struct RetryExecutor {
    limiter: Arc<RateLimiter>,
    sink: Arc<dyn RecordSink>,
}

impl RetryExecutor {
    pub fn new(limiter: Arc<RateLimiter>, sink: Arc<dyn RecordSink>) -> Self {
        Self { limiter, sink }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Execute an operation with retry logic
    ///
    /// Every attempt waits for a rate-limit slot on the call's resource. Failures
    /// are classified; retryable kinds back off and try again until the policy's
    /// attempt limit, anything else ends the sequence at once. Exactly one
    /// operation record reaches the sink per call, whatever the outcome.
    pub async fn execute<T, E, F, Fut>(
        &self,
        call: OperationCall,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, EtlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let OperationCall {
            name,
            resource,
            parameters,
            timeout,
            cancel,
        } = call;
        let mut context = OperationContext::enter(&name, &resource, parameters, self.sink.clone());

        loop {
            let attempt = context.attempt_number();
            debug_assert_eq!(context.history().len() as u32, attempt - 1);

            let waited = match self.limiter.admit(&resource, &cancel).await {
                Ok(waited) => waited,
                Err(_) => return Err(cancelled(context, name, attempt - 1)),
            };
            if !waited.is_zero() {
                debug!(
                    "⏱️ Rate limit on {} delayed attempt {} by {:.2}s",
                    resource,
                    attempt,
                    waited.as_secs_f64()
                );
            }

            if attempt == 1 {
                debug!(
                    "🚀 Starting {} on {} (attempt 1/{})",
                    name,
                    resource,
                    policy.max_attempts()
                );
            } else {
                info!(
                    "🔄 Retry attempt {}/{} of {} starting...",
                    attempt,
                    policy.max_attempts(),
                    name
                );
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = run_attempt(&mut operation, timeout) => Some(result),
            };
            let result = match result {
                Some(result) => result,
                None => return Err(cancelled(context, name, attempt)),
            };

            let failure = match result {
                Ok(value) => {
                    if attempt == 1 {
                        debug!(
                            "✅ {} succeeded on first attempt in {:.2}s",
                            name,
                            context.elapsed().as_secs_f64()
                        );
                    } else {
                        info!(
                            "✅ {} succeeded after {} attempts in {:.2}s total",
                            name,
                            attempt,
                            context.elapsed().as_secs_f64()
                        );
                    }
                    context.exit(Outcome::Success);
                    return Ok(value);
                }
                Err(record) => record,
            };

            let retry = policy.should_retry(&failure) && attempt < policy.max_attempts();
            let mut last = context.record_attempt(failure).clone();

            if !retry {
                if policy.should_retry(&last) {
                    error!(
                        "💥 Maximum retry attempts ({}) for {} reached after {:.2}s - giving up",
                        policy.max_attempts(),
                        name,
                        context.elapsed().as_secs_f64()
                    );
                } else {
                    debug!("❌ {} failed with non-retryable error: {}", name, last);
                }
                last.insert_context("parameters", context.parameters_json());
                last.insert_context("attempts", attempt);
                let history = context.history().to_vec();
                context.exit(Outcome::Failure {
                    error: last.clone(),
                });
                return Err(EtlError::Terminal {
                    operation: name,
                    attempts: attempt,
                    last,
                    history,
                });
            }

            let delay = policy.delay_for(attempt, &last, fastrand::f64());
            if attempt == 1 {
                warn!(
                    "🔄 First attempt of {} failed, retrying in {:.1}s... (attempt {}/{})",
                    name,
                    delay.as_secs_f64(),
                    attempt + 1,
                    policy.max_attempts()
                );
            } else {
                warn!(
                    "⏳ Retry {}/{} of {} failed, trying again in {:.1}s... ({})",
                    attempt,
                    policy.max_attempts(),
                    name,
                    delay.as_secs_f64(),
                    friendly_reason(&last)
                );
            }
            debug!("🔍 Retry details - Error: {}", last);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled(context, name, attempt)),
                _ = sleep(delay) => {}
            }
        }
    }
}

async fn run_attempt<T, E, F, Fut>(
    operation: &mut F,
    timeout: Option<Duration>,
) -> Result<T, ErrorRecord>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, operation()).await {
            Ok(result) => result.map_err(Classify::classify),
            Err(elapsed) => Err(elapsed
                .classify()
                .with_context("timeout_secs", limit.as_secs_f64())),
        },
        None => operation().await.map_err(Classify::classify),
    }
}

fn cancelled(context: OperationContext, name: String, attempts: u32) -> EtlError {
    info!("⏹️ {} cancelled after {} attempt(s)", name, attempts);
    context.exit(Outcome::Cancelled);
    EtlError::cancelled(name, attempts)
}

/// Short human-readable reason for retry log lines
fn friendly_reason(record: &ErrorRecord) -> &'static str {
    match record.kind() {
        ErrorKind::RateLimit => "provider is rate limiting requests",
        ErrorKind::Connection => "provider temporarily unreachable",
        ErrorKind::DataRetrieval => "provider returned unusable data",
        ErrorKind::Authentication => "credentials rejected",
        ErrorKind::Validation => "invalid request",
        ErrorKind::Configuration => "configuration problem",
    }
}
