// SPDX-License-Identifier: MIT
//! Resilience kit (spec §3 "Backoff"/"Circuit breaker", §4.4): backoff
//! strategies, a retry executor, and a circuit breaker, all driven off
//! the same error-classification taxonomy as [`crate::error`].
//!
//! Grounded on the teacher crate's circuit-breaker atomics
//! (`CIRCUIT_BREAKER_FAILURES` / `CIRCUIT_BREAKER_LAST_FAILURE` in
//! `secure_channel_improved.rs`), generalized into a reusable type with
//! the exact state diagram spec'd here rather than a pair of free statics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{RetryDisposition, SsError};
use crate::limiter::tokio_util_notify::CancelToken;

// ---------------------------------------------------------------------
// Backoff (§3 "Backoff", §4.4)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Fixed,
    Linear,
    Exponential,
    Geometric,
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub strategy: Strategy,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Symmetric jitter fraction in `[0, 1]`.
    pub jitter: f64,
    pub reset_threshold: u32,
    pub reset_after: Duration,
}

impl BackoffConfig {
    /// The `NetworkRetryConfig` named in §4.2: base 1s, max 60s, exponential
    /// x2, 5 attempts, 10% jitter.
    pub fn network_retry() -> Self {
        BackoffConfig {
            strategy: Strategy::Exponential,
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.10,
            reset_threshold: 1,
            reset_after: Duration::from_secs(60),
        }
    }
}

/// Stateful backoff sequence: `next_delay`, `should_retry`, `reset`,
/// `record_success`/`record_failure` (§4.4).
pub struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
    max_attempts: u32,
    consecutive_successes: u32,
    last_retry: Instant,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig, max_attempts: u32) -> Self {
        Backoff {
            cfg,
            attempt: 0,
            max_attempts,
            consecutive_successes: 0,
            last_retry: Instant::now(),
        }
    }

    /// `delay(n)` from §3: exponential uses `base * multiplier^n`, geometric
    /// iterated multiply, linear `base * (n+1)`; always clamped to `max`.
    fn delay_for(&self, n: u32) -> Duration {
        let base = self.cfg.base.as_secs_f64();
        let raw = match self.cfg.strategy {
            Strategy::Fixed => base,
            Strategy::Linear => base * (n as f64 + 1.0),
            Strategy::Exponential => base * self.cfg.multiplier.powi(n as i32),
            Strategy::Geometric => {
                let mut d = base;
                for _ in 0..n {
                    d *= self.cfg.multiplier;
                }
                d
            }
        };
        let max = self.cfg.max.as_secs_f64();
        Duration::from_secs_f64(raw.min(max).max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.cfg.jitter <= 0.0 {
            return delay;
        }
        let u: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let factor = 1.0 + (2.0 * u - 1.0) * self.cfg.jitter;
        let jittered_secs = (delay.as_secs_f64() * factor).max(0.0);
        Duration::from_secs_f64(jittered_secs).min(self.cfg.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.jittered(self.delay_for(self.attempt));
        self.attempt += 1;
        self.last_retry = Instant::now();
        delay
    }

    pub fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.consecutive_successes = 0;
    }

    pub fn record_success(&mut self) {
        self.consecutive_successes += 1;
        if self.consecutive_successes >= self.cfg.reset_threshold
            && self.last_retry.elapsed() >= self.cfg.reset_after
        {
            self.reset();
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_successes = 0;
    }
}

// ---------------------------------------------------------------------
// Retry executor (§4.4)
// ---------------------------------------------------------------------

pub type Classifier = fn(&SsError) -> RetryDisposition;

pub fn default_classifier(err: &SsError) -> RetryDisposition {
    err.category().default_disposition()
}

/// `Skip` short-circuit indicator returned by [`retry`] (§4.4).
pub enum RetryOutcome<T> {
    Ok(T),
    Skipped,
    Err(SsError),
}

/// `retry(ctx, op)` (§4.4): loops `op`, classifying failures into
/// Retryable / Fatal / Skip, honoring an attempt timeout and cancellation
/// on the inter-attempt sleep.
pub async fn retry<F, Fut, T>(
    mut backoff: Backoff,
    attempt_timeout: Duration,
    cancel: &CancelToken,
    classify: Classifier,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, SsError>>,
{
    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Err(SsError::Cancelled);
        }

        let attempt = tokio::time::timeout(attempt_timeout, op()).await;
        let result = match attempt {
            Ok(inner) => inner,
            Err(_) => Err(SsError::Timeout(attempt_timeout)),
        };

        match result {
            Ok(value) => {
                backoff.record_success();
                return RetryOutcome::Ok(value);
            }
            Err(e) => {
                backoff.record_failure();
                match classify(&e) {
                    RetryDisposition::Fatal => return RetryOutcome::Err(e),
                    RetryDisposition::Skip => return RetryOutcome::Skipped,
                    RetryDisposition::Retryable => {
                        if !backoff.should_retry() {
                            return RetryOutcome::Err(e);
                        }
                        let delay = backoff.next_delay();
                        debug!(attempt = backoff.attempts(), ?delay, "retrying after failure");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return RetryOutcome::Err(SsError::Cancelled),
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Circuit breaker (§3 "Circuit breaker", §4.4)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: f64,
    pub min_requests: u64,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
    pub request_timeout: Duration,
}

struct BreakerInner {
    state: std::sync::Mutex<BreakerState>,
    last_transition: std::sync::Mutex<Instant>,
    requests: AtomicU64,
    failures: AtomicU64,
    half_open_successes: AtomicU32,
}

/// `call(ctx, op)` circuit breaker (§4.4). State transitions follow the
/// diagram in §3 exactly; Open never jumps straight to Closed.
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    inner: BreakerInner,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        CircuitBreaker {
            cfg,
            inner: BreakerInner {
                state: std::sync::Mutex::new(BreakerState::Closed),
                last_transition: std::sync::Mutex::new(Instant::now()),
                requests: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                half_open_successes: AtomicU32::new(0),
            },
        }
    }

    pub fn state(&self) -> BreakerState {
        *self.inner.state.lock().unwrap()
    }

    fn transition(&self, to: BreakerState) {
        *self.inner.state.lock().unwrap() = to;
        *self.inner.last_transition.lock().unwrap() = Instant::now();
        if to == BreakerState::Closed {
            self.inner.requests.store(0, Ordering::SeqCst);
            self.inner.failures.store(0, Ordering::SeqCst);
        }
        if to != BreakerState::HalfOpen {
            self.inner.half_open_successes.store(0, Ordering::SeqCst);
        }
    }

    pub async fn call<F, Fut, T>(
        &self,
        classify: impl Fn(&SsError) -> bool,
        op: F,
    ) -> Result<T, SsError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, SsError>>,
    {
        let state = self.state();
        if state == BreakerState::Open {
            let elapsed = self.inner.last_transition.lock().unwrap().elapsed();
            if elapsed < self.cfg.recovery_timeout {
                return Err(SsError::CircuitOpen {
                    retry_after_ms: (self.cfg.recovery_timeout - elapsed).as_millis() as u64,
                });
            }
            self.transition(BreakerState::HalfOpen);
        }

        let outcome = tokio::time::timeout(self.cfg.request_timeout, op()).await;
        let result = match outcome {
            Ok(r) => r,
            Err(_) => Err(SsError::Timeout(self.cfg.request_timeout)),
        };

        let is_failure = match &result {
            Ok(_) => false,
            Err(e) => classify(e),
        };

        self.record(is_failure);
        result
    }

    fn record(&self, is_failure: bool) {
        let state = self.state();
        match state {
            BreakerState::HalfOpen => {
                if is_failure {
                    warn!("circuit breaker: half-open probe failed, reopening");
                    self.transition(BreakerState::Open);
                } else {
                    let successes = self.inner.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
                    if successes >= self.cfg.success_threshold {
                        self.transition(BreakerState::Closed);
                    }
                }
            }
            BreakerState::Closed => {
                let requests = self.inner.requests.fetch_add(1, Ordering::SeqCst) + 1;
                let failures = if is_failure {
                    self.inner.failures.fetch_add(1, Ordering::SeqCst) + 1
                } else {
                    self.inner.failures.load(Ordering::SeqCst)
                };
                if requests >= self.cfg.min_requests
                    && (failures as f64 / requests as f64) > self.cfg.failure_threshold
                {
                    warn!(requests, failures, "circuit breaker: failure threshold exceeded");
                    self.transition(BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// Default classifier for the breaker: all errors count as failure (§4.4).
pub fn all_errors_are_failures(_e: &SsError) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_matches_formula() {
        let backoff = Backoff::new(
            BackoffConfig {
                jitter: 0.0,
                ..BackoffConfig::network_retry()
            },
            5,
        );
        assert_eq!(backoff.delay_for(0), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn linear_and_geometric_formulas() {
        let linear = Backoff::new(
            BackoffConfig {
                strategy: Strategy::Linear,
                jitter: 0.0,
                ..BackoffConfig::network_retry()
            },
            5,
        );
        assert_eq!(linear.delay_for(0), Duration::from_secs(1));
        assert_eq!(linear.delay_for(2), Duration::from_secs(3));

        let geometric = Backoff::new(
            BackoffConfig {
                strategy: Strategy::Geometric,
                multiplier: 3.0,
                jitter: 0.0,
                ..BackoffConfig::network_retry()
            },
            5,
        );
        assert_eq!(geometric.delay_for(2), Duration::from_secs(9));
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let backoff = Backoff::new(
            BackoffConfig {
                jitter: 0.0,
                ..BackoffConfig::network_retry()
            },
            20,
        );
        assert_eq!(backoff.delay_for(10), backoff.cfg.max);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_requires_half_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 0.5,
            min_requests: 10,
            recovery_timeout: Duration::from_millis(50),
            success_threshold: 2,
            request_timeout: Duration::from_secs(1),
        });

        for _ in 0..10 {
            let _ = breaker
                .call(all_errors_are_failures, || async {
                    Err::<(), _>(SsError::Cancelled)
                })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let immediate = breaker
            .call(all_errors_are_failures, || async { Ok::<_, SsError>(()) })
            .await;
        assert!(matches!(immediate, Err(SsError::CircuitOpen { .. })));

        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = breaker
            .call(all_errors_are_failures, || async { Ok::<_, SsError>(()) })
            .await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let _ = breaker
            .call(all_errors_are_failures, || async { Ok::<_, SsError>(()) })
            .await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn breaker_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 0.5,
            min_requests: 2,
            recovery_timeout: Duration::from_millis(10),
            success_threshold: 2,
            request_timeout: Duration::from_secs(1),
        });
        for _ in 0..2 {
            let _ = breaker
                .call(all_errors_are_failures, || async {
                    Err::<(), _>(SsError::Cancelled)
                })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = breaker
            .call(all_errors_are_failures, || async {
                Err::<(), _>(SsError::Cancelled)
            })
            .await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn retry_stops_on_fatal() {
        let backoff = Backoff::new(BackoffConfig::network_retry(), 5);
        let cancel = CancelToken::default();
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let outcome = retry(
            backoff,
            Duration::from_secs(1),
            &cancel,
            |_| RetryDisposition::Fatal,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(SsError::ConfigInvalid { reason: "x".into() }) }
            },
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Err(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
