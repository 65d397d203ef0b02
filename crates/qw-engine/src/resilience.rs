//! The resilience envelope wrapped around volatile dependencies
//!
//! Policies compose outermost to innermost: Bulkhead → Rate Limiter →
//! Circuit Breaker → Retry → target call. The breaker records one outcome
//! per logical call, after retries are exhausted or succeed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Envelope outcome: either the target's error or a policy rejection
#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    #[error("Bulkhead rejected the call")]
    Overloaded,

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("{0}")]
    Inner(E),
}

// ============================================================================
// Bulkhead
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BulkheadConfig {
    pub max_concurrent: usize,
    /// How long a caller may wait in the queue before OVERLOADED
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

/// Caps concurrent calls with a bounded wait queue
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
    queue_timeout: Duration,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            queue_timeout: config.queue_timeout,
        }
    }

    async fn acquire<E>(&self) -> Result<OwnedSemaphorePermit, ResilienceError<E>> {
        match tokio::time::timeout(
            self.queue_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            _ => Err(ResilienceError::Overloaded),
        }
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Interval at which one token refills
    pub period: Duration,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(100),
            burst: 10,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: callers wait for a token rather than failing
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                let rate = 1.0 / self.config.period.as_secs_f64().max(1e-9);
                state.tokens = (state.tokens + elapsed.as_secs_f64() * rate)
                    .min(self.config.burst as f64);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failure fraction that opens the circuit
    pub failure_rate_threshold: f64,
    /// Calls required before the rate is meaningful
    pub minimum_calls: usize,
    /// Sliding window length
    pub window: usize,
    pub open_duration: Duration,
    /// Trial calls admitted while half-open
    pub half_open_permits: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 5,
            window: 10,
            open_duration: Duration::from_secs(30),
            half_open_permits: 3,
        }
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { window: VecDeque<bool> },
    Open { until: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

/// Sliding-window circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::Closed {
                window: VecDeque::new(),
            }),
        }
    }

    /// Admit or short-circuit a call.
    async fn try_admit(&self) -> bool {
        let mut state = self.state.lock().await;
        match &mut *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    *state = BreakerState::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.half_open_permits {
                    *in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    async fn record(&self, success: bool) {
        let mut state = self.state.lock().await;
        match &mut *state {
            BreakerState::Closed { window } => {
                window.push_back(success);
                while window.len() > self.config.window {
                    window.pop_front();
                }
                if window.len() >= self.config.minimum_calls {
                    let failures = window.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / window.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        warn!(failure_rate = rate, "circuit breaker opened");
                        *state = BreakerState::Open {
                            until: Instant::now() + self.config.open_duration,
                        };
                    }
                }
            }
            BreakerState::Open { .. } => {}
            BreakerState::HalfOpen {
                in_flight,
                successes,
            } => {
                *in_flight = in_flight.saturating_sub(1);
                if success {
                    *successes += 1;
                    if *successes >= self.config.half_open_permits {
                        debug!("circuit breaker closed after half-open trials");
                        *state = BreakerState::Closed {
                            window: VecDeque::new(),
                        };
                    }
                } else {
                    warn!("circuit breaker re-opened from half-open");
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.open_duration,
                    };
                }
            }
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Additional attempts after the first call
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: f64,
    /// Fractional jitter, e.g. 0.2 for ±20%
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter for a 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.factor.powi(attempt.saturating_sub(1) as i32);
        let spread = exp * self.jitter;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range(exp - spread..=exp + spread)
        } else {
            exp
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

// ============================================================================
// The composed envelope
// ============================================================================

/// Bulkhead, rate limiter, breaker, and retry stacked in order
pub struct ResilienceEnvelope {
    bulkhead: Bulkhead,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryConfig,
}

/// Per-dependency envelope settings
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeConfig {
    pub bulkhead: BulkheadConfig,
    pub rate_limiter: RateLimiterConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl ResilienceEnvelope {
    pub fn new(config: EnvelopeConfig) -> Self {
        Self {
            bulkhead: Bulkhead::new(config.bulkhead),
            limiter: RateLimiter::new(config.rate_limiter),
            breaker: CircuitBreaker::new(config.breaker),
            retry: config.retry,
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    /// Run `call` under the full policy stack. `is_retryable` decides which
    /// inner errors are worth another attempt; the final outcome (after
    /// retries) is what the breaker records.
    pub async fn call<T, E, F, Fut>(
        &self,
        is_retryable: impl Fn(&E) -> bool,
        call: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let _permit = self.bulkhead.acquire().await?;
        self.limiter.acquire().await;

        if !self.breaker.try_admit().await {
            return Err(ResilienceError::CircuitOpen);
        }

        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            match call().await {
                Ok(value) => break Ok(value),
                Err(err) if attempt <= self.retry.max_retries && is_retryable(&err) => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        self.breaker.record(outcome.is_ok()).await;
        outcome.map_err(ResilienceError::Inner)
    }
}
