//! Circuit breaker for the market-data API.
//!
//! HTTP 403 trips the breaker at once; repeated failures (429, 5xx, timeouts)
//! trip it once they reach the threshold. While open, every call fails fast
//! with [`ApiError::CircuitBreakerTripped`] until the cool-off has elapsed.

use super::provider::ApiError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { tripped_at: Instant },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    cool_off: Duration,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(cool_off: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
            }),
            cool_off,
            failure_threshold: 3,
        }
    }

    pub fn with_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    /// 10-minute cool-off, trips after 3 consecutive failures.
    pub fn for_market_data() -> Self {
        Self::new(Duration::from_secs(10 * 60))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call may go out now. An expired cool-off closes the breaker.
    pub fn is_allowed(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open { tripped_at } if tripped_at.elapsed() >= self.cool_off => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                true
            }
            BreakerState::Open { .. } => false,
        }
    }

    /// `Err(CircuitBreakerTripped)` while open.
    pub fn guard(&self) -> Result<(), ApiError> {
        if self.is_allowed() {
            Ok(())
        } else {
            Err(ApiError::CircuitBreakerTripped)
        }
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.failure_threshold {
            warn!(
                failures = inner.consecutive_failures,
                "market-data API failing repeatedly; opening circuit breaker"
            );
            inner.state = BreakerState::Open {
                tripped_at: Instant::now(),
            };
        }
    }

    /// Open immediately (HTTP 403).
    pub fn trip(&self) {
        warn!("market-data API refused access; opening circuit breaker");
        self.lock().state = BreakerState::Open {
            tripped_at: Instant::now(),
        };
    }

    pub fn remaining_cool_off(&self) -> Duration {
        match self.lock().state {
            BreakerState::Closed => Duration::ZERO,
            BreakerState::Open { tripped_at } => self.cool_off.saturating_sub(tripped_at.elapsed()),
        }
    }
}
