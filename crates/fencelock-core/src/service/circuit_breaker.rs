// Circuit breaker guarding calls to one peer region
// An unreachable region is skipped (counted as a missing vote) instead of stalling every round

use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use fencelock_common::current_timestamp_ms;
use tracing::{info, warn};

use crate::model::RegionClientConfig;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without touching the network
    Open,
    /// Probing calls are let through to test recovery
    HalfOpen,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Wait before moving from Open to HalfOpen
    pub reset_timeout: Duration,
    /// Successes in HalfOpen before closing
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&RegionClientConfig::default())
    }
}

impl From<&RegionClientConfig> for CircuitBreakerConfig {
    fn from(config: &RegionClientConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            success_threshold: config.success_threshold.max(1),
        }
    }
}

/// Lock-free breaker for one peer region
pub struct CircuitBreaker {
    region: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// Unix millis when the breaker last opened (0 = never)
    opened_at_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(region: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            region: region.into(),
            config,
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(0),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Whether a call may be attempted now
    pub fn allow_request(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
                let elapsed = current_timestamp_ms().saturating_sub(opened_at);
                if elapsed >= self.config.reset_timeout.as_millis() as i64 {
                    self.transition_to_half_open();
                    return true;
                }
                false
            }
        }
    }

    pub fn record_success(&self) {
        match self.state() {
            CircuitState::Closed => self.failure_count.store(0, Ordering::SeqCst),
            CircuitState::HalfOpen => {
                let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state() {
            CircuitState::Closed => {
                let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    self.transition_to_open();
                }
            }
            // A failed trial call reopens immediately
            CircuitState::HalfOpen => self.transition_to_open(),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.transition_to_closed();
    }

    fn transition_to_open(&self) {
        self.state.store(STATE_OPEN, Ordering::SeqCst);
        self.opened_at_ms
            .store(current_timestamp_ms(), Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        warn!(region = %self.region, "Region circuit breaker opened");
    }

    fn transition_to_half_open(&self) {
        self.state.store(STATE_HALF_OPEN, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        info!(region = %self.region, "Region circuit breaker half-open");
    }

    fn transition_to_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.opened_at_ms.store(0, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        info!(region = %self.region, "Region circuit breaker closed");
    }
}

/// Error of a call made through [`with_circuit_breaker`]
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("operation failed: {0}")]
    OperationFailed(E),
}

/// Run `operation` unless the breaker is open, recording its outcome
pub async fn with_circuit_breaker<F, T, E>(
    circuit_breaker: &CircuitBreaker,
    operation: F,
) -> Result<T, CircuitBreakerError<E>>
where
    F: std::future::Future<Output = Result<T, E>>,
{
    if !circuit_breaker.allow_request() {
        return Err(CircuitBreakerError::CircuitOpen);
    }

    match operation.await {
        Ok(result) => {
            circuit_breaker.record_success();
            Ok(result)
        }
        Err(e) => {
            circuit_breaker.record_failure();
            Err(CircuitBreakerError::OperationFailed(e))
        }
    }
}
