//! Per-operation circuit breaker protecting upstream agent calls.
//!
//! Classic three-state machine (closed / open / half-open). The breaker
//! decides admission under a short lock, releases it, runs the downstream
//! future, then re-acquires to record the outcome; the lock is never held
//! across the call.

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` before tripping open.
    pub failure_threshold: u32,
    /// Consecutive probe successes in `half_open` before closing.
    pub success_threshold: u32,
    /// How long `open` fast-fails before admitting a probe.
    pub open_timeout: Duration,
    /// In-flight cap in `closed` and `half_open`.
    pub max_concurrent_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            max_concurrent_requests: 10,
        }
    }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub state_changed_at: DateTime<Utc>,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    state_changed_at: DateTime<Utc>,
    opened_at: Instant,
    in_flight: u32,
    probe_in_flight: bool,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.state_changed_at = Utc::now();
        self.opened_at = Instant::now();
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.probe_in_flight = false;
    }
}

/// What the admission check decided; carried across the unlocked section.
enum Admission {
    /// Normal closed-state call.
    Call,
    /// The single half-open probe.
    Probe,
}

pub struct CircuitBreaker {
    operation: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                state_changed_at: Utc::now(),
                opened_at: Instant::now(),
                in_flight: 0,
                probe_in_flight: false,
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            state_changed_at: inner.state_changed_at,
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
        }
    }

    /// Force the breaker back to closed and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed);
        inner.total_requests = 0;
        inner.total_successes = 0;
        inner.total_failures = 0;
        tracing::info!(operation = %self.operation, "circuit breaker reset");
    }

    /// Run `call` through the breaker.
    pub async fn execute<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let result = call().await;
        self.record(admission, result.is_ok());
        result
    }

    fn admit(&self) -> Result<Admission> {
        let mut inner = self.inner.lock();
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Open => {
                if inner.opened_at.elapsed() >= self.config.open_timeout {
                    inner.transition(CircuitState::HalfOpen);
                } else {
                    let next_retry = self.config.open_timeout - inner.opened_at.elapsed();
                    return Err(GatewayError::circuit_open(format!(
                        "circuit open for operation '{}'",
                        self.operation
                    ))
                    .with_operation(&self.operation)
                    .with_metadata("opened_at", inner.state_changed_at.to_rfc3339())
                    .with_metadata(
                        "next_retry",
                        (inner.state_changed_at
                            + chrono::Duration::from_std(self.config.open_timeout)
                                .unwrap_or(chrono::Duration::zero()))
                        .to_rfc3339(),
                    )
                    .with_metadata("retry_after", next_retry.as_secs().max(1).to_string()));
                }
            }
            CircuitState::Closed | CircuitState::HalfOpen => {}
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.probe_in_flight {
                return Err(GatewayError::circuit_half_open(format!(
                    "circuit half-open for operation '{}', probe already in flight",
                    self.operation
                ))
                .with_operation(&self.operation)
                .with_metadata("retry_after", "1".to_string()));
            }
            inner.probe_in_flight = true;
            inner.in_flight += 1;
            return Ok(Admission::Probe);
        }

        if inner.in_flight >= self.config.max_concurrent_requests {
            return Err(GatewayError::too_many_requests(format!(
                "operation '{}' at concurrency limit ({})",
                self.operation, self.config.max_concurrent_requests
            ))
            .with_operation(&self.operation));
        }
        inner.in_flight += 1;
        Ok(Admission::Call)
    }

    fn record(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if matches!(admission, Admission::Probe) {
            inner.probe_in_flight = false;
        }

        if success {
            inner.total_successes += 1;
        } else {
            inner.total_failures += 1;
        }

        match inner.state {
            CircuitState::Closed => {
                if success {
                    inner.consecutive_failures = 0;
                } else {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        tracing::warn!(
                            operation = %self.operation,
                            failures = inner.consecutive_failures,
                            "circuit breaker tripped open"
                        );
                        inner.transition(CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        tracing::info!(operation = %self.operation, "circuit breaker closed");
                        inner.transition(CircuitState::Closed);
                    }
                } else {
                    tracing::warn!(operation = %self.operation, "half-open probe failed, reopening");
                    inner.transition(CircuitState::Open);
                }
            }
            // A call admitted before the trip finishes after it; the outcome
            // no longer affects the open state.
            CircuitState::Open => {}
        }
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Process-wide set of breakers keyed by operation name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, operation: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(operation, self.config.clone()))
            })
            .clone()
    }

    pub fn all_stats(&self) -> Vec<(String, BreakerStats)> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
            max_concurrent_requests: 10,
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicU32) -> Result<(), GatewayError> {
        breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GatewayError::server("backend down"))
            })
            .await
            .map(|_| ())
    }

    #[tokio::test]
    async fn trips_open_on_fifth_failure_without_touching_backend() {
        let breaker = CircuitBreaker::new("execute", fast_config());
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let err = fail(&breaker, &calls).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::Server);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // Sixth call fast-fails without calling downstream.
        let err = fail(&breaker, &calls).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert!(err.metadata().contains_key("next_retry"));
        assert!(err.metadata().contains_key("retry_after"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("execute", fast_config());
        let calls = AtomicU32::new(0);
        for _ in 0..4 {
            let _ = fail(&breaker, &calls).await;
        }
        breaker
            .execute(|| async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap();
        // Four more failures still should not trip (counter was reset).
        for _ in 0..4 {
            let _ = fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_recovers_after_success_threshold() {
        let breaker = CircuitBreaker::new("execute", fast_config());
        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        // Two successful probes close the circuit.
        for _ in 0..2 {
            breaker
                .execute(|| async { Ok::<_, GatewayError>(()) })
                .await
                .unwrap();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("execute", fast_config());
        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_admits_single_probe() {
        let breaker = Arc::new(CircuitBreaker::new("execute", fast_config()));
        let calls = AtomicU32::new(0);
        for _ in 0..5 {
            let _ = fail(&breaker, &calls).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let (probe_entered_tx, probe_entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        let _ = probe_entered_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, GatewayError>(())
                    })
                    .await
            })
        };
        probe_entered_rx.await.unwrap();

        // Second concurrent probe is rejected while the first is in flight.
        let err = breaker
            .execute(|| async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::CircuitHalfOpen);

        let _ = release_tx.send(());
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrency_cap_rejects_excess_calls() {
        let config = BreakerConfig {
            max_concurrent_requests: 1,
            ..fast_config()
        };
        let breaker = Arc::new(CircuitBreaker::new("execute", config));

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, GatewayError>(())
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();

        let err = breaker
            .execute(|| async { Ok::<_, GatewayError>(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TooManyRequests);

        let _ = release_tx.send(());
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn registry_reuses_breakers_per_operation() {
        let registry = BreakerRegistry::new(fast_config());
        let a = registry.get("gemini");
        let b = registry.get("gemini");
        let c = registry.get("claude");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.all_stats().len(), 2);
    }
}
