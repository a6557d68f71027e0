//! Token-bucket rate limiting per `(subject, endpoint)`.
//!
//! Bucket state lives in the shared [`KvStore`] so multiple gateway
//! processes converge on one budget; writes go through a compare-and-set
//! loop. When the backend is unreachable the limiter fails open (a broken
//! store must never manufacture 429s) and records the event in metrics.

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::store::kv::KvStore;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Window used for reset-time reporting.
const WINDOW_SECS: i64 = 60;
/// CAS attempts before giving up and admitting (treat contention like an
/// unavailable backend rather than penalizing the caller).
const MAX_CAS_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub rate_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 100,
            burst: 20,
        }
    }
}

/// Outcome of an admission check. `reset_at` is the next full window
/// boundary and must be surfaced as `Retry-After` when rejecting.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_ms: i64,
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimitConfig,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: RateLimitConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            kv,
            config,
            metrics,
        }
    }

    /// Admit or reject one request. Subject identity falls back
    /// `user_id` → `org_id` → `remote_ip`.
    ///
    /// Returns the decision on admit; on reject returns a `rate_limit`
    /// error carrying `retry_after` and `reset_at` metadata.
    pub async fn allow_request(
        &self,
        user_id: Option<&str>,
        org_id: Option<&str>,
        remote_ip: &str,
        endpoint: &str,
    ) -> Result<RateDecision> {
        let subject = user_id
            .filter(|s| !s.is_empty())
            .or(org_id.filter(|s| !s.is_empty()))
            .unwrap_or(remote_ip);
        let key = format!("ratelimit:{subject}:{endpoint}");

        match self.try_take(&key).await {
            Ok(decision) => {
                if decision.allowed {
                    return Ok(decision);
                }
                let retry_after =
                    (decision.reset_at - Utc::now()).num_seconds().clamp(1, WINDOW_SECS);
                Err(GatewayError::rate_limit(format!(
                    "rate limit exceeded for endpoint '{endpoint}'"
                ))
                .with_operation("allow_request")
                .with_resource(endpoint)
                .with_metadata("retry_after", retry_after.to_string())
                .with_metadata("reset_at", decision.reset_at.to_rfc3339())
                .with_metadata("limit", self.config.rate_per_minute.to_string()))
            }
            Err(err) => {
                // Fail open: a broken KV backend must not reject traffic.
                self.metrics.rate_limiter_errors_total.inc();
                tracing::warn!(
                    error = %err,
                    backend = self.kv.name(),
                    "rate limiter backend unavailable, admitting request"
                );
                Ok(RateDecision {
                    allowed: true,
                    remaining: self.config.burst,
                    reset_at: next_window_boundary(Utc::now()),
                })
            }
        }
    }

    async fn try_take(&self, key: &str) -> Result<RateDecision> {
        let rate_per_sec = f64::from(self.config.rate_per_minute) / 60.0;
        let burst = f64::from(self.config.burst);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = self.kv.get(key).await?;
            let state = current
                .as_deref()
                .and_then(|raw| serde_json::from_slice::<BucketState>(raw).ok());

            let tokens_now = match &state {
                Some(s) => {
                    let elapsed = ((now.timestamp_millis() - s.last_ms).max(0)) as f64 / 1000.0;
                    (s.tokens + elapsed * rate_per_sec).min(burst)
                }
                None => burst,
            };

            let reset_at = next_window_boundary(now);
            if tokens_now < 1.0 {
                return Ok(RateDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at,
                });
            }

            let next = BucketState {
                tokens: tokens_now - 1.0,
                last_ms: now.timestamp_millis(),
            };
            let encoded = serde_json::to_vec(&next)
                .map_err(|e| GatewayError::server_internal(e.to_string()))?;
            let written = self
                .kv
                .compare_and_set(
                    key,
                    current.as_deref(),
                    &encoded,
                    Some(Duration::from_secs((WINDOW_SECS * 2) as u64)),
                )
                .await?;
            if written {
                return Ok(RateDecision {
                    allowed: true,
                    remaining: next.tokens.floor() as u32,
                    reset_at,
                });
            }
            // Lost the CAS race; re-read and try again.
        }

        Err(GatewayError::resource_locked(
            "rate bucket contention exceeded CAS retry budget",
        ))
    }
}

fn next_window_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    let boundary = ((secs / WINDOW_SECS) + 1) * WINDOW_SECS;
    Utc.timestamp_opt(boundary, 0).single().unwrap_or(now)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
