//! Encrypted OAuth token cache.
//!
//! One [`OAuthToken`] per `(user_id, provider)`, encrypted with the
//! [`TokenCipher`](super::crypto::TokenCipher) before it reaches the KV
//! backend. Reads hand out defensive copies; writes are atomic per key with
//! last-writer-wins semantics under concurrent refresh.

use super::crypto::TokenCipher;
use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::store::kv::KvStore;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

const CACHE_NAME: &str = "oauth_tokens";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub total: usize,
    pub expired: usize,
    pub expiring_soon: usize,
    pub providers: Vec<String>,
}

pub struct TokenCache {
    kv: Arc<dyn KvStore>,
    cipher: Arc<TokenCipher>,
    refresh_threshold: Duration,
    metrics: Arc<Metrics>,
}

impl TokenCache {
    pub fn new(kv: Arc<dyn KvStore>, cipher: Arc<TokenCipher>, metrics: Arc<Metrics>) -> Self {
        Self {
            kv,
            cipher,
            refresh_threshold: Duration::minutes(5),
            metrics,
        }
    }

    pub fn with_refresh_threshold(mut self, threshold: Duration) -> Self {
        self.refresh_threshold = threshold;
        self
    }

    fn key(user_id: &str, provider: &str) -> String {
        format!("oauth:{user_id}:{provider}")
    }

    fn observe_op(&self, op: &str, started: Instant) {
        self.metrics
            .cache_operation_duration_seconds
            .with_label_values(&[CACHE_NAME, op])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Reject tokens that are unusable: empty access token or already
    /// expired.
    pub fn validate_token(&self, token: &OAuthToken) -> Result<()> {
        if token.access_token.is_empty() {
            return Err(GatewayError::auth_invalid("token has empty access_token")
                .with_operation("validate_token"));
        }
        if token.expires_at <= token.issued_at {
            return Err(
                GatewayError::auth_invalid("token expires_at precedes issued_at")
                    .with_operation("validate_token"),
            );
        }
        if token.expires_at <= Utc::now() {
            return Err(GatewayError::auth_expired("token already expired")
                .with_operation("validate_token")
                .with_resource(&token.provider));
        }
        Ok(())
    }

    /// True when the token is within the refresh threshold of expiry
    /// (boundary inclusive).
    pub fn is_expiring_soon(&self, token: &OAuthToken) -> bool {
        token.expires_at - Utc::now() <= self.refresh_threshold
    }

    /// Store a token. Effective TTL is the smaller of the explicit TTL and
    /// the token's own remaining lifetime.
    pub async fn cache_token(
        &self,
        token: &OAuthToken,
        explicit_ttl: Option<std::time::Duration>,
    ) -> Result<()> {
        let started = Instant::now();
        self.validate_token(token)?;

        let remaining = (token.expires_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let ttl = match explicit_ttl {
            Some(explicit) => explicit.min(remaining),
            None => remaining,
        };

        let plaintext = serde_json::to_vec(token)
            .map_err(|e| GatewayError::server_internal(e.to_string()))?;
        let payload = self.cipher.encrypt(&plaintext)?;
        let key = Self::key(&token.user_id, &token.provider);
        let overwrite = self.kv.get(&key).await?.is_some();
        self.kv.set(&key, &payload, Some(ttl)).await?;
        if !overwrite {
            self.metrics
                .cache_size_items
                .with_label_values(&[CACHE_NAME])
                .inc();
        }
        tracing::debug!(
            user_id = %token.user_id,
            provider = %token.provider,
            expires_at = %token.expires_at,
            "cached oauth token"
        );
        self.observe_op("set", started);
        Ok(())
    }

    pub async fn get_token(&self, user_id: &str, provider: &str) -> Result<OAuthToken> {
        let started = Instant::now();
        let payload = self.kv.get(&Self::key(user_id, provider)).await?;
        let Some(payload) = payload else {
            self.metrics
                .cache_misses_total
                .with_label_values(&[CACHE_NAME])
                .inc();
            self.observe_op("get", started);
            return Err(GatewayError::resource_not_found(format!(
                "no token cached for provider '{provider}'"
            ))
            .with_operation("get_token")
            .with_resource(provider)
            .with_metadata("kind", "token_not_found"));
        };
        self.metrics
            .cache_hits_total
            .with_label_values(&[CACHE_NAME])
            .inc();
        let plaintext = self.cipher.decrypt(&payload)?;
        self.observe_op("get", started);
        serde_json::from_slice(&plaintext)
            .map_err(|e| GatewayError::server_internal(format!("corrupt token payload: {e}")))
    }

    /// Replace the cached token for `(user, provider)`. The write is a
    /// single atomic set, so concurrent refreshes converge on the last
    /// writer; losers observe the winner on their next `get_token`.
    pub async fn refresh_token(&self, token: &OAuthToken) -> Result<()> {
        // Refresh only makes sense once the old value is expired or about to
        // be; a fresh incoming token is validated like any other write.
        match self.get_token(&token.user_id, &token.provider).await {
            Ok(existing)
                if !self.is_expiring_soon(&existing) && existing.expires_at > Utc::now() =>
            {
                return Err(GatewayError::invalid_arguments(
                    "existing token is not yet eligible for refresh",
                )
                .with_operation("refresh_token")
                .with_resource(&token.provider));
            }
            _ => {}
        }
        self.cache_token(token, None).await
    }

    /// Delete the cached token. Subsequent `get_token` calls return
    /// `resource_not_found`.
    pub async fn revoke_token(&self, user_id: &str, provider: &str) -> Result<bool> {
        let started = Instant::now();
        let existed = self.kv.delete(&Self::key(user_id, provider)).await?;
        if existed {
            self.metrics
                .cache_size_items
                .with_label_values(&[CACHE_NAME])
                .dec();
            tracing::info!(user_id, provider, "revoked oauth token");
        }
        self.observe_op("delete", started);
        Ok(existed)
    }

    pub async fn get_all_tokens(&self, user_id: &str) -> Result<Vec<OAuthToken>> {
        let prefix = format!("oauth:{user_id}:");
        let keys = self.kv.keys_with_prefix(&prefix).await?;
        let mut tokens = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(payload) = self.kv.get(&key).await? {
                let plaintext = self.cipher.decrypt(&payload)?;
                if let Ok(token) = serde_json::from_slice::<OAuthToken>(&plaintext) {
                    tokens.push(token);
                }
            }
        }
        tokens.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(tokens)
    }

    pub async fn get_stats(&self, user_id: &str) -> Result<TokenStats> {
        let tokens = self.get_all_tokens(user_id).await?;
        let now = Utc::now();
        Ok(TokenStats {
            total: tokens.len(),
            expired: tokens.iter().filter(|t| t.expires_at <= now).count(),
            expiring_soon: tokens.iter().filter(|t| self.is_expiring_soon(t)).count(),
            providers: tokens.iter().map(|t| t.provider.clone()).collect(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
