//! Bearer token verification against a JWKS document.
//!
//! The identity provider is external; we only fetch its JWKS by URL, cache
//! the decoding keys by `kid`, and verify RS256 signatures locally. A
//! background task refreshes the cache periodically; an unknown `kid` also
//! triggers one on-demand refresh before the token is rejected.

use crate::auth::{AuthenticatedUser, RoleSet, TokenVerifier};
use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const JWKS_CACHE: &str = "jwks_keys";

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    #[serde(default)]
    kty: String,
    #[serde(default)]
    kid: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

/// Claims we read from a verified token. Everything beyond `sub` is
/// optional; role strings map onto [`RoleSet`].
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[allow(dead_code)]
    pub exp: u64,
}

impl Claims {
    pub fn into_user(self) -> AuthenticatedUser {
        let roles = RoleSet {
            org_admin: self.roles.iter().any(|r| r == "org_admin"),
            platform_admin: self.roles.iter().any(|r| r == "platform_admin"),
        };
        AuthenticatedUser {
            id: self.sub,
            org_id: self.org_id,
            email: self.email,
            roles,
        }
    }
}

pub struct JwksValidator {
    jwks_url: String,
    issuer: Option<String>,
    audience: Option<String>,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, DecodingKey>>,
    metrics: Arc<Metrics>,
}

impl JwksValidator {
    pub fn new(
        jwks_url: String,
        issuer: Option<String>,
        audience: Option<String>,
        http: reqwest::Client,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            jwks_url,
            issuer,
            audience,
            http,
            keys: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Fetch the JWKS document and replace the key cache.
    pub async fn refresh_keys(&self) -> Result<usize> {
        let started = std::time::Instant::now();
        let doc: JwksDocument = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| {
                GatewayError::connection(format!("jwks fetch failed: {e}"))
                    .with_operation("jwks_refresh")
                    .with_resource(&self.jwks_url)
            })?
            .error_for_status()
            .map_err(|e| {
                GatewayError::server_unavailable(format!("jwks endpoint error: {e}"))
                    .with_operation("jwks_refresh")
            })?
            .json()
            .await
            .map_err(|e| {
                GatewayError::server_unavailable(format!("jwks parse failed: {e}"))
                    .with_operation("jwks_refresh")
            })?;

        let mut fresh = HashMap::new();
        for jwk in doc.keys {
            if jwk.kty != "RSA" || jwk.kid.is_empty() {
                continue;
            }
            match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
                Ok(key) => {
                    fresh.insert(jwk.kid, key);
                }
                Err(e) => {
                    tracing::warn!(kid = %jwk.kid, error = %e, "skipping unusable jwk");
                }
            }
        }
        let count = fresh.len();
        *self.keys.write() = fresh;
        self.metrics
            .cache_size_items
            .with_label_values(&[JWKS_CACHE])
            .set(count as i64);
        self.metrics
            .cache_operation_duration_seconds
            .with_label_values(&[JWKS_CACHE, "refresh"])
            .observe(started.elapsed().as_secs_f64());
        tracing::debug!(count, "jwks key cache refreshed");
        Ok(count)
    }

    fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.read().get(kid).cloned()
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        match &self.issuer {
            Some(iss) => validation.set_issuer(&[iss]),
            None => {}
        }
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

#[async_trait]
impl TokenVerifier for JwksValidator {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser> {
        let header = decode_header(token).map_err(|e| {
            GatewayError::auth_invalid(format!("malformed token: {e}"))
                .with_operation("validate_token")
        })?;
        let kid = header.kid.ok_or_else(|| {
            GatewayError::auth_invalid("token header missing kid")
                .with_operation("validate_token")
        })?;

        let key = match self.key_for(&kid) {
            Some(key) => {
                self.metrics
                    .cache_hits_total
                    .with_label_values(&[JWKS_CACHE])
                    .inc();
                key
            }
            None => {
                // Key rotation: refresh once before giving up.
                self.metrics
                    .cache_misses_total
                    .with_label_values(&[JWKS_CACHE])
                    .inc();
                self.refresh_keys().await?;
                self.key_for(&kid).ok_or_else(|| {
                    GatewayError::auth_invalid("token signed with unknown key")
                        .with_operation("validate_token")
                        .with_metadata("kid", kid.clone())
                })?
            }
        };

        let data = decode::<Claims>(token, &key, &self.validation()).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => {
                    GatewayError::auth_expired("token expired").with_operation("validate_token")
                }
                _ => GatewayError::auth_invalid(format!("token rejected: {e}"))
                    .with_operation("validate_token"),
            }
        })?;

        Ok(data.claims.into_user())
    }
}

/// Periodic JWKS refresh. Returns the task handle for shutdown.
pub fn spawn_refresh_task(
    validator: Arc<JwksValidator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = validator.refresh_keys().await {
                tracing::warn!(error = %e, "periodic jwks refresh failed");
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
