//! Authentication and tiered authorization.
//!
//! The middleware resolves each route to an [`AccessLevel`] (exact match
//! first, then longest prefix, defaulting to `Authenticated`), extracts and
//! verifies the bearer token, enforces the level, and attaches the
//! [`AuthenticatedUser`] plus a request id to the request extensions.

pub mod validator;

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use std::collections::HashMap;
use std::sync::Arc;

pub use validator::JwksValidator;

// ─── Identity ────────────────────────────────────────────────────────────────

/// Role membership carried by a verified token. Absence of both flags means
/// an ordinary authenticated user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleSet {
    pub org_admin: bool,
    pub platform_admin: bool,
}

/// Built per-request from verified claims; attached to the request context,
/// never persisted.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub org_id: Option<String>,
    pub email: Option<String>,
    pub roles: RoleSet,
}

/// Correlation id attached to every request by the auth middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for RequestId {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(|| RequestId(uuid::Uuid::new_v4().to_string())))
    }
}

/// Client address as seen by the listener, when known.
#[derive(Debug, Clone)]
pub struct ClientIp(pub Option<String>);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        Ok(ClientIp(
            parts
                .extensions
                .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
                .map(|c| c.0.ip().to_string()),
        ))
    }
}

/// Seam between the middleware and the concrete JWKS validator, so tests can
/// substitute a deterministic verifier.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser>;
}

// ─── Bearer extraction ───────────────────────────────────────────────────────

/// Extract the token from an `Authorization` header. Only the exact shape
/// `Bearer <non-empty>` is accepted.
pub fn extract_bearer(header: Option<&str>) -> Result<&str> {
    let header = header.ok_or_else(|| {
        GatewayError::invalid_request("missing Authorization header")
            .with_operation("extract_bearer")
    })?;
    let token = header.strip_prefix("Bearer ").ok_or_else(|| {
        GatewayError::invalid_request("Authorization header must be 'Bearer <token>'")
            .with_operation("extract_bearer")
    })?;
    if token.is_empty() || token.chars().any(char::is_whitespace) {
        return Err(
            GatewayError::invalid_request("Authorization header must be 'Bearer <token>'")
                .with_operation("extract_bearer"),
        );
    }
    Ok(token)
}

// ─── Access levels ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Public,
    Authenticated,
    OrgAdmin,
    PlatformAdmin,
    /// Legacy admin routes: gates exactly like `OrgAdmin`.
    AdminCompat,
}

impl AccessLevel {
    fn permits(self, roles: RoleSet) -> bool {
        match self {
            Self::Public | Self::Authenticated => true,
            Self::OrgAdmin | Self::AdminCompat => roles.org_admin || roles.platform_admin,
            Self::PlatformAdmin => roles.platform_admin,
        }
    }
}

/// Route → access level resolution: exact match, then longest configured
/// prefix, then `Authenticated`.
pub struct RouteAccessTable {
    exact: HashMap<String, AccessLevel>,
    /// Sorted by prefix length, longest first.
    prefixes: Vec<(String, AccessLevel)>,
}

impl RouteAccessTable {
    pub fn new(
        exact: impl IntoIterator<Item = (String, AccessLevel)>,
        prefixes: impl IntoIterator<Item = (String, AccessLevel)>,
    ) -> Self {
        let mut prefixes: Vec<_> = prefixes.into_iter().collect();
        prefixes.sort_by_key(|(prefix, _)| std::cmp::Reverse(prefix.len()));
        Self {
            exact: exact.into_iter().collect(),
            prefixes,
        }
    }

    /// The gateway's standard table.
    pub fn standard() -> Self {
        let exact = [
            ("/health".to_string(), AccessLevel::Public),
            ("/ready".to_string(), AccessLevel::Public),
            ("/live".to_string(), AccessLevel::Public),
            ("/version".to_string(), AccessLevel::Public),
            // Scrapers do not carry bearer tokens.
            ("/metrics".to_string(), AccessLevel::Public),
            ("/metrics/json".to_string(), AccessLevel::Public),
            // The provider redirect arrives without our bearer; the CSRF
            // state is its credential.
            ("/api/v1/oauth/callback".to_string(), AccessLevel::Public),
        ];
        let prefixes = [
            ("/api/v1/platform/".to_string(), AccessLevel::PlatformAdmin),
            ("/api/v1/admin/".to_string(), AccessLevel::AdminCompat),
            ("/api/v1/mcp".to_string(), AccessLevel::Authenticated),
            ("/v1/".to_string(), AccessLevel::Authenticated),
        ];
        Self::new(exact, prefixes)
    }

    pub fn required_level(&self, route_path: &str) -> AccessLevel {
        if let Some(&level) = self.exact.get(route_path) {
            return level;
        }
        for (prefix, level) in &self.prefixes {
            if route_path.starts_with(prefix) {
                return *level;
            }
        }
        AccessLevel::Authenticated
    }
}

// ─── Middleware ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AuthLayerState {
    /// `None` when no JWKS URL is configured: every request is anonymous and
    /// only `Public` routes are reachable.
    pub verifier: Option<Arc<dyn TokenVerifier>>,
    pub table: Arc<RouteAccessTable>,
}

fn unauthorized(request_id: &str, err: &GatewayError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(err.to_envelope(request_id)),
    )
        .into_response()
}

fn forbidden(request_id: &str) -> Response {
    let err = GatewayError::authentication("insufficient privileges for this route")
        .with_operation("authorize");
    let mut body = err.to_envelope(request_id);
    body["error"]["code"] = serde_json::Value::String("forbidden".to_string());
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

/// Tiered authentication middleware applied to the whole router.
pub async fn tiered_auth_middleware(
    State(auth): State<AuthLayerState>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    let level = auth.table.required_level(&path);

    if level == AccessLevel::Public {
        return next.run(req).await;
    }

    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let token = match extract_bearer(header.as_deref()) {
        Ok(token) => token.to_string(),
        Err(err) => {
            tracing::debug!(%path, %method, "request rejected: no usable bearer");
            return unauthorized(&request_id, &err);
        }
    };

    let Some(verifier) = &auth.verifier else {
        let err = GatewayError::authentication("bearer verification is not configured")
            .with_operation("validate_token");
        return unauthorized(&request_id, &err);
    };

    let user = match verifier.verify(&token).await {
        Ok(user) => user,
        Err(err) => {
            tracing::debug!(
                %path,
                %method,
                error_code = err.code().as_str(),
                "bearer verification failed"
            );
            return unauthorized(&request_id, &err);
        }
    };

    if !level.permits(user.roles) {
        tracing::debug!(user_id = %user.id, %path, %method, "access level not met");
        return forbidden(&request_id);
    }

    tracing::debug!(
        user_id = %user.id,
        org_id = user.org_id.as_deref().unwrap_or(""),
        %path,
        %method,
        "request authenticated"
    );

    req.extensions_mut().insert(user);
    next.run(req).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
