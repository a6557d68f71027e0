//! HTTP gateway: state, router assembly, health surface.
//!
//! `AppState` is the process-wide state built once at startup (explicit
//! init, no global lookups); every component hangs off it behind an `Arc`.
//! The router applies, outermost first: panic recovery, HTTP metrics, tiered
//! auth, body limits, then the handlers.

pub mod admin;
pub mod mcp;
pub mod openai;

use crate::auth::{AuthLayerState, RouteAccessTable, TokenVerifier};
use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::config::Config;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::oauth::{OAuthStateStore, SessionStore, TokenCache, TokenCipher};
use crate::orchestrator::{Orchestrator, PhaseTimeouts};
use crate::prompt::PromptComposer;
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::store::kv::KvStore;
use crate::store::Database;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;

// ─── Shared state ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub db: Arc<Database>,
    pub kv: Arc<dyn KvStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub token_cache: Arc<TokenCache>,
    pub cipher: Arc<TokenCipher>,
    pub oauth_states: Arc<OAuthStateStore>,
    pub sessions: Arc<SessionStore>,
    pub composer: Arc<PromptComposer>,
    pub orchestrator: Arc<Orchestrator>,
    pub breakers: Arc<BreakerRegistry>,
    pub http: reqwest::Client,
}

impl AppState {
    /// Assemble the full state from its leaves. The token cipher uses the
    /// configured key, or a random per-process key when none is set (cached
    /// tokens then simply do not survive a restart).
    pub fn new(
        config: Config,
        metrics: Arc<Metrics>,
        db: Arc<Database>,
        kv: Arc<dyn KvStore>,
        primary: Arc<dyn crate::agent::Agent>,
        fallback: Option<Arc<dyn crate::agent::Agent>>,
    ) -> Result<Self, GatewayError> {
        let cipher = if config.oauth.encryption_key_hex.is_empty() {
            tracing::warn!("no oauth encryption key configured, using a per-process random key");
            let key: [u8; 32] = rand::random();
            Arc::new(TokenCipher::new(&key)?)
        } else {
            Arc::new(TokenCipher::from_hex(&config.oauth.encryption_key_hex)?)
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.server.connect_timeout_secs))
            .timeout(Duration::from_secs(config.server.request_timeout_secs))
            .build()
            .map_err(|e| GatewayError::invalid_config(format!("http client: {e}")))?;

        let rate_limiter = Arc::new(RateLimiter::new(
            kv.clone(),
            RateLimitConfig {
                rate_per_minute: config.limits.rate_per_minute,
                burst: config.limits.burst,
            },
            metrics.clone(),
        ));

        let token_cache = Arc::new(
            TokenCache::new(kv.clone(), cipher.clone(), metrics.clone())
                .with_refresh_threshold(chrono::Duration::seconds(
                    config.oauth.refresh_threshold_secs as i64,
                )),
        );

        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            success_threshold: config.breaker.success_threshold,
            open_timeout: Duration::from_secs(config.breaker.open_timeout_secs),
            max_concurrent_requests: config.breaker.max_concurrent_requests,
        }));

        let orchestrator = Arc::new(Orchestrator::new(
            primary,
            fallback,
            config.agents.fallback_enabled,
            config.agents.primary_model_prefixes.clone(),
            config.agents.fallback_model_prefixes.clone(),
            breakers.clone(),
            metrics.clone(),
            PhaseTimeouts {
                request: Duration::from_secs(config.server.request_timeout_secs),
                stream_idle: Duration::from_secs(config.server.stream_idle_timeout_secs),
            },
        ));

        let composer = Arc::new(PromptComposer::new(config.prompts.clone(), metrics.clone()));
        let oauth_states = Arc::new(OAuthStateStore::new(db.clone()));

        Ok(Self {
            config: Arc::new(config),
            metrics,
            db,
            kv,
            rate_limiter,
            token_cache,
            cipher,
            oauth_states,
            sessions: Arc::new(SessionStore::new()),
            composer,
            orchestrator,
            breakers,
            http,
        })
    }
}

// ─── Error responses ─────────────────────────────────────────────────────────

/// Serialize any taxonomy error onto the wire: matching status, JSON
/// envelope, `Retry-After` when the error carries one, and a structured log
/// event.
pub fn error_response(err: &GatewayError, request_id: &str) -> Response {
    tracing::warn!(request_id, fields = ?err.log_fields(), "request failed");
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(err.to_envelope(request_id))).into_response();
    if let Some(retry_after) = err.metadata().get("retry_after") {
        if let Ok(value) = header::HeaderValue::from_str(retry_after) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn build_router(state: AppState, verifier: Option<Arc<dyn TokenVerifier>>) -> Router {
    let auth_state = AuthLayerState {
        verifier,
        table: Arc::new(RouteAccessTable::standard()),
    };
    let max_body = state.config.server.max_body_bytes;
    let metrics = state.metrics.clone();

    Router::new()
        // OpenAI surface
        .route("/v1/chat/completions", post(openai::handle_chat_completions))
        .route("/v1/models", get(openai::handle_models))
        // Platform admin
        .route(
            "/api/v1/platform/admins",
            post(admin::handle_add_admin).get(admin::handle_list_admins),
        )
        .route(
            "/api/v1/platform/admins/{email}",
            delete(admin::handle_remove_admin),
        )
        .route("/api/v1/platform/stats", get(admin::handle_stats))
        .route("/api/v1/platform/audit", get(admin::handle_audit))
        // MCP server management
        .route("/api/v1/mcp", get(mcp::handle_list).post(mcp::handle_create))
        .route(
            "/api/v1/mcp/{id}",
            patch(mcp::handle_update).delete(mcp::handle_delete),
        )
        // OAuth
        .route(
            "/api/v1/oauth/callback",
            get(crate::oauth::handlers::handle_callback),
        )
        .route(
            "/api/v1/oauth/tokens",
            get(crate::oauth::handlers::handle_token_status),
        )
        .route(
            "/api/v1/oauth/{provider}/initiate",
            get(crate::oauth::handlers::handle_initiate),
        )
        .route(
            "/api/v1/oauth/{provider}",
            delete(crate::oauth::handlers::handle_revoke),
        )
        // Health + observability
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/live", get(handle_live))
        .route("/version", get(handle_version))
        .route("/metrics", get(handle_metrics))
        .route("/metrics/json", get(handle_metrics_json))
        // Innermost → outermost: body cap, auth, metrics, panic recovery.
        .layer(RequestBodyLimitLayer::new(max_body))
        .layer(middleware::from_fn_with_state(
            auth_state,
            crate::auth::tiered_auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            metrics,
            crate::metrics::http_metrics_middleware,
        ))
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(state)
}

/// Panics inside a request become a `server` error with a correlation id;
/// the stack trace goes to the log, not the client.
fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::error!(%request_id, panic = detail, "request handler panicked");
    let err = GatewayError::server("internal server error").with_operation("handle_request");
    error_response(&err, &request_id)
}

// ─── Health surface ──────────────────────────────────────────────────────────

async fn handle_health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    let check = Duration::from_secs(2);
    let kv_ok = tokio::time::timeout(check, state.kv.health_check())
        .await
        .unwrap_or(false);
    let db_ok = state.db.health_check();

    let body = serde_json::json!({
        "status": if kv_ok && db_ok { "ok" } else { "degraded" },
        "kv": kv_ok,
        "database": db_ok,
    });
    let status = if kv_ok && db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn handle_ready(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    // Ready means we can reach our own persistence.
    if state.db.health_check() {
        (StatusCode::OK, Json(serde_json::json!({"ready": true}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false})),
        )
            .into_response()
    }
}

async fn handle_live() -> Response {
    (StatusCode::OK, Json(serde_json::json!({"alive": true}))).into_response()
}

async fn handle_version() -> Response {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

async fn handle_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_text(),
    )
        .into_response()
}

async fn handle_metrics_json(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    Json(state.metrics.render_json()).into_response()
}

// ─── Serving ─────────────────────────────────────────────────────────────────

/// Bind and serve until ctrl-c.
pub async fn serve(router: Router, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    })
    .await?;
    Ok(())
}
