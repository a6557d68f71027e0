//! OAuth initiation and callback endpoints for downstream MCP providers.
//!
//! `GET /api/v1/oauth/{provider}/initiate` (authenticated) stores a CSRF
//! state and hands back the provider authorization URL. The provider
//! redirects the browser to `GET /api/v1/oauth/callback`, which consumes the
//! state (single-use and unexpired; anything else is a 403), exchanges the
//! code, and stores the resulting token encrypted in both the cache and the
//! `mcp_oauth_tokens` table.

use super::state::StatePayload;
use super::tokens::OAuthToken;
use crate::auth::{AuthenticatedUser, RequestId};
use crate::error::{wrap_backend_error, GatewayError};
use crate::gateway::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use chrono::{Duration, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct InitiateQuery {
    pub mcp_name: String,
    #[serde(default)]
    pub redirect_uri: Option<String>,
}

/// GET /api/v1/oauth/{provider}/initiate
pub async fn handle_initiate(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
    Query(query): Query<InitiateQuery>,
) -> Response {

    let Some(provider_cfg) = state.config.oauth.providers.get(&provider) else {
        let err = GatewayError::resource_not_found(format!(
            "unknown oauth provider '{provider}'"
        ))
        .with_operation("oauth_initiate")
        .with_resource(&provider);
        return crate::gateway::error_response(&err, &request_id);
    };

    let redirect_uri = query.redirect_uri.clone().unwrap_or_else(|| {
        format!(
            "http://{}:{}/api/v1/oauth/callback",
            state.config.server.host, state.config.server.port
        )
    });

    let stored = state.oauth_states.store_state(StatePayload {
        user_id: user.id.clone(),
        provider: provider.clone(),
        mcp_name: query.mcp_name.clone(),
        code_verifier: None,
        redirect_uri: redirect_uri.clone(),
    });
    let oauth_state = match stored {
        Ok(s) => s,
        Err(err) => return crate::gateway::error_response(&err, &request_id),
    };

    let authorization_url = format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}",
        provider_cfg.authorize_url,
        urlencoding::encode(&provider_cfg.client_id),
        urlencoding::encode(&redirect_uri),
        urlencoding::encode(&provider_cfg.scope),
        urlencoding::encode(&oauth_state),
    );

    tracing::debug!(
        user_id = %user.id,
        provider = %provider,
        mcp_name = %query.mcp_name,
        "oauth flow initiated"
    );

    Json(serde_json::json!({
        "authorization_url": authorization_url,
        "state": oauth_state,
        "expires_in": 600,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// GET /api/v1/oauth/callback
///
/// State failures are always a bare 403; the response never says whether the
/// state was unknown, reused, or expired.
pub async fn handle_callback(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Query(query): Query<CallbackQuery>,
) -> Response {

    if let Some(provider_error) = &query.error {
        tracing::warn!(error = %provider_error, "oauth provider returned an error");
        let err = GatewayError::oauth_failure("authorization was not granted")
            .with_operation("oauth_callback");
        return crate::gateway::error_response(&err, &request_id);
    }

    let (Some(csrf_state), Some(code)) = (&query.state, &query.code) else {
        let err = GatewayError::invalid_request("callback requires `state` and `code`")
            .with_operation("oauth_callback");
        return crate::gateway::error_response(&err, &request_id);
    };

    // Single-use, unexpired, known. Anything else: 403, no further detail.
    let payload = match state.oauth_states.consume_state(csrf_state) {
        Ok(payload) => payload,
        Err(_) => {
            tracing::warn!("oauth callback rejected: state validation failed");
            let body = GatewayError::oauth_failure("state validation failed")
                .with_operation("oauth_callback")
                .to_envelope(&request_id);
            return (StatusCode::FORBIDDEN, Json(body)).into_response();
        }
    };

    let Some(provider_cfg) = state.config.oauth.providers.get(&payload.provider) else {
        let err = GatewayError::missing_config(format!(
            "provider '{}' vanished from configuration",
            payload.provider
        ))
        .with_operation("oauth_callback");
        return crate::gateway::error_response(&err, &request_id);
    };

    // ── Exchange the code ──
    let client_secret = provider_cfg
        .client_secret_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .unwrap_or_default();
    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.clone()),
        ("redirect_uri", payload.redirect_uri.clone()),
        ("client_id", provider_cfg.client_id.clone()),
        ("client_secret", client_secret),
    ];
    if let Some(verifier) = &payload.code_verifier {
        form.push(("code_verifier", verifier.clone()));
    }

    let exchange = async {
        let response = state
            .http
            .post(&provider_cfg.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?
            .error_for_status()?;
        response.json::<TokenExchangeResponse>().await
    }
    .await;

    let exchanged = match exchange {
        Ok(body) => body,
        Err(e) => {
            let err = wrap_backend_error("oauth_exchange", &payload.provider, e.into());
            return crate::gateway::error_response(&err, &request_id);
        }
    };

    if exchanged.access_token.is_empty() {
        let err = GatewayError::oauth_failure("provider returned an empty access token")
            .with_operation("oauth_callback")
            .with_resource(&payload.provider);
        return crate::gateway::error_response(&err, &request_id);
    }

    let now = Utc::now();
    let token = OAuthToken {
        user_id: payload.user_id.clone(),
        provider: payload.provider.clone(),
        access_token: exchanged.access_token,
        refresh_token: exchanged.refresh_token,
        issued_at: now,
        expires_at: now + Duration::seconds(exchanged.expires_in.unwrap_or(3600) as i64),
        token_type: exchanged.token_type.unwrap_or_else(|| "Bearer".to_string()),
        scope: exchanged.scope.unwrap_or_default(),
    };

    if let Err(err) = state.token_cache.cache_token(&token, None).await {
        return crate::gateway::error_response(&err, &request_id);
    }

    // Durable encrypted mirror in mcp_oauth_tokens.
    let persisted = persist_token_row(&state, &payload.mcp_name, &token);
    if let Err(err) = persisted {
        return crate::gateway::error_response(&err, &request_id);
    }

    tracing::info!(
        user_id = %payload.user_id,
        provider = %payload.provider,
        mcp_name = %payload.mcp_name,
        "oauth token stored"
    );

    Json(serde_json::json!({
        "status": "connected",
        "provider": payload.provider,
        "mcp_name": payload.mcp_name,
        "expires_at": token.expires_at.to_rfc3339(),
    }))
    .into_response()
}

fn persist_token_row(
    state: &AppState,
    mcp_name: &str,
    token: &OAuthToken,
) -> Result<(), GatewayError> {
    let access_ct = state.cipher.encrypt(token.access_token.as_bytes())?;
    let refresh_ct = token
        .refresh_token
        .as_deref()
        .map(|r| state.cipher.encrypt(r.as_bytes()))
        .transpose()?;
    state.db.upsert_oauth_token(
        &token.user_id,
        mcp_name,
        &token.provider,
        &access_ct,
        refresh_ct.as_deref(),
        token.expires_at,
        &token.token_type,
        &token.scope,
    )
}

/// GET /api/v1/oauth/tokens: summary of the caller's connected providers.
/// Never returns token material.
pub async fn handle_token_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
) -> Response {
    match state.token_cache.get_stats(&user.id).await {
        Ok(stats) => Json(serde_json::json!({
            "total": stats.total,
            "expired": stats.expired,
            "expiring_soon": stats.expiring_soon,
            "providers": stats.providers,
        }))
        .into_response(),
        Err(err) => crate::gateway::error_response(&err, &request_id),
    }
}

/// DELETE /api/v1/oauth/{provider}: revoke the caller's token for one
/// provider.
pub async fn handle_revoke(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
) -> Response {
    match state.token_cache.revoke_token(&user.id, &provider).await {
        Ok(true) => Json(serde_json::json!({"status": "revoked", "provider": provider}))
            .into_response(),
        Ok(false) => {
            let err = GatewayError::resource_not_found(format!(
                "no token for provider '{provider}'"
            ))
            .with_operation("revoke_token")
            .with_metadata("kind", "token_not_found");
            crate::gateway::error_response(&err, &request_id)
        }
        Err(err) => crate::gateway::error_response(&err, &request_id),
    }
}
