//! Per-user MCP server management (`/api/v1/mcp`).
//!
//! Authenticated users register the MCP tool servers their chat requests may
//! attach. Rows are scoped to the owning user; the gateway treats URLs and
//! auth providers as opaque configuration.

use crate::auth::{AuthenticatedUser, RequestId};
use crate::error::GatewayError;
use crate::gateway::{error_response, AppState};
use crate::store::McpServerRow;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct CreateMcpBody {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub auth_provider: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PatchMcpBody {
    pub name: Option<String>,
    pub url: Option<String>,
    /// `Some(None)` clears the provider; absent leaves it untouched.
    #[serde(default, with = "double_option")]
    pub auth_provider: Option<Option<String>>,
    pub enabled: Option<bool>,
}

/// Distinguishes "field absent" from "field set to null" in PATCH bodies.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

fn validate_server(name: &str, url: &str) -> Result<(), GatewayError> {
    if name.trim().is_empty() {
        return Err(GatewayError::invalid_request("server name must not be empty")
            .with_operation("mcp_validate"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(
            GatewayError::invalid_request("server url must be http(s)")
                .with_operation("mcp_validate"),
        );
    }
    Ok(())
}

/// GET /api/v1/mcp
pub async fn handle_list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
) -> Response {
    match state.db.list_mcp_servers(&user.id) {
        Ok(servers) => Json(serde_json::json!({"servers": servers})).into_response(),
        Err(err) => error_response(&err, &request_id),
    }
}

/// POST /api/v1/mcp
pub async fn handle_create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
    Json(body): Json<CreateMcpBody>,
) -> Response {
    if let Err(err) = validate_server(&body.name, &body.url) {
        return error_response(&err, &request_id);
    }

    let now = Utc::now();
    let row = McpServerRow {
        id: format!("mcp-{}", uuid::Uuid::new_v4()),
        user_id: user.id.clone(),
        name: body.name,
        url: body.url,
        auth_provider: body.auth_provider,
        enabled: body.enabled,
        created_at: now,
        updated_at: now,
    };
    match state.db.insert_mcp_server(&row) {
        Ok(()) => {
            tracing::info!(user_id = %user.id, server = %row.name, "mcp server registered");
            (StatusCode::CREATED, Json(row)).into_response()
        }
        Err(err) => error_response(&err, &request_id),
    }
}

/// PATCH /api/v1/mcp/{id}
pub async fn handle_update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
    Json(body): Json<PatchMcpBody>,
) -> Response {
    if let Some(url) = &body.url {
        if let Err(err) = validate_server(body.name.as_deref().unwrap_or("server"), url) {
            return error_response(&err, &request_id);
        }
    }
    if let Some(name) = &body.name {
        if name.trim().is_empty() {
            let err = GatewayError::invalid_request("server name must not be empty")
                .with_operation("mcp_validate");
            return error_response(&err, &request_id);
        }
    }

    let updated = state.db.update_mcp_server(
        &user.id,
        &id,
        body.name.as_deref(),
        body.url.as_deref(),
        body.auth_provider
            .as_ref()
            .map(|inner| inner.as_deref()),
        body.enabled,
    );
    match updated {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => {
            let err = GatewayError::resource_not_found(format!("no mcp server '{id}'"))
                .with_operation("mcp_update")
                .with_resource(&id);
            error_response(&err, &request_id)
        }
        Err(err) => error_response(&err, &request_id),
    }
}

/// DELETE /api/v1/mcp/{id}
pub async fn handle_delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
    Path(id): Path<String>,
) -> Response {
    match state.db.delete_mcp_server(&user.id, &id) {
        Ok(true) => Json(serde_json::json!({"status": "deleted", "id": id})).into_response(),
        Ok(false) => {
            let err = GatewayError::resource_not_found(format!("no mcp server '{id}'"))
                .with_operation("mcp_delete")
                .with_resource(&id);
            error_response(&err, &request_id)
        }
        Err(err) => error_response(&err, &request_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_defaults_enabled() {
        let body: CreateMcpBody =
            serde_json::from_str(r#"{"name": "docs", "url": "https://mcp.example.com"}"#)
                .unwrap();
        assert!(body.enabled);
        assert!(body.auth_provider.is_none());
    }

    #[test]
    fn patch_body_distinguishes_null_from_absent() {
        let absent: PatchMcpBody = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        assert!(absent.auth_provider.is_none());

        let null: PatchMcpBody =
            serde_json::from_str(r#"{"auth_provider": null}"#).unwrap();
        assert_eq!(null.auth_provider, Some(None));

        let set: PatchMcpBody =
            serde_json::from_str(r#"{"auth_provider": "github"}"#).unwrap();
        assert_eq!(set.auth_provider, Some(Some("github".to_string())));
    }

    #[test]
    fn server_validation() {
        assert!(validate_server("docs", "https://ok.example.com").is_ok());
        assert!(validate_server("", "https://ok.example.com").is_err());
        assert!(validate_server("docs", "ftp://nope").is_err());
    }
}
