//! Platform-admin surface: admin roster CRUD, platform stats, audit log.
//!
//! Every route here sits behind the `platform_admin` access level. Mutating
//! actions write their audit row before the HTTP response completes.

use crate::auth::{AuthenticatedUser, ClientIp, RequestId};
use crate::error::GatewayError;
use crate::gateway::{error_response, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use serde::Deserialize;

const DEFAULT_AUDIT_LIMIT: u32 = 50;
const MAX_AUDIT_LIMIT: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct AddAdminBody {
    pub workos_id: String,
    pub email: String,
    pub name: String,
}

/// POST /api/v1/platform/admins
pub async fn handle_add_admin(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
    ClientIp(ip): ClientIp,
    Json(body): Json<AddAdminBody>,
) -> Response {

    if body.email.is_empty() || !body.email.contains('@') {
        let err = GatewayError::invalid_request("a valid email is required")
            .with_operation("add_admin");
        return error_response(&err, &request_id);
    }
    if body.workos_id.is_empty() {
        let err = GatewayError::invalid_request("workos_id is required")
            .with_operation("add_admin");
        return error_response(&err, &request_id);
    }

    let row = match state
        .db
        .upsert_admin(&body.workos_id, &body.email, &body.name, &user.id)
    {
        Ok(row) => row,
        Err(err) => return error_response(&err, &request_id),
    };

    let audit = state.db.insert_audit(
        &user.id,
        "added_admin",
        user.org_id.as_deref(),
        Some(&body.workos_id),
        &serde_json::json!({"email": body.email, "name": body.name}),
        ip.as_deref(),
    );
    if let Err(err) = audit {
        return error_response(&err, &request_id);
    }

    tracing::info!(admin = %user.id, email = %body.email, "platform admin added");
    (StatusCode::CREATED, Json(row)).into_response()
}

/// DELETE /api/v1/platform/admins/{email}
pub async fn handle_remove_admin(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    RequestId(request_id): RequestId,
    ClientIp(ip): ClientIp,
    Path(email): Path<String>,
) -> Response {

    match state.db.deactivate_admin(&email) {
        Ok(true) => {}
        Ok(false) => {
            let err = GatewayError::resource_not_found(format!(
                "no active admin with email '{email}'"
            ))
            .with_operation("remove_admin");
            return error_response(&err, &request_id);
        }
        Err(err) => return error_response(&err, &request_id),
    }

    let audit = state.db.insert_audit(
        &user.id,
        "removed_admin",
        user.org_id.as_deref(),
        None,
        &serde_json::json!({"email": email}),
        ip.as_deref(),
    );
    if let Err(err) = audit {
        return error_response(&err, &request_id);
    }

    tracing::info!(admin = %user.id, email = %email, "platform admin removed");
    Json(serde_json::json!({"status": "removed", "email": email})).into_response()
}

/// GET /api/v1/platform/admins: active rows, newest first.
pub async fn handle_list_admins(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
) -> Response {
    match state.db.list_active_admins() {
        Ok(admins) => Json(serde_json::json!({"admins": admins})).into_response(),
        Err(err) => error_response(&err, &request_id),
    }
}

/// GET /api/v1/platform/stats
///
/// Request and token counters come straight from the metrics registry at
/// query time.
pub async fn handle_stats(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
) -> Response {
    let day_ago = chrono::Utc::now() - chrono::Duration::hours(24);

    let active_admins = match state.db.count_active_admins() {
        Ok(n) => n,
        Err(err) => return error_response(&err, &request_id),
    };
    let total_audit_entries = match state.db.count_audit() {
        Ok(n) => n,
        Err(err) => return error_response(&err, &request_id),
    };
    let recent_admin_actions = match state.db.count_audit_since(day_ago) {
        Ok(n) => n,
        Err(err) => return error_response(&err, &request_id),
    };

    Json(serde_json::json!({
        "active_admins": active_admins,
        "total_audit_entries": total_audit_entries,
        "recent_admin_actions_24h": recent_admin_actions,
        "total_requests": state.metrics.sum_counter("http_requests_total"),
        "total_tokens": state.metrics.sum_counter("tokens_total"),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// GET /api/v1/platform/audit?limit=&offset=
pub async fn handle_audit(
    State(state): State<AppState>,
    RequestId(request_id): RequestId,
    Query(query): Query<AuditQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .min(MAX_AUDIT_LIMIT)
        .max(1);
    let offset = query.offset.unwrap_or(0);

    match state.db.list_audit(limit, offset) {
        Ok(entries) => Json(serde_json::json!({
            "entries": entries,
            "limit": limit,
            "offset": offset,
        }))
        .into_response(),
        Err(err) => error_response(&err, &request_id),
    }
}
