//! Persistence layer.
//!
//! A single SQLite database holds the platform-admin roster, the append-only
//! audit log, OAuth CSRF states, encrypted OAuth token rows, and per-user MCP
//! server definitions. The connection is wrapped in a mutex; every query is
//! short and never spans an await point. `kv` carries the shared key-value
//! abstraction used by the rate limiter and token cache.

pub mod kv;

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS platform_admins (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    workos_user_id  TEXT NOT NULL,
    email           TEXT NOT NULL UNIQUE,
    name            TEXT NOT NULL,
    is_active       INTEGER NOT NULL DEFAULT 1,
    added_at        INTEGER NOT NULL,
    added_by        TEXT,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS admin_audit_log (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    admin_id        TEXT NOT NULL,
    action          TEXT NOT NULL,
    target_org_id   TEXT,
    target_user_id  TEXT,
    details         TEXT NOT NULL DEFAULT '{}',
    ip_address      TEXT,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS oauth_states (
    state           TEXT PRIMARY KEY,
    provider        TEXT NOT NULL,
    mcp_name        TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    code_verifier   TEXT,
    redirect_uri    TEXT NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mcp_oauth_tokens (
    user_id          TEXT NOT NULL,
    mcp_name         TEXT NOT NULL,
    provider         TEXT NOT NULL,
    access_token_ct  BLOB NOT NULL,
    refresh_token_ct BLOB,
    expires_at       INTEGER NOT NULL,
    token_type       TEXT NOT NULL DEFAULT 'Bearer',
    scope            TEXT NOT NULL DEFAULT '',
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL,
    UNIQUE (user_id, mcp_name)
);

CREATE TABLE IF NOT EXISTS mcp_servers (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    name            TEXT NOT NULL,
    url             TEXT NOT NULL,
    auth_provider   TEXT,
    enabled         INTEGER NOT NULL DEFAULT 1,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_created ON admin_audit_log (created_at DESC);
CREATE INDEX IF NOT EXISTS idx_mcp_servers_user ON mcp_servers (user_id);
"#;

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct AdminRow {
    pub id: i64,
    pub workos_user_id: String,
    pub email: String,
    pub name: String,
    pub is_active: bool,
    pub added_at: DateTime<Utc>,
    pub added_by: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditRow {
    pub id: i64,
    pub admin_id: String,
    pub admin_email: Option<String>,
    pub admin_name: Option<String>,
    pub action: String,
    pub target_org_id: Option<String>,
    pub target_user_id: Option<String>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OAuthStateRow {
    pub state: String,
    pub provider: String,
    pub mcp_name: String,
    pub user_id: String,
    pub code_verifier: Option<String>,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct McpServerRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub auth_provider: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn ts(epoch: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(epoch, 0).single().unwrap_or_else(Utc::now)
}

// ─── Database ────────────────────────────────────────────────────────────────

pub struct Database {
    conn: Mutex<Connection>,
    metrics: Arc<Metrics>,
}

impl Database {
    pub fn open(path: &Path, metrics: Arc<Metrics>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            metrics.database_connection_errors_total.inc();
            GatewayError::server_unavailable(format!("failed to open database: {e}"))
                .with_operation("db_open")
        })?;
        Self::from_connection(conn, metrics)
    }

    pub fn open_in_memory(metrics: Arc<Metrics>) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            GatewayError::server_unavailable(format!("failed to open database: {e}"))
                .with_operation("db_open")
        })?;
        Self::from_connection(conn, metrics)
    }

    fn from_connection(conn: Connection, metrics: Arc<Metrics>) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(|e| {
            GatewayError::server_internal(format!("schema init failed: {e}"))
                .with_operation("db_init")
        })?;
        metrics.database_connections_active.set(1);
        Ok(Self {
            conn: Mutex::new(conn),
            metrics,
        })
    }

    /// Run one query under the connection lock, recording duration and
    /// status under `query_type`.
    fn timed<T>(
        &self,
        query_type: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let started = Instant::now();
        let result = {
            let conn = self.conn.lock();
            f(&conn)
        };
        self.metrics
            .database_query_duration_seconds
            .with_label_values(&[query_type])
            .observe(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .database_queries_total
            .with_label_values(&[query_type, status])
            .inc();
        result.map_err(|e| {
            GatewayError::server_internal(format!("database error: {e}"))
                .with_operation(query_type)
        })
    }

    pub fn health_check(&self) -> bool {
        self.timed("health", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        })
        .map(|v| v == 1)
        .unwrap_or(false)
    }

    // ── Platform admins ──────────────────────────────────────────────────

    /// Insert or reactivate an admin row; returns the stored row.
    pub fn upsert_admin(
        &self,
        workos_user_id: &str,
        email: &str,
        name: &str,
        added_by: &str,
    ) -> Result<AdminRow> {
        let now = Utc::now().timestamp();
        self.timed("admin_upsert", |conn| {
            conn.execute(
                "INSERT INTO platform_admins
                     (workos_user_id, email, name, is_active, added_at, added_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?4, ?4)
                 ON CONFLICT(email) DO UPDATE SET
                     workos_user_id = excluded.workos_user_id,
                     name = excluded.name,
                     is_active = 1,
                     added_by = excluded.added_by,
                     updated_at = excluded.updated_at",
                params![workos_user_id, email, name, now, added_by],
            )?;
            conn.query_row(
                "SELECT id, workos_user_id, email, name, is_active, added_at, added_by
                 FROM platform_admins WHERE email = ?1",
                params![email],
                admin_from_row,
            )
        })
    }

    /// Soft-delete: flips `is_active` off. Returns whether a row changed.
    pub fn deactivate_admin(&self, email: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        self.timed("admin_deactivate", |conn| {
            conn.execute(
                "UPDATE platform_admins SET is_active = 0, updated_at = ?2
                 WHERE email = ?1 AND is_active = 1",
                params![email, now],
            )
        })
        .map(|changed| changed > 0)
    }

    pub fn list_active_admins(&self) -> Result<Vec<AdminRow>> {
        self.timed("admin_list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workos_user_id, email, name, is_active, added_at, added_by
                 FROM platform_admins WHERE is_active = 1
                 ORDER BY added_at DESC",
            )?;
            let rows = stmt.query_map([], admin_from_row)?;
            rows.collect()
        })
    }

    pub fn count_active_admins(&self) -> Result<u64> {
        self.timed("admin_count", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM platform_admins WHERE is_active = 1",
                [],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    // ── Audit log ────────────────────────────────────────────────────────

    pub fn insert_audit(
        &self,
        admin_id: &str,
        action: &str,
        target_org_id: Option<&str>,
        target_user_id: Option<&str>,
        details: &serde_json::Value,
        ip_address: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().timestamp();
        let details = details.to_string();
        self.timed("audit_insert", |conn| {
            conn.execute(
                "INSERT INTO admin_audit_log
                     (admin_id, action, target_org_id, target_user_id, details, ip_address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![admin_id, action, target_org_id, target_user_id, details, ip_address, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Paginated audit retrieval, newest first, joined to admin identity.
    pub fn list_audit(&self, limit: u32, offset: u32) -> Result<Vec<AuditRow>> {
        self.timed("audit_list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT a.id, a.admin_id, p.email, p.name, a.action,
                        a.target_org_id, a.target_user_id, a.details, a.ip_address, a.created_at
                 FROM admin_audit_log a
                 LEFT JOIN platform_admins p ON p.workos_user_id = a.admin_id
                 ORDER BY a.created_at DESC, a.id DESC
                 LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![limit, offset], |row| {
                let details_raw: String = row.get(7)?;
                Ok(AuditRow {
                    id: row.get(0)?,
                    admin_id: row.get(1)?,
                    admin_email: row.get(2)?,
                    admin_name: row.get(3)?,
                    action: row.get(4)?,
                    target_org_id: row.get(5)?,
                    target_user_id: row.get(6)?,
                    details: serde_json::from_str(&details_raw)
                        .unwrap_or(serde_json::Value::Null),
                    ip_address: row.get(8)?,
                    created_at: ts(row.get(9)?),
                })
            })?;
            rows.collect()
        })
    }

    pub fn count_audit(&self) -> Result<u64> {
        self.timed("audit_count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM admin_audit_log", [], |row| {
                row.get::<_, i64>(0)
            })
        })
        .map(|n| n as u64)
    }

    pub fn count_audit_since(&self, since: DateTime<Utc>) -> Result<u64> {
        self.timed("audit_count_since", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM admin_audit_log WHERE created_at >= ?1",
                params![since.timestamp()],
                |row| row.get::<_, i64>(0),
            )
        })
        .map(|n| n as u64)
    }

    // ── OAuth states ─────────────────────────────────────────────────────

    pub fn insert_oauth_state(&self, row: &OAuthStateRow) -> Result<()> {
        self.timed("oauth_state_insert", |conn| {
            conn.execute(
                "INSERT INTO oauth_states
                     (state, provider, mcp_name, user_id, code_verifier, redirect_uri, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.state,
                    row.provider,
                    row.mcp_name,
                    row.user_id,
                    row.code_verifier,
                    row.redirect_uri,
                    row.created_at.timestamp()
                ],
            )
            .map(|_| ())
        })
    }

    /// Atomically consume a state row: the DELETE both checks existence and
    /// guarantees single use.
    pub fn consume_oauth_state(&self, state: &str) -> Result<Option<OAuthStateRow>> {
        self.timed("oauth_state_consume", |conn| {
            conn.query_row(
                "DELETE FROM oauth_states WHERE state = ?1
                 RETURNING state, provider, mcp_name, user_id, code_verifier, redirect_uri, created_at",
                params![state],
                |row| {
                    Ok(OAuthStateRow {
                        state: row.get(0)?,
                        provider: row.get(1)?,
                        mcp_name: row.get(2)?,
                        user_id: row.get(3)?,
                        code_verifier: row.get(4)?,
                        redirect_uri: row.get(5)?,
                        created_at: ts(row.get(6)?),
                    })
                },
            )
            .optional()
        })
    }

    // ── OAuth token rows ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_oauth_token(
        &self,
        user_id: &str,
        mcp_name: &str,
        provider: &str,
        access_token_ct: &[u8],
        refresh_token_ct: Option<&[u8]>,
        expires_at: DateTime<Utc>,
        token_type: &str,
        scope: &str,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        self.timed("oauth_token_upsert", |conn| {
            conn.execute(
                "INSERT INTO mcp_oauth_tokens
                     (user_id, mcp_name, provider, access_token_ct, refresh_token_ct,
                      expires_at, token_type, scope, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(user_id, mcp_name) DO UPDATE SET
                     provider = excluded.provider,
                     access_token_ct = excluded.access_token_ct,
                     refresh_token_ct = excluded.refresh_token_ct,
                     expires_at = excluded.expires_at,
                     token_type = excluded.token_type,
                     scope = excluded.scope,
                     updated_at = excluded.updated_at",
                params![
                    user_id,
                    mcp_name,
                    provider,
                    access_token_ct,
                    refresh_token_ct,
                    expires_at.timestamp(),
                    token_type,
                    scope,
                    now
                ],
            )
            .map(|_| ())
        })
    }

    pub fn delete_oauth_token(&self, user_id: &str, mcp_name: &str) -> Result<bool> {
        self.timed("oauth_token_delete", |conn| {
            conn.execute(
                "DELETE FROM mcp_oauth_tokens WHERE user_id = ?1 AND mcp_name = ?2",
                params![user_id, mcp_name],
            )
        })
        .map(|n| n > 0)
    }

    /// Remove stale OAuth rows: states older than `state_max_age` and tokens
    /// expired longer than `token_grace` ago. Returns (states, tokens)
    /// deleted.
    pub fn cleanup_oauth(
        &self,
        state_max_age: chrono::Duration,
        token_grace: chrono::Duration,
    ) -> Result<(usize, usize)> {
        let state_cutoff = (Utc::now() - state_max_age).timestamp();
        let token_cutoff = (Utc::now() - token_grace).timestamp();
        self.timed("oauth_cleanup", |conn| {
            let states = conn.execute(
                "DELETE FROM oauth_states WHERE created_at < ?1",
                params![state_cutoff],
            )?;
            let tokens = conn.execute(
                "DELETE FROM mcp_oauth_tokens WHERE expires_at < ?1",
                params![token_cutoff],
            )?;
            Ok((states, tokens))
        })
    }

    // ── MCP servers ──────────────────────────────────────────────────────

    pub fn list_mcp_servers(&self, user_id: &str) -> Result<Vec<McpServerRow>> {
        self.timed("mcp_list", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, url, auth_provider, enabled, created_at, updated_at
                 FROM mcp_servers WHERE user_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![user_id], mcp_from_row)?;
            rows.collect()
        })
    }

    pub fn insert_mcp_server(&self, row: &McpServerRow) -> Result<()> {
        self.timed("mcp_insert", |conn| {
            conn.execute(
                "INSERT INTO mcp_servers
                     (id, user_id, name, url, auth_provider, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id,
                    row.user_id,
                    row.name,
                    row.url,
                    row.auth_provider,
                    row.enabled,
                    row.created_at.timestamp(),
                    row.updated_at.timestamp()
                ],
            )
            .map(|_| ())
        })
    }

    pub fn get_mcp_server(&self, user_id: &str, id: &str) -> Result<Option<McpServerRow>> {
        self.timed("mcp_get", |conn| {
            conn.query_row(
                "SELECT id, user_id, name, url, auth_provider, enabled, created_at, updated_at
                 FROM mcp_servers WHERE user_id = ?1 AND id = ?2",
                params![user_id, id],
                mcp_from_row,
            )
            .optional()
        })
    }

    pub fn update_mcp_server(
        &self,
        user_id: &str,
        id: &str,
        name: Option<&str>,
        url: Option<&str>,
        auth_provider: Option<Option<&str>>,
        enabled: Option<bool>,
    ) -> Result<Option<McpServerRow>> {
        let now = Utc::now().timestamp();
        let changed = self.timed("mcp_update", |conn| {
            conn.execute(
                "UPDATE mcp_servers SET
                     name = COALESCE(?3, name),
                     url = COALESCE(?4, url),
                     auth_provider = CASE WHEN ?5 THEN ?6 ELSE auth_provider END,
                     enabled = COALESCE(?7, enabled),
                     updated_at = ?8
                 WHERE user_id = ?1 AND id = ?2",
                params![
                    user_id,
                    id,
                    name,
                    url,
                    auth_provider.is_some(),
                    auth_provider.flatten(),
                    enabled,
                    now
                ],
            )
        })?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_mcp_server(user_id, id)
    }

    pub fn delete_mcp_server(&self, user_id: &str, id: &str) -> Result<bool> {
        self.timed("mcp_delete", |conn| {
            conn.execute(
                "DELETE FROM mcp_servers WHERE user_id = ?1 AND id = ?2",
                params![user_id, id],
            )
        })
        .map(|n| n > 0)
    }
}

fn admin_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AdminRow> {
    Ok(AdminRow {
        id: row.get(0)?,
        workos_user_id: row.get(1)?,
        email: row.get(2)?,
        name: row.get(3)?,
        is_active: row.get::<_, i64>(4)? != 0,
        added_at: ts(row.get(5)?),
        added_by: row.get(6)?,
    })
}

fn mcp_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<McpServerRow> {
    Ok(McpServerRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        url: row.get(3)?,
        auth_provider: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
        created_at: ts(row.get(6)?),
        updated_at: ts(row.get(7)?),
    })
}

/// Background cleanup: prunes stale OAuth states every minute and expired
/// token rows on the same tick. States are dropped after 5 minutes, token
/// rows 7 days after expiry.
pub fn spawn_cleanup_task(db: Arc<Database>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            match db.cleanup_oauth(chrono::Duration::minutes(5), chrono::Duration::days(7)) {
                Ok((states, tokens)) if states > 0 || tokens > 0 => {
                    tracing::debug!(states, tokens, "pruned stale oauth rows");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "oauth cleanup failed"),
            }
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
