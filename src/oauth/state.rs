//! OAuth CSRF state management and the in-process session fallback.
//!
//! States are random URL-safe tokens persisted in `oauth_states`; a state is
//! valid for at most ten minutes and is consumed (deleted) exactly once on
//! callback. The session store is a plain in-memory map used when no KV
//! backend is configured for gateway sessions.

use crate::error::{GatewayError, Result};
use crate::store::{Database, OAuthStateRow};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Random material per state token.
const STATE_BYTES: usize = 32;

/// Maximum age of a state entry before consumption is refused.
pub fn state_max_age() -> Duration {
    Duration::minutes(10)
}

/// Generate a fresh URL-safe state token (≥ 32 bytes of entropy).
pub fn generate_state() -> String {
    let bytes: [u8; STATE_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Payload recorded when an OAuth flow starts.
#[derive(Debug, Clone)]
pub struct StatePayload {
    pub user_id: String,
    pub provider: String,
    pub mcp_name: String,
    pub code_verifier: Option<String>,
    pub redirect_uri: String,
}

pub struct OAuthStateStore {
    db: Arc<Database>,
}

impl OAuthStateStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a payload under a freshly generated state and return the state.
    pub fn store_state(&self, payload: StatePayload) -> Result<String> {
        let state = generate_state();
        self.db.insert_oauth_state(&OAuthStateRow {
            state: state.clone(),
            provider: payload.provider,
            mcp_name: payload.mcp_name,
            user_id: payload.user_id,
            code_verifier: payload.code_verifier,
            redirect_uri: payload.redirect_uri,
            created_at: Utc::now(),
        })?;
        Ok(state)
    }

    /// Consume a state exactly once. Unknown, reused, and expired states all
    /// fail with `oauth_failure`; the caller maps this to 403 without
    /// revealing which check failed.
    pub fn consume_state(&self, state: &str) -> Result<StatePayload> {
        let row = self
            .db
            .consume_oauth_state(state)?
            .ok_or_else(|| {
                GatewayError::oauth_failure("oauth state rejected")
                    .with_operation("consume_state")
            })?;

        if Utc::now() - row.created_at > state_max_age() {
            // The row is already deleted, which is fine: expired states must
            // never become consumable again.
            return Err(GatewayError::oauth_failure("oauth state rejected")
                .with_operation("consume_state"));
        }

        Ok(StatePayload {
            user_id: row.user_id,
            provider: row.provider,
            mcp_name: row.mcp_name,
            code_verifier: row.code_verifier,
            redirect_uri: row.redirect_uri,
        })
    }
}

// ─── Session fallback ────────────────────────────────────────────────────────

/// In-process session store: session id → opaque bytes. Used when no shared
/// KV is configured for session data; entries are removed explicitly on
/// logout.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Vec<u8>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, session_id: &str, data: Vec<u8>) {
        self.sessions.lock().insert(session_id.to_string(), data);
    }

    pub fn get(&self, session_id: &str) -> Option<Vec<u8>> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
