//! OpenAI-compatible `/v1/chat/completions` and `/v1/models`.
//!
//! Parses and validates the OpenAI request shape, applies defaults and
//! numeric bounds, composes the system prompt, then drives the orchestrator
//! down either the SSE or the single-JSON path.

use crate::agent::{ChatMessage, CompletionRequest, Usage};
use crate::auth::{AuthenticatedUser, RequestId};
use crate::error::{GatewayError, Result};
use crate::gateway::{error_response, AppState};
use crate::metrics::SessionGuard;
use crate::sse::{sse_response, StreamMeta};
use crate::util::unix_timestamp;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use uuid::Uuid;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4000;
pub const MAX_MAX_TOKENS: u32 = 4000;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RequestMetadata {
    pub session_id: Option<String>,
    pub workflow: Option<String>,
    pub org_id: Option<String>,
    pub user_id: Option<String>,
    pub variables: HashMap<String, String>,
    pub allowed_tools: Vec<String>,
    pub mcp_servers: Vec<String>,
    pub setting_sources: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionsResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<ResponseChoice>,
    usage: Usage,
    system_fingerprint: String,
}

#[derive(Debug, Serialize)]
struct ResponseChoice {
    index: u32,
    message: ResponseMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct ResponseMessage {
    role: &'static str,
    content: String,
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ValidatedRequest {
    completion: CompletionRequest,
    stream: bool,
    workflow: Option<String>,
    messages_count: usize,
}

/// Apply defaults and bounds, strip system entries, reject unusable
/// requests. Pure; does not suspend.
fn validate(
    body: ChatCompletionsRequest,
    composer: &crate::prompt::PromptComposer,
) -> Result<ValidatedRequest> {
    let model = body
        .model
        .as_deref()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| GatewayError::invalid_request("`model` is required"))?
        .to_string();

    if body.messages.is_empty() {
        return Err(GatewayError::invalid_request(
            "messages array must not be empty",
        ));
    }

    let temperature = body.temperature.unwrap_or(DEFAULT_TEMPERATURE);
    if !(0.0..=2.0).contains(&temperature) {
        return Err(GatewayError::invalid_request(format!(
            "temperature must be within [0, 2], got {temperature}"
        )));
    }

    // 0 (and omission) mean "use the default"; anything above the cap is an
    // error.
    let max_tokens = match body.max_tokens {
        None | Some(0) => DEFAULT_MAX_TOKENS,
        Some(n) if n > MAX_MAX_TOKENS => {
            return Err(GatewayError::invalid_request(format!(
                "max_tokens must be within [1, {MAX_MAX_TOKENS}], got {n}"
            )));
        }
        Some(n) => n,
    };

    if let Some(top_p) = body.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(GatewayError::invalid_request(format!(
                "top_p must be within [0, 1], got {top_p}"
            )));
        }
    }

    let metadata = body.metadata.unwrap_or_default();
    let messages_count = body.messages.len();

    // System entries are folded into the composed prompt; at least one
    // non-system message must remain.
    let (system_entries, messages): (Vec<_>, Vec<_>) = body
        .messages
        .into_iter()
        .partition(|m| m.role == "system");
    if messages.is_empty() {
        return Err(GatewayError::invalid_request(
            "messages must contain at least one non-system message",
        ));
    }

    let session_id = metadata
        .session_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut system_prompt = composer.compose(
        metadata.workflow.as_deref(),
        &metadata.variables,
        body.system_prompt.as_deref(),
    );
    // Request-supplied system messages come after the composed layers, in
    // their original order.
    if body.system_prompt.is_none() {
        for entry in &system_entries {
            if entry.content.trim().is_empty() {
                continue;
            }
            if !system_prompt.is_empty() {
                system_prompt.push_str("\n\n");
            }
            system_prompt.push_str(&entry.content);
        }
    }

    Ok(ValidatedRequest {
        completion: CompletionRequest {
            model,
            messages,
            system_prompt: (!system_prompt.is_empty()).then_some(system_prompt),
            temperature,
            max_tokens,
            top_p: body.top_p,
            session_id,
            user: body.user,
            allowed_tools: metadata.allowed_tools,
            mcp_servers: metadata.mcp_servers,
            setting_sources: metadata.setting_sources,
            variables: metadata.variables,
        },
        stream: body.stream.unwrap_or(false),
        workflow: metadata.workflow,
        messages_count,
    })
}

fn estimate_prompt_tokens(request: &CompletionRequest) -> u32 {
    let mut chars: usize = request.messages.iter().map(|m| m.content.len()).sum();
    if let Some(system) = &request.system_prompt {
        chars += system.len();
    }
    (chars / 4) as u32
}

// ─── Handlers ────────────────────────────────────────────────────────────────

/// POST /v1/chat/completions
pub async fn handle_chat_completions(State(state): State<AppState>, req: Request) -> Response {
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let user = req.extensions().get::<AuthenticatedUser>().cloned();
    let remote_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    // ── Admission ──
    let (user_id, org_id) = match &user {
        Some(u) => (Some(u.id.clone()), u.org_id.clone()),
        None => (None, None),
    };
    if let Err(err) = state
        .rate_limiter
        .allow_request(
            user_id.as_deref(),
            org_id.as_deref(),
            &remote_ip,
            "/v1/chat/completions",
        )
        .await
    {
        return error_response(&err, &request_id);
    }

    // ── Parse ──
    let body = match axum::body::to_bytes(req.into_body(), state.config.server.max_body_bytes)
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => {
            let err = GatewayError::invalid_request(format!("unreadable request body: {e}"));
            return error_response(&err, &request_id);
        }
    };
    let parsed: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(e) => {
            let err = GatewayError::invalid_request(format!("invalid JSON body: {e}"));
            return error_response(&err, &request_id);
        }
    };

    let validated = match validate(parsed, &state.composer) {
        Ok(validated) => validated,
        Err(err) => return error_response(&err, &request_id),
    };
    let ValidatedRequest {
        completion,
        stream,
        workflow,
        messages_count,
    } = validated;

    // Ends the session (gauge, duration, token accounting) when it is
    // dropped; for streams that happens inside the response body.
    let mut session = SessionGuard::begin(state.metrics.clone());

    // ── Audit before the response completes ──
    let audit_user = user_id.clone().unwrap_or_else(|| "anonymous".to_string());
    let audit = state.db.insert_audit(
        &audit_user,
        "chat_completion_requested",
        org_id.as_deref(),
        user_id.as_deref(),
        &serde_json::json!({
            "model": completion.model,
            "messages_count": messages_count,
            "stream": stream,
            "workflow": workflow,
            "session_id": completion.session_id,
        }),
        Some(&remote_ip),
    );
    if let Err(err) = audit {
        return error_response(&err, &request_id);
    }

    tracing::info!(
        %request_id,
        user_id = %audit_user,
        model = %completion.model,
        messages_count,
        stream,
        "chat completion requested"
    );

    // ── Branch ──
    if stream {
        let prompt_tokens = estimate_prompt_tokens(&completion);
        session.set_prompt_tokens(prompt_tokens);
        let meta = StreamMeta {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            created: unix_timestamp(),
            model: completion.model.clone(),
            session_id: completion.session_id.clone(),
            prompt_tokens,
        };
        match state.orchestrator.stream(&completion).await {
            // The guard rides along in the body; it closes the session when
            // the stream truly ends.
            Ok(upstream) => sse_response(meta, upstream, session),
            Err(err) => error_response(&err, &request_id),
        }
    } else {
        match state.orchestrator.execute(&completion).await {
            Ok(result) => {
                session.set_prompt_tokens(result.usage.prompt_tokens);
                session.add_completion_tokens(result.usage.completion_tokens);

                let wire = ChatCompletionsResponse {
                    id: format!("chatcmpl-{}", Uuid::new_v4()),
                    object: "chat.completion",
                    created: unix_timestamp(),
                    model: result.model,
                    choices: vec![ResponseChoice {
                        index: 0,
                        message: ResponseMessage {
                            role: "assistant",
                            content: result.content,
                        },
                        finish_reason: "stop",
                    }],
                    usage: result.usage,
                    system_fingerprint: completion.session_id.clone(),
                };
                Json(wire).into_response()
            }
            Err(err) => error_response(&err, &request_id),
        }
    }
}

/// GET /v1/models, merged across both agents.
pub async fn handle_models(State(state): State<AppState>) -> Response {
    let models = state.orchestrator.available_models().await;
    let data: Vec<serde_json::Value> = models
        .into_iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "object": "model",
                "created": m.created,
                "owned_by": m.owned_by,
            })
        })
        .collect();
    Json(serde_json::json!({"object": "list", "data": data})).into_response()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
