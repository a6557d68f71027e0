//! Shared harness for gateway integration tests: scriptable stub agents, a
//! deterministic token verifier, and a fully wired router over in-memory
//! stores.
#![allow(dead_code)]

use agentrelay::agent::{
    Agent, AgentStream, CompletionRequest, CompletionResponse, ModelInfo, StreamDelta, Usage,
};
use agentrelay::auth::{AuthenticatedUser, RoleSet, TokenVerifier};
use agentrelay::config::Config;
use agentrelay::error::{GatewayError, Result};
use agentrelay::gateway::{build_router, AppState};
use agentrelay::metrics::Metrics;
use agentrelay::store::kv::{KvStore, MemoryKv};
use agentrelay::store::Database;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// ─── Stub agent ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum StreamScript {
    FailToOpen,
    Deltas(Vec<&'static str>),
    ErrorImmediately,
    ErrorAfter(Vec<&'static str>),
}

pub struct StubAgent {
    pub name: String,
    pub execute_result: std::result::Result<String, &'static str>,
    pub stream_script: StreamScript,
    pub execute_calls: AtomicU32,
    pub stream_calls: AtomicU32,
}

impl StubAgent {
    pub fn ok(name: &str, content: &str) -> Arc<Self> {
        Self::new(name, Ok(content.to_string()), StreamScript::Deltas(vec![]))
    }

    pub fn new(
        name: &str,
        execute_result: std::result::Result<String, &'static str>,
        stream_script: StreamScript,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            execute_result,
            stream_script,
            execute_calls: AtomicU32::new(0),
            stream_calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl Agent for StubAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        match &self.execute_result {
            Ok(content) => Ok(CompletionResponse {
                content: content.clone(),
                model: request.model.clone(),
                usage: Usage::new(9, 4),
            }),
            Err(msg) => Err(GatewayError::server_unavailable(*msg)),
        }
    }

    async fn stream(&self, _request: &CompletionRequest) -> Result<AgentStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        match self.stream_script.clone() {
            StreamScript::FailToOpen => {
                Err(GatewayError::connection_refused("stream unavailable"))
            }
            StreamScript::Deltas(parts) => Ok(Box::pin(futures_util::stream::iter(
                parts
                    .into_iter()
                    .map(|p| Ok(StreamDelta { content: p.into() })),
            ))),
            StreamScript::ErrorImmediately => Ok(Box::pin(futures_util::stream::iter([Err(
                GatewayError::server_unavailable("immediate stream failure"),
            )]))),
            StreamScript::ErrorAfter(parts) => {
                let mut items: Vec<Result<StreamDelta>> = parts
                    .into_iter()
                    .map(|p| Ok(StreamDelta { content: p.into() }))
                    .collect();
                items.push(Err(GatewayError::server_unavailable("mid-stream failure")));
                Ok(Box::pin(futures_util::stream::iter(items)))
            }
        }
    }

    async fn available_models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: format!("{}-model", self.name),
            owned_by: self.name.clone(),
            created: 1_700_000_000,
        }]
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}

// ─── Stub verifier ───────────────────────────────────────────────────────────

/// Maps fixed bearer tokens to users; everything else is rejected.
pub struct StubVerifier;

#[async_trait]
impl TokenVerifier for StubVerifier {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser> {
        match token {
            "user-token" => Ok(AuthenticatedUser {
                id: "u-1".into(),
                org_id: Some("org-1".into()),
                email: Some("dev@example.com".into()),
                roles: RoleSet::default(),
            }),
            "org-admin-token" => Ok(AuthenticatedUser {
                id: "u-org".into(),
                org_id: Some("org-1".into()),
                email: Some("org@example.com".into()),
                roles: RoleSet {
                    org_admin: true,
                    platform_admin: false,
                },
            }),
            "platform-admin-token" => Ok(AuthenticatedUser {
                id: "u-admin".into(),
                org_id: None,
                email: Some("root@example.com".into()),
                roles: RoleSet {
                    org_admin: false,
                    platform_admin: true,
                },
            }),
            _ => Err(GatewayError::auth_invalid("unknown token")),
        }
    }
}

// ─── App assembly ────────────────────────────────────────────────────────────

pub fn base_config() -> Config {
    let mut config = Config::default();
    config.agents.fallback_enabled = true;
    config.agents.primary_model_prefixes = vec!["gemini-".into(), "router-".into()];
    config.agents.fallback_model_prefixes = vec!["claude-".into()];
    config
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

pub fn test_app(
    config: Config,
    primary: Arc<StubAgent>,
    fallback: Option<Arc<StubAgent>>,
) -> TestApp {
    let metrics = Arc::new(Metrics::new().unwrap());
    let db = Arc::new(Database::open_in_memory(metrics.clone()).unwrap());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let state = AppState::new(
        config,
        metrics,
        db,
        kv,
        primary as Arc<dyn Agent>,
        fallback.map(|f| f as Arc<dyn Agent>),
    )
    .unwrap();
    let router = build_router(state.clone(), Some(Arc::new(StubVerifier)));
    TestApp { router, state }
}

// ─── Request helpers ─────────────────────────────────────────────────────────

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    use tower::util::ServiceExt;
    router.clone().oneshot(request).await.unwrap()
}

pub fn chat_request(token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(token: Option<&str>, uri: &str) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn json_request(
    method: &str,
    token: &str,
    uri: &str,
    body: serde_json::Value,
) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Parse SSE text into (events, saw_done).
pub fn parse_sse(raw: &str) -> (Vec<serde_json::Value>, bool) {
    let mut saw_done = false;
    let events = raw
        .split("\n\n")
        .filter_map(|e| e.strip_prefix("data: "))
        .filter_map(|d| {
            if d == "[DONE]" {
                saw_done = true;
                None
            } else {
                Some(serde_json::from_str(d).unwrap())
            }
        })
        .collect();
    (events, saw_done)
}

pub fn user_chat_body(model: &str, stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hi"}],
        "stream": stream,
        "metadata": {"session_id": "sess-e2e"},
    })
}
