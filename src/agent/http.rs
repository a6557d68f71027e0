//! Generic OpenAI-compatible HTTP agent.
//!
//! Speaks `POST {base}/chat/completions` (JSON, or SSE when streaming) to
//! any upstream exposing the OpenAI wire format. The concrete Vertex router
//! and Claude agent deployments sit behind endpoints of this shape; the
//! gateway itself stays ignorant of their internals.

use super::{
    Agent, AgentStream, ChatMessage, CompletionRequest, CompletionResponse, ModelInfo,
    StreamDelta, Usage,
};
use crate::error::{GatewayError, Result};
use crate::util::unix_timestamp;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

pub struct HttpAgent {
    name: String,
    base_url: String,
    api_key: Option<String>,
    models: Vec<String>,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpAgent {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        models: Vec<String>,
        http: reqwest::Client,
        request_timeout: Duration,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            models,
            http,
            request_timeout,
        }
    }

    fn wire_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            if !system.is_empty() {
                messages.push(ChatMessage {
                    role: "system".to_string(),
                    content: system.clone(),
                });
            }
        }
        messages.extend(request.messages.iter().cloned());
        messages
    }

    fn body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::wire_messages(request),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(user) = &request.user {
            body["user"] = serde_json::json!(user);
        }
        if !request.setting_sources.is_empty() {
            // Opaque passthrough; the backend decides what these mean.
            body["setting_sources"] = serde_json::json!(request.setting_sources);
        }
        if !request.allowed_tools.is_empty() {
            body["allowed_tools"] = serde_json::json!(request.allowed_tools);
        }
        if !request.mcp_servers.is_empty() {
            body["mcp_servers"] = serde_json::json!(request.mcp_servers);
        }
        body
    }

    fn request(&self, stream: bool, request: &CompletionRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.request_timeout)
            .json(&self.body(request, stream));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: WireDelta,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Agent for HttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let response = self
            .request(false, request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body)
                .with_operation("execute")
                .with_resource(&self.name));
        }

        let wire: WireResponse = response.json().await.map_err(|e| {
            GatewayError::server(format!("upstream returned malformed completion: {e}"))
                .with_operation("execute")
                .with_resource(&self.name)
        })?;

        let content = wire
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                GatewayError::server("upstream returned no choices")
                    .with_operation("execute")
                    .with_resource(&self.name)
            })?;

        let usage = wire
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| estimate_usage(request, &content));

        Ok(CompletionResponse {
            content,
            model: wire.model.unwrap_or_else(|| request.model.clone()),
            usage,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<AgentStream> {
        let response = self
            .request(true, request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body)
                .with_operation("stream")
                .with_resource(&self.name));
        }

        Ok(sse_delta_stream(
            Box::pin(response.bytes_stream()),
            self.name.clone(),
        ))
    }

    async fn available_models(&self) -> Vec<ModelInfo> {
        let created = unix_timestamp();
        self.models
            .iter()
            .map(|id| ModelInfo {
                id: id.clone(),
                owned_by: self.name.clone(),
                created,
            })
            .collect()
    }

    async fn is_healthy(&self) -> bool {
        let mut builder = self
            .http
            .get(format!("{}/models", self.base_url))
            .timeout(Duration::from_secs(5));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

fn estimate_usage(request: &CompletionRequest, content: &str) -> Usage {
    // ~4 bytes per token, same heuristic the upstreams use when they omit
    // usage.
    let prompt: usize = request.messages.iter().map(|m| m.content.len() / 4).sum();
    Usage::new(prompt as u32, (content.len() / 4) as u32)
}

fn classify_transport(e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::connection_timeout(format!("upstream timed out: {e}"))
    } else if e.is_connect() {
        GatewayError::connection_refused(format!("upstream unreachable: {e}"))
    } else {
        GatewayError::connection(format!("upstream transport error: {e}"))
    }
}

fn classify_status(status: u16, body: &str) -> GatewayError {
    let detail = crate::util::truncate_with_ellipsis(body, 200);
    match status {
        401 | 403 => GatewayError::authentication(format!("upstream rejected credentials: {detail}")),
        404 => GatewayError::resource_not_found(format!("upstream route missing: {detail}")),
        429 => GatewayError::rate_limit(format!("upstream rate limited: {detail}")),
        500..=599 => GatewayError::server_unavailable(format!("upstream {status}: {detail}")),
        _ => GatewayError::server(format!("upstream {status}: {detail}")),
    }
}

// ─── SSE parsing ─────────────────────────────────────────────────────────────

type ByteStream =
    Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<axum::body::Bytes>> + Send>>;

struct SseParser {
    inner: ByteStream,
    agent: String,
    buffer: String,
    pending: VecDeque<Result<StreamDelta>>,
    finished: bool,
}

impl SseParser {
    fn drain_events(&mut self) {
        while let Some(boundary) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..boundary + 2).collect();
            for line in event.lines() {
                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    self.finished = true;
                    return;
                }
                match serde_json::from_str::<WireChunk>(data) {
                    Ok(chunk) => {
                        if let Some(content) = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                        {
                            if !content.is_empty() {
                                self.pending.push_back(Ok(StreamDelta { content }));
                            }
                        }
                    }
                    Err(e) => {
                        self.pending.push_back(Err(GatewayError::server(format!(
                            "upstream sent malformed chunk: {e}"
                        ))
                        .with_operation("stream")
                        .with_resource(&self.agent)));
                        self.finished = true;
                        return;
                    }
                }
            }
        }
    }
}

/// Turn an upstream SSE byte stream into a stream of content deltas.
/// Transport errors surface in-band and terminate the stream.
fn sse_delta_stream(bytes: ByteStream, agent: String) -> AgentStream {
    let parser = SseParser {
        inner: bytes,
        agent,
        buffer: String::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(parser, |mut parser| async {
        loop {
            if let Some(item) = parser.pending.pop_front() {
                let stop_after = item.is_err();
                if stop_after {
                    parser.finished = true;
                    parser.pending.clear();
                }
                return Some((item, parser));
            }
            if parser.finished {
                return None;
            }
            match parser.inner.next().await {
                Some(Ok(bytes)) => {
                    parser.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    parser.drain_events();
                }
                Some(Err(e)) => {
                    parser.finished = true;
                    let err = classify_transport(e)
                        .with_operation("stream")
                        .with_resource(&parser.agent);
                    return Some((Err(err), parser));
                }
                None => {
                    parser.finished = true;
                }
            }
        }
    }))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
