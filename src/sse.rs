//! Server-Sent Events emitter for streaming completions.
//!
//! Encodes the OpenAI chunk wire format exactly: every event is
//! `data: <json>\n\n`, the first chunk introduces `delta.role="assistant"`,
//! intermediate chunks carry only `delta.content`, and the terminal chunk
//! has an empty delta plus a `finish_reason`. `data: [DONE]` is emitted only
//! when the stream completed cleanly; its absence after a
//! `finish_reason:"error"` chunk is the client's truncation signal.

use crate::agent::{AgentStream, Usage};
use crate::error::GatewayError;
use crate::metrics::SessionGuard;
use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::Response;
use serde::Serialize;

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StreamChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    pub system_fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Identity shared by every chunk of one stream.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    /// `chatcmpl-<uuid>`, stable across chunks.
    pub id: String,
    pub created: u64,
    pub model: String,
    /// Session id, exposed as `system_fingerprint`.
    pub session_id: String,
    /// Prompt-side token count for the final usage object.
    pub prompt_tokens: u32,
}

impl StreamMeta {
    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<&'static str>) -> StreamChunk {
        StreamChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            system_fingerprint: self.session_id.clone(),
            usage: None,
        }
    }
}

fn frame<T: Serialize>(value: &T) -> Bytes {
    let json = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn error_event(err: &GatewayError) -> Bytes {
    frame(&serde_json::json!({
        "error": {
            "message": err.message(),
            "type": err.code().openai_type(),
            "code": err.code().as_str(),
        }
    }))
}

// ─── Emitter ─────────────────────────────────────────────────────────────────

enum Phase {
    Role,
    Pump,
    DoneMarker,
    Ended,
}

struct EmitterState {
    upstream: AgentStream,
    meta: StreamMeta,
    phase: Phase,
    sent_content: bool,
    completion_chars: usize,
    /// Session lifecycle guard. Lives inside the body stream so session-end
    /// metrics and token accounting fire when the stream is actually done
    /// (or the client disconnects), not when the handler returns.
    session: SessionGuard,
}

/// Wrap an orchestrator stream into a full SSE response. Headers are set
/// before any body byte; each event is flushed as its own body frame.
pub fn sse_response(meta: StreamMeta, upstream: AgentStream, session: SessionGuard) -> Response {
    let state = EmitterState {
        upstream,
        meta,
        phase: Phase::Role,
        sent_content: false,
        completion_chars: 0,
        session,
    };

    let body_stream = futures_util::stream::unfold(state, |mut state| async {
        use futures_util::StreamExt;
        let bytes = loop {
            match state.phase {
                Phase::Role => {
                    state.phase = Phase::Pump;
                    break frame(&state.meta.chunk(
                        ChunkDelta {
                            role: Some("assistant"),
                            content: Some(String::new()),
                        },
                        None,
                    ));
                }
                Phase::Pump => match state.upstream.next().await {
                    Some(Ok(delta)) => {
                        if delta.content.is_empty() {
                            continue;
                        }
                        state.sent_content = true;
                        state.completion_chars += delta.content.len();
                        state.session.add_completion_chars(delta.content.len());
                        break frame(&state.meta.chunk(
                            ChunkDelta {
                                role: None,
                                content: Some(delta.content),
                            },
                            None,
                        ));
                    }
                    None => {
                        // Clean termination: empty delta, stop, usage.
                        state.phase = Phase::DoneMarker;
                        let mut final_chunk =
                            state.meta.chunk(ChunkDelta::default(), Some("stop"));
                        final_chunk.usage = Some(Usage::new(
                            state.meta.prompt_tokens,
                            (state.completion_chars / 4) as u32,
                        ));
                        break frame(&final_chunk);
                    }
                    Some(Err(err)) => {
                        if state.sent_content {
                            // Partial output already on the wire: mark the
                            // stream failed and stop without [DONE].
                            state.phase = Phase::Ended;
                            tracing::warn!(
                                error_code = err.code().as_str(),
                                "stream failed after content, closing without [DONE]"
                            );
                            break frame(
                                &state.meta.chunk(ChunkDelta::default(), Some("error")),
                            );
                        }
                        // Nothing sent yet: one error event, then [DONE] so
                        // clients do not hang.
                        state.phase = Phase::DoneMarker;
                        tracing::warn!(
                            error_code = err.code().as_str(),
                            "stream failed before content, emitting error event"
                        );
                        break error_event(&err);
                    }
                },
                Phase::DoneMarker => {
                    state.phase = Phase::Ended;
                    break done_frame();
                }
                Phase::Ended => return None,
            }
        };
        Some((Ok::<_, std::convert::Infallible>(bytes), state))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::StreamDelta;
    use crate::error::Result;
    use crate::metrics::Metrics;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    fn meta() -> StreamMeta {
        StreamMeta {
            id: "chatcmpl-test".into(),
            created: 1_700_000_000,
            model: "gemini-1.5-pro".into(),
            session_id: "sess-1".into(),
            prompt_tokens: 8,
        }
    }

    fn upstream(items: Vec<Result<StreamDelta>>) -> AgentStream {
        Box::pin(futures_util::stream::iter(items))
    }

    fn session() -> SessionGuard {
        SessionGuard::begin(Arc::new(Metrics::new().unwrap()))
    }

    async fn render(items: Vec<Result<StreamDelta>>) -> String {
        let response = sse_response(meta(), upstream(items), session());
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream; charset=utf-8"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn events(raw: &str) -> Vec<serde_json::Value> {
        raw.split("\n\n")
            .filter_map(|e| e.strip_prefix("data: "))
            .filter(|d| *d != "[DONE]")
            .map(|d| serde_json::from_str(d).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn clean_stream_has_role_content_stop_done() {
        let raw = render(vec![
            Ok(StreamDelta {
                content: "Hello".into(),
            }),
            Ok(StreamDelta {
                content: " world".into(),
            }),
        ])
        .await;

        assert!(raw.trim_end().ends_with("data: [DONE]"));
        let events = events(&raw);
        assert_eq!(events.len(), 4);

        // First event: role, empty content, no finish_reason.
        assert_eq!(events[0]["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(events[0]["choices"][0]["delta"]["content"], "");
        assert!(events[0]["choices"][0]["finish_reason"].is_null());
        assert_eq!(events[0]["object"], "chat.completion.chunk");
        assert_eq!(events[0]["system_fingerprint"], "sess-1");

        // Content events never repeat the role.
        assert!(events[1]["choices"][0]["delta"].get("role").is_none());
        assert_eq!(events[1]["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(events[2]["choices"][0]["delta"]["content"], " world");

        // Terminal event: empty delta, stop, usage.
        let last = &events[3];
        assert!(last["choices"][0]["delta"].get("content").is_none());
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["prompt_tokens"], 8);
        assert_eq!(last["usage"]["total_tokens"], 8 + 11 / 4);

        // Chunk ids are stable across the stream.
        for event in &events {
            assert_eq!(event["id"], "chatcmpl-test");
        }
    }

    #[tokio::test]
    async fn error_before_content_is_error_event_plus_done() {
        let raw = render(vec![Err(GatewayError::server_unavailable("backend died"))]).await;
        assert!(raw.contains("data: [DONE]"));
        let events = events(&raw);
        // Role chunk, then the error envelope.
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["error"]["type"], "server_error");
        assert_eq!(events[1]["error"]["code"], "server_unavailable");
    }

    #[tokio::test]
    async fn error_after_content_ends_without_done() {
        let raw = render(vec![
            Ok(StreamDelta {
                content: "partial".into(),
            }),
            Err(GatewayError::operation_timeout("mid-stream death")),
        ])
        .await;

        assert!(!raw.contains("[DONE]"));
        let events = events(&raw);
        let last = events.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "error");
        assert!(last["choices"][0]["delta"].get("content").is_none());
    }

    #[tokio::test]
    async fn session_ends_when_the_body_finishes_and_carries_tokens() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let mut session = SessionGuard::begin(metrics.clone());
        session.set_prompt_tokens(8);

        let response = sse_response(
            meta(),
            upstream(vec![Ok(StreamDelta {
                content: "12345678".into(), // ~2 tokens
            })]),
            session,
        );
        // Handler has returned; the session is still live inside the body.
        assert_eq!(metrics.sessions_active.get(), 1);
        assert_eq!(metrics.sessions_deleted_total.get(), 0);

        let _ = response.into_body().collect().await.unwrap();
        assert_eq!(metrics.sessions_active.get(), 0);
        assert_eq!(metrics.sessions_deleted_total.get(), 1);
        assert_eq!(metrics.session_duration_seconds.get_sample_count(), 1);
        assert_eq!(metrics.tokens_total.with_label_values(&["input"]).get(), 8);
        assert_eq!(metrics.tokens_total.with_label_values(&["output"]).get(), 2);
    }

    #[tokio::test]
    async fn dropped_body_still_closes_the_session() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let session = SessionGuard::begin(metrics.clone());
        let response = sse_response(
            meta(),
            upstream(vec![Ok(StreamDelta {
                content: "partial".into(),
            })]),
            session,
        );
        // Client disconnect: the body is dropped before being read.
        drop(response);
        assert_eq!(metrics.sessions_active.get(), 0);
        assert_eq!(metrics.sessions_deleted_total.get(), 1);
    }

    #[tokio::test]
    async fn empty_stream_still_produces_stop_and_done() {
        let raw = render(vec![]).await;
        let events = events(&raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["choices"][0]["finish_reason"], "stop");
        assert!(raw.contains("[DONE]"));
    }

    #[test]
    fn chunk_serialization_round_trips_modulo_key_order() {
        let chunk = meta().chunk(
            ChunkDelta {
                role: Some("assistant"),
                content: Some("hi".into()),
            },
            None,
        );
        let json = serde_json::to_string(&chunk).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string(&parsed).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(&rejson).unwrap();
        assert_eq!(parsed, reparsed);
    }
}
