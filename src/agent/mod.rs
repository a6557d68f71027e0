//! The agent contract.
//!
//! Backends (the Gemini/Vertex router, the Claude agent, test stubs) are
//! tagged variants behind this one trait. Streams are finite lazy sequences
//! carrying their error in-band as the final item; they are not restartable.
//! `ModelInfo` lives here, below the orchestrator, so the contract never
//! depends on orchestration types.

pub mod http;

use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Normalized request handed to an agent after validation, prompt
/// composition, and metadata extraction.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// Non-system conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Fully composed system prompt, if any.
    pub system_prompt: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: Option<f64>,
    pub session_id: String,
    pub user: Option<String>,
    /// Tool names the backend may use. Opaque to the gateway.
    pub allowed_tools: Vec<String>,
    /// MCP server names to attach. Opaque to the gateway.
    pub mcp_servers: Vec<String>,
    /// Opaque identifiers passed through to the backend unchanged.
    pub setting_sources: Vec<String>,
    /// Remaining request metadata variables.
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: Usage,
}

/// One streamed increment of assistant output.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDelta {
    pub content: String,
}

/// Finite, non-restartable stream of deltas. The first `Err` item is also
/// the last item.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    pub owned_by: String,
    pub created: u64,
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable name: used as the circuit-breaker key and metric label.
    fn name(&self) -> &str;

    /// Non-streaming completion.
    async fn execute(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Streaming completion. An `Err` here means the stream could not be
    /// started at all; failures after start travel in-band.
    async fn stream(&self, request: &CompletionRequest) -> Result<AgentStream>;

    async fn available_models(&self) -> Vec<ModelInfo>;

    async fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_totals_add_up() {
        let usage = Usage::new(11, 7);
        assert_eq!(usage.total_tokens, 18);
    }

    #[test]
    fn chat_message_wire_shape() {
        let msg: ChatMessage =
            serde_json::from_str(r#"{"role":"user","content":"Hi"}"#).unwrap();
        assert_eq!(msg.role, "user");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"Hi"}"#);
    }
}
