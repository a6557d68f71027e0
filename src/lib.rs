//! agentrelay: OpenAI-compatible chat-completion gateway for coding agents.
//!
//! The serving pipeline: the request handler parses the OpenAI shape, the
//! tiered auth middleware authenticates it, the rate limiter admits it, the
//! prompt composer layers the system prompt, the orchestrator routes it to
//! an agent behind a circuit breaker, and the SSE emitter (or a single JSON
//! body) carries the result back. Around that core: an encrypted OAuth token
//! store for MCP tool servers, a SQLite-backed admin/audit surface, and a
//! Prometheus metrics registry.

pub mod agent;
pub mod auth;
pub mod breaker;
pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod oauth;
pub mod orchestrator;
pub mod prompt;
pub mod ratelimit;
pub mod sse;
pub mod store;
pub mod util;
