//! Gateway configuration.
//!
//! One TOML file, deserialized into plain records at startup. Every section
//! has serviceable defaults so a bare `[server]` block boots a working
//! gateway against the in-memory KV and an on-disk SQLite file. Unknown keys
//! are warned about (likely typos) rather than silently ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub breaker: BreakerSection,
    pub oauth: OauthConfig,
    pub prompts: PromptsConfig,
    pub agents: AgentsConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request body cap in bytes.
    pub max_body_bytes: usize,
    /// Upstream connect timeout.
    pub connect_timeout_secs: u64,
    /// Max silence between stream chunks before the stream is abandoned.
    pub stream_idle_timeout_secs: u64,
    /// Total budget for a non-streaming completion.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8085,
            max_body_bytes: 524_288,
            connect_timeout_secs: 10,
            stream_idle_timeout_secs: 60,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWKS document URL of the identity provider. Empty disables bearer
    /// verification (every request is anonymous; admin routes then reject).
    pub jwks_url: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// How often the JWKS document is re-fetched.
    pub jwks_refresh_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwks_url: String::new(),
            issuer: None,
            audience: None,
            jwks_refresh_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub rate_per_minute: u32,
    pub burst: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: 100,
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_secs: u64,
    pub max_concurrent_requests: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout_secs: 30,
            max_concurrent_requests: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OauthConfig {
    /// Hex-encoded 32-byte key for token encryption at rest. When empty a
    /// random per-process key is generated (tokens do not survive restart).
    pub encryption_key_hex: String,
    /// Tokens within this many seconds of expiry count as expiring soon.
    pub refresh_threshold_secs: u64,
    pub providers: HashMap<String, OauthProviderConfig>,
}

impl Default for OauthConfig {
    fn default() -> Self {
        Self {
            encryption_key_hex: String::new(),
            refresh_threshold_secs: 300,
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OauthProviderConfig {
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    /// Name of the environment variable holding the client secret; the
    /// secret itself never lives in the config file.
    #[serde(default)]
    pub client_secret_env: Option<String>,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromptsConfig {
    /// Always-first platform prompt (may be a template).
    pub platform: String,
    /// Org/user-scoped prompt layers, composed by priority descending.
    pub scoped: Vec<ScopedPrompt>,
    /// Workflow name → prompt template.
    pub workflows: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopedPrompt {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AgentsConfig {
    pub primary: Option<AgentEndpoint>,
    pub fallback: Option<AgentEndpoint>,
    pub fallback_enabled: bool,
    /// Model-id prefixes routed to the primary agent (e.g. "gemini-").
    pub primary_model_prefixes: Vec<String>,
    /// Model-id prefixes routed to the fallback agent (e.g. "claude-").
    pub fallback_model_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEndpoint {
    pub name: String,
    pub base_url: String,
    /// Environment variable carrying the upstream API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models advertised by this agent on `/v1/models`.
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "agentrelay.db".to_string(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the default location under the
    /// user config directory.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path(),
        };
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::parse(&raw, &path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self> {
        let table: toml::Table = raw
            .parse()
            .with_context(|| format!("invalid TOML in {}", path.display()))?;
        let value = toml::Value::Table(table);
        let mut unknown = Vec::new();
        let config: Config = serde_ignored::deserialize(value, |ignored| {
            unknown.push(ignored.to_string());
        })
        .with_context(|| format!("invalid config in {}", path.display()))?;
        for key in unknown {
            tracing::warn!(%key, "unknown config key (typo?)");
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.oauth.encryption_key_hex.is_empty() {
            let decoded = hex::decode(self.oauth.encryption_key_hex.trim())
                .context("oauth.encryption_key_hex is not valid hex")?;
            anyhow::ensure!(
                decoded.len() == 32,
                "oauth.encryption_key_hex must decode to 32 bytes, got {}",
                decoded.len()
            );
        }
        anyhow::ensure!(
            self.limits.rate_per_minute > 0,
            "limits.rate_per_minute must be positive"
        );
        anyhow::ensure!(self.limits.burst > 0, "limits.burst must be positive");
        anyhow::ensure!(
            self.breaker.failure_threshold > 0,
            "breaker.failure_threshold must be positive"
        );
        if let Some(fallback) = &self.agents.fallback {
            if let Some(primary) = &self.agents.primary {
                anyhow::ensure!(
                    fallback.name != primary.name,
                    "agents.primary and agents.fallback must have distinct names"
                );
            }
        }
        Ok(())
    }

    /// Resolved database path with `~` expansion.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).into_owned())
    }
}

fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "agentrelay", "agentrelay")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
