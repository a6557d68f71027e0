//! Binary entry point: CLI, config load, state wiring, serve loop.

use agentrelay::agent::http::HttpAgent;
use agentrelay::agent::Agent;
use agentrelay::auth::{JwksValidator, TokenVerifier};
use agentrelay::config::{AgentEndpoint, Config};
use agentrelay::gateway::{build_router, serve, AppState};
use agentrelay::metrics::Metrics;
use agentrelay::store::kv::{KvStore, MemoryKv};
use agentrelay::store::Database;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "agentrelay", version, about = "OpenAI-compatible gateway for coding agents")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Load and validate the configuration, then exit.
    CheckConfig,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn build_agent(
    endpoint: &AgentEndpoint,
    http: reqwest::Client,
    request_timeout: Duration,
) -> Arc<dyn Agent> {
    let api_key = endpoint
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    if api_key.is_none() && endpoint.api_key_env.is_some() {
        tracing::warn!(
            agent = %endpoint.name,
            env = endpoint.api_key_env.as_deref().unwrap_or(""),
            "api key env var is not set, calling upstream unauthenticated"
        );
    }
    Arc::new(HttpAgent::new(
        endpoint.name.clone(),
        endpoint.base_url.clone(),
        api_key,
        endpoint.models.clone(),
        http,
        request_timeout,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    if matches!(cli.command, Some(Command::CheckConfig)) {
        println!("configuration ok");
        return Ok(());
    }

    let metrics = Arc::new(Metrics::new().context("metrics registry init")?);
    let db = Arc::new(Database::open(&config.database_path(), metrics.clone())?);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());

    let upstream_http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(config.server.connect_timeout_secs))
        .build()
        .context("upstream http client")?;
    let request_timeout = Duration::from_secs(config.server.request_timeout_secs);

    let primary_endpoint = config
        .agents
        .primary
        .clone()
        .context("agents.primary must be configured")?;
    let primary = build_agent(&primary_endpoint, upstream_http.clone(), request_timeout);
    let fallback = config
        .agents
        .fallback
        .clone()
        .map(|endpoint| build_agent(&endpoint, upstream_http.clone(), request_timeout));

    // JWKS verifier, if an identity provider is configured.
    let mut jwks_refresh = None;
    let verifier: Option<Arc<dyn TokenVerifier>> = if config.auth.jwks_url.is_empty() {
        tracing::warn!("auth.jwks_url is not set; only public routes will be reachable");
        None
    } else {
        let validator = Arc::new(JwksValidator::new(
            config.auth.jwks_url.clone(),
            config.auth.issuer.clone(),
            config.auth.audience.clone(),
            upstream_http.clone(),
            metrics.clone(),
        ));
        if let Err(e) = validator.refresh_keys().await {
            tracing::warn!(error = %e, "initial jwks fetch failed, retrying in background");
        }
        jwks_refresh = Some(agentrelay::auth::validator::spawn_refresh_task(
            validator.clone(),
            Duration::from_secs(config.auth.jwks_refresh_secs),
        ));
        Some(validator)
    };

    let host = config.server.host.clone();
    let port = config.server.port;
    let state = AppState::new(config, metrics.clone(), db.clone(), kv, primary, fallback)
        .map_err(|e| anyhow::anyhow!(e.detailed_message()))?;

    let sampler = agentrelay::metrics::spawn_process_sampler(metrics);
    let cleanup = agentrelay::store::spawn_cleanup_task(db);

    let router = build_router(state, verifier);
    let result = serve(router, &host, port).await;

    sampler.abort();
    cleanup.abort();
    if let Some(task) = jwks_refresh {
        task.abort();
    }
    result
}
