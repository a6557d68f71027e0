//! In-process metrics registry and HTTP instrumentation.
//!
//! All metric families live in one explicitly-constructed [`Metrics`] value
//! that components receive by reference; there is no global registry lookup
//! in the hot path. The registry feeds two scrape endpoints: the Prometheus
//! text exposition format and a JSON mirror of the same samples.

use crate::util::truncate_chars;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

/// Metric label values are capped so hostile paths cannot explode series
/// cardinality.
const MAX_PATH_LABEL_CHARS: usize = 100;

// ─── Registry ────────────────────────────────────────────────────────────────

pub struct Metrics {
    registry: Registry,

    // HTTP surface
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_requests_in_flight: IntGauge,
    pub http_response_size_bytes: HistogramVec,

    // Agent / MCP operations
    pub mcp_connections_active: IntGauge,
    pub mcp_connection_errors_total: IntCounterVec,
    pub mcp_operations_total: IntCounterVec,
    pub mcp_operation_duration_seconds: HistogramVec,

    // Sessions
    pub sessions_active: IntGauge,
    pub sessions_created_total: IntCounter,
    pub sessions_deleted_total: IntCounter,
    pub session_duration_seconds: Histogram,

    // Database
    pub database_query_duration_seconds: HistogramVec,
    pub database_queries_total: IntCounterVec,
    pub database_connections_active: IntGauge,
    pub database_connection_errors_total: IntCounter,

    // Caches (token cache, JWKS cache, ...)
    pub cache_hits_total: IntCounterVec,
    pub cache_misses_total: IntCounterVec,
    pub cache_operation_duration_seconds: HistogramVec,
    pub cache_size_items: IntGaugeVec,

    // Token accounting, surfaced in platform stats
    pub tokens_total: IntCounterVec,

    // Prompt composition
    pub prompt_render_errors_total: IntCounterVec,

    // Rate limiter backend failures (fail-open events)
    pub rate_limiter_errors_total: IntCounter,

    // Process health, sampled by a background task
    pub process_threads: IntGauge,
    pub process_allocated_bytes: IntGauge,
    pub process_resident_bytes: IntGauge,
}

fn log_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    prometheus::exponential_buckets(start, factor, count).expect("valid bucket layout")
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request latency in seconds",
            )
            // 1ms .. ~10s, log-spaced
            .buckets(log_buckets(0.001, 2.0, 14)),
            &["method", "path"],
        )?;
        let http_requests_in_flight = IntGauge::new(
            "http_requests_in_flight",
            "HTTP requests currently being served",
        )?;
        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new("http_response_size_bytes", "HTTP response body size")
                .buckets(log_buckets(100.0, 10.0, 6)),
            &["method", "path"],
        )?;

        let mcp_connections_active = IntGauge::new(
            "mcp_connections_active",
            "Active upstream agent connections",
        )?;
        let mcp_connection_errors_total = IntCounterVec::new(
            Opts::new("mcp_connection_errors_total", "Upstream connection errors"),
            &["name", "type"],
        )?;
        let mcp_operations_total = IntCounterVec::new(
            Opts::new("mcp_operations_total", "Upstream agent operations"),
            &["name", "op", "status"],
        )?;
        let mcp_operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "mcp_operation_duration_seconds",
                "Upstream agent operation latency in seconds",
            )
            // 10ms .. ~30s
            .buckets(log_buckets(0.01, 2.0, 12)),
            &["name", "op"],
        )?;

        let sessions_active = IntGauge::new("sessions_active", "Active chat sessions")?;
        let sessions_created_total =
            IntCounter::new("sessions_created_total", "Chat sessions created")?;
        let sessions_deleted_total =
            IntCounter::new("sessions_deleted_total", "Chat sessions deleted")?;
        let session_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("session_duration_seconds", "Chat session lifetime")
                // 1s .. ~1h
                .buckets(log_buckets(1.0, 2.0, 12)),
        )?;

        let database_query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "database_query_duration_seconds",
                "Database query latency in seconds",
            )
            .buckets(log_buckets(0.0005, 2.0, 12)),
            &["query_type"],
        )?;
        let database_queries_total = IntCounterVec::new(
            Opts::new("database_queries_total", "Database queries"),
            &["query_type", "status"],
        )?;
        let database_connections_active = IntGauge::new(
            "database_connections_active",
            "Open database connections",
        )?;
        let database_connection_errors_total = IntCounter::new(
            "database_connection_errors_total",
            "Database connection failures",
        )?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("cache_hits_total", "Cache hits"),
            &["name"],
        )?;
        let cache_misses_total = IntCounterVec::new(
            Opts::new("cache_misses_total", "Cache misses"),
            &["name"],
        )?;
        let cache_operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cache_operation_duration_seconds",
                "Cache operation latency in seconds",
            )
            .buckets(log_buckets(0.0001, 4.0, 10)),
            &["name", "op"],
        )?;
        let cache_size_items = IntGaugeVec::new(
            Opts::new("cache_size_items", "Entries currently cached"),
            &["name"],
        )?;

        let tokens_total = IntCounterVec::new(
            Opts::new("tokens_total", "Prompt and completion tokens processed"),
            &["direction"],
        )?;

        let prompt_render_errors_total = IntCounterVec::new(
            Opts::new(
                "prompt_render_errors_total",
                "Prompt template render failures (raw content substituted)",
            ),
            &["scope"],
        )?;

        let rate_limiter_errors_total = IntCounter::new(
            "rate_limiter_errors_total",
            "Rate limiter KV failures that caused a fail-open admit",
        )?;

        let process_threads = IntGauge::new("process_threads", "OS threads in this process")?;
        let process_allocated_bytes =
            IntGauge::new("process_allocated_bytes", "Estimated allocated heap bytes")?;
        let process_resident_bytes =
            IntGauge::new("process_resident_bytes", "Resident set size in bytes")?;

        let metrics = Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            http_requests_in_flight,
            http_response_size_bytes,
            mcp_connections_active,
            mcp_connection_errors_total,
            mcp_operations_total,
            mcp_operation_duration_seconds,
            sessions_active,
            sessions_created_total,
            sessions_deleted_total,
            session_duration_seconds,
            database_query_duration_seconds,
            database_queries_total,
            database_connections_active,
            database_connection_errors_total,
            cache_hits_total,
            cache_misses_total,
            cache_operation_duration_seconds,
            cache_size_items,
            tokens_total,
            prompt_render_errors_total,
            rate_limiter_errors_total,
            process_threads,
            process_allocated_bytes,
            process_resident_bytes,
        };
        metrics.register_all()?;
        Ok(metrics)
    }

    fn register_all(&self) -> Result<(), prometheus::Error> {
        let r = &self.registry;
        r.register(Box::new(self.http_requests_total.clone()))?;
        r.register(Box::new(self.http_request_duration_seconds.clone()))?;
        r.register(Box::new(self.http_requests_in_flight.clone()))?;
        r.register(Box::new(self.http_response_size_bytes.clone()))?;
        r.register(Box::new(self.mcp_connections_active.clone()))?;
        r.register(Box::new(self.mcp_connection_errors_total.clone()))?;
        r.register(Box::new(self.mcp_operations_total.clone()))?;
        r.register(Box::new(self.mcp_operation_duration_seconds.clone()))?;
        r.register(Box::new(self.sessions_active.clone()))?;
        r.register(Box::new(self.sessions_created_total.clone()))?;
        r.register(Box::new(self.sessions_deleted_total.clone()))?;
        r.register(Box::new(self.session_duration_seconds.clone()))?;
        r.register(Box::new(self.database_query_duration_seconds.clone()))?;
        r.register(Box::new(self.database_queries_total.clone()))?;
        r.register(Box::new(self.database_connections_active.clone()))?;
        r.register(Box::new(self.database_connection_errors_total.clone()))?;
        r.register(Box::new(self.cache_hits_total.clone()))?;
        r.register(Box::new(self.cache_misses_total.clone()))?;
        r.register(Box::new(self.cache_operation_duration_seconds.clone()))?;
        r.register(Box::new(self.cache_size_items.clone()))?;
        r.register(Box::new(self.tokens_total.clone()))?;
        r.register(Box::new(self.prompt_render_errors_total.clone()))?;
        r.register(Box::new(self.rate_limiter_errors_total.clone()))?;
        r.register(Box::new(self.process_threads.clone()))?;
        r.register(Box::new(self.process_allocated_bytes.clone()))?;
        r.register(Box::new(self.process_resident_bytes.clone()))?;
        Ok(())
    }

    /// Start a timer for a named upstream operation. The returned closure
    /// records the duration and bumps the status counter exactly once.
    pub fn start_op_timer(
        &self,
        name: &str,
        op: &str,
    ) -> impl FnOnce(bool) + Send + 'static {
        let started = Instant::now();
        let duration = self
            .mcp_operation_duration_seconds
            .with_label_values(&[name, op]);
        let totals = self.mcp_operations_total.clone();
        let name = name.to_string();
        let op = op.to_string();
        move |success: bool| {
            duration.observe(started.elapsed().as_secs_f64());
            let status = if success { "success" } else { "error" };
            totals.with_label_values(&[&name, &op, status]).inc();
        }
    }

    /// Scoped in-flight counter: increments now, decrements on drop.
    pub fn in_flight(&self) -> InFlightGuard {
        self.http_requests_in_flight.inc();
        InFlightGuard(self.http_requests_in_flight.clone())
    }

    /// Scoped upstream-connection counter, held for the duration of one
    /// agent call or stream.
    pub fn upstream_connection(&self) -> InFlightGuard {
        self.mcp_connections_active.inc();
        InFlightGuard(self.mcp_connections_active.clone())
    }

    pub fn record_http(&self, method: &str, path: &str, status: u16, seconds: f64, bytes: u64) {
        self.http_requests_total
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(seconds);
        self.http_response_size_bytes
            .with_label_values(&[method, path])
            .observe(bytes as f64);
    }

    /// Sum a counter family across all label combinations. Used by the
    /// platform stats endpoint to report live request/token totals.
    pub fn sum_counter(&self, family_name: &str) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == family_name)
            .flat_map(|f| f.get_metric().iter())
            .map(|m| m.get_counter().get_value() as u64)
            .sum()
    }

    /// Text exposition format for `GET /metrics`.
    pub fn render_text(&self) -> String {
        let mut buf = String::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode_utf8(&self.registry.gather(), &mut buf) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buf
    }

    /// JSON mirror for `GET /metrics/json`:
    /// `{timestamp, metrics:[{name, help, type, labels, value|count+sum}]}`.
    pub fn render_json(&self) -> serde_json::Value {
        use prometheus::proto::MetricType;

        let mut out = Vec::new();
        for family in self.registry.gather() {
            let kind = match family.get_field_type() {
                MetricType::COUNTER => "counter",
                MetricType::GAUGE => "gauge",
                MetricType::HISTOGRAM => "histogram",
                MetricType::SUMMARY => "summary",
                MetricType::UNTYPED => "untyped",
            };
            for metric in family.get_metric() {
                let labels: serde_json::Map<String, serde_json::Value> = metric
                    .get_label()
                    .iter()
                    .map(|l| {
                        (
                            l.get_name().to_string(),
                            serde_json::Value::String(l.get_value().to_string()),
                        )
                    })
                    .collect();
                let mut entry = serde_json::json!({
                    "name": family.get_name(),
                    "help": family.get_help(),
                    "type": kind,
                    "labels": labels,
                });
                match family.get_field_type() {
                    MetricType::COUNTER => {
                        entry["value"] = metric.get_counter().get_value().into();
                    }
                    MetricType::GAUGE => {
                        entry["value"] = metric.get_gauge().get_value().into();
                    }
                    MetricType::HISTOGRAM => {
                        let h = metric.get_histogram();
                        entry["count"] = h.get_sample_count().into();
                        entry["sum"] = h.get_sample_sum().into();
                    }
                    _ => {}
                }
                out.push(entry);
            }
        }
        serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "metrics": out,
        })
    }
}

pub struct InFlightGuard(IntGauge);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

// ─── Session lifecycle ───────────────────────────────────────────────────────

/// Tracks one chat session end to end. Creation bumps the created counter
/// and the active gauge; dropping records the duration, the deleted counter,
/// and accumulated token usage. For streaming responses the guard lives
/// inside the response body, so it fires when the stream actually ends
/// (including client disconnect), not when the handler returns.
pub struct SessionGuard {
    metrics: Arc<Metrics>,
    started: Instant,
    prompt_tokens: u64,
    completion_tokens: u64,
    completion_chars: usize,
}

impl SessionGuard {
    pub fn begin(metrics: Arc<Metrics>) -> Self {
        metrics.sessions_created_total.inc();
        metrics.sessions_active.inc();
        Self {
            metrics,
            started: Instant::now(),
            prompt_tokens: 0,
            completion_tokens: 0,
            completion_chars: 0,
        }
    }

    pub fn set_prompt_tokens(&mut self, tokens: u32) {
        self.prompt_tokens = u64::from(tokens);
    }

    /// Exact completion tokens, as reported by a backend.
    pub fn add_completion_tokens(&mut self, tokens: u32) {
        self.completion_tokens += u64::from(tokens);
    }

    /// Streamed content bytes, converted with the ~4 bytes/token estimate
    /// when the session closes. Counting per chunk keeps partial streams
    /// accounted for.
    pub fn add_completion_chars(&mut self, chars: usize) {
        self.completion_chars += chars;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.metrics.sessions_active.dec();
        self.metrics.sessions_deleted_total.inc();
        self.metrics
            .session_duration_seconds
            .observe(self.started.elapsed().as_secs_f64());

        let completion = self.completion_tokens + (self.completion_chars / 4) as u64;
        if self.prompt_tokens > 0 {
            self.metrics
                .tokens_total
                .with_label_values(&["input"])
                .inc_by(self.prompt_tokens);
        }
        if completion > 0 {
            self.metrics
                .tokens_total
                .with_label_values(&["output"])
                .inc_by(completion);
        }
    }
}

// ─── Path normalization ──────────────────────────────────────────────────────

/// Normalize a request path into a bounded-cardinality metric label.
///
/// Prefers the router's matched route pattern when available. Otherwise any
/// segment that parses as an integer or looks like a UUID is replaced with
/// `{id}`, and the result is capped at 100 characters.
pub fn normalize_path(matched_route: Option<&str>, raw_path: &str) -> String {
    static UUID_SEGMENT: OnceLock<regex::Regex> = OnceLock::new();

    if let Some(route) = matched_route {
        return truncate_chars(route, MAX_PATH_LABEL_CHARS).to_string();
    }

    let uuid_re = UUID_SEGMENT.get_or_init(|| {
        regex::Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        )
        .expect("valid regex")
    });

    let normalized: Vec<&str> = raw_path
        .split('/')
        .map(|segment| {
            if !segment.is_empty()
                && (segment.parse::<i64>().is_ok() || uuid_re.is_match(segment))
            {
                "{id}"
            } else {
                segment
            }
        })
        .collect();
    truncate_chars(&normalized.join("/"), MAX_PATH_LABEL_CHARS).to_string()
}

// ─── HTTP middleware ─────────────────────────────────────────────────────────

/// Axum middleware that instruments every response with status, latency, and
/// body size. The scrape endpoints themselves are excluded so scraping does
/// not feed back into the series it reads.
pub async fn http_metrics_middleware(
    axum::extract::State(metrics): axum::extract::State<Arc<Metrics>>,
    matched: Option<axum::extract::MatchedPath>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let path = req.uri().path().to_string();
    if path == "/metrics" || path == "/metrics/json" {
        return next.run(req).await;
    }

    let method = req.method().as_str().to_string();
    let label = normalize_path(matched.as_ref().map(|m| m.as_str()), &path);

    let _guard = metrics.in_flight();
    let started = Instant::now();
    let response = next.run(req).await;

    let status = response.status().as_u16();
    let bytes = {
        use axum::body::HttpBody;
        response.body().size_hint().exact().unwrap_or(0)
    };
    metrics.record_http(&method, &label, status, started.elapsed().as_secs_f64(), bytes);
    response
}

// ─── Process sampler ─────────────────────────────────────────────────────────

/// Spawn the background task that samples process-level gauges every 15s.
/// Returns the task handle so the caller can abort it on shutdown.
pub fn spawn_process_sampler(metrics: Arc<Metrics>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(15));
        loop {
            tick.tick().await;
            let sample = ProcessSample::read();
            metrics.process_threads.set(sample.threads);
            metrics.process_allocated_bytes.set(sample.data_bytes);
            metrics.process_resident_bytes.set(sample.resident_bytes);
        }
    })
}

#[derive(Debug, Default)]
struct ProcessSample {
    threads: i64,
    data_bytes: i64,
    resident_bytes: i64,
}

impl ProcessSample {
    /// Best-effort read of `/proc/self/status`; zeroes on platforms without
    /// procfs.
    fn read() -> Self {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return Self::default();
        };
        let mut sample = Self::default();
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("Threads:") {
                sample.threads = rest.trim().parse().unwrap_or(0);
            } else if let Some(rest) = line.strip_prefix("VmRSS:") {
                sample.resident_bytes = parse_kb(rest);
            } else if let Some(rest) = line.strip_prefix("VmData:") {
                sample.data_bytes = parse_kb(rest);
            }
        }
        sample
    }
}

fn parse_kb(field: &str) -> i64 {
    field
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<i64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
