//! Typed error taxonomy for the gateway.
//!
//! Every failure that crosses a component boundary is a [`GatewayError`]:
//! a stable [`ErrorCode`], a human message, optional operation/resource
//! context, string metadata, and an optional source chain. HTTP status and
//! the `retryable`/`temporary` flags are derived from the code alone, so a
//! handler never has to guess how to map an error onto the wire.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

// ─── Codes ───────────────────────────────────────────────────────────────────

/// Stable error codes. The HTTP status and retry flags of every
/// [`GatewayError`] are a pure function of its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Connection,
    ConnectionTimeout,
    ConnectionRefused,
    ToolExecution,
    ToolNotFound,
    InvalidArguments,
    Timeout,
    OperationTimeout,
    DeadlineExceeded,
    Authentication,
    AuthExpired,
    AuthInvalid,
    OauthFailure,
    RateLimit,
    QuotaExceeded,
    Throttled,
    Server,
    ServerUnavailable,
    ServerInternal,
    CircuitOpen,
    CircuitHalfOpen,
    TooManyRequests,
    InvalidRequest,
    InvalidConfig,
    MissingConfig,
    ConfigValidation,
    ResourceNotFound,
    ResourceLocked,
    ResourceExhausted,
    Network,
    Dns,
    Tls,
}

impl ErrorCode {
    /// Wire name of the code (`snake_case`, matches the serialized form).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::ConnectionTimeout => "connection_timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::ToolExecution => "tool_execution",
            Self::ToolNotFound => "tool_not_found",
            Self::InvalidArguments => "invalid_arguments",
            Self::Timeout => "timeout",
            Self::OperationTimeout => "operation_timeout",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Authentication => "authentication",
            Self::AuthExpired => "auth_expired",
            Self::AuthInvalid => "auth_invalid",
            Self::OauthFailure => "oauth_failure",
            Self::RateLimit => "rate_limit",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Throttled => "throttled",
            Self::Server => "server",
            Self::ServerUnavailable => "server_unavailable",
            Self::ServerInternal => "server_internal",
            Self::CircuitOpen => "circuit_open",
            Self::CircuitHalfOpen => "circuit_half_open",
            Self::TooManyRequests => "too_many_requests",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidConfig => "invalid_config",
            Self::MissingConfig => "missing_config",
            Self::ConfigValidation => "config_validation",
            Self::ResourceNotFound => "resource_not_found",
            Self::ResourceLocked => "resource_locked",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Network => "network",
            Self::Dns => "dns",
            Self::Tls => "tls",
        }
    }

    /// HTTP status this code maps to.
    pub fn http_status(self) -> u16 {
        match self {
            Self::Connection | Self::ConnectionRefused => 503,
            Self::ConnectionTimeout => 504,
            Self::ToolExecution => 500,
            Self::ToolNotFound => 404,
            Self::InvalidArguments => 400,
            Self::Timeout | Self::OperationTimeout | Self::DeadlineExceeded => 504,
            Self::Authentication | Self::AuthExpired | Self::AuthInvalid | Self::OauthFailure => {
                401
            }
            Self::RateLimit | Self::Throttled | Self::QuotaExceeded => 429,
            Self::Server | Self::ServerInternal => 500,
            Self::ServerUnavailable => 503,
            Self::CircuitOpen | Self::CircuitHalfOpen => 503,
            Self::TooManyRequests => 429,
            Self::InvalidRequest => 400,
            Self::InvalidConfig | Self::ConfigValidation => 400,
            Self::MissingConfig => 500,
            Self::ResourceNotFound => 404,
            Self::ResourceLocked => 409,
            Self::ResourceExhausted => 429,
            Self::Network | Self::Dns => 503,
            Self::Tls => 503,
        }
    }

    /// Whether a caller may retry the same request.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::ConnectionTimeout
                | Self::ConnectionRefused
                | Self::Timeout
                | Self::OperationTimeout
                | Self::DeadlineExceeded
                | Self::AuthExpired
                | Self::RateLimit
                | Self::Throttled
                | Self::ServerUnavailable
                | Self::CircuitOpen
                | Self::CircuitHalfOpen
                | Self::TooManyRequests
                | Self::ResourceLocked
                | Self::Network
                | Self::Dns
        )
    }

    /// Whether the underlying condition is expected to clear on its own.
    pub fn temporary(self) -> bool {
        // auth_expired is retryable (after a refresh) but not temporary.
        self.retryable() && self != Self::AuthExpired
    }

    /// OpenAI-style error `type` string used in client-facing envelopes.
    pub fn openai_type(self) -> &'static str {
        match self.http_status() {
            400 | 404 | 409 => "invalid_request_error",
            401 | 403 => "authentication_error",
            429 => "rate_limit_error",
            _ => "server_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Error value ─────────────────────────────────────────────────────────────

/// The one error type propagated from the core to the HTTP boundary.
#[derive(Debug, thiserror::Error)]
#[error("{}", self.detailed_message())]
pub struct GatewayError {
    code: ErrorCode,
    message: String,
    operation: Option<String>,
    resource: Option<String>,
    timestamp: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

macro_rules! constructors {
    ($($fn_name:ident => $code:ident),* $(,)?) => {
        $(
            pub fn $fn_name(message: impl Into<String>) -> Self {
                Self::new(ErrorCode::$code, message)
            }
        )*
    };
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            operation: None,
            resource: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            cause: None,
        }
    }

    #[rustfmt::skip]
    constructors! {
        connection => Connection,
        connection_timeout => ConnectionTimeout,
        connection_refused => ConnectionRefused,
        tool_execution => ToolExecution,
        tool_not_found => ToolNotFound,
        invalid_arguments => InvalidArguments,
        timeout => Timeout,
        operation_timeout => OperationTimeout,
        deadline_exceeded => DeadlineExceeded,
        authentication => Authentication,
        auth_expired => AuthExpired,
        auth_invalid => AuthInvalid,
        oauth_failure => OauthFailure,
        rate_limit => RateLimit,
        quota_exceeded => QuotaExceeded,
        throttled => Throttled,
        server => Server,
        server_unavailable => ServerUnavailable,
        server_internal => ServerInternal,
        circuit_open => CircuitOpen,
        circuit_half_open => CircuitHalfOpen,
        too_many_requests => TooManyRequests,
        invalid_request => InvalidRequest,
        invalid_config => InvalidConfig,
        missing_config => MissingConfig,
        config_validation => ConfigValidation,
        resource_not_found => ResourceNotFound,
        resource_locked => ResourceLocked,
        resource_exhausted => ResourceExhausted,
        network => Network,
        dns => Dns,
        tls => Tls,
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    pub fn temporary(&self) -> bool {
        self.code.temporary()
    }

    /// Attach the operation that was being performed. Fluent.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Attach the resource being operated on. Fluent.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Attach one metadata key/value pair. Fluent.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause. Fluent.
    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Deterministic single-line rendering: code, operation, resource,
    /// metadata (JSON, sorted keys), and cause.
    pub fn detailed_message(&self) -> String {
        let mut out = format!("[{}] {}", self.code.as_str(), self.message);
        if let Some(op) = &self.operation {
            out.push_str(&format!(" (operation: {op})"));
        }
        if let Some(res) = &self.resource {
            out.push_str(&format!(" (resource: {res})"));
        }
        if !self.metadata.is_empty() {
            // BTreeMap keeps key order stable.
            let json = serde_json::to_string(&self.metadata).unwrap_or_default();
            out.push_str(&format!(" metadata={json}"));
        }
        if let Some(cause) = &self.cause {
            out.push_str(&format!(": {cause}"));
        }
        out
    }

    /// Flat string-keyed map for structured logging. Metadata entries are
    /// prefixed with `meta_`.
    pub fn log_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("error_code".to_string(), self.code.as_str().to_string());
        fields.insert("error_message".to_string(), self.message.clone());
        fields.insert("retryable".to_string(), self.retryable().to_string());
        fields.insert("temporary".to_string(), self.temporary().to_string());
        if let Some(op) = &self.operation {
            fields.insert("operation".to_string(), op.clone());
        }
        if let Some(res) = &self.resource {
            fields.insert("resource".to_string(), res.clone());
        }
        if let Some(cause) = &self.cause {
            fields.insert("cause".to_string(), cause.to_string());
        }
        for (k, v) in &self.metadata {
            fields.insert(format!("meta_{k}"), v.clone());
        }
        fields
    }

    /// Client-facing JSON envelope, shared by every HTTP error path.
    pub fn to_envelope(&self, request_id: &str) -> serde_json::Value {
        let mut error = serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "type": self.code.openai_type(),
            "retryable": self.retryable(),
            "temporary": self.temporary(),
        });
        if let Some(op) = &self.operation {
            error["operation"] = serde_json::Value::String(op.clone());
        }
        if let Some(res) = &self.resource {
            error["resource"] = serde_json::Value::String(res.clone());
        }
        if !self.metadata.is_empty() {
            error["metadata"] = serde_json::to_value(&self.metadata).unwrap_or_default();
        }
        serde_json::json!({
            "error": error,
            "request_id": request_id,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

impl Clone for GatewayError {
    fn clone(&self) -> Self {
        Self {
            code: self.code,
            message: self.message.clone(),
            operation: self.operation.clone(),
            resource: self.resource.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            // Causes are not cloneable; keep the rendered text instead.
            cause: self.cause.as_ref().map(|c| {
                Box::from(c.to_string()) as Box<dyn std::error::Error + Send + Sync>
            }),
        }
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

// ─── Backend error classification ────────────────────────────────────────────

fn pattern(cell: &'static OnceLock<regex::Regex>, pat: &str) -> &'static regex::Regex {
    cell.get_or_init(|| regex::Regex::new(pat).expect("valid regex"))
}

/// Classify an arbitrary backend failure into the taxonomy.
///
/// Already-typed errors keep their code; only operation/resource are
/// updated, which makes the classification idempotent. Untyped errors are
/// matched against message patterns in a fixed precedence order, falling
/// back to `tool_execution` for tool calls and `server` otherwise.
pub fn wrap_backend_error(operation: &str, resource: &str, err: anyhow::Error) -> GatewayError {
    static TIMEOUT: OnceLock<regex::Regex> = OnceLock::new();
    static REFUSED: OnceLock<regex::Regex> = OnceLock::new();
    static CONNECT: OnceLock<regex::Regex> = OnceLock::new();
    static AUTH: OnceLock<regex::Regex> = OnceLock::new();
    static RATE: OnceLock<regex::Regex> = OnceLock::new();
    static TOOL: OnceLock<regex::Regex> = OnceLock::new();

    let err = match err.downcast::<GatewayError>() {
        Ok(typed) => {
            return typed.with_operation(operation).with_resource(resource);
        }
        Err(err) => err,
    };

    // tokio's deadline sentinel classifies without string matching.
    if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
        return GatewayError::operation_timeout("operation deadline exceeded")
            .with_operation(operation)
            .with_resource(resource)
            .with_cause(err.to_string());
    }

    let message = err.to_string();
    let lower = message.to_lowercase();

    let code = if pattern(&TIMEOUT, r"timeout|deadline").is_match(&lower) {
        ErrorCode::OperationTimeout
    } else if pattern(&REFUSED, r"connection refused").is_match(&lower) {
        ErrorCode::ConnectionRefused
    } else if pattern(&CONNECT, r"connection|connect").is_match(&lower) {
        ErrorCode::Connection
    } else if pattern(&AUTH, r"unauthorized|auth").is_match(&lower) {
        ErrorCode::Authentication
    } else if pattern(&RATE, r"rate limit|too many requests").is_match(&lower) {
        ErrorCode::RateLimit
    } else if pattern(&TOOL, r"tool not found|unknown tool").is_match(&lower) {
        ErrorCode::ToolNotFound
    } else if operation == "call_tool" {
        ErrorCode::ToolExecution
    } else {
        ErrorCode::Server
    };

    GatewayError::new(code, message)
        .with_operation(operation)
        .with_resource(resource)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::Connection,
        ErrorCode::ConnectionTimeout,
        ErrorCode::ConnectionRefused,
        ErrorCode::ToolExecution,
        ErrorCode::ToolNotFound,
        ErrorCode::InvalidArguments,
        ErrorCode::Timeout,
        ErrorCode::OperationTimeout,
        ErrorCode::DeadlineExceeded,
        ErrorCode::Authentication,
        ErrorCode::AuthExpired,
        ErrorCode::AuthInvalid,
        ErrorCode::OauthFailure,
        ErrorCode::RateLimit,
        ErrorCode::QuotaExceeded,
        ErrorCode::Throttled,
        ErrorCode::Server,
        ErrorCode::ServerUnavailable,
        ErrorCode::ServerInternal,
        ErrorCode::CircuitOpen,
        ErrorCode::CircuitHalfOpen,
        ErrorCode::TooManyRequests,
        ErrorCode::InvalidRequest,
        ErrorCode::InvalidConfig,
        ErrorCode::MissingConfig,
        ErrorCode::ConfigValidation,
        ErrorCode::ResourceNotFound,
        ErrorCode::ResourceLocked,
        ErrorCode::ResourceExhausted,
        ErrorCode::Network,
        ErrorCode::Dns,
        ErrorCode::Tls,
    ];

    #[test]
    fn status_and_flags_are_functions_of_code() {
        for &code in ALL_CODES {
            let a = GatewayError::new(code, "one").with_operation("op_a");
            let b = GatewayError::new(code, "two").with_resource("res_b");
            assert_eq!(a.http_status(), b.http_status(), "{code}");
            assert_eq!(a.retryable(), b.retryable(), "{code}");
            assert_eq!(a.temporary(), b.temporary(), "{code}");
        }
    }

    #[test]
    fn auth_expired_is_the_only_retryable_auth_code() {
        assert!(GatewayError::auth_expired("x").retryable());
        assert!(!GatewayError::authentication("x").retryable());
        assert!(!GatewayError::auth_invalid("x").retryable());
        assert!(!GatewayError::oauth_failure("x").retryable());
        // Retryable after refresh, but the condition does not clear itself.
        assert!(!GatewayError::auth_expired("x").temporary());
    }

    #[test]
    fn quota_exceeded_is_429_but_not_retryable() {
        let err = GatewayError::quota_exceeded("monthly cap reached");
        assert_eq!(err.http_status(), 429);
        assert!(!err.retryable());
        assert!(!err.temporary());
    }

    #[test]
    fn circuit_codes_are_503_and_retryable() {
        for err in [
            GatewayError::circuit_open("open"),
            GatewayError::circuit_half_open("probing"),
        ] {
            assert_eq!(err.http_status(), 503);
            assert!(err.retryable());
            assert!(err.temporary());
        }
    }

    #[test]
    fn resource_locked_is_409_retryable() {
        let err = GatewayError::resource_locked("session busy");
        assert_eq!(err.http_status(), 409);
        assert!(err.retryable());
    }

    #[test]
    fn detailed_message_is_deterministic() {
        let err = GatewayError::connection("refused by peer")
            .with_operation("execute")
            .with_resource("agent/gemini")
            .with_metadata("attempt", "2")
            .with_metadata("host", "upstream");
        let a = err.detailed_message();
        assert!(a.contains("[connection] refused by peer"));
        assert!(a.contains("(operation: execute)"));
        assert!(a.contains("(resource: agent/gemini)"));
        assert!(a.contains(r#""attempt":"2""#));
        assert!(a.contains(r#""host":"upstream""#));
        assert_eq!(a, err.detailed_message());
    }

    #[test]
    fn log_fields_prefix_metadata() {
        let err = GatewayError::rate_limit("slow down")
            .with_operation("chat_completion")
            .with_metadata("retry_after", "30");
        let fields = err.log_fields();
        assert_eq!(fields["error_code"], "rate_limit");
        assert_eq!(fields["operation"], "chat_completion");
        assert_eq!(fields["meta_retry_after"], "30");
        assert_eq!(fields["retryable"], "true");
    }

    #[test]
    fn wrap_classifies_timeout_messages() {
        let err = wrap_backend_error("execute", "agent", anyhow::anyhow!("request timeout"));
        assert_eq!(err.code(), ErrorCode::OperationTimeout);
        let err = wrap_backend_error("execute", "agent", anyhow::anyhow!("deadline passed"));
        assert_eq!(err.code(), ErrorCode::OperationTimeout);
    }

    #[test]
    fn wrap_classifies_connection_messages() {
        let err = wrap_backend_error("execute", "a", anyhow::anyhow!("connection refused"));
        assert_eq!(err.code(), ErrorCode::ConnectionRefused);
        let err = wrap_backend_error("execute", "a", anyhow::anyhow!("failed to connect to host"));
        assert_eq!(err.code(), ErrorCode::Connection);
    }

    #[test]
    fn wrap_classifies_auth_rate_and_tool() {
        assert_eq!(
            wrap_backend_error("x", "r", anyhow::anyhow!("401 unauthorized")).code(),
            ErrorCode::Authentication
        );
        assert_eq!(
            wrap_backend_error("x", "r", anyhow::anyhow!("rate limit exceeded")).code(),
            ErrorCode::RateLimit
        );
        assert_eq!(
            wrap_backend_error("x", "r", anyhow::anyhow!("tool not found: web_search")).code(),
            ErrorCode::ToolNotFound
        );
    }

    #[test]
    fn wrap_falls_back_by_operation() {
        assert_eq!(
            wrap_backend_error("call_tool", "r", anyhow::anyhow!("boom")).code(),
            ErrorCode::ToolExecution
        );
        assert_eq!(
            wrap_backend_error("execute", "r", anyhow::anyhow!("boom")).code(),
            ErrorCode::Server
        );
    }

    #[test]
    fn wrap_is_idempotent() {
        let once = wrap_backend_error("execute", "agent", anyhow::anyhow!("rate limit hit"));
        let twice = wrap_backend_error("execute", "agent", anyhow::Error::new(once.clone()));
        assert_eq!(once.code(), twice.code());
        assert_eq!(once.message(), twice.message());
        assert_eq!(once.operation(), twice.operation());
        assert_eq!(once.resource(), twice.resource());
    }

    #[test]
    fn wrap_preserves_typed_code_but_updates_context() {
        let typed = GatewayError::quota_exceeded("cap").with_operation("old_op");
        let wrapped = wrap_backend_error("new_op", "new_res", anyhow::Error::new(typed));
        assert_eq!(wrapped.code(), ErrorCode::QuotaExceeded);
        assert_eq!(wrapped.operation(), Some("new_op"));
        assert_eq!(wrapped.resource(), Some("new_res"));
    }

    #[test]
    fn envelope_carries_request_id_and_type() {
        let err = GatewayError::invalid_request("messages array must not be empty");
        let env = err.to_envelope("req-123");
        assert_eq!(env["request_id"], "req-123");
        assert_eq!(env["error"]["code"], "invalid_request");
        assert_eq!(env["error"]["type"], "invalid_request_error");
        assert_eq!(env["error"]["retryable"], false);
    }
}
