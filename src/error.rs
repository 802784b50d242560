use axum::{http::StatusCode, response::IntoResponse, response::Json, response::Response};
use serde::Serialize;
use thiserror::Error;

/// Convenience alias for Results with [`AgentGateError`].
pub type Result<T> = std::result::Result<T, AgentGateError>;

/// Coarse classification used by the Retry Manager to decide whether an
/// error is worth retrying. See `spec.md` §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient: OOM, timeout, network blip, sandbox creation failure.
    Retryable,
    /// Non-retryable: invalid input, fatal agent error, user cancellation.
    NonRetryable,
}

/// All errors the orchestration core can produce. Every variant carries
/// enough structured detail to populate an audit event without an empty
/// `details` object (§8 invariant: "the Audit Log never stores a failure
/// event whose details is empty").
#[derive(Error, Debug)]
pub enum AgentGateError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("work order not found: {0}")]
    NotFound(String),

    #[error("work order store is corrupt: {0}")]
    Corrupt(String),

    #[error("invalid state transition: event {event} not valid from state {from}")]
    InvalidTransition { from: String, event: String },

    #[error("concurrency limit reached: {active}/{max} runs active")]
    ConcurrencyLimit { active: usize, max: usize },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("queue is full: {0} pending events")]
    QueueFull(usize),

    #[error("OOM killed: {message}")]
    OomKilled { message: String, exit_code: Option<i32> },

    #[error("execution timeout: {message}")]
    Timeout { message: String },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("sandbox creation failed: {message}")]
    SandboxCreationFailed { message: String },

    #[error("invalid work order: {0}")]
    InvalidWorkOrder(String),

    #[error("agent fatal error: {0}")]
    AgentFatalError(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("agent crashed with exit code {exit_code:?}: {stderr_tail}")]
    AgentCrash { exit_code: Option<i32>, stderr_tail: String },

    #[error("agent timed out: {message}")]
    AgentTimeout { message: String },

    #[error("agent reported task failure: {message}")]
    AgentTaskFailure { message: String },

    #[error("typecheck failed: {0}")]
    TypecheckFailed(String),

    #[error("lint failed: {0}")]
    LintFailed(String),

    #[error("test failed: {0}")]
    TestFailed(String),

    #[error("blackbox verification failed: {0}")]
    BlackboxFailed(String),

    #[error("CI failed: {0}")]
    CiFailed(String),

    #[error("workspace error: {0}")]
    WorkspaceError(String),

    #[error("snapshot error: {0}")]
    SnapshotError(String),

    #[error("github error: {0}")]
    GithubError(String),

    #[error("system error: {0}")]
    SystemError(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl AgentGateError {
    /// Maps each variant to its `spec.md` §7 error code and retry class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Corrupt(_) => "CORRUPT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::OomKilled { .. } => "OOM_KILLED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Network { .. } => "NETWORK_ERROR",
            Self::SandboxCreationFailed { .. } => "SANDBOX_CREATION_FAILED",
            Self::InvalidWorkOrder(_) => "INVALID_WORK_ORDER",
            Self::AgentFatalError(_) => "AGENT_FATAL_ERROR",
            Self::Cancelled(_) => "CANCELLED",
            Self::AgentCrash { .. } => "AGENT_CRASH",
            Self::AgentTimeout { .. } => "AGENT_TIMEOUT",
            Self::AgentTaskFailure { .. } => "AGENT_TASK_FAILURE",
            Self::TypecheckFailed(_) => "TYPECHECK_FAILED",
            Self::LintFailed(_) => "LINT_FAILED",
            Self::TestFailed(_) => "TEST_FAILED",
            Self::BlackboxFailed(_) => "BLACKBOX_FAILED",
            Self::CiFailed(_) => "CI_FAILED",
            Self::WorkspaceError(_) => "WORKSPACE_ERROR",
            Self::SnapshotError(_) => "SNAPSHOT_ERROR",
            Self::GithubError(_) => "GITHUB_ERROR",
            Self::SystemError(_) => "SYSTEM_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Classifies retryability per §7. Used by the Retry Manager; everything
    /// not explicitly transient is treated as non-retryable.
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::OomKilled { .. }
            | Self::Timeout { .. }
            | Self::Network { .. }
            | Self::SandboxCreationFailed { .. } => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        }
    }

    /// Classifies a raw exit code / stderr pair the way the Build phase does
    /// when wrapping an `AgentDriver` result (§7, §4.8.1).
    pub fn classify_agent_failure(exit_code: Option<i32>, combined_output: &str) -> Self {
        let lower = combined_output.to_lowercase();
        if exit_code == Some(137) || exit_code == Some(-1) || lower.contains("out of memory") || lower.contains("oom") {
            return Self::OomKilled {
                message: "agent process was killed, likely out of memory".to_string(),
                exit_code,
            };
        }
        if lower.contains("timeout") || lower.contains("timed out") {
            return Self::AgentTimeout {
                message: "agent reported a timeout".to_string(),
            };
        }
        if lower.contains("econnrefused") || lower.contains("enotfound") || lower.contains("network") {
            return Self::Network {
                message: "agent failed due to a network error".to_string(),
            };
        }
        if lower.contains("sandbox") || lower.contains("container") {
            return Self::SandboxCreationFailed {
                message: "sandbox failed to come up".to_string(),
            };
        }
        let tail: String = combined_output.chars().rev().take(2000).collect::<Vec<_>>().into_iter().rev().collect();
        Self::AgentCrash { exit_code, stderr_tail: tail }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Envelope {
    success: bool,
    error: ErrorBody,
}

impl IntoResponse for AgentGateError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) | Self::InvalidWorkOrder(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) | Self::RunNotFound(_) => StatusCode::NOT_FOUND,
            Self::ConcurrencyLimit { .. } | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Envelope {
            success: false,
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
