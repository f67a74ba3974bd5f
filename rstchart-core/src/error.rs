//! Core error types.

use thiserror::Error;

/// Errors from the statechart engine.
///
/// Failures inside executable content never show up here; they become
/// `error.execution` / `error.communication` events on the internal queue.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("chart not found: {chart}")]
    ChartNotFound { chart: String },

    #[error("chart already exists with different content: {chart}")]
    ChartExists { chart: String },

    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("session already exists: {session_id}")]
    SessionExists { session_id: String },

    #[error("session not running: {session_id}")]
    SessionNotRunning { session_id: String },

    #[error("invalid chart definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("microstep limit of {limit} exceeded in session {session_id}")]
    MicrostepLimit { session_id: String, limit: usize },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    /// Shorthand for definition errors.
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }

    /// Returns whether the operation can be retried once the caller has
    /// drained pending work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::MicrostepLimit { .. })
    }

    /// Returns a stable error code for callers that report errors as text.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ChartNotFound { .. } => "CHART_NOT_FOUND",
            CoreError::ChartExists { .. } => "CHART_EXISTS",
            CoreError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            CoreError::SessionExists { .. } => "SESSION_EXISTS",
            CoreError::SessionNotRunning { .. } => "SESSION_NOT_RUNNING",
            CoreError::InvalidDefinition { .. } => "BAD_REQUEST",
            CoreError::MicrostepLimit { .. } => "MICROSTEP_LIMIT",
            CoreError::Json(_) => "BAD_REQUEST",
            CoreError::Yaml(_) => "BAD_REQUEST",
        }
    }
}

/// Failure reported by the expression evaluator.
///
/// The engine converts every variant into `error.execution`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvalError {
    #[error("syntax error in '{expr}': {reason}")]
    Syntax { expr: String, reason: String },

    #[error("undeclared location: {location}")]
    Undeclared { location: String },

    #[error("invalid location '{location}': {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("type error: {reason}")]
    Type { reason: String },

    #[error("unsupported: {what}")]
    Unsupported { what: String },
}

/// Failure reported by a delayed-send scheduler or an external transport.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("no scheduler configured for delayed send")]
    NoScheduler,

    #[error("no transport for target '{target}'")]
    NoTransport { target: String },

    #[error("target unreachable: {target}")]
    Unreachable { target: String },

    #[error("transport failure for '{target}': {reason}")]
    Transport { target: String, reason: String },
}

/// Failure to start an invocation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvokeError {
    #[error("unsupported invoke type: {invoke_type}")]
    UnsupportedType { invoke_type: String },

    #[error("invoke source not found: {src}")]
    SourceNotFound { src: String },

    #[error("invoke has neither src nor content")]
    MissingSource,

    #[error("child failed to start: {reason}")]
    StartFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CoreError::SessionNotFound {
            session_id: "s-1".to_string(),
        };
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
        assert!(!err.is_retryable());

        let err = CoreError::MicrostepLimit {
            session_id: "s-1".to_string(),
            limit: 10,
        };
        assert_eq!(err.error_code(), "MICROSTEP_LIMIT");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "microstep limit of 10 exceeded in session s-1"
        );
    }
}
