use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum ErrorCode {
    #[serde(rename = "ERR_VALIDATION")]
    Validation,
    #[serde(rename = "ERR_DEPENDENCY")]
    Dependency,
    #[serde(rename = "ERR_SYSTEM")]
    System,
    #[serde(rename = "ERR_CANCELLED")]
    Cancelled,
    #[serde(rename = "ERR_TIMEOUT")]
    Timeout,
    #[serde(rename = "ERR_NOT_CONNECTED")]
    NotConnected,
    #[serde(rename = "ERR_PROTOCOL")]
    Protocol,
    #[serde(rename = "ERR_BOOTSTRAP")]
    Bootstrap,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ERR_VALIDATION",
            Self::Dependency => "ERR_DEPENDENCY",
            Self::System => "ERR_SYSTEM",
            Self::Cancelled => "ERR_CANCELLED",
            Self::Timeout => "ERR_TIMEOUT",
            Self::NotConnected => "ERR_NOT_CONNECTED",
            Self::Protocol => "ERR_PROTOCOL",
            Self::Bootstrap => "ERR_BOOTSTRAP",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub error: String,
    pub code: ErrorCode,
    pub trace_id: String,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code,
            trace_id: trace_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message, trace_id)
    }

    pub fn dependency(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::Dependency, message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::System, message, trace_id)
    }

    pub fn cancelled(trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, "operation cancelled", trace_id)
    }

    pub fn timeout(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message, trace_id)
    }

    pub fn not_connected(trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotConnected, "not connected", trace_id)
    }

    pub fn protocol(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new(ErrorCode::Protocol, message, trace_id)
    }

    /// Wraps a failed bootstrap step. Cancellation passes through untouched
    /// so callers can still tell it apart from a real failure.
    pub fn bootstrap(step: &str, cause: AppError) -> Self {
        if cause.is_cancelled() {
            return cause;
        }
        Self {
            error: format!("{step} failed: {}", cause.error),
            code: ErrorCode::Bootstrap,
            trace_id: cause.trace_id,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::Timeout
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.error, self.code.as_str())
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_wraps_step_name() {
        let err = AppError::bootstrap("push payload", AppError::system("adb push exited 1", "t-1"));
        assert_eq!(err.code, ErrorCode::Bootstrap);
        assert_eq!(err.error, "push payload failed: adb push exited 1");
        assert_eq!(err.trace_id, "t-1");
    }

    #[test]
    fn bootstrap_keeps_cancellation_identity() {
        let err = AppError::bootstrap("start server", AppError::cancelled("t-2"));
        assert!(err.is_cancelled());
    }

    #[test]
    fn serializes_code_as_string() {
        let value = serde_json::to_value(AppError::timeout("request timeout", "t-3"))
            .expect("serialize");
        assert_eq!(value["code"], "ERR_TIMEOUT");
        assert_eq!(value["error"], "request timeout");
    }
}
