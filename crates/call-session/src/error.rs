//! Error types for the call-session core
//!
//! Errors are split by how they reach the application:
//!
//! - **Configuration** - endpoint or account setup failed. Construction of the
//!   [`SessionManager`](crate::SessionManager) fails as a whole; no partially
//!   initialised manager is ever returned.
//! - **Protocol** - the protocol engine rejected a command (make call, answer,
//!   hang up). Returned to the caller of that command; the registry keeps the
//!   call where it was.
//! - **MediaBinding** - attaching negotiated audio to the sound device failed.
//!   Only ever delivered through the error sink, never fails the call.
//!
//! A call id that is absent from every partition is *not* an error: answering,
//! hanging up or querying a call that just disconnected is an expected race.
//!
//! ```rust
//! use sipdesk_call_session::{SessionError, EngineError};
//!
//! let err = SessionError::protocol("answer", EngineError::new("call.answer", "INVALID_OPERATION"));
//! assert_eq!(err.category(), "protocol");
//! assert!(!err.is_recoverable());
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::call::CallId;

/// Result type alias for call-session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Result type alias for protocol engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the session manager and its components
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Endpoint/account setup or configuration validation failed
    #[error("Invalid configuration: {field} - {reason}")]
    Configuration { field: String, reason: String },

    /// A command was rejected by the protocol engine
    #[error("Protocol error during {operation}: {source}")]
    Protocol {
        operation: String,
        #[source]
        source: EngineError,
    },

    /// Audio device attach failed after media became ready
    #[error("Media binding failed for call {call_id}: {reason}")]
    MediaBinding { call_id: CallId, reason: String },

    /// The engine reported a call id that is already registered
    #[error("Call already exists: {call_id}")]
    CallAlreadyExists { call_id: CallId },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SessionError {
    /// Create a configuration error
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error for the named engine operation
    pub fn protocol(operation: impl Into<String>, source: EngineError) -> Self {
        Self::Protocol {
            operation: operation.into(),
            source,
        }
    }

    /// Create a media binding error
    pub fn media_binding(call_id: CallId, reason: impl Into<String>) -> Self {
        Self::MediaBinding {
            call_id,
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Short category label, useful for grouping errors in logs
    pub fn category(&self) -> &'static str {
        match self {
            SessionError::Configuration { .. } => "configuration",
            SessionError::Protocol { .. } => "protocol",
            SessionError::MediaBinding { .. } => "media",
            SessionError::CallAlreadyExists { .. } => "registry",
            SessionError::Internal { .. } => "internal",
        }
    }

    /// Whether retrying the same operation later may succeed
    ///
    /// A media binding failure may clear once the device is available again;
    /// everything else needs a change of input or configuration first.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SessionError::MediaBinding { .. })
    }
}

/// Source position attached to an engine error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Engine reason for a call object the stack has already torn down
pub const SESSION_TERMINATED: &str = "SESSION_TERMINATED";

/// Error object produced by the protocol engine
///
/// Mirrors what SIP stacks usually hand back: the failing API (`title`), a
/// short status (`reason`), a longer human-readable description (`detail`) and
/// where inside the stack the failure was raised.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{title}: {reason}")]
pub struct EngineError {
    pub title: String,
    pub reason: String,
    pub detail: String,
    pub location: Option<SourceLocation>,
}

impl EngineError {
    pub fn new(title: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            reason: reason.into(),
            detail: String::new(),
            location: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.location = Some(SourceLocation {
            file: file.into(),
            line,
        });
        self
    }
    /// Whether the call this error refers to no longer exists in the engine
    pub fn is_session_terminated(&self) -> bool {
        self.reason == SESSION_TERMINATED
    }
}

/// Payload delivered to the host error sink
///
/// Flattened to plain strings so it can cross a foreign-function boundary
/// unchanged: `(title, reason, detail, source file, source line)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub title: String,
    pub reason: String,
    pub detail: String,
    pub source_location: Option<SourceLocation>,
}

impl ErrorReport {
    pub fn new(title: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            reason: reason.into(),
            detail: String::new(),
            source_location: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.title, self.reason)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        if let Some(location) = &self.source_location {
            write!(f, " at {}", location)?;
        }
        Ok(())
    }
}

impl From<&EngineError> for ErrorReport {
    fn from(err: &EngineError) -> Self {
        Self {
            title: err.title.clone(),
            reason: err.reason.clone(),
            detail: err.detail.clone(),
            source_location: err.location.clone(),
        }
    }
}

impl From<&SessionError> for ErrorReport {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Protocol { operation, source } => {
                let mut report = ErrorReport::from(source);
                if report.detail.is_empty() {
                    report.detail = format!("during {}", operation);
                }
                report
            }
            SessionError::MediaBinding { call_id, reason } => {
                ErrorReport::new("Media binding failed", reason.clone())
                    .with_detail(format!("call {}", call_id))
            }
            other => ErrorReport::new(other.category(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_report_keeps_engine_fields() {
        let engine_err = EngineError::new("call.hangup", "SESSION_TERMINATED")
            .with_detail("INVITE session already terminated")
            .with_location("session.rs", 412);
        let err = SessionError::protocol("hang_up", engine_err);

        let report = ErrorReport::from(&err);
        assert_eq!(report.title, "call.hangup");
        assert_eq!(report.reason, "SESSION_TERMINATED");
        assert_eq!(report.detail, "INVITE session already terminated");
        assert_eq!(report.source_location.as_ref().map(|l| l.line), Some(412));
        assert_eq!(
            report.to_string(),
            "call.hangup: SESSION_TERMINATED (INVITE session already terminated) at session.rs:412"
        );
    }

    #[test]
    fn test_protocol_error_report_falls_back_to_operation() {
        let err = SessionError::protocol("answer", EngineError::new("call.answer", "INVALID_ARGUMENT"));
        let report = ErrorReport::from(&err);
        assert_eq!(report.detail, "during answer");
    }

    #[test]
    fn test_categories() {
        let call_id = CallId::from("abc");
        assert_eq!(SessionError::configuration("domain", "empty").category(), "configuration");
        assert_eq!(SessionError::media_binding(call_id.clone(), "no device").category(), "media");
        assert_eq!(SessionError::CallAlreadyExists { call_id }.category(), "registry");
        assert!(SessionError::media_binding(CallId::from("x"), "busy").is_recoverable());
        assert!(!SessionError::internal("boom").is_recoverable());
    }
}
