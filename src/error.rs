//! Error types for the discovery engine.
//!
//! Client errors (a malformed request or an address space that is too large) are kept apart
//! from everything else so the HTTP surface can map them to 400 without string matching.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// One offending request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ScanError {
    /// The request is malformed; every offending field is listed.
    #[error("invalid scan request: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    /// The requested address space exceeds the safety ceiling.
    #[error("address range too large: {requested} hosts requested, limit is {limit}")]
    RangeTooLarge { requested: u64, limit: u64 },

    /// An optional external tool is not installed.
    #[error("external tool '{tool}' is not available")]
    ToolUnavailable { tool: String },

    /// Nothing listens on the probed port.
    #[error("connection to {target} refused")]
    ConnectionRefused { target: String },

    #[error("probe of {target} timed out after {after:?}")]
    ProbeTimeout { target: String, after: Duration },

    #[error("probe of {target} failed: {reason}")]
    ProbeFailure { target: String, reason: String },

    /// An external command ran but did not produce usable output.
    #[error("command '{program}' failed: {reason}")]
    Command { program: String, reason: String },

    #[error("device registry error: {0}")]
    Registry(String),

    #[error("scan was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::Validation(vec![FieldError::new(field, message)])
    }

    /// True for errors caused by the request itself rather than by the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ScanError::Validation(_) | ScanError::RangeTooLarge { .. }
        )
    }

    /// A refused or unanswered connect: the port is simply not open. Anything else that stops
    /// a connect is worth reporting.
    pub fn is_closed_port(&self) -> bool {
        matches!(
            self,
            ScanError::ConnectionRefused { .. } | ScanError::ProbeTimeout { .. }
        )
    }

    /// Field-level detail for client errors.
    pub fn field_errors(&self) -> Vec<FieldError> {
        match self {
            ScanError::Validation(fields) => fields.clone(),
            ScanError::RangeTooLarge { requested, limit } => vec![FieldError::new(
                "range",
                format!("{requested} hosts requested, at most {limit} allowed"),
            )],
            _ => Vec::new(),
        }
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T, E = ScanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = ScanError::Validation(vec![
            FieldError::new("startIp", "not an IPv4 address"),
            FieldError::new("ports[1]", "out of range"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("startIp: not an IPv4 address"));
        assert!(msg.contains("ports[1]: out of range"));
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(ScanError::validation("ports", "empty").is_client_error());
        assert!(ScanError::RangeTooLarge {
            requested: 1022,
            limit: 254
        }
        .is_client_error());
        assert!(!ScanError::Cancelled.is_client_error());
        assert!(!ScanError::ToolUnavailable { tool: "nmap".into() }.is_client_error());
    }

    #[test]
    fn refusals_and_timeouts_mean_closed() {
        assert!(ScanError::ConnectionRefused { target: "10.0.0.1:9100".into() }.is_closed_port());
        assert!(ScanError::ProbeTimeout {
            target: "10.0.0.1:9100".into(),
            after: Duration::from_millis(1500)
        }
        .is_closed_port());
        assert!(!ScanError::ProbeFailure {
            target: "10.0.0.1:9100".into(),
            reason: "Network is unreachable (os error 101)".into()
        }
        .is_closed_port());
    }
}
