//! Error types for deferred operations.
//!
//! This module defines [`OperationError`], the structured failure value that
//! every operation variant captures and surfaces: a human-readable message,
//! a machine-readable code, an optional structured payload, and an optional
//! wrapped cause forming a chain back to the original failure point.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Well-known error codes attached to errors the crate itself produces.
pub mod codes {
    /// Generic code for failures wrapped from foreign error types.
    pub const GENERIC: &str = "OperationError";
    /// A factory, continuation, or scheduled task panicked.
    pub const PANIC: &str = "Panic";
    /// The backing scheduled work was cancelled before completion.
    pub const CANCELLED: &str = "Cancelled";
    /// A compensation action failed after the triggering failure; both are
    /// preserved in the aggregate.
    pub const AGGREGATE: &str = "Aggregate";
    /// Evaluation state was lost mid-flight (a forcing thread died).
    pub const INTERRUPTED: &str = "Interrupted";
}

/// Key under which an aggregate error stores the serialized compensation
/// failure in its data payload.
pub const COMPENSATION_ERROR_KEY: &str = "CompensationError";

/// Structured error value produced when an operation fails.
///
/// An `OperationError` is immutable after construction. Equality is
/// structural over all four fields, which is what makes short-circuit
/// propagation testable: an error carried through a continuation chain
/// compares equal to the error that entered it.
///
/// The `cause` field preserves the original failure point as a chain, so
/// re-surfacing the error through `Result` does not degrade debugging the
/// way a synthetic wrapper would. [`std::error::Error::source`] walks the
/// same chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{}", render(.message, .code))]
pub struct OperationError {
    /// Human-readable description of the failure.
    #[serde(rename = "Message", skip_serializing_if = "Option::is_none")]
    message: Option<String>,

    /// Machine-readable error code.
    #[serde(rename = "Code", skip_serializing_if = "Option::is_none")]
    code: Option<String>,

    /// Structured key/value payload with failure details.
    #[serde(rename = "Data", skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,

    /// The wrapped cause, if this error was produced from an earlier one.
    #[source]
    #[serde(rename = "Cause", skip_serializing_if = "Option::is_none")]
    cause: Option<Box<OperationError>>,
}

fn render(message: &Option<String>, code: &Option<String>) -> String {
    match (message.as_deref(), code.as_deref()) {
        (Some(message), Some(code)) => format!("{message} ({code})"),
        (Some(message), None) => message.to_string(),
        (None, Some(code)) => format!("operation failed ({code})"),
        (None, None) => "operation failed".to_string(),
    }
}

impl OperationError {
    /// Creates a new error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            code: None,
            data: None,
            cause: None,
        }
    }

    /// Sets the machine-readable code for this error.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Adds a key/value entry to the structured data payload.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Sets the wrapped cause for this error.
    pub fn with_cause(mut self, cause: OperationError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Builds an error from a foreign error, preserving its source chain.
    ///
    /// The message defaults to the cause's rendered message and the code to
    /// [`codes::GENERIC`]; each level of the foreign source chain becomes a
    /// level of the structural cause chain.
    pub fn caused_by(source: &(dyn std::error::Error + 'static)) -> Self {
        let mut error = Self::new(source.to_string()).with_code(codes::GENERIC);
        if let Some(inner) = source.source() {
            error.cause = Some(Box::new(Self::caused_by(inner)));
        }
        error
    }

    /// Combines a triggering failure with a compensation failure.
    ///
    /// The original failure stays reachable as the aggregate's cause chain;
    /// the compensation failure is carried, fully serialized, in the data
    /// payload under [`COMPENSATION_ERROR_KEY`]. Neither failure is lost.
    pub fn aggregate(original: OperationError, compensation: OperationError) -> Self {
        let preserved = serde_json::to_value(&compensation).unwrap_or(Value::Null);
        Self::new(format!(
            "{original}; compensation also failed: {compensation}"
        ))
        .with_code(codes::AGGREGATE)
        .with_data(COMPENSATION_ERROR_KEY, preserved)
        .with_cause(original)
    }

    /// Captures a panic payload as a structured error with code
    /// [`codes::PANIC`].
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(text) = payload.downcast_ref::<&str>() {
            (*text).to_string()
        } else if let Some(text) = payload.downcast_ref::<String>() {
            text.clone()
        } else {
            "computation panicked".to_string()
        };
        Self::new(message).with_code(codes::PANIC)
    }

    /// Error reported when the backing work was cancelled.
    pub(crate) fn cancelled() -> Self {
        Self::new("operation was cancelled").with_code(codes::CANCELLED)
    }

    /// Returns the human-readable message, if any.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the machine-readable code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Returns the structured data payload, if any.
    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref()
    }

    /// Returns the wrapped cause, if any.
    pub fn cause(&self) -> Option<&OperationError> {
        self.cause.as_deref()
    }

    /// Walks the cause chain to the innermost error.
    pub fn root_cause(&self) -> &OperationError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }

    /// Returns true if this error aggregates a compensation failure with the
    /// triggering failure.
    pub fn is_aggregate(&self) -> bool {
        self.code.as_deref() == Some(codes::AGGREGATE)
    }

    /// Returns true if this error was produced by cancellation of the
    /// backing work.
    pub fn is_cancelled(&self) -> bool {
        self.code.as_deref() == Some(codes::CANCELLED)
    }
}

// Conversions from common foreign error types.

impl From<&str> for OperationError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for OperationError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<serde_json::Error> for OperationError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string()).with_code(codes::GENERIC)
    }
}

impl From<std::io::Error> for OperationError {
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string()).with_code(codes::GENERIC)
    }
}

impl From<tokio::task::JoinError> for OperationError {
    fn from(error: tokio::task::JoinError) -> Self {
        if error.is_cancelled() {
            Self::cancelled()
        } else if error.is_panic() {
            Self::from_panic(error.into_panic())
        } else {
            Self::new(error.to_string()).with_code(codes::GENERIC)
        }
    }
}
