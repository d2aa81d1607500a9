use std::fmt;

use shared::error::{ErrorCode, ValidationError};
use thiserror::Error;

/// Outcome of a single REST call that did not produce the expected body.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{message}")]
    Rejected {
        status: u16,
        code: ErrorCode,
        message: String,
    },
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl RequestError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        RequestError::Rejected {
            status,
            code: ErrorCode::from_status(status),
            message: message.into(),
        }
    }

    /// Message suitable for the operator: the collaborator's own explanation
    /// when it sent one, otherwise the transport description.
    pub fn operator_message(&self) -> String {
        match self {
            RequestError::Rejected { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Roster, pool or attendance could not be loaded.
    DataFetch,
    /// Starting, capturing or running the camera failed.
    CameraSession,
    /// Registration input was rejected.
    Validation,
    /// The live channel dropped or gave up reconnecting.
    Channel,
}

/// A non-fatal, dismissable failure shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleError {
    category: ErrorCategory,
    message: String,
}

impl ConsoleError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    pub fn data_fetch(context: &str, err: &RequestError) -> Self {
        Self::new(
            ErrorCategory::DataFetch,
            format!("{context}: {}", err.operator_message()),
        )
    }

    pub fn camera(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::CameraSession, message)
    }

    pub fn validation(errors: &[ValidationError]) -> Self {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ConsoleError {}
