//! Defines the conditions the handler maps onto response status
//! codes. Anything else travels as a plain `anyhow::Error` and aborts
//! the invocation.

use thiserror::Error;

/// Typed pipeline failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// A required field of the incoming event is missing.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The event was recognised but carries a type this pipeline
    /// doesn't act upon.
    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    /// The output root to be packaged is missing or isn't a folder.
    #[error("package precondition failed: {0}")]
    PackagePrecondition(String),

    /// A package name is not of the `<owner>/<name>` form.
    #[error("invalid package name: {0:?}")]
    InvalidPackageName(String),
}

impl PipelineError {
    /// The status code reported to the caller for this condition, or
    /// `None` if the condition must abort the invocation instead.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            PipelineError::MalformedEvent(_) | PipelineError::InvalidPackageName(_) => Some(400),
            PipelineError::UnsupportedEventType(_) => Some(404),
            PipelineError::PackagePrecondition(_) => None,
        }
    }
}
