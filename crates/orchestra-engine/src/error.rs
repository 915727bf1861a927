/*!
 * Error types for the Device Orchestra engine crate.
 */
use thiserror::Error;

/// Error type for pipeline engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Pipeline failed validation; one message per problem
    #[error("Pipeline validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Structurally invalid step
    #[error("Invalid step: {0}")]
    InvalidStep(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] orchestra_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] orchestra_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for pipeline engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new invalid step error
    pub fn invalid_step<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidStep(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Failure of a single pipeline step
///
/// Recorded in the pipeline result; never propagated out of an execution.
#[derive(Error, Debug)]
#[error("Step {index} ({kind}) failed: {source}")]
pub struct StepError {
    /// 1-based step index
    pub index: usize,
    /// Step kind as written in the pipeline, `unknown` when absent
    pub kind: String,
    /// Underlying failure
    #[source]
    pub source: Error,
}

impl StepError {
    /// Wrap `source` as the failure of step `index`
    pub fn new<E: Into<Error>>(index: usize, kind: impl Into<String>, source: E) -> Self {
        Self {
            index,
            kind: kind.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_validation_message_lists_problems() {
        let err = Error::Validation(vec!["Step 1: a".to_string(), "Step 2: b".to_string()]);
        assert_eq!(err.to_string(), "Pipeline validation failed: Step 1: a; Step 2: b");
    }

    #[test]
    fn test_step_error_keeps_source() {
        let err = StepError::new(3, "wait", Error::invalid_step("negative duration"));
        assert_eq!(err.to_string(), "Step 3 (wait) failed: Invalid step: negative duration");
        assert!(err.source().is_some());
    }
}
