/*!
 * Device Orchestra Engine
 *
 * This crate provides the pipeline engine of Device Orchestra: pipeline
 * definitions, validation against a device registry, sequential fail-fast
 * execution with dry-run support, and device smoke tests.
 */

#![warn(missing_docs)]

// Re-export core types
pub use orchestra_core::prelude;

// Re-export types from orchestra_core for convenience
pub use orchestra_core::types::{Id, Params, Value};

pub mod error;
pub mod pipeline;
pub mod result;
pub mod runner;
pub mod tester;

// Re-export main types for convenience
pub use error::{Error, Result, StepError};
pub use pipeline::{Pipeline, Step, StepKind};
pub use result::{PipelineResult, StepOutcome, StepStatus};
pub use runner::{PipelineRunner, RunOptions, RunnerOptions, StartPolicy};
pub use tester::{DeviceTestResult, DeviceTester, TestReport};

/// Device Orchestra engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
