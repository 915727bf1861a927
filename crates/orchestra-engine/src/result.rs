/*!
 * Pipeline execution results.
 */
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orchestra_core::types::{Id, Value};

use crate::error::{Result, StepError};

/// Outcome of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// The step succeeded
    Success,
    /// The step failed
    Error,
}

/// Record of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// 1-based step index
    pub step_index: usize,
    /// Step kind as written, `unknown` when absent
    pub step_type: String,
    /// Step duration in seconds
    pub duration: f64,
    /// Payload of a successful step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text of a failed step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Success or error
    pub status: StepStatus,
}

impl StepOutcome {
    /// Successful step
    pub fn success(
        step_index: usize,
        step_type: impl Into<String>,
        duration: Duration,
        result: Value,
    ) -> Self {
        Self {
            step_index,
            step_type: step_type.into(),
            duration: duration.as_secs_f64(),
            result: Some(result),
            error: None,
            status: StepStatus::Success,
        }
    }

    /// Failed step
    pub fn failure(error: &StepError, duration: Duration) -> Self {
        Self {
            step_index: error.index,
            step_type: error.kind.clone(),
            duration: duration.as_secs_f64(),
            result: None,
            error: Some(error.source.to_string()),
            status: StepStatus::Error,
        }
    }

    /// Whether the step succeeded
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Aggregate result of a pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Random id of this run
    pub run_id: Id,
    /// Wall-clock start of the run
    pub started_at: DateTime<Utc>,
    /// Steps in the pipeline
    pub total_steps: usize,
    /// Steps attempted, including a failing one
    pub executed_steps: usize,
    /// Steps that succeeded
    pub successful_steps: usize,
    /// Steps that failed; at most one since execution stops at the first failure
    pub failed_steps: usize,
    /// Wall-clock duration of the run in seconds
    pub total_duration: f64,
    /// Outcomes of the executed steps, in order
    pub results: Vec<StepOutcome>,
    /// Outcomes of the failed steps
    pub errors: Vec<StepOutcome>,
    /// Whether devices were left untouched
    pub dry_run: bool,
}

impl PipelineResult {
    /// Empty result for a pipeline of `total_steps`
    pub fn new(total_steps: usize, dry_run: bool) -> Self {
        Self {
            run_id: Id::new(),
            started_at: Utc::now(),
            total_steps,
            executed_steps: 0,
            successful_steps: 0,
            failed_steps: 0,
            total_duration: 0.0,
            results: Vec::new(),
            errors: Vec::new(),
            dry_run,
        }
    }

    /// Record a step outcome and update the counters
    pub fn record(&mut self, outcome: StepOutcome) {
        self.executed_steps += 1;
        if outcome.is_success() {
            self.successful_steps += 1;
        } else {
            self.failed_steps += 1;
            self.errors.push(outcome.clone());
        }
        self.results.push(outcome);
    }

    /// Set the overall duration
    pub fn finish(&mut self, elapsed: Duration) {
        self.total_duration = elapsed.as_secs_f64();
    }

    /// Whether every step of the pipeline ran and succeeded
    pub fn is_success(&self) -> bool {
        self.failed_steps == 0 && self.executed_steps == self.total_steps
    }

    /// First failed step, if any
    pub fn first_error(&self) -> Option<&StepOutcome> {
        self.errors.first()
    }

    /// Write the result as pretty JSON
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }
}
