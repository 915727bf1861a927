/*!
 * Pipeline validation and execution.
 *
 * [`PipelineRunner::validate`] checks a pipeline against the device
 * registry without touching any device. [`PipelineRunner::execute`] runs
 * the steps strictly in order and stops at the first failing step.
 * [`PipelineRunner::run`] wraps both and manages the lifecycle of the
 * devices the pipeline addresses.
 */
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn, Instrument};

use orchestra_core::{
    config::PipelineConfig,
    event::{event_types, SharedEventBus},
    logging::operation_span,
    types::{Params, Value},
    utils::{millis_to_duration, secs_to_duration, unix_timestamp},
};
use orchestra_devices::DeviceRegistry;

use crate::error::{Error, Result, StepError};
use crate::pipeline::{Pipeline, Step, StepKind};
use crate::result::{PipelineResult, StepOutcome};

/// Wait used when a `wait` step gives no duration
const DEFAULT_WAIT_SECS: f64 = 1.0;

/// How [`PipelineRunner::run`] treats the devices a pipeline addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPolicy {
    /// Start every device; failures are logged and the run goes on
    #[default]
    BestEffort,
    /// Start every device; the first failure aborts the run
    Abort,
    /// Leave device lifecycle to the caller
    Skip,
}

impl StartPolicy {
    /// Policy name
    pub fn as_str(&self) -> &'static str {
        match self {
            StartPolicy::BestEffort => "best_effort",
            StartPolicy::Abort => "abort",
            StartPolicy::Skip => "skip",
        }
    }
}

impl FromStr for StartPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(StartPolicy::BestEffort),
            "abort" => Ok(StartPolicy::Abort),
            "skip" => Ok(StartPolicy::Skip),
            _ => Err(Error::other(format!("unknown start policy '{}'", s))),
        }
    }
}

impl fmt::Display for StartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine defaults
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerOptions {
    /// Action of `init` steps without one
    pub init_action: String,
    /// Action of `capture` steps without one
    pub capture_action: String,
    /// Action of `move` steps without one
    pub move_action: String,
    /// Bound on stopping each device after [`PipelineRunner::run`]
    pub stop_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            init_action: "home".to_string(),
            capture_action: "capture".to_string(),
            move_action: "move".to_string(),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&PipelineConfig> for RunnerOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            init_action: config.default_init_action.clone(),
            capture_action: config.default_capture_action.clone(),
            move_action: config.default_move_action.clone(),
            stop_timeout: millis_to_duration(config.stop_timeout_ms),
        }
    }
}

/// Options of a single [`PipelineRunner::run`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Simulate every step instead of calling devices
    pub dry_run: bool,
    /// Device start policy
    pub start_policy: StartPolicy,
}

/// Pipeline runner
#[derive(Debug)]
pub struct PipelineRunner {
    registry: Arc<DeviceRegistry>,
    event_bus: Option<SharedEventBus>,
    options: RunnerOptions,
}

impl PipelineRunner {
    /// Create a runner resolving devices in `registry`
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            event_bus: None,
            options: RunnerOptions::default(),
        }
    }

    /// Publish `pipeline.*` events on `event_bus`
    pub fn with_event_bus(mut self, event_bus: SharedEventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Replace the engine defaults
    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    /// Engine defaults
    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Check every step; an empty list means the pipeline is valid
    pub fn validate(&self, pipeline: &Pipeline) -> Vec<String> {
        pipeline
            .steps()
            .iter()
            .enumerate()
            .flat_map(|(i, step)| self.validate_step(i + 1, step))
            .collect()
    }

    fn validate_step(&self, number: usize, step: &Step) -> Vec<String> {
        let mut errors = Vec::new();
        let name = match &step.kind {
            None => {
                errors.push(format!("Step {}: missing field 'step'", number));
                return errors;
            }
            Some(Value::String(name)) => name,
            Some(_) => {
                errors.push(format!("Step {}: field 'step' must be a string", number));
                return errors;
            }
        };
        let kind = match name.parse::<StepKind>() {
            Ok(kind) => kind,
            Err(_) => {
                errors.push(format!("Step {}: unknown step type '{}'", number, name));
                return errors;
            }
        };

        for field in step.mistyped_fields() {
            errors.push(format!("Step {}: field '{}' must be a string", number, field));
        }

        if kind.requires_device() {
            match step.device_id() {
                Some(id) if !self.registry.contains(id) => {
                    errors.push(format!("Step {}: device '{}' not found", number, id))
                }
                Some(_) => {}
                None if step.device.is_some() => {}
                None => errors.push(format!(
                    "Step {}: missing field 'device' for type '{}'",
                    number, kind
                )),
            }
        }

        match kind {
            StepKind::CustomCommand if step.action.is_none() => {
                errors.push(format!(
                    "Step {}: missing field 'action' for type 'custom_command'",
                    number
                ));
            }
            StepKind::Wait => match &step.duration {
                None => errors.push(format!(
                    "Step {}: missing field 'duration' for type 'wait'",
                    number
                )),
                Some(d) => match d.as_float() {
                    Some(secs) if secs < 0.0 => errors.push(format!(
                        "Step {}: field 'duration' must not be negative",
                        number
                    )),
                    Some(secs) if secs_to_duration(secs).is_none() => errors.push(format!(
                        "Step {}: field 'duration' is out of range",
                        number
                    )),
                    Some(_) => {}
                    None => errors.push(format!(
                        "Step {}: field 'duration' must be a number",
                        number
                    )),
                },
            },
            StepKind::Save if step.filepath.is_none() => {
                errors.push(format!("Step {}: missing field 'filepath' for type 'save'", number));
            }
            _ => {}
        }

        if let Err(e) = step.args_map() {
            errors.push(format!("Step {}: {}", number, e));
        }
        errors
    }

    /// Validate, turning problems into [`Error::Validation`]
    pub fn ensure_valid(&self, pipeline: &Pipeline) -> Result<()> {
        let errors = self.validate(pipeline);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// Run every step in order, stopping at the first failure
    ///
    /// Step failures end up in the returned result; this never fails.
    pub async fn execute(&self, pipeline: &Pipeline, dry_run: bool) -> PipelineResult {
        let span = operation_span("execute", "pipeline");
        self.execute_steps(pipeline, dry_run).instrument(span).await
    }

    async fn execute_steps(&self, pipeline: &Pipeline, dry_run: bool) -> PipelineResult {
        let started = Instant::now();
        let mut result = PipelineResult::new(pipeline.len(), dry_run);
        info!(run_id = %result.run_id, steps = pipeline.len(), dry_run, "pipeline started");
        self.emit(
            event_types::PIPELINE_STARTED,
            Value::object([
                ("run_id", Value::from(&result.run_id)),
                ("total_steps", Value::from(pipeline.len())),
                ("dry_run", Value::from(dry_run)),
            ]),
        );

        for (i, step) in pipeline.steps().iter().enumerate() {
            let index = i + 1;
            debug!(step = index, total = pipeline.len(), kind = step.kind_name(), "executing step");
            let step_started = Instant::now();
            let outcome = if dry_run {
                Ok(self.simulate_step(step))
            } else {
                self.execute_step(index, step).await
            };
            let elapsed = step_started.elapsed();

            match outcome {
                Ok(value) => {
                    info!(step = index, duration = ?elapsed, "step completed");
                    self.emit(
                        event_types::PIPELINE_STEP_COMPLETED,
                        Value::object([
                            ("run_id", Value::from(&result.run_id)),
                            ("step_index", Value::from(index)),
                            ("step_type", Value::from(step.kind_name())),
                            ("duration", Value::from(elapsed.as_secs_f64())),
                        ]),
                    );
                    result.record(StepOutcome::success(index, step.kind_name(), elapsed, value));
                }
                Err(e) => {
                    error!(step = index, error = %e, "step failed");
                    self.emit(
                        event_types::PIPELINE_STEP_FAILED,
                        Value::object([
                            ("run_id", Value::from(&result.run_id)),
                            ("step_index", Value::from(index)),
                            ("step_type", Value::from(e.kind.as_str())),
                            ("error", Value::from(e.source.to_string())),
                        ]),
                    );
                    result.record(StepOutcome::failure(&e, elapsed));
                    break;
                }
            }
        }

        result.finish(started.elapsed());
        info!(
            run_id = %result.run_id,
            successful = result.successful_steps,
            total = result.total_steps,
            duration = result.total_duration,
            "pipeline finished"
        );
        self.emit(
            event_types::PIPELINE_FINISHED,
            Value::object([
                ("run_id", Value::from(&result.run_id)),
                ("executed_steps", Value::from(result.executed_steps)),
                ("successful_steps", Value::from(result.successful_steps)),
                ("failed_steps", Value::from(result.failed_steps)),
                ("total_duration", Value::from(result.total_duration)),
            ]),
        );
        result
    }

    /// Execute one step against the registry
    pub async fn execute_step(
        &self,
        index: usize,
        step: &Step,
    ) -> std::result::Result<Value, StepError> {
        self.dispatch(step)
            .await
            .map_err(|e| StepError::new(index, step.kind_name(), e))
    }

    async fn dispatch(&self, step: &Step) -> Result<Value> {
        let kind = step.parsed_kind()?;
        match kind {
            StepKind::Init | StepKind::Capture | StepKind::Move | StepKind::CustomCommand => {
                let action = self
                    .action_for(kind, step)
                    .ok_or_else(|| Error::invalid_step("missing field 'action'"))?;
                let mut args = step.args_map()?;
                if kind == StepKind::Capture {
                    if let Some(save_to) = &step.save_to {
                        args.insert("save_to".to_string(), save_to.clone());
                    }
                }
                self.send(step, &action, args).await
            }
            StepKind::Wait => {
                let requested = step.duration.clone().unwrap_or(Value::Float(DEFAULT_WAIT_SECS));
                let duration = requested
                    .as_float()
                    .and_then(secs_to_duration)
                    .ok_or_else(|| {
                        Error::invalid_step(format!("invalid wait duration {}", requested))
                    })?;
                tokio::time::sleep(duration).await;
                Ok(Value::object([
                    ("waited", requested),
                    ("timestamp", Value::from(unix_timestamp())),
                ]))
            }
            StepKind::Save => {
                let filepath = step
                    .file_path()
                    .ok_or_else(|| Error::invalid_step("missing field 'filepath'"))?;
                save_data(Path::new(filepath), step.data.as_ref()).await?;
                Ok(Value::object([
                    ("saved", Value::from(true)),
                    ("filepath", Value::from(filepath)),
                    ("timestamp", Value::from(unix_timestamp())),
                ]))
            }
        }
    }

    async fn send(&self, step: &Step, action: &str, args: Params) -> Result<Value> {
        let id = step
            .device_id()
            .ok_or_else(|| Error::invalid_step("missing field 'device'"))?;
        let device = self.registry.get(id)?;
        debug!(device_id = %id, action, "sending command");
        Ok(device.send_command(action, args).await?)
    }

    /// Explicit action, or the kind's configured default
    fn action_for(&self, kind: StepKind, step: &Step) -> Option<String> {
        if step.action.is_some() {
            return step.action_name().map(str::to_string);
        }
        match kind {
            StepKind::Init => Some(self.options.init_action.clone()),
            StepKind::Capture => Some(self.options.capture_action.clone()),
            StepKind::Move => Some(self.options.move_action.clone()),
            _ => None,
        }
    }

    fn simulate_step(&self, step: &Step) -> Value {
        let action = step
            .parsed_kind()
            .ok()
            .and_then(|kind| self.action_for(kind, step))
            .unwrap_or_else(|| "N/A".to_string());
        Value::object([
            ("dry_run", Value::from(true)),
            ("step_type", Value::from(step.kind_name())),
            ("device", Value::from(step.device_id().unwrap_or("N/A"))),
            ("action", Value::from(action)),
            ("simulated", Value::from(true)),
            ("timestamp", Value::from(unix_timestamp())),
        ])
    }

    /// Validate, start the addressed devices, execute, then stop them again
    ///
    /// Only validation problems and, under [`StartPolicy::Abort`], start
    /// failures are returned as errors. Dry runs never touch device
    /// lifecycle.
    pub async fn run(&self, pipeline: &Pipeline, options: RunOptions) -> Result<PipelineResult> {
        self.ensure_valid(pipeline)?;
        if options.dry_run {
            return Ok(self.execute(pipeline, true).await);
        }

        let started = self.start_devices(pipeline, options.start_policy).await?;
        let result = self.execute(pipeline, false).await;
        self.stop_devices(&started).await;
        Ok(result)
    }

    async fn start_devices(&self, pipeline: &Pipeline, policy: StartPolicy) -> Result<Vec<String>> {
        let mut started = Vec::new();
        if policy == StartPolicy::Skip {
            return Ok(started);
        }

        for id in pipeline.device_ids() {
            match self.registry.start(&id).await {
                Ok(()) => started.push(id),
                Err(e) if policy == StartPolicy::BestEffort => {
                    warn!(device_id = %id, error = %e, "device failed to start, continuing");
                }
                Err(e) => {
                    self.stop_devices(&started).await;
                    return Err(e.into());
                }
            }
        }
        Ok(started)
    }

    async fn stop_devices(&self, ids: &[String]) {
        for id in ids.iter().rev() {
            match tokio::time::timeout(self.options.stop_timeout, self.registry.stop(id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(device_id = %id, error = %e, "device failed to stop"),
                Err(_) => warn!(
                    device_id = %id,
                    timeout = ?self.options.stop_timeout,
                    "device did not stop in time"
                ),
            }
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event_type, payload);
        }
    }
}

/// Write `data` to `path`: strings verbatim, arrays and objects as pretty
/// JSON, other scalars in display form
async fn save_data(path: &Path, data: Option<&Value>) -> Result<()> {
    let text = match data {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(value @ (Value::Array(_) | Value::Object(_))) => serde_json::to_string_pretty(value)?,
        Some(value) => value.to_string(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await?;
    debug!(path = %path.display(), "data saved");
    Ok(())
}
