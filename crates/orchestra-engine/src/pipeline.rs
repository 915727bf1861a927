/*!
 * Pipeline definitions.
 *
 * A pipeline is an ordered list of steps, stored as a JSON array of step
 * objects. Steps are kept loosely typed so that structurally broken
 * pipelines can still be loaded and reported on by validation.
 */
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use orchestra_core::types::{Params, Value};

use crate::error::{Error, Result};

/// Step kinds understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Send an initialization action to a device
    Init,
    /// Send a capture action, optionally with a save target
    Capture,
    /// Send a move action with arguments
    Move,
    /// Suspend the pipeline
    Wait,
    /// Send an explicitly named action
    CustomCommand,
    /// Write data to a file
    Save,
}

impl StepKind {
    /// Every kind, in documentation order
    pub const ALL: [StepKind; 6] = [
        StepKind::Init,
        StepKind::Capture,
        StepKind::Move,
        StepKind::Wait,
        StepKind::CustomCommand,
        StepKind::Save,
    ];

    /// Name as written in pipeline files
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Init => "init",
            StepKind::Capture => "capture",
            StepKind::Move => "move",
            StepKind::Wait => "wait",
            StepKind::CustomCommand => "custom_command",
            StepKind::Save => "save",
        }
    }

    /// Whether the step addresses a device
    pub fn requires_device(&self) -> bool {
        matches!(
            self,
            StepKind::Init | StepKind::Capture | StepKind::Move | StepKind::CustomCommand
        )
    }
}

impl FromStr for StepKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StepKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::invalid_step(format!("unknown step type '{}'", s)))
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pipeline step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step kind, see [`StepKind`]
    #[serde(rename = "step", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
    /// Target device id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Value>,
    /// Device action overriding the kind's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,
    /// Arguments forwarded with the action; must be a mapping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    /// Save target forwarded by capture steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<Value>,
    /// Wait duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Value>,
    /// Output file of save steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<Value>,
    /// Payload of save steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Step {
    /// Create a step of `kind`
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind: Some(Value::from(kind.as_str())),
            ..Self::default()
        }
    }

    /// `init` step for `device`
    pub fn init(device: impl Into<String>) -> Self {
        Self::new(StepKind::Init).with_device(device)
    }

    /// `capture` step for `device`
    pub fn capture(device: impl Into<String>) -> Self {
        Self::new(StepKind::Capture).with_device(device)
    }

    /// `move` step for `device`
    pub fn move_device(device: impl Into<String>, args: Params) -> Self {
        Self::new(StepKind::Move).with_device(device).with_args(args)
    }

    /// `wait` step of `seconds`
    pub fn wait(seconds: f64) -> Self {
        Self {
            duration: Some(Value::Float(seconds)),
            ..Self::new(StepKind::Wait)
        }
    }

    /// `custom_command` step sending `action` to `device`
    pub fn custom_command(device: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(StepKind::CustomCommand)
            .with_device(device)
            .with_action(action)
    }

    /// `save` step writing `data` to `filepath`
    pub fn save(filepath: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            filepath: Some(Value::String(filepath.into())),
            data: Some(data.into()),
            ..Self::new(StepKind::Save)
        }
    }

    /// Set the target device
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(Value::String(device.into()));
        self
    }

    /// Set the action
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(Value::String(action.into()));
        self
    }

    /// Set the forwarded arguments
    pub fn with_args(mut self, args: Params) -> Self {
        self.args = Some(Value::Object(args));
        self
    }

    /// Set the capture save target
    pub fn with_save_to(mut self, save_to: impl Into<String>) -> Self {
        self.save_to = Some(Value::String(save_to.into()));
        self
    }

    /// Kind as written, `unknown` when missing or not a string
    pub fn kind_name(&self) -> &str {
        text(&self.kind).unwrap_or("unknown")
    }

    /// Parsed kind
    pub fn parsed_kind(&self) -> Result<StepKind> {
        match &self.kind {
            None => Err(Error::invalid_step("missing field 'step'")),
            Some(Value::String(name)) => name.parse(),
            Some(other) => Err(Error::invalid_step(format!(
                "field 'step' must be a string, got {}",
                other
            ))),
        }
    }

    /// Target device id, when given as a string
    pub fn device_id(&self) -> Option<&str> {
        text(&self.device)
    }

    /// Explicit action, when given as a string
    pub fn action_name(&self) -> Option<&str> {
        text(&self.action)
    }

    /// Output file, when given as a string
    pub fn file_path(&self) -> Option<&str> {
        text(&self.filepath)
    }

    /// Names of the text fields that hold something other than a string
    pub fn mistyped_fields(&self) -> Vec<&'static str> {
        [
            ("step", &self.kind),
            ("device", &self.device),
            ("action", &self.action),
            ("filepath", &self.filepath),
        ]
        .into_iter()
        .filter(|(_, field)| matches!(field, Some(value) if !value.is_string()))
        .map(|(name, _)| name)
        .collect()
    }

    /// Forwarded arguments as a parameter map
    pub fn args_map(&self) -> Result<Params> {
        match &self.args {
            None | Some(Value::Null) => Ok(Params::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(Error::invalid_step(format!(
                "'args' must be a mapping, got {}",
                other
            ))),
        }
    }
}

fn text(field: &Option<Value>) -> Option<&str> {
    field.as_ref().and_then(Value::as_str)
}

/// An ordered sequence of steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// Create a pipeline from steps
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Parse a pipeline from a JSON array of step objects
    pub fn from_json_str(text: &str) -> Result<Self> {
        let pipeline: Pipeline = serde_json::from_str(text)?;
        Ok(pipeline)
    }

    /// Read and parse a pipeline file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await?;
        let pipeline = Self::from_json_str(&text)?;
        debug!(path = %path.display(), steps = pipeline.len(), "pipeline loaded");
        Ok(pipeline)
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Ids of the devices addressed by the pipeline, in order of first use
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for device in self.steps.iter().filter_map(Step::device_id) {
            if !ids.iter().any(|id| id == device) {
                ids.push(device.to_string());
            }
        }
        ids
    }
}

impl From<Vec<Step>> for Pipeline {
    fn from(steps: Vec<Step>) -> Self {
        Self::new(steps)
    }
}

impl FromIterator<Step> for Pipeline {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
