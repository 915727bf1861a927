/*!
 * Device trait and core device abstractions.
 *
 * Every peripheral, physical or simulated, is driven through the four
 * operations of [`Device`]: start, stop, a status snapshot and named
 * commands with keyword arguments. Concrete kinds are selected by type tag
 * through the [`DeviceFactory`](crate::factory::DeviceFactory).
 */
use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use orchestra_core::{
    error::Error as CoreError,
    types::{Id, Params, Value},
};

use crate::channel::ChannelError;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No constructor is bound to the type tag
    #[error("Unknown device type '{tag}'. Available types: {}", available.join(", "))]
    UnknownType {
        /// The requested tag
        tag: String,
        /// Tags that are bound
        available: Vec<String>,
    },

    /// A device id or type tag is already taken
    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered {
        /// What was being registered ("Device", "Device type")
        kind: &'static str,
        /// The clashing id or tag
        name: String,
    },

    /// No device with this id is registered
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// The device must be started before this operation
    #[error("Device '{0}' is not started")]
    NotStarted(String),

    /// The device does not understand the command
    #[error("Unknown command '{command}' for device '{device}'")]
    UnknownCommand {
        /// Device id
        device: String,
        /// Command name
        command: String,
    },

    /// A parameter or command argument is missing or has the wrong type
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device accepted the command but failed to carry it out
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Communication channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new invalid argument error
    pub fn invalid_argument<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::InvalidArgument(msg.as_ref().to_string())
    }

    /// Create a new command failure
    pub fn command_failed<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::CommandFailed(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Other(msg.as_ref().to_string())
    }

    /// Create an unknown command error
    pub fn unknown_command(device: &Id, command: &str) -> Self {
        DeviceError::UnknownCommand {
            device: device.to_string(),
            command: command.to_string(),
        }
    }
}

/// The capability contract every device implements
///
/// All operations may block on I/O or simulated delays. Implementations keep
/// their mutable state behind interior locks so a device can be shared as
/// `Arc<dyn Device>` between the registry, the pipeline engine and
/// background tasks.
#[async_trait]
pub trait Device: Send + Sync + Debug {
    /// Unique device id
    fn id(&self) -> &Id;

    /// Factory type tag the device was built from
    fn device_type(&self) -> &str;

    /// Construction parameters
    fn params(&self) -> &Params;

    /// Bring the device into its operational state
    async fn start(&self) -> Result<()>;

    /// Leave the operational state and release resources
    async fn stop(&self) -> Result<()>;

    /// A fresh snapshot of the device state; always contains `id` and `type`
    async fn status(&self) -> Value;

    /// Execute a named command with keyword arguments
    async fn send_command(&self, command: &str, args: Params) -> Result<Value>;
}

/// Read a float parameter, falling back to `default` when absent
pub fn float_param(params: &Params, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_float()
            .ok_or_else(|| {
                DeviceError::invalid_argument(format!("'{}' must be a number, got {}", key, v))
            }),
    }
}

/// Read an integer parameter, falling back to `default` when absent
pub fn integer_param(params: &Params, key: &str, default: i64) -> Result<i64> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_integer()
            .ok_or_else(|| {
                DeviceError::invalid_argument(format!("'{}' must be an integer, got {}", key, v))
            }),
    }
}

/// Read a string parameter, falling back to `default` when absent
pub fn string_param(params: &Params, key: &str, default: &str) -> Result<String> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(v) => Err(DeviceError::invalid_argument(format!(
            "'{}' must be a string, got {}",
            key, v
        ))),
    }
}

/// Read a boolean parameter, falling back to `default` when absent
pub fn bool_param(params: &Params, key: &str, default: bool) -> Result<bool> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| {
                DeviceError::invalid_argument(format!("'{}' must be a boolean, got {}", key, v))
            }),
    }
}

/// Read a required integer argument
pub fn required_integer(args: &Params, key: &str) -> Result<i64> {
    args.get(key)
        .ok_or_else(|| {
            DeviceError::invalid_argument(format!("missing required argument '{}'", key))
        })?
        .as_integer()
        .ok_or_else(|| DeviceError::invalid_argument(format!("'{}' must be an integer", key)))
}
