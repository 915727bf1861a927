/*!
 * Configuration management for Device Orchestra.
 *
 * Two kinds of configuration live here: the application settings
 * ([`Config`], layered from defaults, an optional TOML file and environment
 * variables) and the device inventory ([`DeviceConfig`] entries loaded from
 * a JSON file by [`DeviceConfigLoader`]).
 */
use std::fs;
use std::path::{Path, PathBuf};

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::types::{Params, Value};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Communication channel configuration
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Pipeline engine configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Device inventory file name, relative to the config directory
    #[serde(default = "default_devices_file")]
    pub devices_file: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to print the event target
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Communication channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Receive timeout used when a device does not specify one
    #[serde(default = "default_channel_timeout_ms")]
    pub default_timeout_ms: u64,
}

/// Pipeline engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Action used by `init` steps without an explicit action
    #[serde(default = "default_init_action")]
    pub default_init_action: String,

    /// Action used by `capture` steps without an explicit action
    #[serde(default = "default_capture_action")]
    pub default_capture_action: String,

    /// Action used by `move` steps without an explicit action
    #[serde(default = "default_move_action")]
    pub default_move_action: String,

    /// How devices referenced by a pipeline are started (best_effort, abort, skip)
    #[serde(default = "default_start_policy")]
    pub start_policy: String,

    /// Upper bound for stopping a device after a run
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            devices_file: default_devices_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_channel_timeout_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_init_action: default_init_action(),
            default_capture_action: default_capture_action(),
            default_move_action: default_move_action(),
            start_policy: default_start_policy(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

fn default_app_name() -> String {
    "orchestra".to_string()
}

fn default_devices_file() -> String {
    "devices.json".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_channel_timeout_ms() -> u64 {
    5000
}

fn default_init_action() -> String {
    "home".to_string()
}

fn default_capture_action() -> String {
    "capture".to_string()
}

fn default_move_action() -> String {
    "move".to_string()
}

fn default_start_policy() -> String {
    "best_effort".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    2000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix, e.g. `orchestra` for
    /// `ORCHESTRA__LOGGING__LEVEL`
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::from(path));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// One entry of the device inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device id, unique within a registry
    pub id: String,
    /// Factory type tag
    #[serde(rename = "type")]
    pub device_type: String,
    /// Constructor parameters
    #[serde(default)]
    pub params: Params,
}

/// Parse a device inventory document
///
/// Two shapes are accepted: an object keyed by device id whose entries carry
/// a `type` next to their parameters, or an array of
/// `{ "id", "type", "params" }` records. Object entries without a `type`
/// get an empty tag, which the factory later rejects for that device alone.
pub fn parse_device_configs(text: &str) -> Result<Vec<DeviceConfig>> {
    let raw: serde_json::Value = serde_json::from_str(text)?;
    match raw {
        serde_json::Value::Object(entries) => entries
            .into_iter()
            .map(|(id, entry)| {
                let mut params: Params = serde_json::from_value(entry).map_err(|e| {
                    Error::config(format!("Device '{}' must be an object of parameters: {}", id, e))
                })?;
                let device_type = match params.remove("type") {
                    Some(Value::String(tag)) => tag,
                    _ => String::new(),
                };
                Ok(DeviceConfig {
                    id,
                    device_type,
                    params,
                })
            })
            .collect(),
        raw @ serde_json::Value::Array(_) => serde_json::from_value(raw)
            .map_err(|e| Error::config(format!("Invalid device list: {}", e))),
        _ => Err(Error::config(
            "Device configuration must be an object or an array",
        )),
    }
}

/// Loads device inventories from a configuration directory
#[derive(Debug, Clone)]
pub struct DeviceConfigLoader {
    config_dir: PathBuf,
}

impl DeviceConfigLoader {
    /// Create a loader rooted at `config_dir`
    pub fn new<P: Into<PathBuf>>(config_dir: P) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Load `file_name`, surfacing every failure
    pub fn try_load(&self, file_name: &str) -> Result<Vec<DeviceConfig>> {
        let path = self.config_dir.join(file_name);
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::config(format!("Cannot read device configuration {}: {}", path.display(), e))
        })?;
        let configs = parse_device_configs(&text)?;
        debug!(path = %path.display(), count = configs.len(), "device configuration loaded");
        Ok(configs)
    }

    /// Load `file_name`, logging failures and yielding an empty inventory
    pub fn load(&self, file_name: &str) -> Vec<DeviceConfig> {
        match self.try_load(file_name) {
            Ok(configs) => configs,
            Err(e) => {
                error!(error = %e, "failed to load device configuration");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "orchestra");
        assert_eq!(config.general.devices_file, "devices.json");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.channels.default_timeout_ms, 5000);
        assert_eq!(config.pipeline.default_init_action, "home");
        assert_eq!(config.pipeline.start_policy, "best_effort");
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "orchestra");
        assert_eq!(config.pipeline.default_move_action, "move");
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("orchestra.toml");

        {
            let mut file = fs::File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                app_name = "bench-rig"

                [logging]
                level = "debug"

                [pipeline]
                default_init_action = "calibrate"
                start_policy = "abort"
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.general.app_name, "bench-rig");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.pipeline.default_init_action, "calibrate");
        assert_eq!(config.pipeline.start_policy, "abort");
        assert_eq!(config.pipeline.default_capture_action, "capture");

        Ok(())
    }

    #[test]
    fn test_config_builder_missing_file_uses_defaults() -> Result<()> {
        let config = ConfigBuilder::new()
            .with_config_file("/definitely/not/here.toml")
            .build()?;
        assert_eq!(config.logging.level, "info");
        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("ORCHESTRATEST__GENERAL__APP_NAME", "env-app");
        env::set_var("ORCHESTRATEST__CHANNELS__DEFAULT_TIMEOUT_MS", "250");

        let config = ConfigBuilder::new()
            .with_environment_prefix("orchestratest")
            .build()?;

        assert_eq!(config.general.app_name, "env-app");
        assert_eq!(config.channels.default_timeout_ms, 250);

        env::remove_var("ORCHESTRATEST__GENERAL__APP_NAME");
        env::remove_var("ORCHESTRATEST__CHANNELS__DEFAULT_TIMEOUT_MS");

        Ok(())
    }

    #[test]
    fn test_parse_keyed_inventory() {
        let configs = parse_device_configs(
            r#"{
                "motor1": {"type": "StepperMotor", "port": "/dev/ttyUSB0", "baudrate": 115200},
                "thermo": {"type": "VirtualThermometer"}
            }"#,
        )
        .unwrap();

        assert_eq!(configs.len(), 2);
        let motor = configs.iter().find(|c| c.id == "motor1").unwrap();
        assert_eq!(motor.device_type, "StepperMotor");
        assert_eq!(motor.params.get("baudrate"), Some(&Value::Integer(115200)));
        assert!(!motor.params.contains_key("type"));
    }

    #[test]
    fn test_parse_list_inventory() {
        let configs = parse_device_configs(
            r#"[
                {"id": "cam0", "type": "FakeDevice", "params": {"device_type": "camera"}},
                {"id": "motor1", "type": "StepperMotor"}
            ]"#,
        )
        .unwrap();

        assert_eq!(configs[0].id, "cam0");
        assert_eq!(configs[0].params.get("device_type").and_then(Value::as_str), Some("camera"));
        assert!(configs[1].params.is_empty());
    }

    #[test]
    fn test_parse_entry_without_type() {
        let configs = parse_device_configs(r#"{"x": {"port": "COM3"}}"#).unwrap();
        assert_eq!(configs[0].device_type, "");
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(matches!(parse_device_configs("42"), Err(Error::Config(_))));
        assert!(matches!(parse_device_configs(r#"{"x": 1}"#), Err(Error::Config(_))));
        assert!(matches!(parse_device_configs("{nope"), Err(Error::Serialization(_))));
    }

    #[test_log::test]
    fn test_loader_recovers_to_empty() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("broken.json"), "{ not json")?;
        fs::write(
            dir.path().join("devices.json"),
            r#"{"motor1": {"type": "StepperMotor"}}"#,
        )?;

        let loader = DeviceConfigLoader::new(dir.path());
        assert!(loader.load("missing.json").is_empty());
        assert!(loader.load("broken.json").is_empty());
        assert!(loader.try_load("missing.json").is_err());
        assert_eq!(loader.load("devices.json").len(), 1);

        Ok(())
    }
}
