/*!
 * Communication channel definitions.
 *
 * A channel is a stateful, protocol-versioned transport owned by the device
 * that created it. Commands travel as single text lines of the form
 * `"<version>:<command> key=value ...\n"`, with arguments sorted by key so
 * the envelope for a given call is always the same.
 */
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use orchestra_core::types::{Params, Value};

/// Receive timeout applied when neither the channel config nor the factory
/// provides one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for channel operations
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Connecting failed, or the operation needs a connected channel
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response arrived in time
    #[error("Timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    /// The peer closed the connection
    #[error("Channel closed by peer")]
    Closed,

    /// The protocol version is not one of 1.0, 2.0, 3.0
    #[error("Unsupported protocol version '{0}'")]
    UnsupportedProtocol(String),

    /// No constructor is bound to the channel type
    #[error("Unknown channel type '{tag}'. Available types: {}", available.join(", "))]
    UnknownType {
        /// The requested tag
        tag: String,
        /// Tags that are bound
        available: Vec<String>,
    },

    /// The channel type is already bound
    #[error("Channel type '{0}' is already registered")]
    AlreadyRegistered(String),

    /// Channel configuration is malformed
    #[error("Invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

impl ChannelError {
    /// Create a new connection error
    pub fn connection<S: AsRef<str>>(msg: S) -> Self {
        ChannelError::Connection(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn invalid_config<S: AsRef<str>>(msg: S) -> Self {
        ChannelError::InvalidConfig(msg.as_ref().to_string())
    }
}

/// Connection state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Not connected
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Ready for send and receive
    Connected,
    /// The last connection attempt failed
    Error,
}

impl ChannelState {
    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Error => "error",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ProtocolVersion {
    /// Version 1.0
    #[default]
    #[serde(rename = "1.0")]
    V1,
    /// Version 2.0
    #[serde(rename = "2.0")]
    V2,
    /// Version 3.0
    #[serde(rename = "3.0")]
    V3,
}

impl ProtocolVersion {
    /// Convert to the envelope prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "1.0",
            ProtocolVersion::V2 => "2.0",
            ProtocolVersion::V3 => "3.0",
        }
    }

    /// Read a version from a config value, accepting `"2.0"` as well as `2`
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => s.parse(),
            Value::Integer(_) | Value::Float(_) => value.to_string().parse(),
            other => Err(ChannelError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().parse::<f64>() {
            Ok(v) if v == 1.0 => Ok(ProtocolVersion::V1),
            Ok(v) if v == 2.0 => Ok(ProtocolVersion::V2),
            Ok(v) if v == 3.0 => Ok(ProtocolVersion::V3),
            _ => Err(ChannelError::UnsupportedProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render the wire envelope for `command`
pub fn frame_command(version: ProtocolVersion, command: &str, args: &Params) -> String {
    let mut line = format!("{}:{}", version, command);
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    for key in keys {
        line.push_str(&format!(" {}={}", key, args[key]));
    }
    line.push('\n');
    line
}

/// Settings every channel reads from its config bag
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSettings {
    /// Protocol version from `protocol_version` (default 1.0)
    pub protocol_version: ProtocolVersion,
    /// Default receive timeout from `timeout`, in seconds
    pub timeout: Duration,
}

impl ChannelSettings {
    /// Parse the common settings out of a channel config
    pub fn from_config(config: &Params) -> Result<Self> {
        let protocol_version = match config.get("protocol_version") {
            None | Some(Value::Null) => ProtocolVersion::default(),
            Some(v) => ProtocolVersion::from_value(v)?,
        };
        let timeout = match config.get("timeout") {
            None | Some(Value::Null) => DEFAULT_TIMEOUT,
            Some(v) => v
                .as_float()
                .and_then(orchestra_core::utils::secs_to_duration)
                .ok_or_else(|| {
                    ChannelError::invalid_config(format!(
                        "'timeout' must be a non-negative number of seconds, got {}",
                        v
                    ))
                })?,
        };
        Ok(Self {
            protocol_version,
            timeout,
        })
    }
}

/// A stateful, protocol-versioned transport
#[async_trait]
pub trait Channel: Send + Sync + Debug {
    /// Factory key of this channel kind
    fn channel_type(&self) -> &str;

    /// Configuration bag the channel was built from
    fn config(&self) -> &Params;

    /// Current connection state
    fn state(&self) -> ChannelState;

    /// Protocol version used for outgoing envelopes
    fn protocol_version(&self) -> ProtocolVersion;

    /// Change the protocol version; applies to the next send
    fn set_protocol_version(&mut self, version: ProtocolVersion);

    /// Default receive timeout
    fn timeout(&self) -> Duration;

    /// Open the transport. `Disconnected -> Connecting -> Connected`, or
    /// `Connecting -> Error` with a [`ChannelError::Connection`].
    async fn connect(&mut self) -> Result<()>;

    /// Close the transport; closing a closed channel is not an error
    async fn disconnect(&mut self) -> Result<()>;

    /// Write one command envelope
    async fn send(&mut self, command: &str, args: &Params) -> Result<()>;

    /// Read one response line
    async fn receive(&mut self, timeout: Duration) -> Result<String>;

    /// Whether the channel is connected
    fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Send a command and wait for its response
    async fn request(&mut self, command: &str, args: &Params, timeout: Duration) -> Result<String> {
        self.send(command, args).await?;
        self.receive(timeout).await
    }

    /// Connected and answering a `ping`
    async fn health_check(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let timeout = self.timeout();
        match self.request("ping", &Params::new(), timeout).await {
            Ok(_) => true,
            Err(e) => {
                debug!(channel = self.channel_type(), error = %e, "health check failed");
                false
            }
        }
    }

    /// Snapshot of state, protocol version, config and connected flag
    fn status(&self) -> Value {
        Value::object([
            ("type", Value::from(self.channel_type())),
            ("state", Value::from(self.state().as_str())),
            ("protocol_version", Value::from(self.protocol_version().as_str())),
            ("config", Value::from(self.config().clone())),
            ("connected", Value::from(self.is_connected())),
        ])
    }
}

/// Fails with [`ChannelError::Connection`] unless the channel is connected
pub fn ensure_connected(channel: &dyn Channel) -> Result<()> {
    if channel.is_connected() {
        Ok(())
    } else {
        Err(ChannelError::connection(format!(
            "{} channel is {}",
            channel.channel_type(),
            channel.state()
        )))
    }
}

/// Builds a channel from its configuration bag
pub type ChannelConstructor = Arc<dyn Fn(Params) -> Result<Box<dyn Channel>> + Send + Sync>;

/// Channel type to constructor mapping
pub struct ChannelFactory {
    constructors: HashMap<String, ChannelConstructor>,
    default_timeout: Duration,
}

impl ChannelFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use `timeout` for channels whose config has no `timeout`
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Bind `tag` to `constructor`; an already bound tag is rejected
    pub fn register<S: Into<String>>(
        &mut self,
        tag: S,
        constructor: ChannelConstructor,
    ) -> Result<()> {
        let tag = tag.into();
        if self.constructors.contains_key(&tag) {
            return Err(ChannelError::AlreadyRegistered(tag));
        }
        debug!(channel_type = %tag, "channel type registered");
        self.constructors.insert(tag, constructor);
        Ok(())
    }

    /// Bind `tag` to a closure
    pub fn register_fn<S, F>(&mut self, tag: S, f: F) -> Result<()>
    where
        S: Into<String>,
        F: Fn(Params) -> Result<Box<dyn Channel>> + Send + Sync + 'static,
    {
        self.register(tag, Arc::new(f))
    }

    /// Remove a binding; returns whether it existed
    pub fn unregister(&mut self, tag: &str) -> bool {
        self.constructors.remove(tag).is_some()
    }

    /// Build a channel of type `tag`
    pub fn create(&self, tag: &str, mut config: Params) -> Result<Box<dyn Channel>> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| ChannelError::UnknownType {
                tag: tag.to_string(),
                available: self.available(),
            })?;
        config
            .entry("timeout".to_string())
            .or_insert_with(|| Value::from(self.default_timeout.as_secs_f64()));
        debug!(channel_type = %tag, "creating channel");
        constructor(config)
    }

    /// Bound tags, sorted
    pub fn available(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.constructors.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Whether `tag` is bound
    pub fn is_registered(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }
}

impl Default for ChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for ChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("types", &self.available())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::SimulatedChannel;

    fn args(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_frame_command_sorts_arguments() {
        let line = frame_command(
            ProtocolVersion::V2,
            "MOVE",
            &args(&[
                ("speed", Value::from(0.5)),
                ("axis", Value::from("x")),
                ("steps", Value::from(100)),
            ]),
        );
        assert_eq!(line, "2.0:MOVE axis=x speed=0.5 steps=100\n");
    }

    #[test]
    fn test_frame_command_without_arguments() {
        assert_eq!(frame_command(ProtocolVersion::V1, "ping", &Params::new()), "1.0:ping\n");
    }

    #[test]
    fn test_protocol_version_parsing() {
        assert_eq!("1.0".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V1);
        assert_eq!("3".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::V3);
        assert_eq!(ProtocolVersion::from_value(&Value::from(2.0)).unwrap(), ProtocolVersion::V2);
        assert!(matches!(
            "4.0".parse::<ProtocolVersion>(),
            Err(ChannelError::UnsupportedProtocol(v)) if v == "4.0"
        ));
        assert!(ProtocolVersion::from_value(&Value::Bool(true)).is_err());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = ChannelSettings::from_config(&args(&[
            ("protocol_version", Value::from("3.0")),
            ("timeout", Value::from(0.25)),
        ]))
        .unwrap();
        assert_eq!(settings.protocol_version, ProtocolVersion::V3);
        assert_eq!(settings.timeout, Duration::from_millis(250));

        let defaults = ChannelSettings::from_config(&Params::new()).unwrap();
        assert_eq!(defaults.protocol_version, ProtocolVersion::V1);
        assert_eq!(defaults.timeout, DEFAULT_TIMEOUT);

        assert!(ChannelSettings::from_config(&args(&[("timeout", Value::from(-1))])).is_err());
        assert!(matches!(
            ChannelSettings::from_config(&args(&[("timeout", Value::from(1e20))])),
            Err(ChannelError::InvalidConfig(_))
        ));
    }

    fn simulated_factory() -> ChannelFactory {
        let mut factory = ChannelFactory::new().with_default_timeout(Duration::from_millis(40));
        factory
            .register_fn("simulated", |config| {
                Ok(Box::new(SimulatedChannel::new(config)?) as Box<dyn Channel>)
            })
            .unwrap();
        factory
    }

    #[test]
    fn test_factory_policies() {
        let mut factory = simulated_factory();
        assert!(matches!(
            factory.register_fn("simulated", |config| {
                Ok(Box::new(SimulatedChannel::new(config)?) as Box<dyn Channel>)
            }),
            Err(ChannelError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            factory.create("serial", Params::new()),
            Err(ChannelError::UnknownType { available, .. })
                if available == vec!["simulated".to_string()]
        ));
        assert_eq!(factory.available(), vec!["simulated".to_string()]);
        assert!(factory.unregister("simulated"));
        assert!(!factory.unregister("simulated"));
        assert!(!factory.is_registered("simulated"));
    }

    #[test]
    fn test_factory_injects_default_timeout() {
        let factory = simulated_factory();
        let channel = factory.create("simulated", Params::new()).unwrap();
        assert_eq!(channel.timeout(), Duration::from_millis(40));

        let channel = factory
            .create("simulated", args(&[("timeout", Value::from(1))]))
            .unwrap();
        assert_eq!(channel.timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_status_reflects_state() {
        let factory = simulated_factory();
        let mut channel = factory
            .create("simulated", args(&[("protocol_version", Value::from("2.0"))]))
            .unwrap();

        let status = channel.status();
        assert_eq!(status.get("state").and_then(Value::as_str), Some("disconnected"));
        assert_eq!(status.get("protocol_version").and_then(Value::as_str), Some("2.0"));
        assert_eq!(status.get("connected"), Some(&Value::Bool(false)));

        channel.connect().await.unwrap();
        assert_eq!(channel.status().get("connected"), Some(&Value::Bool(true)));
        assert!(channel.health_check().await);

        channel.disconnect().await.unwrap();
        assert!(!channel.health_check().await);
    }
}
