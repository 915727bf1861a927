/*!
 * Configurable fake device for debugging pipelines without hardware.
 *
 * The `device_type` parameter picks a behaviour profile (`camera`, `sensor`,
 * `motor` or `generic`). `simulation_mode` scales the artificial delay and
 * `error_probability` makes start and commands fail at random.
 */
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use orchestra_core::{
    types::{Id, Params, Value},
    utils::{secs_to_duration, unix_timestamp},
};

use crate::device::{float_param, string_param, Device, DeviceError, Result};

/// Behaviour profile of a [`FakeDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// `capture` and `get_frame`
    Camera,
    /// `read`
    Sensor,
    /// `move`, `home` and `stop`
    Motor,
    /// Echoes every command
    Generic,
}

impl Profile {
    /// Profile name as used in params
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Camera => "camera",
            Profile::Sensor => "sensor",
            Profile::Motor => "motor",
            Profile::Generic => "generic",
        }
    }
}

impl FromStr for Profile {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "camera" => Ok(Profile::Camera),
            "sensor" => Ok(Profile::Sensor),
            "motor" => Ok(Profile::Motor),
            "generic" => Ok(Profile::Generic),
            other => Err(DeviceError::invalid_argument(format!(
                "unknown fake device profile '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay scaling applied by a [`FakeDevice`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMode {
    /// Base delay as configured
    Normal,
    /// Three times the base delay
    Slow,
    /// 30% of the base delay
    Fast,
    /// Base delay scaled by a random factor in [0.5, 2.0]
    Unstable,
}

impl SimulationMode {
    /// Mode name as used in params
    pub fn as_str(&self) -> &'static str {
        match self {
            SimulationMode::Normal => "normal",
            SimulationMode::Slow => "slow",
            SimulationMode::Fast => "fast",
            SimulationMode::Unstable => "unstable",
        }
    }

    /// Largest factor [`SimulationMode::scale`] applies
    fn max_factor(&self) -> f64 {
        match self {
            SimulationMode::Normal => 1.0,
            SimulationMode::Slow => 3.0,
            SimulationMode::Fast => 0.3,
            SimulationMode::Unstable => 2.0,
        }
    }

    /// `None` when the scaled delay does not fit a `Duration`
    fn scale(&self, delay: Duration) -> Option<Duration> {
        let factor = match self {
            SimulationMode::Unstable => rand::thread_rng().gen_range(0.5..=2.0),
            mode => mode.max_factor(),
        };
        secs_to_duration(delay.as_secs_f64() * factor)
    }
}

impl FromStr for SimulationMode {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(SimulationMode::Normal),
            "slow" => Ok(SimulationMode::Slow),
            "fast" => Ok(SimulationMode::Fast),
            "unstable" => Ok(SimulationMode::Unstable),
            other => Err(DeviceError::invalid_argument(format!(
                "unknown simulation mode '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    started: bool,
    data_counter: u64,
}

/// Fake device
#[derive(Debug)]
pub struct FakeDevice {
    id: Id,
    params: Params,
    profile: Profile,
    mode: SimulationMode,
    base_delay: Duration,
    error_probability: f64,
    state: Mutex<FakeState>,
}

impl FakeDevice {
    /// Factory type tag
    pub const TYPE: &'static str = "FakeDevice";

    /// Build a fake device from its params
    pub fn new(id: Id, params: Params) -> Result<Self> {
        let profile: Profile = string_param(&params, "device_type", "generic")?.parse()?;
        let mode: SimulationMode = string_param(&params, "simulation_mode", "normal")?.parse()?;
        let base_delay = secs_to_duration(float_param(&params, "base_delay", 0.1)?)
            .ok_or_else(|| {
                DeviceError::invalid_argument("base_delay must be a non-negative number of seconds")
            })?;
        if secs_to_duration(base_delay.as_secs_f64() * mode.max_factor()).is_none() {
            return Err(DeviceError::invalid_argument(format!(
                "base_delay is too large for simulation mode '{}'",
                mode.as_str()
            )));
        }
        let error_probability = float_param(&params, "error_probability", 0.02)?;
        if !(0.0..=1.0).contains(&error_probability) {
            return Err(DeviceError::invalid_argument("error_probability must be within [0, 1]"));
        }

        Ok(Self {
            id,
            params,
            profile,
            mode,
            base_delay,
            error_probability,
            state: Mutex::new(FakeState::default()),
        })
    }

    /// Behaviour profile
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Number of commands executed successfully
    pub fn data_counter(&self) -> u64 {
        self.state.lock().data_counter
    }

    async fn simulate_delay(&self, delay: Duration) {
        // base_delay was checked against the mode's largest factor
        let delay = self.mode.scale(delay).unwrap_or(Duration::MAX);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn should_fail(&self) -> bool {
        self.error_probability > 0.0 && rand::thread_rng().gen_bool(self.error_probability)
    }

    fn camera(&self, counter: u64, command: &str, args: &Params) -> Value {
        match command {
            "capture" => Value::object([
                ("image_id", Value::from(format!("fake_img_{}", counter))),
                ("timestamp", Value::from(unix_timestamp())),
                (
                    "resolution",
                    args.get("resolution")
                        .cloned()
                        .unwrap_or_else(|| Value::Array(vec![Value::from(640), Value::from(480)])),
                ),
                ("format", args.get("format").cloned().unwrap_or_else(|| Value::from("jpg"))),
                (
                    "save_to",
                    args.get("save_to")
                        .cloned()
                        .unwrap_or_else(|| Value::from(format!("images/fake_{}.jpg", counter))),
                ),
            ]),
            "get_frame" => Value::from(format!("fake_frame_data_{}", counter)),
            _ => self.generic(counter, command, args),
        }
    }

    fn sensor(&self, counter: u64, command: &str, args: &Params) -> Value {
        match command {
            "read" => {
                let value: f64 = rand::thread_rng().gen_range(18.0..=25.0);
                Value::object([
                    ("value", Value::from((value * 100.0).round() / 100.0)),
                    ("unit", Value::from("°C")),
                    ("timestamp", Value::from(unix_timestamp())),
                    ("reading_id", Value::Integer(counter as i64)),
                ])
            }
            _ => self.generic(counter, command, args),
        }
    }

    fn motor(&self, counter: u64, command: &str, args: &Params) -> Value {
        match command {
            "move" => Value::object([
                ("steps_moved", args.get("steps").cloned().unwrap_or(Value::Integer(100))),
                ("position", Value::Integer(counter as i64)),
            ]),
            "home" => Value::object([
                ("status", Value::from("homed")),
                ("position", Value::Integer(0)),
            ]),
            "stop" => Value::object([("status", "stopped")]),
            _ => self.generic(counter, command, args),
        }
    }

    fn generic(&self, counter: u64, command: &str, args: &Params) -> Value {
        Value::object([
            ("command", Value::from(command)),
            ("params", Value::Object(args.clone())),
            ("result", Value::from(format!("Executed {}", command))),
            ("execution_id", Value::Integer(counter as i64)),
            ("timestamp", Value::from(unix_timestamp())),
        ])
    }
}

#[async_trait]
impl Device for FakeDevice {
    fn id(&self) -> &Id {
        &self.id
    }

    fn device_type(&self) -> &str {
        Self::TYPE
    }

    fn params(&self) -> &Params {
        &self.params
    }

    async fn start(&self) -> Result<()> {
        self.simulate_delay(self.base_delay).await;
        if self.should_fail() {
            warn!(device_id = %self.id, "simulated start failure");
            return Err(DeviceError::command_failed("simulated start failure"));
        }
        self.state.lock().started = true;
        debug!(device_id = %self.id, profile = %self.profile, "fake device started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.simulate_delay(self.base_delay / 2).await;
        self.state.lock().started = false;
        debug!(device_id = %self.id, "fake device stopped");
        Ok(())
    }

    async fn status(&self) -> Value {
        let state = self.state.lock();
        Value::object([
            ("id", Value::from(&self.id)),
            ("type", Value::from(Self::TYPE)),
            ("started", Value::from(state.started)),
            ("device_type", Value::from(self.profile.as_str())),
            ("simulation_mode", Value::from(self.mode.as_str())),
            ("data_counter", Value::Integer(state.data_counter as i64)),
        ])
    }

    async fn send_command(&self, command: &str, args: Params) -> Result<Value> {
        if !self.state.lock().started {
            return Err(DeviceError::NotStarted(self.id.to_string()));
        }

        self.simulate_delay(self.base_delay).await;
        if self.should_fail() {
            warn!(device_id = %self.id, command, "simulated command failure");
            return Err(DeviceError::command_failed(format!(
                "simulated failure of command '{}'",
                command
            )));
        }

        let counter = {
            let mut state = self.state.lock();
            state.data_counter += 1;
            state.data_counter
        };

        Ok(match self.profile {
            Profile::Camera => self.camera(counter, command, &args),
            Profile::Sensor => self.sensor(counter, command, &args),
            Profile::Motor => self.motor(counter, command, &args),
            Profile::Generic => self.generic(counter, command, &args),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn fake(profile: &str, extra: &[(&str, Value)]) -> FakeDevice {
        let mut params = Params::new();
        params.insert("device_type".to_string(), Value::from(profile));
        params.insert("base_delay".to_string(), Value::from(0.0));
        params.insert("error_probability".to_string(), Value::from(0.0));
        for (k, v) in extra {
            params.insert(k.to_string(), v.clone());
        }
        FakeDevice::new(Id::from(profile), params).unwrap()
    }

    #[test]
    fn test_rejects_bad_params() {
        let with = |key: &str, value: Value| {
            let mut params = Params::new();
            params.insert(key.to_string(), value);
            FakeDevice::new(Id::from("x"), params)
        };
        assert!(matches!(
            with("device_type", Value::from("laser")),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(with("simulation_mode", Value::from("turbo")).is_err());
        assert!(with("base_delay", Value::from(-1.0)).is_err());
        assert!(with("error_probability", Value::from(1.5)).is_err());
    }

    #[test]
    fn test_base_delay_must_survive_scaling() {
        let mut params = Params::new();
        params.insert("base_delay".to_string(), Value::from(1e19));
        params.insert("simulation_mode".to_string(), Value::from("slow"));
        assert!(matches!(
            FakeDevice::new(Id::from("x"), params.clone()),
            Err(DeviceError::InvalidArgument(_))
        ));

        params.insert("simulation_mode".to_string(), Value::from("fast"));
        assert!(FakeDevice::new(Id::from("x"), params.clone()).is_ok());

        params.insert("base_delay".to_string(), Value::from(1e20));
        assert!(FakeDevice::new(Id::from("x"), params).is_err());
    }

    #[test]
    fn test_mode_scaling() {
        let delay = Duration::from_millis(100);
        assert_eq!(SimulationMode::Normal.scale(delay), Some(delay));
        assert_eq!(SimulationMode::Slow.scale(delay), Some(Duration::from_millis(300)));
        let unstable = SimulationMode::Unstable.scale(delay).unwrap();
        assert!(unstable >= Duration::from_millis(50) && unstable <= Duration::from_millis(200));
        assert_eq!(SimulationMode::Slow.scale(Duration::MAX), None);
    }

    #[tokio::test]
    async fn test_commands_require_start() {
        let device = fake("generic", &[]);
        assert!(matches!(
            device.send_command("ping", Params::new()).await,
            Err(DeviceError::NotStarted(_))
        ));

        assert_ok!(device.start().await);
        let result = device.send_command("ping", Params::new()).await.unwrap();
        assert_eq!(result.get("result"), Some(&Value::from("Executed ping")));
        assert_eq!(result.get("execution_id"), Some(&Value::Integer(1)));

        assert_ok!(device.stop().await);
        assert!(device.send_command("ping", Params::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_camera_profile() {
        let device = fake("camera", &[]);
        device.start().await.unwrap();

        let mut args = Params::new();
        args.insert("save_to".to_string(), Value::from("out/a.jpg"));
        let shot = device.send_command("capture", args).await.unwrap();
        assert_eq!(shot.get("image_id"), Some(&Value::from("fake_img_1")));
        assert_eq!(shot.get("save_to"), Some(&Value::from("out/a.jpg")));
        assert_eq!(shot.get("format"), Some(&Value::from("jpg")));

        let frame = device.send_command("get_frame", Params::new()).await.unwrap();
        assert_eq!(frame, Value::from("fake_frame_data_2"));
        assert_eq!(device.data_counter(), 2);
    }

    #[tokio::test]
    async fn test_motor_and_sensor_profiles() {
        let motor = fake("motor", &[("simulation_mode", Value::from("fast"))]);
        motor.start().await.unwrap();
        let moved = motor.send_command("move", Params::new()).await.unwrap();
        assert_eq!(moved.get("steps_moved"), Some(&Value::Integer(100)));
        let homed = motor.send_command("home", Params::new()).await.unwrap();
        assert_eq!(homed.get("status"), Some(&Value::from("homed")));

        let sensor = fake("sensor", &[]);
        sensor.start().await.unwrap();
        let reading = sensor.send_command("read", Params::new()).await.unwrap();
        let value = reading.get("value").and_then(Value::as_float).unwrap();
        assert!((18.0..=25.0).contains(&value));
    }

    #[tokio::test]
    async fn test_certain_failure() {
        let device = fake("generic", &[("error_probability", Value::from(1.0))]);
        assert!(matches!(device.start().await, Err(DeviceError::CommandFailed(_))));
        assert_eq!(device.status().await.get("started"), Some(&Value::Bool(false)));
    }

    #[tokio::test]
    async fn test_status_fields() {
        let device = fake("sensor", &[("simulation_mode", Value::from("unstable"))]);
        let status = device.status().await;
        assert_eq!(status.get("id"), Some(&Value::from("sensor")));
        assert_eq!(status.get("type"), Some(&Value::from("FakeDevice")));
        assert_eq!(status.get("simulation_mode"), Some(&Value::from("unstable")));
        assert_eq!(status.get("data_counter"), Some(&Value::Integer(0)));
    }
}
