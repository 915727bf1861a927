/*!
 * Stepper motor driven over a communication channel.
 *
 * Wire commands: `INIT` on start, `STOP` on stop, `HOME`, `MOVE steps=<n>`
 * and `ESTOP`. Each is sent as a request and its response line is returned
 * in the command result.
 */
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use orchestra_core::{
    types::{Id, Params, Value},
    utils::unix_timestamp,
};

use crate::channel::{Channel, ChannelFactory};
use crate::device::{integer_param, string_param, Device, DeviceError, Result};

/// Parameters consumed by the motor itself; everything else is channel config
const MOTOR_KEYS: &[&str] = &[
    "channel",
    "home_duration_ms",
    "step_duration_us",
    "microstep",
    "steps_per_rev",
];

#[derive(Debug, Default)]
struct MotorState {
    started: bool,
    homed: bool,
    position: i64,
}

/// Stepper motor device
#[derive(Debug)]
pub struct StepperMotor {
    id: Id,
    params: Params,
    channel: tokio::sync::Mutex<Box<dyn Channel>>,
    state: Mutex<MotorState>,
    home_duration: Duration,
    step_duration: Duration,
    microstep: i64,
    steps_per_rev: i64,
}

impl StepperMotor {
    /// Factory type tag
    pub const TYPE: &'static str = "StepperMotor";

    /// Build a motor; its channel comes from `channels` using the `channel`
    /// parameter (default `simulated`)
    pub fn new(id: Id, params: Params, channels: &ChannelFactory) -> Result<Self> {
        let channel_type = string_param(&params, "channel", "simulated")?;
        let home_ms = non_negative(
            integer_param(&params, "home_duration_ms", 2000)?,
            "home_duration_ms",
        )?;
        let step_us = non_negative(
            integer_param(&params, "step_duration_us", 1000)?,
            "step_duration_us",
        )?;
        let microstep = integer_param(&params, "microstep", 16)?;
        let steps_per_rev = integer_param(&params, "steps_per_rev", 200)?;

        let channel_config: Params = params
            .iter()
            .filter(|(k, _)| !MOTOR_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let channel = channels.create(&channel_type, channel_config)?;

        Ok(Self {
            id,
            params,
            channel: tokio::sync::Mutex::new(channel),
            state: Mutex::new(MotorState::default()),
            home_duration: Duration::from_millis(home_ms),
            step_duration: Duration::from_micros(step_us),
            microstep,
            steps_per_rev,
        })
    }

    /// Current position in steps
    pub fn position(&self) -> i64 {
        self.state.lock().position
    }

    fn require_started(&self) -> Result<()> {
        if self.state.lock().started {
            Ok(())
        } else {
            Err(DeviceError::NotStarted(self.id.to_string()))
        }
    }

    async fn exchange(&self, command: &str, args: Params) -> Result<String> {
        let mut channel = self.channel.lock().await;
        let timeout = channel.timeout();
        let response = channel.request(command, &args, timeout).await?;
        debug!(device_id = %self.id, command, response = %response, "motor exchange");
        Ok(response)
    }

    async fn home(&self) -> Result<Value> {
        let response = self.exchange("HOME", Params::new()).await?;
        tokio::time::sleep(self.home_duration).await;
        {
            let mut state = self.state.lock();
            state.position = 0;
            state.homed = true;
        }
        Ok(Value::object([
            ("status", Value::from("homed")),
            ("position", Value::from(0)),
            ("response", Value::from(response)),
            ("timestamp", Value::from(unix_timestamp())),
        ]))
    }

    async fn move_steps(&self, steps: i64) -> Result<Value> {
        let move_time = u32::try_from(steps.unsigned_abs())
            .ok()
            .and_then(|n| self.step_duration.checked_mul(n))
            .ok_or_else(|| {
                DeviceError::invalid_argument(format!("steps out of range: {}", steps))
            })?;
        if self.position().checked_add(steps).is_none() {
            return Err(position_overflow(self.position(), steps));
        }

        let mut args = Params::new();
        args.insert("steps".to_string(), Value::from(steps));
        let response = self.exchange("MOVE", args).await?;
        tokio::time::sleep(move_time).await;

        let position = {
            let mut state = self.state.lock();
            state.position = state
                .position
                .checked_add(steps)
                .ok_or_else(|| position_overflow(state.position, steps))?;
            state.position
        };
        Ok(Value::object([
            ("steps_moved", Value::from(steps)),
            ("position", Value::from(position)),
            ("move_time", Value::from(move_time.as_secs_f64())),
            ("response", Value::from(response)),
            ("timestamp", Value::from(unix_timestamp())),
        ]))
    }

    async fn emergency_stop(&self) -> Result<Value> {
        let response = self.exchange("ESTOP", Params::new()).await?;
        warn!(device_id = %self.id, "emergency stop");
        Ok(Value::object([
            ("status", Value::from("stopped")),
            ("position", Value::from(self.position())),
            ("response", Value::from(response)),
            ("timestamp", Value::from(unix_timestamp())),
        ]))
    }

    fn set_position(&self, position: i64) -> Value {
        let old_position = std::mem::replace(&mut self.state.lock().position, position);
        Value::object([
            ("old_position", Value::from(old_position)),
            ("new_position", Value::from(position)),
            ("timestamp", Value::from(unix_timestamp())),
        ])
    }
}

fn position_overflow(position: i64, steps: i64) -> DeviceError {
    DeviceError::invalid_argument(format!(
        "moving {} steps from position {} overflows",
        steps, position
    ))
}

fn non_negative(value: i64, key: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| DeviceError::invalid_argument(format!("'{}' must not be negative", key)))
}

#[async_trait]
impl Device for StepperMotor {
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
        if self.state.lock().started {
            return Ok(());
        }

        let mut channel = self.channel.lock().await;
        channel.connect().await?;
        let timeout = channel.timeout();
        if let Err(e) = channel.request("INIT", &Params::new(), timeout).await {
            if let Err(close_err) = channel.disconnect().await {
                debug!(device_id = %self.id, error = %close_err, "disconnect after failed INIT");
            }
            return Err(e.into());
        }
        drop(channel);

        self.state.lock().started = true;
        info!(device_id = %self.id, "stepper motor started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        if channel.is_connected() {
            let timeout = channel.timeout();
            if let Err(e) = channel.request("STOP", &Params::new(), timeout).await {
                warn!(device_id = %self.id, error = %e, "STOP was not acknowledged");
            }
        }
        channel.disconnect().await?;
        drop(channel);

        self.state.lock().started = false;
        info!(device_id = %self.id, "stepper motor stopped");
        Ok(())
    }

    async fn status(&self) -> Value {
        let channel_status = self.channel.lock().await.status();
        let state = self.state.lock();
        Value::object([
            ("id", Value::from(&self.id)),
            ("type", Value::from(Self::TYPE)),
            ("started", Value::from(state.started)),
            ("homed", Value::from(state.homed)),
            ("position", Value::from(state.position)),
            ("microstep", Value::from(self.microstep)),
            ("steps_per_rev", Value::from(self.steps_per_rev)),
            ("channel", channel_status),
        ])
    }

    async fn send_command(&self, command: &str, args: Params) -> Result<Value> {
        self.require_started()?;
        match command {
            "home" => self.home().await,
            "move" => self.move_steps(integer_param(&args, "steps", 0)?).await,
            "stop" => self.emergency_stop().await,
            "set_position" => Ok(self.set_position(integer_param(&args, "position", 0)?)),
            "get_position" => Ok(Value::object([
                ("position", Value::from(self.position())),
                ("timestamp", Value::from(unix_timestamp())),
            ])),
            _ => Err(DeviceError::unknown_command(&self.id, command)),
        }
    }
}
