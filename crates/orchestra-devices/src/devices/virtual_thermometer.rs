/*!
 * Simulated thermometer with a background sampling loop.
 *
 * While started, a tokio task takes a reading every `measurement_interval`
 * seconds: a random walk bounded by `min_temp`/`max_temp` with occasional
 * spikes. Each reading is published as `device.data`; readings above
 * `overheat_threshold` are also published as `thermometer.overheat`.
 */
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use orchestra_core::{
    event::{event_types, SharedEventBus},
    logging::component_span,
    types::{Id, Params, Value},
    utils::{secs_to_duration, unix_timestamp},
};

use crate::device::{float_param, integer_param, Device, DeviceError, Result};

/// Commands answered while the sampling loop is not running
const OFFLINE_COMMANDS: &[&str] = &["get_temperature", "get_logs", "clear_logs"];

#[derive(Debug, Clone)]
struct Settings {
    min_temp: f64,
    max_temp: f64,
    overheat_threshold: f64,
    interval: Duration,
    drift: f64,
    spike_probability: f64,
    stop_timeout: Duration,
    max_log_entries: usize,
}

impl Settings {
    fn from_params(params: &Params) -> Result<Self> {
        let min_temp = float_param(params, "min_temp", 20.0)?;
        let max_temp = float_param(params, "max_temp", 30.0)?;
        if !(min_temp <= max_temp) {
            return Err(DeviceError::invalid_argument(format!(
                "min_temp ({}) must not exceed max_temp ({})",
                min_temp, max_temp
            )));
        }

        let drift = float_param(params, "temperature_drift", 0.5)?;
        if !(drift >= 0.0 && drift.is_finite()) {
            return Err(DeviceError::invalid_argument(
                "temperature_drift must be a non-negative number",
            ));
        }

        let spike_probability = float_param(params, "spike_probability", 0.1)?;
        if !(0.0..=1.0).contains(&spike_probability) {
            return Err(DeviceError::invalid_argument("spike_probability must be within [0, 1]"));
        }

        let seconds = |key: &str, default: f64| -> Result<Duration> {
            secs_to_duration(float_param(params, key, default)?)
                .ok_or_else(|| {
                    DeviceError::invalid_argument(format!(
                        "{} must be a non-negative number of seconds",
                        key
                    ))
                })
        };

        let max_log_entries = usize::try_from(integer_param(params, "max_log_entries", 1000)?)
            .map_err(|_| DeviceError::invalid_argument("max_log_entries must not be negative"))?;

        Ok(Self {
            min_temp,
            max_temp,
            overheat_threshold: float_param(params, "overheat_threshold", 28.0)?,
            interval: seconds("measurement_interval", 1.0)?,
            drift,
            spike_probability,
            stop_timeout: seconds("stop_timeout", 2.0)?,
            max_log_entries,
        })
    }

    fn clamp(&self, temperature: f64) -> f64 {
        temperature.clamp(self.min_temp, self.max_temp)
    }
}

#[derive(Debug, Default)]
struct Readings {
    started: bool,
    temperature: f64,
    measurement_count: u64,
    measurements: VecDeque<Value>,
    overheat_events: VecDeque<Value>,
    cooling_commands: VecDeque<Value>,
}

/// State shared between the device and its sampling task
#[derive(Debug)]
struct Shared {
    id: Id,
    settings: Settings,
    readings: Mutex<Readings>,
    event_bus: Option<SharedEventBus>,
}

fn push_bounded(log: &mut VecDeque<Value>, entry: Value, limit: usize) {
    if limit == 0 {
        return;
    }
    while log.len() >= limit {
        log.pop_front();
    }
    log.push_back(entry);
}

impl Shared {
    /// Take one reading and publish it
    fn sample(&self) {
        let (measurement, overheat) = {
            let mut rng = rand::thread_rng();
            let mut readings = self.readings.lock();
            readings.measurement_count += 1;

            let mut temperature = readings.temperature;
            if self.settings.drift > 0.0 {
                temperature += rng.gen_range(-self.settings.drift..=self.settings.drift);
            }
            temperature = self.settings.clamp(temperature);
            if rng.gen_bool(self.settings.spike_probability) {
                temperature = self.settings.clamp(temperature + rng.gen_range(-1.5..=2.0));
            }
            readings.temperature = temperature;

            let rounded = round2(temperature);
            let timestamp = unix_timestamp();
            let measurement = Value::object([
                ("measurement_id", Value::Integer(readings.measurement_count as i64)),
                ("temperature", Value::from(rounded)),
                ("timestamp", Value::from(timestamp)),
                ("unit", Value::from("°C")),
                ("device_id", Value::from(&self.id)),
            ]);
            let limit = self.settings.max_log_entries;
            push_bounded(&mut readings.measurements, measurement.clone(), limit);

            let overheat = if rounded > self.settings.overheat_threshold {
                let event = Value::object([
                    ("device_id", Value::from(&self.id)),
                    ("temperature", Value::from(rounded)),
                    ("threshold", Value::from(self.settings.overheat_threshold)),
                    ("timestamp", Value::from(timestamp)),
                    ("measurement_id", Value::Integer(readings.measurement_count as i64)),
                ]);
                push_bounded(&mut readings.overheat_events, event.clone(), limit);
                Some(event)
            } else {
                None
            };
            (measurement, overheat)
        };

        if let Some(bus) = &self.event_bus {
            bus.emit_from(
                &self.id,
                event_types::DEVICE_DATA,
                Value::object([
                    ("device_id", Value::from(&self.id)),
                    ("device_type", Value::from(VirtualThermometer::TYPE)),
                    ("data", measurement),
                ]),
            );
            if let Some(event) = overheat {
                warn!(device_id = %self.id, "temperature above overheat threshold");
                bus.emit_from(&self.id, event_types::THERMOMETER_OVERHEAT, event);
            }
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn sampling_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    debug!(device_id = %shared.id, "sampling loop started");
    loop {
        shared.sample();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(shared.settings.interval) => {}
        }
    }
    debug!(device_id = %shared.id, "sampling loop finished");
}

#[derive(Debug)]
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Virtual thermometer device
#[derive(Debug)]
pub struct VirtualThermometer {
    params: Params,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl VirtualThermometer {
    /// Factory type tag
    pub const TYPE: &'static str = "VirtualThermometer";

    /// Build a thermometer publishing to `event_bus`
    pub fn new(id: Id, params: Params, event_bus: Option<SharedEventBus>) -> Result<Self> {
        let settings = Settings::from_params(&params)?;
        let readings = Readings {
            temperature: (settings.min_temp + settings.max_temp) / 2.0,
            ..Readings::default()
        };
        Ok(Self {
            params,
            shared: Arc::new(Shared {
                id,
                settings,
                readings: Mutex::new(readings),
                event_bus,
            }),
            worker: Mutex::new(None),
        })
    }

    /// Current temperature, unrounded
    pub fn current_temperature(&self) -> f64 {
        self.shared.readings.lock().temperature
    }

    /// Number of readings taken so far
    pub fn measurement_count(&self) -> u64 {
        self.shared.readings.lock().measurement_count
    }

    /// Lower the temperature by `power` degrees, not below `min_temp`
    pub fn activate_cooling(&self, power: f64) -> Value {
        let mut readings = self.shared.readings.lock();
        let before = readings.temperature;
        readings.temperature = (before - power).max(self.shared.settings.min_temp);
        let record = Value::object([
            ("command", Value::from("cooling_activate")),
            ("power", Value::from(power)),
            ("temperature_before", Value::from(round2(before))),
            ("temperature_after", Value::from(round2(readings.temperature))),
            ("timestamp", Value::from(unix_timestamp())),
        ]);
        let limit = self.shared.settings.max_log_entries;
        push_bounded(&mut readings.cooling_commands, record.clone(), limit);
        info!(device_id = %self.shared.id, power, "cooling activated");
        record
    }

    /// Force the temperature, clamped to the configured range
    pub fn set_temperature(&self, temperature: f64) -> f64 {
        let clamped = self.shared.settings.clamp(temperature);
        self.shared.readings.lock().temperature = clamped;
        clamped
    }

    fn logs(&self) -> Value {
        let readings = self.shared.readings.lock();
        let list = |log: &VecDeque<Value>| Value::Array(log.iter().cloned().collect());
        Value::object([
            ("measurements", list(&readings.measurements)),
            ("overheat_events", list(&readings.overheat_events)),
            ("cooling_commands", list(&readings.cooling_commands)),
        ])
    }

    fn clear_logs(&self) {
        let mut readings = self.shared.readings.lock();
        readings.measurements.clear();
        readings.overheat_events.clear();
        readings.cooling_commands.clear();
        readings.measurement_count = 0;
    }
}

#[async_trait]
impl Device for VirtualThermometer {
    fn id(&self) -> &Id {
        &self.shared.id
    }

    fn device_type(&self) -> &str {
        Self::TYPE
    }

    fn params(&self) -> &Params {
        &self.params
    }

    async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.readings.lock().started = true;

        let cancel = CancellationToken::new();
        let span = component_span(Self::TYPE, Some(self.shared.id.as_str()));
        let sampling = sampling_loop(self.shared.clone(), cancel.clone());
        let handle = tokio::spawn(sampling.instrument(span));
        *worker = Some(Worker { cancel, handle });
        info!(
            device_id = %self.shared.id,
            interval = ?self.shared.settings.interval,
            "thermometer started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().take();
        self.shared.readings.lock().started = false;
        let Some(Worker { cancel, mut handle }) = worker else {
            return Ok(());
        };

        cancel.cancel();
        match tokio::time::timeout(self.shared.settings.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(device_id = %self.shared.id, error = %e, "sampling task ended abnormally")
            }
            Err(_) => {
                warn!(
                    device_id = %self.shared.id,
                    timeout = ?self.shared.settings.stop_timeout,
                    "sampling loop did not stop in time, aborting"
                );
                handle.abort();
            }
        }
        info!(device_id = %self.shared.id, "thermometer stopped");
        Ok(())
    }

    async fn status(&self) -> Value {
        let settings = &self.shared.settings;
        let readings = self.shared.readings.lock();
        Value::object([
            ("id", Value::from(&self.shared.id)),
            ("type", Value::from(Self::TYPE)),
            ("started", Value::from(readings.started)),
            ("current_temperature", Value::from(round2(readings.temperature))),
            ("overheat_threshold", Value::from(settings.overheat_threshold)),
            ("measurement_count", Value::Integer(readings.measurement_count as i64)),
            ("measurement_interval", Value::from(settings.interval.as_secs_f64())),
            (
                "temperature_range",
                Value::Array(vec![Value::from(settings.min_temp), Value::from(settings.max_temp)]),
            ),
            ("recent_measurements", Value::from(readings.measurements.len())),
            ("overheat_events_count", Value::from(readings.overheat_events.len())),
            ("cooling_commands_count", Value::from(readings.cooling_commands.len())),
        ])
    }

    async fn send_command(&self, command: &str, args: Params) -> Result<Value> {
        let started = self.shared.readings.lock().started;
        if !started && !OFFLINE_COMMANDS.contains(&command) {
            return Err(DeviceError::NotStarted(self.shared.id.to_string()));
        }

        match command {
            "get_temperature" => Ok(Value::object([
                ("temperature", Value::from(round2(self.current_temperature()))),
                ("timestamp", Value::from(unix_timestamp())),
                ("unit", Value::from("°C")),
                ("device_id", Value::from(&self.shared.id)),
            ])),
            "set_temperature" => {
                let requested = float_param(&args, "temperature", self.current_temperature())?;
                let temperature = self.set_temperature(requested);
                Ok(Value::object([
                    ("temperature", Value::from(temperature)),
                    ("timestamp", Value::from(unix_timestamp())),
                ]))
            }
            "cooling_activate" => Ok(self.activate_cooling(float_param(&args, "power", 2.0)?)),
            "get_logs" => Ok(self.logs()),
            "clear_logs" => {
                self.clear_logs();
                Ok(Value::object([("cleared", true)]))
            }
            _ => Err(DeviceError::unknown_command(&self.shared.id, command)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params(pairs: &[(&str, Value)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn wait_for_samples(thermo: &VirtualThermometer, count: u64) {
        for _ in 0..200 {
            if thermo.measurement_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("thermometer produced fewer than {} samples", count);
    }

    #[test]
    fn test_settings_validation() {
        assert!(VirtualThermometer::new(
            Id::from("t"),
            params(&[("min_temp", Value::from(30)), ("max_temp", Value::from(20))]),
            None
        )
        .is_err());
        let with = |key: &str, value: Value| {
            VirtualThermometer::new(Id::from("t"), params(&[(key, value)]), None)
        };
        assert!(with("measurement_interval", Value::from(-1)).is_err());
        assert!(matches!(
            with("measurement_interval", Value::from(1e20)),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(with("stop_timeout", Value::from(f64::MAX)).is_err());
        assert!(with("spike_probability", Value::from(2)).is_err());
    }

    #[tokio::test]
    async fn test_offline_commands() {
        let thermo = VirtualThermometer::new(Id::from("thermo"), Params::new(), None).unwrap();

        let reading = thermo.send_command("get_temperature", Params::new()).await.unwrap();
        assert_eq!(reading.get("temperature"), Some(&Value::Float(25.0)));
        assert!(thermo.send_command("get_logs", Params::new()).await.is_ok());
        assert!(matches!(
            thermo.send_command("cooling_activate", Params::new()).await,
            Err(DeviceError::NotStarted(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_overheat_events_published() {
        let bus = SharedEventBus::new();
        let data = Arc::new(AtomicUsize::new(0));
        let overheats = Arc::new(AtomicUsize::new(0));
        let counter = data.clone();
        bus.subscribe_fn(event_types::DEVICE_DATA, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let counter = overheats.clone();
        bus.subscribe_fn(event_types::THERMOMETER_OVERHEAT, move |event| {
            assert_eq!(event.payload.get("threshold"), Some(&Value::Float(28.0)));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        // A degenerate range pins every reading at 29 degrees.
        let thermo = VirtualThermometer::new(
            Id::from("thermo"),
            params(&[
                ("min_temp", Value::from(29.0)),
                ("max_temp", Value::from(29.0)),
                ("measurement_interval", Value::from(0.01)),
            ]),
            Some(bus),
        )
        .unwrap();

        thermo.start().await.unwrap();
        wait_for_samples(&thermo, 3).await;
        thermo.stop().await.unwrap();

        let taken = thermo.measurement_count() as usize;
        assert!(taken >= 3);
        assert_eq!(data.load(Ordering::SeqCst), taken);
        assert_eq!(overheats.load(Ordering::SeqCst), taken);

        // No further samples after stop.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(thermo.measurement_count() as usize, taken);
    }

    #[tokio::test]
    async fn test_readings_stay_in_range() {
        let thermo = VirtualThermometer::new(
            Id::from("thermo"),
            params(&[
                ("measurement_interval", Value::from(0.001)),
                ("temperature_drift", Value::from(5.0)),
                ("spike_probability", Value::from(1.0)),
            ]),
            None,
        )
        .unwrap();

        thermo.start().await.unwrap();
        wait_for_samples(&thermo, 20).await;
        thermo.stop().await.unwrap();

        let logs = thermo.send_command("get_logs", Params::new()).await.unwrap();
        for m in logs.get("measurements").and_then(Value::as_array).unwrap() {
            let t = m.get("temperature").and_then(Value::as_float).unwrap();
            assert!((20.0..=30.0).contains(&t), "reading {} out of range", t);
        }
    }

    #[tokio::test]
    async fn test_cooling_and_set_temperature() {
        let thermo = VirtualThermometer::new(
            Id::from("thermo"),
            params(&[
                ("measurement_interval", Value::from(60)),
                ("temperature_drift", Value::from(0.0)),
                ("spike_probability", Value::from(0.0)),
            ]),
            None,
        )
        .unwrap();
        thermo.start().await.unwrap();

        let mut args = Params::new();
        args.insert("temperature".to_string(), Value::from(100.0));
        let result = thermo.send_command("set_temperature", args).await.unwrap();
        assert_eq!(result.get("temperature"), Some(&Value::Float(30.0)));

        let mut args = Params::new();
        args.insert("power".to_string(), Value::from(3));
        let record = thermo.send_command("cooling_activate", args).await.unwrap();
        assert_eq!(record.get("temperature_after"), Some(&Value::Float(27.0)));

        let record = thermo.send_command("cooling_activate", Params::new()).await.unwrap();
        assert_eq!(record.get("power"), Some(&Value::Float(2.0)));

        let status = thermo.status().await;
        assert_eq!(status.get("cooling_commands_count"), Some(&Value::Integer(2)));
        assert_eq!(status.get("started"), Some(&Value::Bool(true)));

        thermo.stop().await.unwrap();
        thermo.stop().await.unwrap();
        assert_eq!(thermo.status().await.get("started"), Some(&Value::Bool(false)));
    }

    #[tokio::test]
    async fn test_log_is_bounded() {
        let thermo = VirtualThermometer::new(
            Id::from("thermo"),
            params(&[
                ("measurement_interval", Value::from(0.001)),
                ("max_log_entries", Value::from(5)),
            ]),
            None,
        )
        .unwrap();
        thermo.start().await.unwrap();
        wait_for_samples(&thermo, 10).await;
        thermo.stop().await.unwrap();

        let logs = thermo.send_command("get_logs", Params::new()).await.unwrap();
        assert_eq!(logs.get("measurements").and_then(Value::as_array).map(<[Value]>::len), Some(5));

        thermo.send_command("clear_logs", Params::new()).await.unwrap();
        assert_eq!(thermo.measurement_count(), 0);
    }
}
