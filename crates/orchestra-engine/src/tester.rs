/*!
 * Device smoke tests.
 *
 * [`DeviceTester`] exercises a registered device through the registry:
 * a start/stop cycle, a status snapshot and one command chosen by device
 * type.
 */
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::info;

use orchestra_core::types::{Params, Value};
use orchestra_devices::{Device, DeviceRegistry, FakeDevice, StepperMotor, VirtualThermometer};

/// Outcome of one smoke test
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceTestResult {
    /// Device under test
    pub device_id: String,
    /// Test name
    pub test_name: String,
    /// Whether the test passed
    pub success: bool,
    /// Failure reason
    pub error_message: Option<String>,
    /// Duration in seconds
    pub duration: f64,
    /// Data collected by the test
    pub details: Value,
}

/// Aggregate over many test results
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    /// Tests run
    pub total_tests: usize,
    /// Tests passed
    pub successful_tests: usize,
    /// Tests failed
    pub failed_tests: usize,
    /// Percentage of passed tests
    pub success_rate: f64,
    /// Every result
    pub results: Vec<DeviceTestResult>,
}

impl TestReport {
    /// Summarize `results`
    pub fn new(results: Vec<DeviceTestResult>) -> Self {
        let total_tests = results.len();
        let successful_tests = results.iter().filter(|r| r.success).count();
        let success_rate = if total_tests == 0 {
            0.0
        } else {
            successful_tests as f64 * 100.0 / total_tests as f64
        };
        Self {
            total_tests,
            successful_tests,
            failed_tests: total_tests - successful_tests,
            success_rate,
            results,
        }
    }
}

struct Timer {
    device_id: String,
    test_name: &'static str,
    started: Instant,
}

impl Timer {
    fn start(device_id: &str, test_name: &'static str) -> Self {
        Self {
            device_id: device_id.to_string(),
            test_name,
            started: Instant::now(),
        }
    }

    fn finish(self, outcome: std::result::Result<Value, String>) -> DeviceTestResult {
        let (success, error_message, details) = match outcome {
            Ok(details) => (true, None, details),
            Err(e) => (false, Some(e), Value::Null),
        };
        DeviceTestResult {
            device_id: self.device_id,
            test_name: self.test_name.to_string(),
            success,
            error_message,
            duration: self.started.elapsed().as_secs_f64(),
            details,
        }
    }
}

/// Runs smoke tests against devices of a registry
#[derive(Debug, Clone)]
pub struct DeviceTester {
    registry: Arc<DeviceRegistry>,
}

impl DeviceTester {
    /// Create a tester for devices in `registry`
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Run every applicable test on `device_id`
    pub async fn test_device(&self, device_id: &str) -> Vec<DeviceTestResult> {
        let device = match self.registry.get(device_id) {
            Ok(device) => device,
            Err(e) => {
                return vec![Timer::start(device_id, "general_error").finish(Err(e.to_string()))];
            }
        };

        let mut results = vec![
            self.test_start_stop(&device).await,
            self.test_status(&device).await,
        ];
        if let Some(result) = self.test_commands(&device).await {
            results.push(result);
        }

        let passed = results.iter().filter(|r| r.success).count();
        info!(device_id, passed, total = results.len(), "device tests finished");
        results
    }

    /// Test every registered device
    pub async fn test_all(&self) -> TestReport {
        let mut results = Vec::new();
        for id in self.registry.ids().unwrap_or_default() {
            results.extend(self.test_device(id.as_str()).await);
        }
        TestReport::new(results)
    }

    async fn test_start_stop(&self, device: &Arc<dyn Device>) -> DeviceTestResult {
        let id = device.id().as_str();
        let timer = Timer::start(id, "start_stop");
        let outcome = async {
            self.registry.start(id).await.map_err(|e| format!("start failed: {}", e))?;
            let after_start = device.status().await;
            self.registry.stop(id).await.map_err(|e| format!("stop failed: {}", e))?;
            let after_stop = device.status().await;
            Ok::<_, String>(Value::object([
                ("status_after_start", after_start),
                ("status_after_stop", after_stop),
            ]))
        }
        .await;
        timer.finish(outcome)
    }

    async fn test_status(&self, device: &Arc<dyn Device>) -> DeviceTestResult {
        let timer = Timer::start(device.id().as_str(), "status");
        let status = device.status().await;
        let outcome = if status.get("id").is_some() {
            Ok(Value::object([("status", status)]))
        } else {
            Err("status snapshot has no 'id'".to_string())
        };
        timer.finish(outcome)
    }

    /// Type-specific check; `None` for device types without one
    async fn test_commands(&self, device: &Arc<dyn Device>) -> Option<DeviceTestResult> {
        let checks: Vec<(&str, Params)> = match device.device_type() {
            StepperMotor::TYPE => vec![("home", Params::new()), ("move", args("steps", 10))],
            VirtualThermometer::TYPE => vec![("get_temperature", Params::new())],
            FakeDevice::TYPE => {
                let profile = device
                    .params()
                    .get("device_type")
                    .and_then(Value::as_str)
                    .unwrap_or("generic");
                match profile {
                    "camera" => vec![("capture", Params::new())],
                    "motor" => vec![("move", args("steps", 5))],
                    _ => vec![("ping", Params::new())],
                }
            }
            _ => return None,
        };

        let id = device.id().as_str();
        let timer = Timer::start(id, "commands");
        let outcome = async {
            self.registry.start(id).await.map_err(|e| format!("start failed: {}", e))?;
            let mut replies = Params::new();
            let mut failure = None;
            for (command, command_args) in checks {
                match device.send_command(command, command_args).await {
                    Ok(reply) if !reply.is_null() => {
                        replies.insert(command.to_string(), reply);
                    }
                    Ok(_) => {
                        failure = Some(format!("'{}' returned nothing", command));
                        break;
                    }
                    Err(e) => {
                        failure = Some(format!("'{}' failed: {}", command, e));
                        break;
                    }
                }
            }
            self.registry.stop(id).await.map_err(|e| format!("stop failed: {}", e))?;
            match failure {
                Some(e) => Err(e),
                None => Ok(Value::Object(replies)),
            }
        }
        .await;
        Some(timer.finish(outcome))
    }
}

fn args(key: &str, value: i64) -> Params {
    let mut params = Params::new();
    params.insert(key.to_string(), Value::from(value));
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestra_devices::channels::register_builtin_channels;
    use orchestra_devices::ChannelFactory;

    fn fake(id: &str, profile: &str, error_probability: f64) -> Arc<dyn Device> {
        let mut params = Params::new();
        params.insert("device_type".to_string(), Value::from(profile));
        params.insert("base_delay".to_string(), Value::from(0.0));
        params.insert("error_probability".to_string(), Value::from(error_probability));
        Arc::new(FakeDevice::new(id.into(), params).unwrap())
    }

    #[tokio::test]
    async fn test_fake_camera_passes() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(fake("cam0", "camera", 0.0)).unwrap();
        let tester = DeviceTester::new(registry);

        let results = tester.test_device("cam0").await;
        let names: Vec<&str> = results.iter().map(|r| r.test_name.as_str()).collect();
        assert_eq!(names, vec!["start_stop", "status", "commands"]);
        assert!(results.iter().all(|r| r.success), "{:?}", results);
        assert!(results[2].details.get("capture").is_some());
    }

    #[tokio::test]
    async fn test_stepper_motor_check() {
        let mut channels = ChannelFactory::new();
        register_builtin_channels(&mut channels).unwrap();
        let mut params = Params::new();
        params.insert("home_duration_ms".to_string(), Value::from(0));
        params.insert("step_duration_us".to_string(), Value::from(0));
        let motor = StepperMotor::new("m1".into(), params, &channels).unwrap();

        let registry = Arc::new(DeviceRegistry::new());
        registry.register(Arc::new(motor)).unwrap();
        let results = DeviceTester::new(registry).test_device("m1").await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success), "{:?}", results);
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(fake("flaky", "sensor", 1.0)).unwrap();
        let tester = DeviceTester::new(registry);

        let results = tester.test_device("flaky").await;
        assert!(!results[0].success);
        assert!(results[0].error_message.as_deref().unwrap().starts_with("start failed"));
        assert!(results[1].success);

        let missing = tester.test_device("ghost").await;
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].test_name, "general_error");
    }

    #[tokio::test]
    async fn test_report() {
        let registry = Arc::new(DeviceRegistry::new());
        registry.register(fake("a", "generic", 0.0)).unwrap();
        registry.register(fake("b", "motor", 0.0)).unwrap();
        let report = DeviceTester::new(registry).test_all().await;

        assert_eq!(report.total_tests, 6);
        assert_eq!(report.failed_tests, 0);
        assert_eq!(report.success_rate, 100.0);
    }
}
