/*!
 * Device registry for Device Orchestra.
 *
 * Owns the live devices keyed by id. Lookups hand out the same
 * `Arc<dyn Device>` every time; lifecycle calls resolve the device and
 * delegate to it, publishing lifecycle events when an event bus is attached.
 */
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use orchestra_core::{
    config::DeviceConfig,
    event::{event_types, SharedEventBus},
    types::{Id, Value},
};

use crate::device::{Device, DeviceError, Result};
use crate::factory::DeviceFactory;

/// One row of [`DeviceRegistry::list`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSummary {
    /// Device id
    pub id: Id,
    /// Factory type tag
    #[serde(rename = "type")]
    pub device_type: String,
    /// Status snapshot taken during the listing
    pub status: Value,
}

/// Device registry
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// The registered devices
    devices: RwLock<HashMap<Id, Arc<dyn Device>>>,
    /// Bus for lifecycle events
    event_bus: Option<SharedEventBus>,
}

impl DeviceRegistry {
    /// Create a new device registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry that publishes lifecycle events to `event_bus`
    pub fn with_event_bus(event_bus: SharedEventBus) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            event_bus: Some(event_bus),
        }
    }

    fn emit(&self, id: &Id, event_type: &str, payload: Value) {
        if let Some(bus) = &self.event_bus {
            bus.emit_from(id, event_type, payload);
        }
    }

    fn snapshot(&self) -> Result<Vec<Arc<dyn Device>>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::other("Failed to acquire read lock on device registry")
        })?;
        let mut all: Vec<Arc<dyn Device>> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(all)
    }

    /// Register a device; a duplicate id is rejected and never overwrites
    pub fn register(&self, device: Arc<dyn Device>) -> Result<()> {
        let id = device.id().clone();
        let device_type = device.device_type().to_string();

        {
            let mut devices = self.devices.write().map_err(|_| {
                DeviceError::other("Failed to acquire write lock on device registry")
            })?;

            if devices.contains_key(&id) {
                return Err(DeviceError::AlreadyRegistered {
                    kind: "Device",
                    name: id.to_string(),
                });
            }
            devices.insert(id.clone(), device);
        }

        debug!("Registered device with ID {}", id);
        self.emit(
            &id,
            event_types::DEVICE_REGISTERED,
            Value::object([
                ("device_id", Value::from(&id)),
                ("device_type", Value::from(device_type)),
            ]),
        );
        Ok(())
    }

    /// Remove a device and hand it back
    pub fn unregister(&self, id: &str) -> Result<Arc<dyn Device>> {
        let removed = {
            let mut devices = self.devices.write().map_err(|_| {
                DeviceError::other("Failed to acquire write lock on device registry")
            })?;
            devices
                .remove(id)
                .ok_or_else(|| DeviceError::NotFound(id.to_string()))?
        };

        debug!("Unregistered device with ID {}", id);
        self.emit(
            removed.id(),
            event_types::DEVICE_UNREGISTERED,
            Value::object([("device_id", id)]),
        );
        Ok(removed)
    }

    /// Get a device by ID
    pub fn get(&self, id: &str) -> Result<Arc<dyn Device>> {
        let devices = self.devices.read().map_err(|_| {
            DeviceError::other("Failed to acquire read lock on device registry")
        })?;

        devices
            .get(id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))
    }

    /// Check if a device is registered
    pub fn contains(&self, id: &str) -> bool {
        self.devices
            .read()
            .map(|devices| devices.contains_key(id))
            .unwrap_or(false)
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Result<Vec<Id>> {
        Ok(self.snapshot()?.iter().map(|d| d.id().clone()).collect())
    }

    /// Count registered devices
    pub fn len(&self) -> usize {
        self.devices.read().map(|devices| devices.len()).unwrap_or(0)
    }

    /// Whether the registry holds no devices
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a device
    pub async fn start(&self, id: &str) -> Result<()> {
        let device = self.get(id)?;
        debug!("Starting device with ID {}", id);
        match device.start().await {
            Ok(()) => {
                info!(device_id = %id, "device started");
                self.emit(
                    device.id(),
                    event_types::DEVICE_STARTED,
                    Value::object([
                        ("device_id", Value::from(id)),
                        ("device_type", Value::from(device.device_type())),
                    ]),
                );
                Ok(())
            }
            Err(e) => {
                self.report_failure(&device, "start", &e);
                Err(e)
            }
        }
    }

    /// Stop a device
    pub async fn stop(&self, id: &str) -> Result<()> {
        let device = self.get(id)?;
        debug!("Stopping device with ID {}", id);
        match device.stop().await {
            Ok(()) => {
                info!(device_id = %id, "device stopped");
                self.emit(
                    device.id(),
                    event_types::DEVICE_STOPPED,
                    Value::object([
                        ("device_id", Value::from(id)),
                        ("device_type", Value::from(device.device_type())),
                    ]),
                );
                Ok(())
            }
            Err(e) => {
                self.report_failure(&device, "stop", &e);
                Err(e)
            }
        }
    }

    fn report_failure(&self, device: &Arc<dyn Device>, operation: &str, e: &DeviceError) {
        error!(device_id = %device.id(), operation, error = %e, "device operation failed");
        self.emit(
            device.id(),
            event_types::DEVICE_ERROR,
            Value::object([
                ("device_id", Value::from(device.id())),
                ("operation", Value::from(operation)),
                ("error", Value::from(e.to_string())),
            ]),
        );
    }

    /// Every device with a fresh status snapshot, sorted by id
    pub async fn list(&self) -> Result<Vec<DeviceSummary>> {
        let mut summaries = Vec::new();
        for device in self.snapshot()? {
            summaries.push(DeviceSummary {
                id: device.id().clone(),
                device_type: device.device_type().to_string(),
                status: device.status().await,
            });
        }
        Ok(summaries)
    }

    /// Stop every device, logging failures; returns how many stopped cleanly
    pub async fn stop_all(&self) -> Result<usize> {
        let devices = self.snapshot()?;
        let mut stopped = 0;
        for device in &devices {
            match self.stop(device.id().as_str()).await {
                Ok(()) => stopped += 1,
                Err(e) => warn!("Failed to stop device with ID {}: {}", device.id(), e),
            }
        }
        info!("Stopped {} of {} devices", stopped, devices.len());
        Ok(stopped)
    }

    /// Build and register every configured device
    ///
    /// Entries the factory cannot build, or whose id is taken, are logged and
    /// skipped. Returns the number of devices registered.
    pub fn load_from_configs(&self, factory: &DeviceFactory, configs: &[DeviceConfig]) -> usize {
        let mut loaded = 0;
        for config in configs {
            let result = factory
                .create(&config.device_type, Id::from(config.id.as_str()), config.params.clone())
                .and_then(|device| self.register(device));
            match result {
                Ok(()) => loaded += 1,
                Err(e) => error!(
                    device_id = %config.id,
                    device_type = %config.device_type,
                    error = %e,
                    "skipping device"
                ),
            }
        }
        info!("Loaded {} of {} configured devices", loaded, configs.len());
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use orchestra_core::types::Params;
    use tokio_test::assert_ok;

    /// Counts lifecycle calls and can be told to fail on start
    #[derive(Debug)]
    struct StubDevice {
        id: Id,
        params: Params,
        fail_start: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl StubDevice {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: Id::from(id),
                params: Params::new(),
                fail_start: false,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: Id::from(id),
                params: Params::new(),
                fail_start: true,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Device for StubDevice {
        fn id(&self) -> &Id {
            &self.id
        }

        fn device_type(&self) -> &str {
            "Stub"
        }

        fn params(&self) -> &Params {
            &self.params
        }

        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(DeviceError::command_failed("stub refused to start"));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self) -> Value {
            Value::object([
                ("id", Value::from(&self.id)),
                ("starts", Value::from(self.starts.load(Ordering::SeqCst))),
            ])
        }

        async fn send_command(&self, command: &str, _args: Params) -> Result<Value> {
            Err(DeviceError::unknown_command(&self.id, command))
        }
    }

    #[test]
    fn test_get_returns_same_instance() {
        let registry = DeviceRegistry::new();
        let stub = StubDevice::new("motor1");
        assert_ok!(registry.register(stub.clone()));

        let first = registry.get("motor1").unwrap();
        let second = registry.get("motor1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let registry = DeviceRegistry::new();
        assert!(matches!(registry.get("ghost"), Err(DeviceError::NotFound(id)) if id == "ghost"));
    }

    #[test]
    fn test_duplicate_id_does_not_overwrite() {
        let registry = DeviceRegistry::new();
        let original = StubDevice::new("cam0");
        registry.register(original.clone()).unwrap();

        let err = registry.register(StubDevice::new("cam0")).unwrap_err();
        assert!(matches!(err, DeviceError::AlreadyRegistered { .. }));

        let held = registry.get("cam0").unwrap();
        let original_dyn: Arc<dyn Device> = original;
        assert!(Arc::ptr_eq(&held, &original_dyn));
    }

    #[test]
    fn test_unregister() {
        let registry = DeviceRegistry::new();
        registry.register(StubDevice::new("a")).unwrap();
        assert_eq!(registry.unregister("a").unwrap().id().as_str(), "a");
        assert!(registry.is_empty());
        assert!(matches!(registry.unregister("a"), Err(DeviceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_stop_delegate_and_publish() {
        let bus = SharedEventBus::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for topic in [
            event_types::DEVICE_STARTED,
            event_types::DEVICE_STOPPED,
            event_types::DEVICE_ERROR,
        ] {
            let seen = seen.clone();
            bus.subscribe_fn(topic, move |event| {
                seen.lock().unwrap().push(event.event_type.clone());
                Ok(())
            });
        }

        let registry = DeviceRegistry::with_event_bus(bus);
        let stub = StubDevice::new("m");
        registry.register(stub.clone()).unwrap();
        registry.register(StubDevice::failing("bad")).unwrap();

        registry.start("m").await.unwrap();
        registry.stop("m").await.unwrap();
        let err = registry.start("bad").await.unwrap_err();

        assert!(matches!(err, DeviceError::CommandFailed(_)));
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);
        assert_eq!(stub.stops.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["device.started", "device.stopped", "device.error"]
        );
        assert!(matches!(registry.start("ghost").await, Err(DeviceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_sorted_with_fresh_status() {
        let registry = DeviceRegistry::new();
        registry.register(StubDevice::new("zeta")).unwrap();
        registry.register(StubDevice::new("alpha")).unwrap();
        registry.start("zeta").await.unwrap();

        let listing = registry.list().await.unwrap();
        let ids: Vec<&str> = listing.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(listing[1].status.get("starts"), Some(&Value::Integer(1)));
        assert_eq!(listing[0].device_type, "Stub");
    }

    #[tokio::test]
    async fn test_stop_all_counts() {
        let registry = DeviceRegistry::new();
        let a = StubDevice::new("a");
        let b = StubDevice::new("b");
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert_eq!(registry.stop_all().await.unwrap(), 2);
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_load_from_configs_skips_unknown_types() {
        let mut factory = DeviceFactory::new();
        factory
            .register_fn("Stub", |id, _params| {
                Ok(StubDevice::new(id.as_str()) as Arc<dyn Device>)
            })
            .unwrap();
        let configs = vec![
            DeviceConfig {
                id: "p1".to_string(),
                device_type: "Stub".to_string(),
                params: Params::new(),
            },
            DeviceConfig {
                id: "laser".to_string(),
                device_type: "Laser".to_string(),
                params: Params::new(),
            },
            DeviceConfig {
                id: "p1".to_string(),
                device_type: "Stub".to_string(),
                params: Params::new(),
            },
        ];

        let registry = DeviceRegistry::new();
        assert_eq!(registry.load_from_configs(&factory, &configs), 1);
        assert!(registry.contains("p1"));
        assert!(!registry.contains("laser"));
    }
}
