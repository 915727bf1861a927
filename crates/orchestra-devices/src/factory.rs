/*!
 * Device factory.
 *
 * Maps type tags to constructors. Nothing registers itself at load time:
 * the composition root binds the tags it needs, usually through
 * [`register_builtin_devices`](crate::devices::register_builtin_devices).
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use orchestra_core::types::{Id, Params};

use crate::device::{Device, DeviceError, Result};

/// Builds a device from its id and parameter bag
pub type DeviceConstructor = Arc<dyn Fn(Id, Params) -> Result<Arc<dyn Device>> + Send + Sync>;

/// Type tag to constructor mapping
#[derive(Default)]
pub struct DeviceFactory {
    constructors: HashMap<String, DeviceConstructor>,
}

impl DeviceFactory {
    /// Create an empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `tag` to `constructor`; an already bound tag is rejected
    pub fn register<S: Into<String>>(
        &mut self,
        tag: S,
        constructor: DeviceConstructor,
    ) -> Result<()> {
        let tag = tag.into();
        if self.constructors.contains_key(&tag) {
            return Err(DeviceError::AlreadyRegistered {
                kind: "Device type",
                name: tag,
            });
        }
        debug!(device_type = %tag, "device type registered");
        self.constructors.insert(tag, constructor);
        Ok(())
    }

    /// Bind `tag` to a closure
    pub fn register_fn<S, F>(&mut self, tag: S, f: F) -> Result<()>
    where
        S: Into<String>,
        F: Fn(Id, Params) -> Result<Arc<dyn Device>> + Send + Sync + 'static,
    {
        self.register(tag, Arc::new(f))
    }

    /// Build a device of type `tag`
    pub fn create(&self, tag: &str, id: Id, params: Params) -> Result<Arc<dyn Device>> {
        let constructor = self
            .constructors
            .get(tag)
            .ok_or_else(|| DeviceError::UnknownType {
                tag: tag.to_string(),
                available: self.registered_types(),
            })?;
        debug!(device_type = %tag, device_id = %id, "creating device");
        constructor(id, params)
    }

    /// Bound tags, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.constructors.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Whether `tag` is bound
    pub fn is_registered(&self, tag: &str) -> bool {
        self.constructors.contains_key(tag)
    }
}

impl fmt::Debug for DeviceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFactory")
            .field("types", &self.registered_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::FakeDevice;
    use orchestra_core::types::Value;
    use tokio_test::{assert_err, assert_ok};

    fn fake_constructor() -> DeviceConstructor {
        Arc::new(|id, params| Ok(Arc::new(FakeDevice::new(id, params)?) as Arc<dyn Device>))
    }

    #[test]
    fn test_register_and_create() {
        let mut factory = DeviceFactory::new();
        assert_ok!(factory.register("FakeDevice", fake_constructor()));
        assert!(factory.is_registered("FakeDevice"));

        let device = factory
            .create("FakeDevice", Id::from("cam0"), Params::new())
            .unwrap();
        assert_eq!(device.id().as_str(), "cam0");
        assert_eq!(device.device_type(), "FakeDevice");
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let mut factory = DeviceFactory::new();
        assert_ok!(factory.register("FakeDevice", fake_constructor()));
        let err = assert_err!(factory.register("FakeDevice", fake_constructor()));
        assert!(matches!(err, DeviceError::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_unknown_tag_lists_available() {
        let mut factory = DeviceFactory::new();
        factory.register("FakeDevice", fake_constructor()).unwrap();
        factory.register("Other", fake_constructor()).unwrap();

        match factory.create("Laser", Id::from("l1"), Params::new()) {
            Err(DeviceError::UnknownType { tag, available }) => {
                assert_eq!(tag, "Laser");
                assert_eq!(available, vec!["FakeDevice".to_string(), "Other".to_string()]);
            }
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }

    #[test]
    fn test_constructor_errors_propagate() {
        let mut factory = DeviceFactory::new();
        factory.register("FakeDevice", fake_constructor()).unwrap();
        let mut params = Params::new();
        params.insert("base_delay".to_string(), Value::from("slow"));

        assert!(matches!(
            factory.create("FakeDevice", Id::from("x"), params),
            Err(DeviceError::InvalidArgument(_))
        ));
    }
}
