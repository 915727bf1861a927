/*!
 * Reference device implementations.
 */
use std::sync::Arc;

use orchestra_core::event::SharedEventBus;

use crate::channel::ChannelFactory;
use crate::device::{Device, Result};
use crate::factory::DeviceFactory;

pub mod fake_device;
pub mod stepper_motor;
pub mod virtual_thermometer;

pub use fake_device::{FakeDevice, Profile, SimulationMode};
pub use stepper_motor::StepperMotor;
pub use virtual_thermometer::VirtualThermometer;

/// Bind `StepperMotor`, `VirtualThermometer` and `FakeDevice` in `factory`
///
/// Motors open their channel through `channels`; thermometers publish their
/// readings on `event_bus`.
pub fn register_builtin_devices(
    factory: &mut DeviceFactory,
    event_bus: SharedEventBus,
    channels: Arc<ChannelFactory>,
) -> Result<()> {
    factory.register_fn(StepperMotor::TYPE, move |id, params| {
        Ok(Arc::new(StepperMotor::new(id, params, &channels)?) as Arc<dyn Device>)
    })?;
    factory.register_fn(VirtualThermometer::TYPE, move |id, params| {
        let thermometer = VirtualThermometer::new(id, params, Some(event_bus.clone()))?;
        Ok(Arc::new(thermometer) as Arc<dyn Device>)
    })?;
    factory.register_fn(FakeDevice::TYPE, |id, params| {
        Ok(Arc::new(FakeDevice::new(id, params)?) as Arc<dyn Device>)
    })?;
    Ok(())
}
