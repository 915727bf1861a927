/*!
 * Device Orchestra Devices
 *
 * This crate provides the device contract, the device factory and registry,
 * communication channels and the reference devices of Device Orchestra.
 */

#![warn(missing_docs)]

// Re-export core types
pub use orchestra_core::prelude;

pub mod channel;
pub mod channels;
pub mod device;
pub mod devices;
pub mod factory;
pub mod registry;

// Re-export the device and channel contracts
pub use channel::{Channel, ChannelError, ChannelFactory, ChannelState, ProtocolVersion};
pub use device::{Device, DeviceError};
pub use devices::{register_builtin_devices, FakeDevice, StepperMotor, VirtualThermometer};
pub use factory::DeviceFactory;
pub use registry::{DeviceRegistry, DeviceSummary};

/// Device Orchestra devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Device and channel factories with every built-in type registered
pub fn builtin_factories(
    event_bus: orchestra_core::event::SharedEventBus,
    channels: ChannelFactory,
) -> device::Result<(DeviceFactory, std::sync::Arc<ChannelFactory>)> {
    let mut channels = channels;
    channels::register_builtin_channels(&mut channels)?;
    let channels = std::sync::Arc::new(channels);

    let mut devices = DeviceFactory::new();
    register_builtin_devices(&mut devices, event_bus, channels.clone())?;
    Ok((devices, channels))
}
