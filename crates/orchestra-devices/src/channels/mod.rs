/*!
 * Built-in communication channels.
 */
use crate::channel::{Channel, ChannelFactory, Result};

pub mod simulated;
pub mod tcp;

pub use simulated::{SimulatedChannel, Transcript};
pub use tcp::TcpChannel;

/// Bind `simulated` and `tcp` in `factory`
pub fn register_builtin_channels(factory: &mut ChannelFactory) -> Result<()> {
    factory.register_fn("simulated", |config| {
        Ok(Box::new(SimulatedChannel::new(config)?) as Box<dyn Channel>)
    })?;
    factory.register_fn("tcp", |config| {
        Ok(Box::new(TcpChannel::new(config)?) as Box<dyn Channel>)
    })?;
    Ok(())
}
