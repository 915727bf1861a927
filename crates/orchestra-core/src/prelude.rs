/*!
 * Prelude module for Device Orchestra Core.
 *
 * This module re-exports commonly used types and functions from the core
 * crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Params, Value};

// Re-export event types
pub use crate::event::{callback, event_types, Event, EventBus, EventCallback, SharedEventBus};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, DeviceConfig, DeviceConfigLoader};

// Re-export utility functions
pub use crate::utils::{millis_to_duration, secs_to_duration, unix_timestamp};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};
