/*!
 * Device Orchestra Core
 *
 * This crate provides the shared foundation for Device Orchestra: identifiers
 * and dynamic values, the event bus, configuration loading and logging setup.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Device Orchestra core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
