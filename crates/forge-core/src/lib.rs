//! forge-core: shared types and configuration for nodeforge.
//!
//! Everything here is free of I/O against the hypervisor or the nodes
//! themselves: identifiers and protected id ranges, derived node status,
//! readiness stages, home-network matching, the `forge.toml` schema, and
//! the cancellation signal threaded through every long-running step.

pub mod cancel;
pub mod config;
pub mod error;
pub mod network;
pub mod types;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use config::{ForgeConfig, parse_duration};
pub use error::{ConfigError, ConfigResult};
pub use network::HomeNetwork;
pub use types::*;
