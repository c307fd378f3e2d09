//! # devicelost
//!
//! Recovers Direct3D 9 devices from the "device lost" state inside a host
//! process, without the host's cooperation.
//!
//! This crate provides:
//! - In-place dispatch-table interception of foreign COM objects with per-table
//!   originals and chaining (`hook::vtable`)
//! - Import-table redirection of exported factories (`hook::imports`)
//! - The device lifecycle monitor and the recovery protocol (`d3d9`)
//!
//! ## Example
//!
//! ```ignore
//! // Once, at startup, after the game has loaded d3d9.dll:
//! let activation = devicelost::activate();
//! if !activation.is_active() {
//!     // d3d9.dll was not loaded; the host runs unmonitored
//! }
//! ```

pub mod config;
pub mod d3d9;
pub mod error;
pub mod hook;
pub mod memory;
pub mod platform;

pub use config::{MonitorConfig, MonitorConfigBuilder};
pub use d3d9::{
    Activation, CooperativeLevel, HResult, Monitor, RecoveryReport, RecoverySession, ResetPath,
    ResettableDevice, reset_device,
};
pub use error::{Error, Result};
pub use hook::{Binding, DispatchContract, Interceptor};
pub use platform::{EventPump, Host, ModuleHandle, Modules, Notifier, SystemHost, SystemModules};

/// Activate device-lifecycle monitoring with the default configuration.
///
/// Safe to call more than once; only the first call does anything. Monitoring
/// starts only if the graphics module is already loaded.
pub fn activate() -> Activation {
    activate_with(MonitorConfig::default())
}

/// Activate device-lifecycle monitoring with `config`.
///
/// The configuration of the first call wins.
pub fn activate_with(config: MonitorConfig) -> Activation {
    Monitor::init_global(config).activate(&SystemModules).clone()
}
