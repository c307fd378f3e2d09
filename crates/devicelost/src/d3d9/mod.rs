//! Direct3D 9 device lifecycle monitoring and device-lost recovery.

mod monitor;
pub mod recovery;
pub mod types;

pub use monitor::{Activation, Monitor, create_device_hook, direct3d_create9_hook, reset_hook};
pub use recovery::{RecoveryReport, RecoverySession, ResetPath, ResettableDevice, reset_device};
pub use types::{CooperativeLevel, HResult};
