//! # devicelost-plugin
//!
//! Loadable plugin that switches on Direct3D 9 device-lost recovery in the
//! host process.
//!
//! The host (or a patcher loading plugins into it) calls the exported
//! `devicelost_mod_detour` once it has loaded `d3d9.dll`. The plugin reads
//! `devicelost.toml`, installs its log subscriber and activates the monitor.

pub mod logging;
pub mod settings;

use std::sync::OnceLock;

use devicelost::Activation;
use tracing::{info, warn};

pub use settings::PluginSettings;

static ACTIVATION: OnceLock<Activation> = OnceLock::new();

/// Load settings, set up logging and activate the monitor.
///
/// Only the first call does any work.
pub fn initialize() -> &'static Activation {
    ACTIVATION.get_or_init(|| {
        let path = PluginSettings::path_from_env();
        let (settings, load_error) = if path.exists() {
            match PluginSettings::load(&path) {
                Ok(settings) => (settings, None),
                Err(e) => (PluginSettings::default(), Some(e)),
            }
        } else {
            (PluginSettings::default(), None)
        };

        if let Err(e) = logging::init(&settings) {
            // No subscriber of ours; the host may still have one.
            warn!("{:#}", e);
        }

        match load_error {
            Some(e) => warn!("Failed to load settings: {:#}, using defaults", e),
            None if path.exists() => info!("Loaded settings from {}", path.display()),
            None => info!("No settings at {}, using defaults", path.display()),
        }

        let activation = devicelost::activate_with(settings.monitor);
        info!("devicelost plugin initialized: {:?}", activation);
        activation
    })
}

/// Plugin entry point called by the host after `d3d9.dll` is loaded.
#[unsafe(no_mangle)]
pub extern "C" fn devicelost_mod_detour() {
    initialize();
}
