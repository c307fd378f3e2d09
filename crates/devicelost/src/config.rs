//! Monitor configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::memory::layout::timing;

/// Configuration for the device lifecycle monitor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Whether activation installs anything at all
    pub enabled: bool,
    /// Graphics module whose factory is intercepted
    pub module: String,
    /// Factory export creating the graphics interface
    pub factory_symbol: String,
    /// Bounded wait between cooperative level queries while the device is lost
    pub poll_interval_ms: u64,
    /// Caption of the unrecoverable-error notification
    pub notify_title: String,
    /// Body of the unrecoverable-error notification
    pub notify_text: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            module: "d3d9.dll".to_string(),
            factory_symbol: "Direct3DCreate9".to_string(),
            poll_interval_ms: timing::LOST_POLL_INTERVAL_MS,
            notify_title: "Error".to_string(),
            notify_text: "Unable to recover from Device Lost error.".to_string(),
        }
    }
}

impl MonitorConfig {
    /// Create a new configuration builder
    pub fn builder() -> MonitorConfigBuilder {
        MonitorConfigBuilder::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Builder for MonitorConfig
#[derive(Debug, Clone, Default)]
pub struct MonitorConfigBuilder {
    enabled: Option<bool>,
    module: Option<String>,
    factory_symbol: Option<String>,
    poll_interval: Option<Duration>,
    notify_title: Option<String>,
    notify_text: Option<String>,
}

impl MonitorConfigBuilder {
    /// Enable or disable the monitor
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Set the graphics module name
    pub fn module<S: Into<String>>(mut self, module: S) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Set the factory export name
    pub fn factory_symbol<S: Into<String>>(mut self, symbol: S) -> Self {
        self.factory_symbol = Some(symbol.into());
        self
    }

    /// Set the wait between cooperative level queries
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the notification caption and text
    pub fn notification<S: Into<String>, T: Into<String>>(mut self, title: S, text: T) -> Self {
        self.notify_title = Some(title.into());
        self.notify_text = Some(text.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> MonitorConfig {
        let default = MonitorConfig::default();
        MonitorConfig {
            enabled: self.enabled.unwrap_or(default.enabled),
            module: self.module.unwrap_or(default.module),
            factory_symbol: self.factory_symbol.unwrap_or(default.factory_symbol),
            poll_interval_ms: self
                .poll_interval
                .map_or(default.poll_interval_ms, |d| d.as_millis() as u64),
            notify_title: self.notify_title.unwrap_or(default.notify_title),
            notify_text: self.notify_text.unwrap_or(default.notify_text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_target_d3d9() {
        let config = MonitorConfig::default();
        assert!(config.enabled);
        assert_eq!(config.module, "d3d9.dll");
        assert_eq!(config.factory_symbol, "Direct3DCreate9");
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_builder_overrides_only_given_fields() {
        let config = MonitorConfig::builder()
            .poll_interval(Duration::from_millis(25))
            .notification("Device", "Gone")
            .build();

        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.notify_title, "Device");
        assert_eq!(config.notify_text, "Gone");
        assert_eq!(config.module, "d3d9.dll");
        assert!(config.enabled);
    }

    #[test]
    fn test_builder_disabled() {
        let config = MonitorConfig::builder()
            .enabled(false)
            .module("d3d9_alt.dll")
            .factory_symbol("Create")
            .build();
        assert!(!config.enabled);
        assert_eq!(config.module, "d3d9_alt.dll");
        assert_eq!(config.factory_symbol, "Create");
    }
}
