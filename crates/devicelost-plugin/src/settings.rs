//! Plugin settings file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use devicelost::MonitorConfig;
use serde::Deserialize;

/// Settings file looked up in the working directory
pub const DEFAULT_SETTINGS_FILE: &str = "devicelost.toml";

/// Environment variable overriding the settings file path
pub const SETTINGS_ENV: &str = "DEVICELOST_CONFIG";

/// Contents of `devicelost.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Log destination; `None` logs to stderr
    pub log_file: Option<PathBuf>,
    /// `EnvFilter` directives used when `RUST_LOG` is not set
    pub log_filter: String,
    pub monitor: MonitorConfig,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            log_file: Some(PathBuf::from("devicelost.log")),
            log_filter: "devicelost=info,devicelost_plugin=info".to_string(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl PluginSettings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid settings")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Settings path: `$DEVICELOST_CONFIG`, else `devicelost.toml`
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(SETTINGS_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_parse_full_settings() {
        let settings = PluginSettings::from_toml_str(
            r#"
            log_file = "logs/recovery.log"
            log_filter = "devicelost=debug"

            [monitor]
            enabled = true
            module = "d3d9.dll"
            factory_symbol = "Direct3DCreate9"
            poll_interval_ms = 50
            notify_title = "Touhou"
            notify_text = "Graphics device is gone."
            "#,
        )
        .unwrap();

        assert_eq!(settings.log_file, Some(PathBuf::from("logs/recovery.log")));
        assert_eq!(settings.log_filter, "devicelost=debug");
        assert_eq!(settings.monitor.poll_interval(), Duration::from_millis(50));
        assert_eq!(settings.monitor.notify_title, "Touhou");
        assert_eq!(settings.monitor.notify_text, "Graphics device is gone.");
    }

    #[test]
    fn test_partial_settings_keep_defaults() {
        let settings = PluginSettings::from_toml_str(
            r#"
            [monitor]
            poll_interval_ms = 20
            "#,
        )
        .unwrap();

        let defaults = PluginSettings::default();
        assert_eq!(settings.log_file, defaults.log_file);
        assert_eq!(settings.log_filter, defaults.log_filter);
        assert_eq!(settings.monitor.poll_interval_ms, 20);
        assert_eq!(settings.monitor.module, "d3d9.dll");
        assert!(settings.monitor.enabled);
    }

    #[test]
    fn test_empty_settings_are_defaults() {
        let settings = PluginSettings::from_toml_str("").unwrap();
        assert_eq!(settings, PluginSettings::default());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let result = PluginSettings::from_toml_str("[monitor]\npoll_interval_ms = \"soon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[monitor]\nenabled = false").unwrap();

        let settings = PluginSettings::load(file.path()).unwrap();
        assert!(!settings.monitor.enabled);
    }

    #[test]
    fn test_load_missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let err = PluginSettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"));
    }
}
