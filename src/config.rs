//! Runtime settings.
//!
//! [`DashboardSettings`] carries the timings the host uses; [`CliConfig`] is
//! what the binary loads through confy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::render::SortDir;

pub const APP_NAME: &str = "pp-reader-dashboard";
pub const CONFIG_NAME: &str = "config";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardSettings {
    /// How long a patched cell keeps the flash class.
    pub flash_ms: u64,
    /// Fixed delay between two flush attempts of a pending update.
    pub pending_retry_ms: u64,
    pub pending_max_attempts: u32,
    /// Upper bound for callers waiting on a render.
    pub wait_timeout_ms: u64,
    pub default_sort_key: String,
    pub default_sort_dir: String,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            flash_ms: 800,
            pending_retry_ms: 500,
            pending_max_attempts: 10,
            wait_timeout_ms: 3000,
            default_sort_key: "name".to_string(),
            default_sort_dir: "asc".to_string(),
        }
    }
}

impl DashboardSettings {
    pub fn flash_duration(&self) -> Duration {
        Duration::from_millis(self.flash_ms)
    }

    pub fn pending_retry_delay(&self) -> Duration {
        Duration::from_millis(self.pending_retry_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn default_sort(&self) -> (String, SortDir) {
        (
            self.default_sort_key.clone(),
            SortDir::parse(&self.default_sort_dir),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Fixture used when `render`/`inspect` get no file argument.
    pub fixture_file: String,
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub log_filter: String,
    pub dashboard: DashboardSettings,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            fixture_file: String::new(),
            log_filter: "pp_reader_dashboard=info".to_string(),
            dashboard: DashboardSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DashboardSettings::default();
        assert_eq!(settings.flash_duration(), Duration::from_millis(800));
        assert_eq!(settings.pending_retry_delay(), Duration::from_millis(500));
        assert_eq!(settings.pending_max_attempts, 10);
        assert_eq!(settings.wait_timeout(), Duration::from_secs(3));
        assert_eq!(settings.default_sort(), ("name".to_string(), SortDir::Asc));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: CliConfig =
            serde_json::from_str(r#"{"fixture_file": "f.json", "dashboard": {"flash_ms": 10}}"#).unwrap();
        assert_eq!(config.fixture_file, "f.json");
        assert_eq!(config.dashboard.flash_ms, 10);
        assert_eq!(config.dashboard.pending_max_attempts, 10);
        assert_eq!(config.log_filter, "pp_reader_dashboard=info");
    }
}
