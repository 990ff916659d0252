use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_SETTINGS_FILE: &str = "realtime.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RealtimeSettings {
    pub realtime_url: String,
    pub functions_url: String,
    pub api_key: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub typing_timeout_ms: u64,
    pub rebuild_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub network_probe_addr: Option<String>,
    pub network_probe_interval_ms: u64,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            realtime_url: "ws://127.0.0.1:54321/realtime/v1/websocket".into(),
            functions_url: "http://127.0.0.1:54321/functions/v1".into(),
            api_key: String::new(),
            reconnect_base_delay_ms: 2000,
            reconnect_max_attempts: 5,
            typing_timeout_ms: 3000,
            rebuild_delay_ms: 250,
            heartbeat_interval_ms: 25_000,
            network_probe_addr: None,
            network_probe_interval_ms: 5000,
        }
    }
}

impl RealtimeSettings {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn rebuild_delay(&self) -> Duration {
        Duration::from_millis(self.rebuild_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn network_probe_interval(&self) -> Duration {
        Duration::from_millis(self.network_probe_interval_ms)
    }
}

/// Defaults, then `realtime.toml` in the working directory when present and
/// parseable, then environment overrides.
pub fn load_settings() -> RealtimeSettings {
    let mut settings = fs::read_to_string(DEFAULT_SETTINGS_FILE)
        .ok()
        .and_then(|raw| toml::from_str::<RealtimeSettings>(&raw).ok())
        .unwrap_or_default();
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Like [`load_settings`] but with an explicit file that must exist and parse.
pub fn load_settings_from(path: &Path) -> anyhow::Result<RealtimeSettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Parses a settings file without applying environment overrides.
pub fn read_settings_file(path: &Path) -> anyhow::Result<RealtimeSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str::<RealtimeSettings>(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

/// Applies `NAME` then `APP__NAME` overrides; the prefixed form wins.
/// Numeric values that fail to parse are ignored.
pub fn apply_env_overrides(
    settings: &mut RealtimeSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let read = |name: &str| lookup(&format!("APP__{name}")).or_else(|| lookup(name));

    if let Some(v) = read("REALTIME_URL") {
        settings.realtime_url = v;
    }
    if let Some(v) = read("FUNCTIONS_URL") {
        settings.functions_url = v;
    }
    if let Some(v) = read("REALTIME_API_KEY") {
        settings.api_key = v;
    }
    if let Some(v) = read("RECONNECT_BASE_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_base_delay_ms = v;
    }
    if let Some(v) = read("RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = read("TYPING_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.typing_timeout_ms = v;
    }
    if let Some(v) = read("REBUILD_DELAY_MS").and_then(|v| v.parse().ok()) {
        settings.rebuild_delay_ms = v;
    }
    if let Some(v) = read("HEARTBEAT_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = read("NETWORK_PROBE_ADDR") {
        settings.network_probe_addr = (!v.trim().is_empty()).then_some(v);
    }
    if let Some(v) = read("NETWORK_PROBE_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.network_probe_interval_ms = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
