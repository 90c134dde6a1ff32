use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "chat_state.toml";
const ENV_PREFIX: &str = "CHAT_STATE__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    pub typing_timeout_ms: u64,
    /// Largest visible window kept after pagination. `None` disables trimming.
    pub message_limit: Option<usize>,
    pub trim_buffer: usize,
    pub cached_latest_limit: usize,
    pub event_buffer: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            typing_timeout_ms: 7_000,
            message_limit: None,
            trim_buffer: 30,
            cached_latest_limit: 25,
            event_buffer: 256,
        }
    }
}

impl StateSettings {
    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

/// Defaults, then `chat_state.toml` in the working directory, then
/// `CHAT_STATE__*` environment variables. A broken file is reported and
/// skipped.
pub fn load_settings() -> StateSettings {
    match load_settings_from(Path::new(DEFAULT_SETTINGS_FILE)) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, "config: falling back to defaults");
            apply_env_overrides(StateSettings::default(), |key| std::env::var(key).ok())
        }
    }
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<StateSettings> {
    let settings = if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        parse_settings(&raw).with_context(|| format!("invalid settings in {}", path.display()))?
    } else {
        StateSettings::default()
    };
    Ok(apply_env_overrides(settings, |key| std::env::var(key).ok()))
}

pub fn parse_settings(raw: &str) -> anyhow::Result<StateSettings> {
    Ok(toml::from_str(raw)?)
}

pub fn apply_env_overrides(
    mut settings: StateSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> StateSettings {
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(v) = var("TYPING_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.typing_timeout_ms = v;
    }
    if let Some(v) = var("MESSAGE_LIMIT") {
        settings.message_limit = match v.trim() {
            "" | "none" => None,
            raw => raw.parse().ok().or(settings.message_limit),
        };
    }
    if let Some(v) = var("TRIM_BUFFER").and_then(|v| v.parse().ok()) {
        settings.trim_buffer = v;
    }
    if let Some(v) = var("CACHED_LATEST_LIMIT").and_then(|v| v.parse().ok()) {
        settings.cached_latest_limit = v;
    }
    if let Some(v) = var("EVENT_BUFFER").and_then(|v| v.parse().ok()) {
        settings.event_buffer = v;
    }

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
