use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use url::Url;

pub const MESSAGING_NAMESPACE: &str = "/messaging";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_url: String,
    pub realtime_enabled: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    pub typing_idle: Duration,
    pub typing_expiry: Duration,
    pub history_page_size: u32,
    pub query_retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8080/api".into(),
            realtime_enabled: true,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(5),
            typing_idle: Duration::from_secs(1),
            typing_expiry: Duration::from_secs(3),
            history_page_size: 50,
            query_retries: 3,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    realtime_enabled: Option<bool>,
    request_timeout_secs: Option<u64>,
    reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    history_page_size: Option<u32>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            apply_file_settings(&mut settings, file_cfg);
        }
    }
    let env: HashMap<String, String> = std::env::vars().collect();
    apply_env_overrides(&mut settings, &env);
    settings
}

/// Defaults, then the given file, then environment. Unlike `load_settings`
/// a missing or malformed file is an error.
pub fn load_settings_from(path: &Path) -> Result<ClientSettings> {
    let env: HashMap<String, String> = std::env::vars().collect();
    settings_from_file(path, &env)
}

pub(crate) fn settings_from_file(
    path: &Path,
    env: &HashMap<String, String>,
) -> Result<ClientSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read client settings '{}'", path.display()))?;
    let file_cfg: FileSettings = toml::from_str(&raw)
        .with_context(|| format!("invalid client settings '{}'", path.display()))?;
    let mut settings = ClientSettings::default();
    apply_file_settings(&mut settings, file_cfg);
    apply_env_overrides(&mut settings, env);
    Ok(settings)
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.api_url {
        settings.api_url = v;
    }
    if let Some(v) = file_cfg.realtime_enabled {
        settings.realtime_enabled = v;
    }
    if let Some(v) = file_cfg.request_timeout_secs {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.reconnect_attempts {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.history_page_size {
        settings.history_page_size = v;
    }
}

pub(crate) fn apply_env_overrides(settings: &mut ClientSettings, env: &HashMap<String, String>) {
    if let Some(v) = env.get("API_URL") {
        settings.api_url = v.clone();
    }
    if let Some(v) = env.get("APP__API_URL") {
        settings.api_url = v.clone();
    }
    if let Some(v) = env.get("APP__REALTIME_ENABLED") {
        match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => settings.realtime_enabled = true,
            "0" | "false" | "no" | "off" => settings.realtime_enabled = false,
            _ => {}
        }
    }
    if let Some(Ok(v)) = env.get("APP__REQUEST_TIMEOUT_SECS").map(|v| v.parse::<u64>()) {
        settings.request_timeout = Duration::from_secs(v);
    }
    if let Some(Ok(v)) = env.get("APP__RECONNECT_ATTEMPTS").map(|v| v.parse::<u32>()) {
        settings.reconnect_attempts = v;
    }
    if let Some(Ok(v)) = env.get("APP__RECONNECT_DELAY_MS").map(|v| v.parse::<u64>()) {
        settings.reconnect_delay = Duration::from_millis(v);
    }
}

impl ClientSettings {
    /// REST base with any trailing slash removed.
    pub fn api_base(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    /// Socket.IO endpoint for the messaging namespace: the API URL without
    /// its `/api` suffix, switched to the websocket scheme.
    pub fn websocket_url(&self) -> Result<Url> {
        let base = self.api_base();
        let base = base.strip_suffix("/api").unwrap_or(base);
        let base = base.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("api_url must start with http:// or https://"));
        };
        Url::parse(&format!("{ws_base}/socket.io/?EIO=4&transport=websocket"))
            .with_context(|| format!("invalid websocket url derived from '{}'", self.api_url))
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
