use std::{fs, time::Duration};

use serde::Deserialize;
use tracing::warn;

const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    pub database_url: String,
    pub max_upload_bytes: u64,
    pub typing_expiry: Duration,
    pub recording_expiry: Duration,
    pub listening_expiry: Duration,
    pub ack_timeout: Duration,
    pub ghost_text: bool,
    pub history_limit: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/client.db".into(),
            max_upload_bytes: 25 * 1024 * 1024,
            typing_expiry: Duration::from_secs(5),
            recording_expiry: Duration::from_secs(30),
            listening_expiry: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            ghost_text: false,
            history_limit: 200,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    database_url: Option<String>,
    max_upload_bytes: Option<u64>,
    typing_expiry_ms: Option<u64>,
    recording_expiry_ms: Option<u64>,
    listening_expiry_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    ghost_text: Option<bool>,
    history_limit: Option<u32>,
}

/// Defaults, then `client.toml` in the working directory, then `APP__*` env vars.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!(%err, file = SETTINGS_FILE, "ignoring malformed settings file"),
        }
    }

    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.max_upload_bytes {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = file_cfg.typing_expiry_ms {
        settings.typing_expiry = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.recording_expiry_ms {
        settings.recording_expiry = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.listening_expiry_ms {
        settings.listening_expiry = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.ack_timeout_ms {
        settings.ack_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.ghost_text {
        settings.ghost_text = v;
    }
    if let Some(v) = file_cfg.history_limit {
        settings.history_limit = v;
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = parse_env(&var, "APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = v;
    }
    if let Some(v) = parse_env(&var, "APP__TYPING_EXPIRY_MS") {
        settings.typing_expiry = Duration::from_millis(v);
    }
    if let Some(v) = parse_env(&var, "APP__RECORDING_EXPIRY_MS") {
        settings.recording_expiry = Duration::from_millis(v);
    }
    if let Some(v) = parse_env(&var, "APP__LISTENING_EXPIRY_MS") {
        settings.listening_expiry = Duration::from_millis(v);
    }
    if let Some(v) = parse_env(&var, "APP__ACK_TIMEOUT_MS") {
        settings.ack_timeout = Duration::from_millis(v);
    }
    if let Some(v) = parse_env(&var, "APP__GHOST_TEXT") {
        settings.ghost_text = v;
    }
    if let Some(v) = parse_env(&var, "APP__HISTORY_LIMIT") {
        settings.history_limit = v;
    }
}

fn parse_env<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = var(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}

/// Turns a bare path or `sqlite:path` into a `sqlite://` URL. The store
/// creates the parent directory when it opens the file.
pub fn normalize_database_url(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return ClientSettings::default().database_url;
    }
    if raw.contains("://") || raw.starts_with("sqlite::memory:") {
        return raw.to_string();
    }
    let path = raw.strip_prefix("sqlite:").unwrap_or(raw);
    format!("sqlite://{}", path.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
