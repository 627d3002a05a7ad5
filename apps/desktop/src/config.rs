use std::{collections::HashMap, fs, path::{Path, PathBuf}, time::Duration};

use client_core::{ReconnectPolicy, SyncSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub ws_path: String,
    pub page_size: u32,
    pub preview_limit: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Zero retries forever.
    pub reconnect_max_attempts: u32,
    pub log_filter: String,
    pub session_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let sync = SyncSettings::default();
        let reconnect = ReconnectPolicy::default();
        Self {
            server_url: "http://127.0.0.1:3001".into(),
            ws_path: "/ws".into(),
            page_size: sync.page_size,
            preview_limit: sync.preview_limit,
            reconnect_initial_ms: reconnect.initial_delay.as_millis() as u64,
            reconnect_max_ms: reconnect.max_delay.as_millis() as u64,
            reconnect_max_attempts: reconnect.max_attempts.unwrap_or(0),
            log_filter: "info".into(),
            session_file: None,
        }
    }
}

impl Settings {
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: self.page_size.max(1),
            preview_limit: self.preview_limit,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect_initial_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: (self.reconnect_max_attempts > 0).then_some(self.reconnect_max_attempts),
            ..ReconnectPolicy::default()
        }
    }

    fn apply_file(&mut self, file_cfg: &HashMap<String, String>) {
        if let Some(v) = file_cfg.get("server_url") {
            self.server_url = v.clone();
        }
        if let Some(v) = file_cfg.get("ws_path") {
            self.ws_path = v.clone();
        }
        if let Some(v) = file_cfg.get("page_size").and_then(|v| v.parse().ok()) {
            self.page_size = v;
        }
        if let Some(v) = file_cfg.get("preview_limit").and_then(|v| v.parse().ok()) {
            self.preview_limit = v;
        }
        if let Some(v) = file_cfg.get("reconnect_initial_ms").and_then(|v| v.parse().ok()) {
            self.reconnect_initial_ms = v;
        }
        if let Some(v) = file_cfg.get("reconnect_max_ms").and_then(|v| v.parse().ok()) {
            self.reconnect_max_ms = v;
        }
        if let Some(v) = file_cfg
            .get("reconnect_max_attempts")
            .and_then(|v| v.parse().ok())
        {
            self.reconnect_max_attempts = v;
        }
        if let Some(v) = file_cfg.get("log_filter") {
            self.log_filter = v.clone();
        }
        if let Some(v) = file_cfg.get("session_file") {
            self.session_file = Some(PathBuf::from(v));
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CHAT_SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = var("APP__WS_PATH") {
            self.ws_path = v;
        }
        if let Some(v) = var("APP__PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.page_size = v;
        }
        if let Some(v) = var("APP__PREVIEW_LIMIT").and_then(|v| v.parse().ok()) {
            self.preview_limit = v;
        }
        if let Some(v) = var("APP__RECONNECT_INITIAL_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_initial_ms = v;
        }
        if let Some(v) = var("APP__RECONNECT_MAX_MS").and_then(|v| v.parse().ok()) {
            self.reconnect_max_ms = v;
        }
        if let Some(v) = var("APP__RECONNECT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.reconnect_max_attempts = v;
        }
        if let Some(v) = var("APP__LOG_FILTER") {
            self.log_filter = v;
        }
        if let Some(v) = var("CHAT_SESSION_FILE") {
            self.session_file = Some(PathBuf::from(v));
        }
        if let Some(v) = var("APP__SESSION_FILE") {
            self.session_file = Some(PathBuf::from(v));
        }
    }
}

/// Defaults, overlaid by `config_path` (a flat TOML string table) when it
/// exists, then by environment variables.
pub fn load_settings(config_path: &Path) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(config_path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            settings.apply_file(&file_cfg);
        }
    }
    settings.apply_env(|key| std::env::var(key).ok());

    settings
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
