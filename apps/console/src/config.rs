use std::{fs, time::Duration};

use anyhow::Context;
use client_core::{endpoint::DEFAULT_PORT, Endpoint, ReconnectPolicy};
use serde::Deserialize;

pub const SETTINGS_FILE: &str = "console.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_url: String,
    pub refresh_interval_secs: u64,
    pub reconnect: ReconnectSettings,
    pub log_filter: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms)),
            max_attempts: self.max_attempts,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            refresh_interval_secs: 30,
            reconnect: ReconnectSettings::default(),
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn endpoint(&self) -> anyhow::Result<Endpoint> {
        Endpoint::parse(&self.server_url)
            .with_context(|| format!("invalid server url {:?}", self.server_url))
    }

    /// Command-line flags win over everything else. `--server-url` takes
    /// precedence over `--host`.
    pub fn override_server(
        &mut self,
        server_url: Option<String>,
        host: Option<String>,
        port: u16,
    ) -> anyhow::Result<()> {
        if let Some(url) = server_url {
            self.server_url = url;
        } else if let Some(host) = host {
            self.server_url = Endpoint::from_host(&host, port)
                .with_context(|| format!("invalid host {host:?}"))?
                .to_string();
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    refresh_interval_secs: Option<u64>,
    reconnect: Option<ReconnectSettings>,
    log_filter: Option<String>,
}

/// Defaults, then `console.toml` from the working directory, then the
/// environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub(crate) fn apply_file(settings: &mut Settings, raw: &str) {
    // Logging is not up yet when settings load; an unreadable file is skipped.
    let Ok(file_cfg) = toml::from_str::<FileSettings>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.refresh_interval_secs {
        settings.refresh_interval_secs = v;
    }
    if let Some(v) = file_cfg.reconnect {
        settings.reconnect = v;
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
}

pub(crate) fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("KIOSK_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("APP__REFRESH_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.refresh_interval_secs = parsed;
        }
    }

    if let Some(v) = lookup("APP__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect.max_attempts = parsed;
        }
    }

    if let Some(v) = lookup("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
