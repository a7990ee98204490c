use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::{Context, Result};

use crate::subscriber::ReconnectPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "board_sync.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub server_url: String,
    /// Sent verbatim as the `Cookie` header.
    pub session_cookie: Option<String>,
    pub request_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive failed reconnects before the board is flagged possibly stale.
    pub stale_after_failures: u32,
    /// Capacity of the engine's input queue.
    pub event_buffer: usize,
    /// How long the echo of a confirmed move is still recognised.
    pub echo_ttl: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".to_string(),
            session_cookie: None,
            request_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            stale_after_failures: 3,
            event_buffer: 256,
            echo_ttl: Duration::from_secs(10),
        }
    }
}

impl ClientSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            stale_after_failures: self.stale_after_failures,
        }
    }
}

/// Defaults, then `board_sync.toml` in the working directory if present, then
/// environment overrides.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Ok(raw) = fs::read_to_string(DEFAULT_CONFIG_FILE) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            apply_file(&mut settings, &file_cfg);
        }
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Like [`load_settings`], but an explicitly named file must exist and parse.
pub fn load_settings_from(path: Option<&Path>) -> Result<ClientSettings> {
    let Some(path) = path else {
        return Ok(load_settings());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(&raw)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    let mut settings = ClientSettings::default();
    apply_file(&mut settings, &file_cfg);
    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut ClientSettings, file_cfg: &HashMap<String, toml::Value>) {
    if let Some(v) = file_cfg.get("server_url").and_then(toml::Value::as_str) {
        settings.server_url = v.to_string();
    }
    if let Some(v) = file_cfg.get("session_cookie").and_then(toml::Value::as_str) {
        settings.session_cookie = Some(v.to_string());
    }
    if let Some(v) = file_integer(file_cfg, "request_timeout_ms") {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_integer(file_cfg, "reconnect_initial_ms") {
        settings.reconnect_initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_integer(file_cfg, "reconnect_max_ms") {
        settings.reconnect_max_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_integer(file_cfg, "stale_after_failures") {
        settings.stale_after_failures = v.try_into().unwrap_or(u32::MAX);
    }
    if let Some(v) = file_integer(file_cfg, "event_buffer") {
        settings.event_buffer = v.try_into().unwrap_or(usize::MAX).max(1);
    }
    if let Some(v) = file_integer(file_cfg, "echo_ttl_ms") {
        settings.echo_ttl = Duration::from_millis(v);
    }
}

fn file_integer(file_cfg: &HashMap<String, toml::Value>, key: &str) -> Option<u64> {
    match file_cfg.get(key)? {
        toml::Value::Integer(v) => u64::try_from(*v).ok(),
        toml::Value::String(v) => v.parse().ok(),
        _ => None,
    }
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("BOARD_SYNC_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = lookup("BOARD_SYNC_SESSION_COOKIE") {
        settings.session_cookie = Some(v);
    }
    if let Some(v) = lookup("APP__SESSION_COOKIE") {
        settings.session_cookie = Some(v);
    }

    if let Some(v) = lookup("APP__REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.request_timeout = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__RECONNECT_INITIAL_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__RECONNECT_MAX_MS").and_then(|v| v.parse().ok()) {
        settings.reconnect_max_delay = Duration::from_millis(v);
    }
    if let Some(v) = lookup("APP__STALE_AFTER_FAILURES").and_then(|v| v.parse().ok()) {
        settings.stale_after_failures = v;
    }
    if let Some(v) = lookup("APP__EVENT_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
        settings.event_buffer = v.max(1);
    }
    if let Some(v) = lookup("APP__ECHO_TTL_MS").and_then(|v| v.parse().ok()) {
        settings.echo_ttl = Duration::from_millis(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| pairs.get(key).cloned()
    }

    #[test]
    fn file_values_override_defaults() {
        let file_cfg: HashMap<String, toml::Value> = toml::from_str(
            r#"
            server_url = "https://boards.example.net"
            request_timeout_ms = 2500
            reconnect_max_ms = "9000"
            event_buffer = 0
            "#,
        )
        .expect("toml");
        let mut settings = ClientSettings::default();

        apply_file(&mut settings, &file_cfg);

        assert_eq!(settings.server_url, "https://boards.example.net");
        assert_eq!(settings.request_timeout, Duration::from_millis(2500));
        assert_eq!(settings.reconnect_max_delay, Duration::from_secs(9));
        assert_eq!(settings.event_buffer, 1);
        assert_eq!(settings.stale_after_failures, 3);
    }

    #[test]
    fn app_prefixed_env_wins_over_plain_env() {
        let mut settings = ClientSettings::default();

        apply_env(
            &mut settings,
            env(&[
                ("BOARD_SYNC_SERVER_URL", "http://plain:1"),
                ("APP__SERVER_URL", "http://prefixed:2"),
                ("APP__STALE_AFTER_FAILURES", "7"),
                ("APP__RECONNECT_INITIAL_MS", "not-a-number"),
            ]),
        );

        assert_eq!(settings.server_url, "http://prefixed:2");
        assert_eq!(settings.stale_after_failures, 7);
        assert_eq!(
            settings.reconnect_initial_delay,
            ClientSettings::default().reconnect_initial_delay
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load_settings_from(Some(Path::new("/definitely/not/here.toml")))
            .expect_err("missing file");
        assert!(err.to_string().contains("failed to read config file"));
    }
}
