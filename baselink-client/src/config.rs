//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Client configuration. File: ~/.config/baselink/config.toml.
/// Env overrides: BASELINK_CONFIG_DIR, BASELINK_PROBE_TIMEOUT_SECS,
/// BASELINK_HANDSHAKE_TIMEOUT_SECS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the app static key and trusted base keys.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Timeout for the HTTP reachability probe, in seconds (default 5).
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Timeout for the whole handshake including pairing confirmation, in
    /// seconds (default 60; the user has to compare codes within this).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_config_dir() -> PathBuf {
    match std::env::var_os("HOME").map(PathBuf::from) {
        Some(home) => home.join(".config/baselink"),
        None => PathBuf::from("."),
    }
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            probe_timeout_secs: default_probe_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
        }
    }
}

impl Config {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Some(dir) = std::env::var_os("BASELINK_CONFIG_DIR") {
        c.config_dir = PathBuf::from(dir);
    }
    if let Ok(s) = std::env::var("BASELINK_PROBE_TIMEOUT_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.probe_timeout_secs = v;
        }
    }
    if let Ok(s) = std::env::var("BASELINK_HANDSHAKE_TIMEOUT_SECS") {
        if let Ok(v) = s.parse::<u64>() {
            c.handshake_timeout_secs = v;
        }
    }
    c
}

fn load_file() -> Option<Config> {
    let path = default_config_dir().join("config.toml");
    if !path.exists() {
        return None;
    }
    let s = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<Config>(&s) {
        Ok(c) => Some(c),
        Err(err) => {
            tracing::warn!("ignoring unparseable config at {}: {err}", path.display());
            None
        }
    }
}
