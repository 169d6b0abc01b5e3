use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

pub const DEFAULT_API_KEY: &str = "sk-local-development-key";
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_SESSION_COOKIE: &str = "gwc_session";

static SETTINGS_PATH: Lazy<Option<PathBuf>> = Lazy::new(|| {
    let proj = ProjectDirs::from("com", "example", "GatewayConsole")?;
    Some(proj.config_dir().join("gateway-console.toml"))
});

/// Server-side settings. The API key and base URL here are only the fallbacks
/// used until a session saves its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub default_api_key: String,
    pub default_base_url: String,
    pub upstream_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub session_cookie: String,
    pub session_ttl_secs: u64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            default_api_key: DEFAULT_API_KEY.to_string(),
            default_base_url: DEFAULT_BASE_URL.to_string(),
            upstream_timeout_secs: 15,
            accept_invalid_certs: false,
            session_cookie: DEFAULT_SESSION_COOKIE.to_string(),
            session_ttl_secs: 60 * 60 * 8,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn path() -> Option<PathBuf> {
        SETTINGS_PATH.clone()
    }

    /// Reads the settings file if there is one, then applies `GWC_*`
    /// environment overrides. A broken file is logged and ignored.
    pub fn load() -> Self {
        let mut settings = Self::path()
            .and_then(|path| match Self::from_file(&path) {
                Ok(s) => Some(s),
                Err(SettingsError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    log::warn!("ignoring settings file {}: {}", path.display(), e);
                    None
                }
            })
            .unwrap_or_default();
        if let Err(e) = settings.apply_env(|key| std::env::var(key).ok()) {
            log::warn!("ignoring environment override: {}", e);
        }
        settings
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        let path = Self::path().ok_or(SettingsError::NoConfigDir)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("GWC_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("GWC_API_KEY") {
            self.default_api_key = v;
        }
        if let Some(v) = lookup("GWC_BASE_URL") {
            self.default_base_url = v;
        }
        if let Some(v) = lookup("GWC_UPSTREAM_TIMEOUT_SECS") {
            self.upstream_timeout_secs = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: "GWC_UPSTREAM_TIMEOUT_SECS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("GWC_ACCEPT_INVALID_CERTS") {
            self.accept_invalid_certs = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("GWC_SESSION_COOKIE") {
            self.session_cookie = v;
        }
        if let Some(v) = lookup("GWC_SESSION_TTL_SECS") {
            self.session_ttl_secs = v.parse().map_err(|_| SettingsError::InvalidValue {
                key: "GWC_SESSION_TTL_SECS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("GWC_LOG") {
            self.log_filter = v;
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, SettingsError> {
        self.bind_addr
            .parse()
            .map_err(|_| SettingsError::InvalidValue { key: "bind_addr", value: self.bind_addr.clone() })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let s: Settings = toml::from_str("default_base_url = \"https://gw.example/api/v1\"").unwrap();
        assert_eq!(s.default_base_url, "https://gw.example/api/v1");
        assert_eq!(s.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(s.session_cookie, DEFAULT_SESSION_COOKIE);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("GWC_API_KEY", "sk-env"),
            ("GWC_UPSTREAM_TIMEOUT_SECS", "3"),
            ("GWC_ACCEPT_INVALID_CERTS", "true"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.default_api_key, "sk-env");
        assert_eq!(s.upstream_timeout(), Duration::from_secs(3));
        assert!(s.accept_invalid_certs);
    }

    #[test]
    fn bad_number_is_rejected() {
        let mut s = Settings::default();
        let err = s
            .apply_env(|k| (k == "GWC_SESSION_TTL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue { key: "GWC_SESSION_TTL_SECS", .. }));
    }

    #[test]
    fn round_trips_through_toml() {
        let s = Settings::default();
        let text = toml::to_string_pretty(&s).unwrap();
        assert_eq!(toml::from_str::<Settings>(&text).unwrap(), s);
    }
}
