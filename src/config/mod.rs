//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, layered from defaults, an optional config file and
/// `RFC_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port for the HTTP API and the event callback listener.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Address remote devices should call back on. Detected when unset.
    #[serde(default)]
    pub callback_host: Option<String>,

    /// Raumfeld host (config device), `ip` or `ip:port`. Located by SSDP when unset.
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_subscription_timeout")]
    pub subscription_timeout_secs: u64,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    #[serde(default = "default_subscription_interval")]
    pub subscription_interval_secs: u64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Timeout applied to every outbound request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_port() -> u16 {
    28080
}

fn default_subscription_timeout() -> u64 {
    300
}

fn default_discovery_interval() -> u64 {
    600
}

fn default_subscription_interval() -> u64 {
    30
}

fn default_tick_interval() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            callback_host: None,
            host: None,
            subscription_timeout_secs: default_subscription_timeout(),
            discovery_interval_secs: default_discovery_interval(),
            subscription_interval_secs: default_subscription_interval(),
            tick_interval_ms: default_tick_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Config {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }

    pub fn subscription_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_interval_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

const APP_DIR_NAME: &str = "raumfeld-control";

/// Get config directory (RFC_CONFIG_DIR, XDG_CONFIG_HOME or ~/.config)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RFC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library/Application Support")
                .join(APP_DIR_NAME);
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config").join(APP_DIR_NAME);
        }
    }

    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        .set_default("port", default_port() as i64)?
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // RFC_PORT, RFC_SUBSCRIPTION_TIMEOUT_SECS, ...
        .add_source(
            ::config::Environment::with_prefix("RFC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Precedence: RFC_PORT > PORT > config file > default
    if let Ok(port) = std::env::var("RFC_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    } else if let Ok(port) = std::env::var("PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("port", port_num as i64)?;
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const MISSING_DIR: &str = "/tmp/rfc-test-nonexistent";

    fn clear_env() {
        for key in [
            "RFC_PORT",
            "PORT",
            "RFC_HOST",
            "RFC_CALLBACK_HOST",
            "RFC_SUBSCRIPTION_TIMEOUT_SECS",
            "RFC_DISCOVERY_INTERVAL_SECS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_file_or_env() {
        clear_env();
        env::set_var("RFC_CONFIG_DIR", MISSING_DIR);

        let config = load_config().expect("config should load");

        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.port, 28080);
        assert_eq!(config.subscription_timeout_secs, 300);
        assert_eq!(config.discovery_interval_secs, 600);
        assert_eq!(config.subscription_interval_secs, 30);
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert!(config.host.is_none());
        assert!(config.callback_host.is_none());
    }

    #[test]
    #[serial]
    fn test_port_env_fallback() {
        clear_env();
        env::set_var("RFC_CONFIG_DIR", MISSING_DIR);
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");

        env::remove_var("PORT");
        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.port, 3000, "PORT env var should set config.port");
    }

    #[test]
    #[serial]
    fn test_rfc_port_takes_precedence_over_port() {
        clear_env();
        env::set_var("RFC_CONFIG_DIR", MISSING_DIR);
        env::set_var("RFC_PORT", "5000");
        env::set_var("PORT", "3000");

        let config = load_config().expect("config should load");

        clear_env();
        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.port, 5000, "RFC_PORT should take precedence over PORT");
    }

    #[test]
    #[serial]
    fn test_invalid_port_uses_default() {
        clear_env();
        env::set_var("RFC_CONFIG_DIR", MISSING_DIR);
        env::set_var("PORT", "not-a-number");

        let config = load_config().expect("config should load");

        env::remove_var("PORT");
        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.port, 28080, "Invalid PORT should fall back to default");
    }

    #[test]
    #[serial]
    fn test_env_overrides_intervals_and_host() {
        clear_env();
        env::set_var("RFC_CONFIG_DIR", MISSING_DIR);
        env::set_var("RFC_SUBSCRIPTION_TIMEOUT_SECS", "180");
        env::set_var("RFC_HOST", "10.0.0.2");

        let config = load_config().expect("config should load");

        clear_env();
        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.subscription_timeout_secs, 180);
        assert_eq!(config.host.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    #[serial]
    fn test_config_file_in_config_dir() {
        clear_env();
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "discovery_interval_secs = 120\ncallback_host = \"192.168.1.20\"\n",
        )
        .expect("write config");
        env::set_var("RFC_CONFIG_DIR", temp_dir.path());

        let config = load_config().expect("config should load");

        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.discovery_interval(), Duration::from_secs(120));
        assert_eq!(config.callback_host.as_deref(), Some("192.168.1.20"));
        assert_eq!(config.port, 28080);
    }

    #[test]
    #[serial]
    fn test_env_beats_config_file() {
        clear_env();
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        std::fs::write(
            temp_dir.path().join("config.toml"),
            "discovery_interval_secs = 120\n",
        )
        .expect("write config");
        env::set_var("RFC_CONFIG_DIR", temp_dir.path());
        env::set_var("RFC_DISCOVERY_INTERVAL_SECS", "60");

        let config = load_config().expect("config should load");

        clear_env();
        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(config.discovery_interval_secs, 60);
    }

    #[test]
    #[serial]
    fn test_get_config_dir_prefers_rfc_config_dir() {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        env::set_var("RFC_CONFIG_DIR", temp_dir.path());

        let dir = get_config_dir();

        env::remove_var("RFC_CONFIG_DIR");

        assert_eq!(dir, temp_dir.path());
    }
}
