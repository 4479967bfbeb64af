use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// llm-alias-proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where per-alias listeners bind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    /// First port probed when starting a proxy.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of ports probed upward from `base_port`.
    #[serde(default = "default_port_range")]
    pub port_range: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            port_range: default_port_range(),
        }
    }
}

impl ServerConfig {
    /// Last port (inclusive) the allocator may hand out.
    pub fn last_port(&self) -> u16 {
        self.base_port
            .saturating_add(self.port_range.saturating_sub(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// When false, stopping an alias that is not running is a silent no-op.
    #[serde(default = "default_true")]
    pub strict_stop: bool,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            strict_stop: true,
            drain_timeout_secs: default_drain_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ProxyConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Total request timeout. Unset by default so streams may run indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: default_storage_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_base_port() -> u16 { 3000 }
fn default_port_range() -> u16 { 100 }
fn default_true() -> bool { true }
fn default_drain_timeout() -> u64 { 5 }
fn default_max_body_bytes() -> usize { 100 * 1024 * 1024 }
fn default_connect_timeout() -> u64 { 20 }
fn default_log_level() -> String { "info".to_string() }

fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".llm_alias_proxy")
}

/// Get default config file path
/// Uses ~/.config/llm-alias-proxy/config.toml for Unix-like CLI experience
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("llm-alias-proxy")
        .join("config.toml")
}

/// A loaded config and where it came from.
#[derive(Debug)]
pub struct LoadedConfig {
    pub config: Config,
    /// File the config was read from; `None` means built-in defaults.
    pub source: Option<PathBuf>,
    /// Parse error of a `./config.toml` that was skipped in favour of the default path.
    pub skipped_local: Option<String>,
}

impl LoadedConfig {
    /// Report the config source. Loading happens before the subscriber is
    /// installed, so this is called once logging is up.
    pub fn log_source(&self) {
        if let Some(e) = &self.skipped_local {
            tracing::error!("Failed to load ./config.toml: {}. Fell back to default path.", e);
        }
        match &self.source {
            Some(path) => tracing::info!("Loaded config from {:?}", path),
            None => tracing::info!("No config file found, using defaults"),
        }
    }
}

/// Load config from file, or return defaults if not found.
///
/// Loading order:
/// 1. Specified path (if provided)
/// 2. ./config.toml (if exists)
/// 3. default_config_path() (usually ~/.config/llm-alias-proxy/config.toml)
pub fn load_config(path: Option<PathBuf>) -> anyhow::Result<LoadedConfig> {
    if let Some(config_path) = path {
        if !config_path.exists() {
            anyhow::bail!("Specified config file not found: {:?}", config_path);
        }
        return Ok(LoadedConfig {
            config: read_config(&config_path)?,
            source: Some(config_path),
            skipped_local: None,
        });
    }

    let mut skipped_local = None;
    let local_config = PathBuf::from("config.toml");
    if local_config.exists() {
        match read_config(&local_config) {
            Ok(config) => {
                return Ok(LoadedConfig {
                    config,
                    source: Some(local_config),
                    skipped_local: None,
                })
            }
            Err(e) => skipped_local = Some(e.to_string()),
        }
    }

    let default_path = default_config_path();
    if default_path.exists() {
        Ok(LoadedConfig {
            config: read_config(&default_path)?,
            source: Some(default_path),
            skipped_local,
        })
    } else {
        Ok(LoadedConfig {
            config: Config::default(),
            source: None,
            skipped_local,
        })
    }
}

fn read_config(path: &PathBuf) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Expand ~ in path to home directory
pub fn expand_path(path: &PathBuf) -> PathBuf {
    if let Some(path_str) = path.to_str() {
        if let Some(rest) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
    }
    path.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.base_port, 3000);
        assert!(config.proxy.strict_stop);
        assert_eq!(config.timeouts.request_timeout_secs, None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_sections_override_only_given_keys() {
        let config: Config = toml::from_str(
            r#"
            [server]
            base_port = 4100
            port_range = 10

            [proxy]
            strict_stop = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.base_port, 4100);
        assert_eq!(config.server.last_port(), 4109);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.proxy.strict_stop);
        assert_eq!(config.proxy.drain_timeout_secs, 5);
    }

    #[test]
    fn last_port_saturates() {
        let server = ServerConfig {
            base_port: u16::MAX - 1,
            port_range: 50,
            ..ServerConfig::default()
        };
        assert_eq!(server.last_port(), u16::MAX);
    }

    #[test]
    fn load_config_rejects_missing_explicit_path() {
        let missing = PathBuf::from("/nonexistent/llm-alias-proxy/config.toml");
        assert!(load_config(Some(missing)).is_err());
    }

    #[test]
    fn load_config_reads_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n").unwrap();

        let loaded = load_config(Some(path.clone())).unwrap();
        assert_eq!(loaded.config.server.host, "0.0.0.0");
        assert_eq!(loaded.source, Some(path));
        assert!(loaded.skipped_local.is_none());
    }
}
