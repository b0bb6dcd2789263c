use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const DEFAULT_BIND: &str = "127.0.0.1:1337";

/// Top-level server config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeplaneConfig {
    pub server: ServerSection,
    pub engine: EngineSection,
    pub cipher: CipherSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Address to listen on (host:port).
    pub bind: String,
    /// Bind every connection to one engine created at startup instead of
    /// one engine per connection.
    pub shared_engine: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            shared_engine: false,
        }
    }
}

/// How to launch the engine host process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub command: String,
    pub args: Vec<String>,
    /// Seconds to wait for the host's `ready` notification.
    pub startup_timeout_secs: u64,
    /// Seed values for each engine's configuration store.
    pub config: toml::Table,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command: "veplane-engine".to_string(),
            args: Vec::new(),
            startup_timeout_secs: 60,
            config: toml::Table::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherSection {
    /// Key file; defaults to `<config dir>/veplane/cipher.key`.
    pub key_file: Option<PathBuf>,
}

/// Errors that can occur when loading config.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// `<config dir>/veplane`, if the platform has a config dir.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("veplane"))
}

pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

impl VeplaneConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn key_file(&self) -> Option<PathBuf> {
        self.cipher
            .key_file
            .clone()
            .or_else(|| config_dir().map(|d| d.join("cipher.key")))
    }

    /// Initial engine configuration: built-in defaults overlaid with the
    /// `[engine.config]` table.
    pub fn engine_seed(&self) -> Map<String, Value> {
        let mut seed = Map::new();
        if let Some(home) = dirs::home_dir() {
            seed.insert("userHome".into(), json!(home.to_string_lossy()));
        }
        seed.insert(
            "temp".into(),
            json!(std::env::temp_dir().to_string_lossy()),
        );
        seed.insert("timeToWaitForScreenShot".into(), json!(0));
        if let Some(dir) = config_dir() {
            seed.insert(
                "veUserFavorites".into(),
                json!(dir.join("favorites.json").to_string_lossy()),
            );
            seed.insert(
                "veUserSettings".into(),
                json!(dir.join("settings.json").to_string_lossy()),
            );
        }
        if let Some(proxy) = std::env::var("HTTP_PROXY")
            .ok()
            .or_else(|| std::env::var("http_proxy").ok())
        {
            seed.insert("proxy".into(), json!(proxy));
        }

        for (key, value) in &self.engine.config {
            match serde_json::to_value(value) {
                Ok(v) => {
                    seed.insert(key.clone(), v);
                }
                Err(e) => tracing::warn!(key, error = %e, "ignoring unrepresentable engine config value"),
            }
        }
        seed
    }
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It may contain proxy credentials -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9000"
            shared_engine = true

            [engine]
            command = "node"
            args = ["host.js", "--quiet"]

            [engine.config]
            timeToWaitForScreenShot = 250
            sodaRootId = "root"

            [cipher]
            key_file = "/etc/veplane/key"
        "#;
        let config: VeplaneConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert!(config.server.shared_engine);
        assert_eq!(config.engine.command, "node");
        assert_eq!(config.engine.args, vec!["host.js", "--quiet"]);
        assert_eq!(config.engine.startup_timeout_secs, 60);
        assert_eq!(config.key_file(), Some(PathBuf::from("/etc/veplane/key")));

        let seed = config.engine_seed();
        assert_eq!(seed["timeToWaitForScreenShot"], json!(250));
        assert_eq!(seed["sodaRootId"], json!("root"));
        assert!(seed.contains_key("temp"));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: VeplaneConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.bind, DEFAULT_BIND);
        assert!(!config.server.shared_engine);
        assert_eq!(config.engine.command, "veplane-engine");
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VeplaneConfig::load(&dir.path().join("nope.toml")).unwrap().is_none());
    }

    #[test]
    fn invalid_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nbind = ").unwrap();
        assert!(matches!(
            VeplaneConfig::load(&path),
            Err(ConfigError::ParseFailed(_, _))
        ));
    }

    #[test]
    fn world_readable_bit() {
        assert!(is_world_readable(0o644));
        assert!(!is_world_readable(0o600));
    }
}
