use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Sent as `anthropic-version` when the client does not supply one
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding a key for clients that send no credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_api_key_env: Option<String>,
}

fn default_port() -> u16 {
    8787
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_anthropic_version() -> String {
    DEFAULT_ANTHROPIC_VERSION.to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            anthropic_version: default_anthropic_version(),
            timeout_secs: default_timeout_secs(),
            fallback_api_key_env: None,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(&candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Full URL of the upstream Messages endpoint
    pub fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.upstream.base_url.trim_end_matches('/'))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.timeout_secs)
    }

    /// Key from the configured fallback environment variable, if any.
    pub fn fallback_api_key(&self) -> Option<String> {
        let var = self.upstream.fallback_api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("oai2ant.toml")];

    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("oai2ant")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("oai2ant").join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join("oai2ant").join("config.toml"));
        }
    }

    if let Some(home) = home_dir() {
        paths.push(home.join(".oai2ant.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000

[upstream]
base_url = "http://localhost:9000/"
anthropic_version = "2024-01-01"
timeout_secs = 30
"#
        )
        .unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.upstream.anthropic_version, "2024-01-01");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.messages_url(), "http://localhost:9000/v1/messages");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "port = 6000").unwrap();

        let config = BridgeConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.upstream.anthropic_version, DEFAULT_ANTHROPIC_VERSION);
        assert_eq!(config.messages_url(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BridgeConfig::find_and_load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn test_fallback_api_key_unset() {
        let mut config = BridgeConfig::default();
        assert_eq!(config.fallback_api_key(), None);

        config.upstream.fallback_api_key_env =
            Some("OAI2ANT_TEST_KEY_THAT_IS_NEVER_SET".to_string());
        assert_eq!(config.fallback_api_key(), None);
    }
}
