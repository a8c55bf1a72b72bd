//! Global CLI configuration management
//!
//! Stores the pool server URL and local paths in ~/.wgpool/config.json.
//! Command-line flags and `WGPOOL_*` environment variables take precedence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use wgpool_lib::{DEFAULT_POOL_URL, DEFAULT_STATE_FILE};

/// Default tunnel artifact directory
pub const DEFAULT_TUNNEL_DIR: &str = wgpool_lib::DEFAULT_CONFIG_DIR;

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WgpoolConfig {
    /// Pool server base URL
    pub pool_url: Option<String>,
    /// Connection registry document
    pub state_file: Option<PathBuf>,
    /// Directory for tunnel configuration artifacts
    pub tunnel_dir: Option<PathBuf>,
    /// Run networking commands through `sudo -n`
    pub use_sudo: bool,
    /// Fail `up` when the tunnel cannot reach the probe target
    pub require_reachability: bool,
}

/// Configuration manager
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Manager for `<config_dir>/config.json`, defaulting to ~/.wgpool
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let dir = match config_dir {
            Some(dir) => dir,
            None => {
                let home = dirs::home_dir().context("Failed to get home directory")?;
                home.join(".wgpool")
            }
        };
        Ok(Self {
            path: dir.join("config.json"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the configuration from disk
    pub fn load(&self) -> Result<WgpoolConfig> {
        // Return default config if file doesn't exist
        if !self.path.exists() {
            return Ok(WgpoolConfig::default());
        }

        let json = fs::read_to_string(&self.path)
            .context(format!("Failed to read config file: {:?}", self.path))?;

        let config: WgpoolConfig = serde_json::from_str(&json)
            .context(format!("Failed to parse config file: {:?}", self.path))?;

        Ok(config)
    }

    /// Save the configuration to disk
    pub fn save(&self, config: &WgpoolConfig) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(&self.path, json)
            .context(format!("Failed to write config file: {:?}", self.path))?;

        Ok(())
    }

    /// Set the default pool server URL
    pub fn set_pool_url(&self, url: &str) -> Result<()> {
        validate_pool_url(url)?;
        let mut config = self.load()?;
        config.pool_url = Some(url.trim_end_matches('/').to_string());
        self.save(&config)
    }

    /// Restore every setting to its default
    pub fn reset(&self) -> Result<()> {
        self.save(&WgpoolConfig::default())
    }
}

fn validate_pool_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => anyhow::bail!("Pool URL must be an http:// or https:// URL, got '{}'", url),
    }
}

/// Values given on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub pool_url: Option<String>,
    pub state_file: Option<PathBuf>,
    pub tunnel_dir: Option<PathBuf>,
    pub use_sudo: bool,
    pub require_reachability: bool,
}

/// Effective settings after layering overrides on the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub pool_url: String,
    pub state_file: PathBuf,
    pub tunnel_dir: PathBuf,
    pub use_sudo: bool,
    pub require_reachability: bool,
}

impl Settings {
    pub fn resolve(overrides: Overrides, file: &WgpoolConfig) -> Self {
        Self {
            pool_url: overrides
                .pool_url
                .or_else(|| file.pool_url.clone())
                .unwrap_or_else(|| DEFAULT_POOL_URL.to_string()),
            state_file: overrides
                .state_file
                .or_else(|| file.state_file.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            tunnel_dir: overrides
                .tunnel_dir
                .or_else(|| file.tunnel_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TUNNEL_DIR)),
            use_sudo: overrides.use_sudo || file.use_sudo,
            require_reachability: overrides.require_reachability || file.require_reachability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_default() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::new(Some(temp.path().join("wgpool"))).unwrap();

        assert_eq!(manager.load().unwrap(), WgpoolConfig::default());
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_set_pool_url_and_reset() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::new(Some(temp.path().join("wgpool"))).unwrap();

        manager.set_pool_url("http://10.0.0.5:3000/vpn_api/").unwrap();
        assert_eq!(
            manager.load().unwrap().pool_url.as_deref(),
            Some("http://10.0.0.5:3000/vpn_api")
        );

        manager.reset().unwrap();
        assert_eq!(manager.load().unwrap(), WgpoolConfig::default());
    }

    #[test]
    fn test_rejects_invalid_pool_url() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::new(Some(temp.path().to_path_buf())).unwrap();

        assert!(manager.set_pool_url("10.0.0.5:3000").is_err());
        assert!(manager.set_pool_url("http://").is_err());
        assert!(!manager.path().exists());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let manager = ConfigManager::new(Some(temp.path().to_path_buf())).unwrap();
        fs::write(manager.path(), r#"{"use_sudo": true}"#).unwrap();

        let config = manager.load().unwrap();
        assert!(config.use_sudo);
        assert!(config.pool_url.is_none());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = WgpoolConfig {
            pool_url: Some("http://pool.internal/vpn_api".to_string()),
            state_file: Some(PathBuf::from("/srv/wgpool/state.json")),
            tunnel_dir: None,
            use_sudo: true,
            require_reachability: false,
        };
        let settings = Settings::resolve(
            Overrides {
                pool_url: Some("http://127.0.0.1:9000/vpn_api".to_string()),
                require_reachability: true,
                ..Default::default()
            },
            &file,
        );

        assert_eq!(settings.pool_url, "http://127.0.0.1:9000/vpn_api");
        assert_eq!(settings.state_file, PathBuf::from("/srv/wgpool/state.json"));
        assert_eq!(settings.tunnel_dir, PathBuf::from(DEFAULT_TUNNEL_DIR));
        assert!(settings.use_sudo);
        assert!(settings.require_reachability);
    }

    #[test]
    fn test_defaults_without_file_or_overrides() {
        let settings = Settings::resolve(Overrides::default(), &WgpoolConfig::default());
        assert_eq!(settings.pool_url, DEFAULT_POOL_URL);
        assert_eq!(settings.state_file, PathBuf::from(DEFAULT_STATE_FILE));
        assert!(!settings.use_sudo);
    }
}
