use crate::core::error::{Error, Result};
use crate::retry::RetryConfig;
use crate::utils::{get_config_dir, write_atomic};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Runtime configuration for the compiler and the converger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Interface carrying inter-cluster tunnel traffic on gateway nodes
    pub tunnel_interface: String,
    /// Node uplink; traffic leaving through it bypasses the gateway filter
    pub external_interface: String,
    /// Prefix of the per-cluster tenant namespace (`<prefix>-<clusterID>`)
    pub tenant_namespace_prefix: String,
    /// Namespace the cluster-wide isolation object is written to
    pub isolation_namespace: String,
    pub chain_priority: i32,
    /// Command line used to reach nft, e.g. `nft` or `sudo nft`
    pub nft_command: String,
    pub fetch_timeout_secs: u64,
    pub apply_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tunnel_interface: "liqo-tunnel".to_string(),
            external_interface: "eth0".to_string(),
            tenant_namespace_prefix: "tenant".to_string(),
            isolation_namespace: "mesh-system".to_string(),
            chain_priority: crate::core::assemble::DEFAULT_CHAIN_PRIORITY,
            nft_command: "nft".to_string(),
            fetch_timeout_secs: 10,
            apply_timeout_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    /// Checks interface names and the namespace settings.
    pub fn validate(&self) -> Result<()> {
        validators::validate_interface(&self.tunnel_interface)
            .map_err(|m| Error::invalid_input("tunnel_interface", m))?;
        validators::validate_interface(&self.external_interface)
            .map_err(|m| Error::invalid_input("external_interface", m))?;
        validators::validate_namespace(&self.tenant_namespace_prefix)
            .map_err(|m| Error::invalid_input("tenant_namespace_prefix", m))?;
        validators::validate_namespace(&self.isolation_namespace)
            .map_err(|m| Error::invalid_input("isolation_namespace", m))?;
        if self.nft_command.trim().is_empty() {
            return Err(Error::invalid_input("nft_command", "cannot be empty"));
        }
        if self.fetch_timeout_secs == 0 || self.apply_timeout_secs == 0 {
            return Err(Error::invalid_input("timeouts", "must be at least one second"));
        }
        Ok(())
    }
}

/// `<config dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path`, or from the default location.
///
/// A missing file yields the defaults. A file that exists but does not
/// parse or validate is an error rather than a silent fallback.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        warn!("No config directory available, using defaults");
        return Ok(AppConfig::default());
    };

    let config = match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Config file not found, using defaults");
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    config.validate()?;
    Ok(config)
}

/// Saves the config with the atomic temp-file + rename pattern (mode 0o600).
pub async fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(config)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &json))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    Ok(())
}
