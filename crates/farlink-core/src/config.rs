//! Tunnel and portal configuration
//!
//! Deadlines and cadences for the tunnel supervisor and the cache
//! reaper, with TOML load/save helpers.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for booting and tearing down a single tunnel process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// SSH binary to spawn (resolved through PATH unless absolute)
    pub ssh_binary: PathBuf,

    /// Sleep between readiness checks while booting
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Overall deadline for the local socket to appear
    #[serde(with = "duration_millis")]
    pub boot_deadline: Duration,

    /// How long to wait after SIGTERM before escalating
    #[serde(with = "duration_millis")]
    pub term_grace: Duration,

    /// How long to wait after SIGKILL before giving up
    #[serde(with = "duration_millis")]
    pub kill_grace: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_binary: PathBuf::from("ssh"),
            poll_interval: Duration::from_millis(100),
            boot_deadline: Duration::from_secs(10),
            term_grace: Duration::from_secs(5),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl TunnelConfig {
    /// Number of readiness polls the boot deadline allows
    pub fn max_polls(&self) -> u32 {
        let poll = self.poll_interval.max(Duration::from_millis(1));
        (self.boot_deadline.as_millis() / poll.as_millis()).max(1) as u32
    }
}

/// Configuration for the portal cache and its reaper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Period between reaper sweeps; entry TTL is twice this
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl PortalConfig {
    /// Time-to-live applied to an entry on insert and on every hit
    pub fn ttl(&self) -> Duration {
        self.sweep_interval * 2
    }
}

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("farlink")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

/// Serde helper storing a Duration as whole milliseconds.
///
/// Sweep intervals and grace periods are routinely sub-second, so the
/// seconds granularity used for coarser timeouts would round them away.
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize a Duration from milliseconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_bounded() {
        let config = TunnelConfig::default();
        assert!(config.poll_interval < config.boot_deadline);
        assert!(config.max_polls() > 1);
    }

    #[test]
    fn test_ttl_is_twice_sweep() {
        let config = PortalConfig {
            sweep_interval: Duration::from_millis(500),
        };
        assert_eq!(config.ttl(), Duration::from_secs(1));
    }

    #[test]
    fn test_duration_millis_roundtrip() {
        let original = PortalConfig {
            sweep_interval: Duration::from_millis(250),
        };
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, r#"{"sweep_interval":250}"#);
        let parsed: PortalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sweep_interval, original.sweep_interval);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = TunnelConfig {
            boot_deadline: Duration::from_secs(3),
            ..TunnelConfig::default()
        };
        save_config(&path, &config).unwrap();

        let loaded: TunnelConfig = load_config(&path).unwrap();
        assert_eq!(loaded.boot_deadline, Duration::from_secs(3));
        assert_eq!(loaded.ssh_binary, PathBuf::from("ssh"));
    }

    #[test]
    fn test_load_missing_config() {
        let err = load_config::<TunnelConfig>(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
