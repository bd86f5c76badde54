use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use roster_core::DEFAULT_SNAPSHOT_PREFIX;
use roster_remote::RemoteConfig;
use serde::Deserialize;

pub const DEFAULT_DB_PATH: &str = "./roster.sqlite3";
pub const DEFAULT_OUTPUT_DIR: &str = "./backups";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Contents of the optional `--config` YAML file. Every key is optional.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RosterConfig {
    pub db_path: Option<PathBuf>,
    pub snapshot_prefix: String,
    pub output_dir: PathBuf,
    /// Retention applied by `cleanup`; `backup` only sweeps when this is set explicitly
    /// or `--retention` is passed.
    pub retention_days: Option<u32>,
    pub remote: RemoteConfig,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            snapshot_prefix: DEFAULT_SNAPSHOT_PREFIX.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            retention_days: None,
            remote: RemoteConfig::default(),
        }
    }
}

impl RosterConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use roster_core::RetryPolicy;

    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() -> Result<()> {
        let config: RosterConfig = serde_yaml::from_str("snapshot_prefix: acme\n")?;
        assert_eq!(config.snapshot_prefix, "acme");
        assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
        assert_eq!(config.retention_days, None);
        assert_eq!(config.remote, RemoteConfig::default());
        Ok(())
    }

    #[test]
    fn nested_remote_settings_are_parsed() -> Result<()> {
        let config: RosterConfig = serde_yaml::from_str(
            "db_path: /var/lib/roster/store.sqlite3
retention_days: 14
remote:
  base_url: https://api.example.com
  timeout_secs: 5
  retry:
    max_attempts: 6
    base_delay_ms: 100
",
        )?;
        assert_eq!(config.db_path, Some(PathBuf::from("/var/lib/roster/store.sqlite3")));
        assert_eq!(config.retention_days, Some(14));
        assert_eq!(config.remote.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.remote.timeout_secs, 5);
        assert_eq!(
            config.remote.retry,
            RetryPolicy { max_attempts: 6, base_delay_ms: 100, ..RetryPolicy::default() }
        );
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<RosterConfig>("retention: 3\n").is_err());
    }

    #[test]
    fn no_config_path_means_defaults() -> Result<()> {
        assert_eq!(RosterConfig::load(None)?, RosterConfig::default());
        Ok(())
    }
}
