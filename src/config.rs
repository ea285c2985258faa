//! Panel configuration and file loading.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Configuration for [`UserPanel`](crate::UserPanel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelConfig {
    /// Path of the embedded ledger database.
    pub db_path: PathBuf,
    /// Directory DelUser backups are written to. When unset, `db-backup`
    /// is created best-effort next to the process; an explicit directory
    /// is used as-is.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Credit flush interval in seconds.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl PanelConfig {
    /// Config with defaults for everything but the database path.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            backup_dir: None,
            flush_interval_secs: defaults::DEFAULT_FLUSH_INTERVAL_SECS,
        }
    }

    /// The flush interval as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

fn default_flush_interval_secs() -> u64 {
    defaults::DEFAULT_FLUSH_INTERVAL_SECS
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format")]
    UnsupportedFormat,
    #[error("validation: {0}")]
    Validation(String),
}

/// Load a [`PanelConfig`] from a JSON (with comments), YAML or TOML file,
/// selected by extension.
pub fn load_config(path: impl AsRef<Path>) -> Result<PanelConfig, ConfigError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
        "json" | "jsonc" => {
            let stripped = json_comments::StripComments::new(data.as_bytes());
            Ok(serde_json::from_reader(stripped)?)
        }
        "yaml" | "yml" => Ok(serde_yaml::from_str(&data)?),
        "toml" => Ok(toml::from_str(&data)?),
        _ => Err(ConfigError::UnsupportedFormat),
    }
}

pub fn validate_config(config: &PanelConfig) -> Result<(), ConfigError> {
    if config.db_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("db_path is empty".into()));
    }
    if config.flush_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "flush_interval_secs must be > 0".into(),
        ));
    }
    if let Some(dir) = &config.backup_dir {
        if dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation("backup_dir is empty".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PanelConfig::new("users.db");
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert!(config.backup_dir.is_none());
        validate_config(&config).unwrap();
    }

    #[test]
    fn test_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "db_path = \"/var/lib/veil/users.db\"").unwrap();
        writeln!(file, "flush_interval_secs = 30").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/veil/users.db"));
        assert_eq!(config.flush_interval_secs, 30);
        assert!(config.backup_dir.is_none());
    }

    #[test]
    fn test_load_json_with_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.jsonc");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "{{\n  // ledger location\n  \"db_path\": \"users.db\",\n  \"backup_dir\": \"backups\"\n}}"
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.backup_dir, Some(PathBuf::from("backups")));
        assert_eq!(config.flush_interval_secs, 10); // default applied
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.ini");
        fs::write(&path, "db_path=users.db").unwrap();

        assert!(matches!(
            load_config(&path).unwrap_err(),
            ConfigError::UnsupportedFormat
        ));
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = PanelConfig::new("users.db");
        config.flush_interval_secs = 0;
        assert!(matches!(
            validate_config(&config).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }
}
