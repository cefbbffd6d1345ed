//! Datastore configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `ORBIT_*` environment variables (`ORBIT_POOL_SIZE`,
//! `ORBIT_DATABASE__PATH`, `ORBIT_TABLES__GROUPS`, ...).

use std::path::{Path, PathBuf};

use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DatastoreError, Result};
use crate::store::TableNames;

pub const ENV_PREFIX: &str = "ORBIT";

/// Backing database settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; an in-memory database is used when unset
    pub path: Option<PathBuf>,
    /// How long a writer waits on a locked database file
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5000,
        }
    }
}

/// Template for the group created when the store has no default group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultGroupConfig {
    pub name: String,
    pub display_name: String,
    pub prefix: String,
    pub suffix: String,
    pub sort_order: i32,
}

impl Default for DefaultGroupConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            display_name: "Default".into(),
            prefix: String::new(),
            suffix: String::new(),
            sort_order: i32::from(i16::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreConfig {
    pub database: DatabaseConfig,
    /// Worker threads in the task queue; 0 and 1 both mean a single FIFO worker
    pub pool_size: usize,
    pub tables: TableNames,
    pub default_group: DefaultGroupConfig,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            pool_size: 1,
            tables: TableNames::default(),
            default_group: DefaultGroupConfig::default(),
        }
    }
}

impl DatastoreConfig {
    /// Load from an optional TOML file, with environment overrides applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let settings: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let settings: Self = config::Config::builder()
            .add_source(File::from_str(toml_str, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|error| DatastoreError::Config(error.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.tables.validate()?;

        if self.default_group.name.trim().is_empty() {
            return Err(DatastoreError::Config(
                "default_group.name must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.pool_size.max(1)
    }

    pub fn log_config(&self) {
        let database = self
            .database
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string());

        info!(
            database = %database,
            workers = self.worker_count(),
            groups_table = %self.tables.groups,
            subjects_table = %self.tables.subjects,
            default_group = %self.default_group.name,
            "Datastore configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DatastoreConfig::default();
        assert_eq!(config.pool_size, 1);
        assert_eq!(config.database.path, None);
        assert_eq!(config.tables.groups, "groups");
        assert_eq!(config.tables.subjects, "subjects");
        assert_eq!(config.default_group.name, "default");
        assert_eq!(config.default_group.display_name, "Default");
        assert_eq!(config.default_group.sort_order, 32767);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DatastoreConfig::from_toml_str(
            r#"
pool_size = 4

[tables]
groups = "orbit_groups"
"#,
        )
        .unwrap();

        assert_eq!(config.pool_size, 4);
        assert_eq!(config.worker_count(), 4);
        assert_eq!(config.tables.groups, "orbit_groups");
        assert_eq!(config.tables.subjects, "subjects");
        assert_eq!(config.database.busy_timeout_ms, 5000);
    }

    #[test]
    fn test_zero_pool_size_means_one_worker() {
        let config = DatastoreConfig::from_toml_str("pool_size = 0").unwrap();
        assert_eq!(config.worker_count(), 1);
    }

    #[test]
    fn test_rejects_unsafe_table_name() {
        let result = DatastoreConfig::from_toml_str(
            r#"
[tables]
groups = "groups; DROP TABLE subjects"
"#,
        );
        assert!(matches!(result, Err(DatastoreError::Config(_))));
    }

    #[test]
    fn test_rejects_empty_default_group_name() {
        let result = DatastoreConfig::from_toml_str(
            r#"
[default_group]
name = "  "
"#,
        );
        assert!(matches!(result, Err(DatastoreError::Config(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = DatastoreConfig::default();
        config.database.path = Some(PathBuf::from("/var/lib/orbit/orbit.db"));
        config.pool_size = 3;

        let rendered = config.to_toml().unwrap();
        let parsed = DatastoreConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("orbit.toml");
        std::fs::write(
            &path,
            r#"
[database]
busy_timeout_ms = 250

[default_group]
name = "guest"
"#,
        )
        .unwrap();

        let config = DatastoreConfig::load(Some(&path)).unwrap();
        assert_eq!(config.database.busy_timeout_ms, 250);
        assert_eq!(config.default_group.name, "guest");
    }
}
