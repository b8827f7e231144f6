//! Project configuration.
//!
//! A project is described by an optional `revchain.toml`:
//!
//! ```toml
//! data_path = "revchain.db"
//! revisions_dir = "revisions"
//!
//! [migration]
//! batch_size = 500
//! allow_destructive = false
//! ```

use crate::migration::MigrationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default project configuration file name.
pub const CONFIG_FILE: &str = "revchain.toml";

/// Default path of the sled database holding schema and state.
pub const DEFAULT_DATA_PATH: &str = "revchain.db";

/// Default directory of revision files.
pub const DEFAULT_REVISIONS_DIR: &str = "revisions";

/// Errors loading a project configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for a project.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Project configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Path to the sled database.
    pub data_path: PathBuf,
    /// Directory holding revision files.
    pub revisions_dir: PathBuf,
    /// Engine settings.
    pub migration: MigrationConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            revisions_dir: PathBuf::from(DEFAULT_REVISIONS_DIR),
            migration: MigrationConfig::default(),
        }
    }
}

impl ProjectConfig {
    /// Load a configuration file.
    ///
    /// Relative paths in the file are resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if config.data_path.is_relative() {
                config.data_path = dir.join(&config.data_path);
            }
            if config.revisions_dir.is_relative() {
                config.revisions_dir = dir.join(&config.revisions_dir);
            }
        }
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no project file, using defaults");
            Ok(Self::default())
        }
    }

    /// Set the database path.
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = path.into();
        self
    }

    /// Set the revisions directory.
    pub fn with_revisions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.revisions_dir = dir.into();
        self
    }

    /// Set the engine settings.
    pub fn with_migration(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "revisions_dir = \"migrations\"\n\n[migration]\nbatch_size = 250\n")
            .unwrap();

        let config = ProjectConfig::load(&path).unwrap();
        assert_eq!(config.revisions_dir, dir.path().join("migrations"));
        assert_eq!(config.data_path, dir.path().join(DEFAULT_DATA_PATH));
        assert_eq!(config.migration.batch_size, 250);
        assert!(config.migration.verify_checksums);
        assert!(!config.migration.allow_destructive);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load_or_default(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, ProjectConfig::default());
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "batch_size = [").unwrap();
        assert!(matches!(
            ProjectConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
