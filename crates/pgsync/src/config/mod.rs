//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, SyncError};
use std::path::{Path, PathBuf};
use tracing::debug;

/// How many parent directories are searched for a config file.
const MAX_SEARCH_DEPTH: usize = 20;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string. An empty document is an empty config.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// Locate and load the config for a run.
    ///
    /// An explicit path must exist. Otherwise `.pgsync.yml` (or
    /// `.pgsync-<db>.yml`) is searched from `start` upward; no file found
    /// yields an empty config.
    pub fn discover(
        explicit: Option<&Path>,
        db: Option<&str>,
        start: &Path,
    ) -> Result<(Option<PathBuf>, Self)> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(SyncError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            return Ok((Some(path.to_path_buf()), Self::load(path)?));
        }

        let name = config_file_name(db);
        match search_upward(start, &name) {
            Some(path) => {
                debug!("Using config file {}", path.display());
                let config = Self::load(&path)?;
                Ok((Some(path), config))
            }
            None if db.is_some() => Err(SyncError::Config(format!(
                "Config file not found: {}",
                name
            ))),
            None => Ok((None, Config::default())),
        }
    }

    /// Group names, sorted.
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }
}

impl SyncOptions {
    /// Reject conflicting or out-of-range options.
    pub fn validate(&self) -> Result<()> {
        validation::validate_options(self)
    }
}

/// `.pgsync.yml`, or `.pgsync-<db>.yml` for a named database.
pub fn config_file_name(db: Option<&str>) -> String {
    match db {
        Some(db) => format!(".pgsync-{}.yml", db),
        None => ".pgsync.yml".to_string(),
    }
}

fn search_upward(start: &Path, name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .take(MAX_SEARCH_DEPTH + 1)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
