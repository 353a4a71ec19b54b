//! Configuration loader
//!
//! Loads the base configuration file and its drop-ins and merges them.

use super::{BootstrapConfig, merge};
use crate::{BootstrapError, state::CloudPaths};
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Load and merge the base config and drop-ins from standard locations
pub async fn load_config(paths: &CloudPaths) -> Result<BootstrapConfig, BootstrapError> {
    ConfigLoader::new().with_paths(paths.clone()).load().await
}

/// Read one YAML config file; missing or unparsable files give `None`
async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<Value>, BootstrapError> {
    let path = path.as_ref();

    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }

    let content = fs::read_to_string(path).await?;

    match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Null) => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Load all `*.cfg` drop-ins from a directory, sorted by name
async fn load_dropin_configs(dir: impl AsRef<Path>) -> Result<Vec<Value>, BootstrapError> {
    let dir = dir.as_ref();

    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }
    entries.sort();

    let mut configs = Vec::new();
    for path in entries {
        if let Some(config) = load_config_file(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            configs.push(config);
        }
    }

    info!("Loaded {} drop-in configs", configs.len());
    Ok(configs)
}

/// Configuration loader builder
pub struct ConfigLoader {
    paths: CloudPaths,
    file: Option<PathBuf>,
    include_dropins: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            paths: CloudPaths::new(),
            file: None,
            include_dropins: true,
        }
    }

    /// Use custom paths
    pub fn with_paths(mut self, paths: CloudPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Read this file instead of the standard base config
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Skip loading drop-in configs
    pub fn skip_dropins(mut self) -> Self {
        self.include_dropins = false;
        self
    }

    /// Load and merge; drop-ins override the base file
    pub async fn load(self) -> Result<BootstrapConfig, BootstrapError> {
        let mut documents = Vec::new();

        let base = self.file.unwrap_or_else(|| self.paths.main_config());
        if let Some(config) = load_config_file(&base).await? {
            debug!("Loaded base config from {}", base.display());
            documents.push(config);
        }

        if self.include_dropins {
            documents.extend(load_dropin_configs(self.paths.config_d()).await?);
        }

        let merged = merge::merge_all(&documents, merge::ListMergeStrategy::Replace);
        if merged.is_null() {
            return Ok(BootstrapConfig::default());
        }
        serde_yaml::from_value(merged).map_err(|e| BootstrapError::Config(e.to_string()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
