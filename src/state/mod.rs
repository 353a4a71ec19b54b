//! Instance state
//!
//! Tracks which instance the machine currently is and where its data lives.
//! A changed instance-id means a new instance: per-instance work runs again.

pub mod paths;

pub use paths::CloudPaths;

use serde_json::Value;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

use crate::BootstrapError;

/// Instance state manager
#[derive(Debug)]
pub struct InstanceState {
    paths: CloudPaths,
    instance_id: Option<String>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    pub fn new() -> Self {
        Self::with_paths(CloudPaths::new())
    }

    pub fn with_paths(paths: CloudPaths) -> Self {
        Self {
            paths,
            instance_id: None,
        }
    }

    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Create the shared directory structure
    pub async fn initialize(&self) -> Result<(), BootstrapError> {
        fs::create_dir_all(self.paths.data_dir()).await?;
        fs::create_dir_all(self.paths.instances_dir()).await?;
        fs::create_dir_all(self.paths.scripts_per_boot()).await?;
        fs::create_dir_all(self.paths.scripts_per_instance()).await?;
        fs::create_dir_all(self.paths.scripts_per_once()).await?;

        debug!("Created state directories under {}", self.paths.base.display());
        Ok(())
    }

    /// Switch to `instance_id`; returns whether this is a new instance
    pub async fn set_instance_id(&mut self, instance_id: &str) -> Result<bool, BootstrapError> {
        if instance_id.is_empty() || instance_id.contains('/') || instance_id == ".." {
            return Err(BootstrapError::InvalidData(format!(
                "unusable instance id '{instance_id}'"
            )));
        }

        let is_new_instance = self.check_instance_change(instance_id).await?;

        let instance_dir = self.paths.instance_dir(instance_id);
        for dir in [
            instance_dir.clone(),
            self.paths.handlers_dir(instance_id),
            self.paths.boothooks_dir(instance_id),
            self.paths.instance_scripts_dir(instance_id),
            self.paths.vendor_scripts_dir(instance_id),
            self.paths.urlcache_dir(instance_id),
        ] {
            fs::create_dir_all(dir).await?;
        }

        self.update_instance_link(instance_id).await?;
        fs::create_dir_all(self.paths.data_dir()).await?;
        fs::write(self.paths.cached_instance_id(), instance_id).await?;
        self.instance_id = Some(instance_id.to_string());

        if is_new_instance {
            info!("New instance detected: {}", instance_id);
        } else {
            debug!("Same instance as last boot: {}", instance_id);
        }

        Ok(is_new_instance)
    }

    async fn check_instance_change(&self, new_id: &str) -> Result<bool, BootstrapError> {
        let cached_path = self.paths.cached_instance_id();

        if !fs::try_exists(&cached_path).await.unwrap_or(false) {
            return Ok(true);
        }

        let cached_id = fs::read_to_string(&cached_path).await?;
        let cached_id = cached_id.trim();
        if cached_id == new_id {
            return Ok(false);
        }

        fs::write(self.paths.previous_instance_id(), cached_id).await?;
        Ok(true)
    }

    async fn update_instance_link(&self, instance_id: &str) -> Result<(), BootstrapError> {
        let link_path = self.paths.instance_link();
        let target = self.paths.instance_dir(instance_id);

        if fs::symlink_metadata(&link_path).await.is_ok() {
            fs::remove_file(&link_path).await.ok();
        }

        #[cfg(unix)]
        fs::symlink(&target, &link_path).await?;

        #[cfg(not(unix))]
        fs::write(&link_path, target.to_string_lossy().as_bytes()).await?;

        debug!("Instance link {} -> {}", link_path.display(), target.display());
        Ok(())
    }

    fn instance_path(&self, file: impl Fn(&CloudPaths, &str) -> PathBuf) -> Option<PathBuf> {
        self.instance_id.as_deref().map(|id| file(&self.paths, id))
    }

    async fn write_instance_file(
        &self,
        file: impl Fn(&CloudPaths, &str) -> PathBuf,
        data: &[u8],
    ) -> Result<(), BootstrapError> {
        if let Some(path) = self.instance_path(file) {
            fs::write(&path, data).await?;
            debug!("Wrote {}", path.display());
        }
        Ok(())
    }

    /// Raw user-data as received from the datasource
    pub async fn save_userdata(&self, data: &[u8]) -> Result<(), BootstrapError> {
        self.write_instance_file(CloudPaths::user_data, data).await
    }

    pub async fn save_vendordata(&self, data: &[u8]) -> Result<(), BootstrapError> {
        self.write_instance_file(CloudPaths::vendor_data, data).await
    }

    /// Datasource provenance string
    pub async fn save_datasource(&self, provenance: &str) -> Result<(), BootstrapError> {
        self.write_instance_file(CloudPaths::datasource_file, provenance.as_bytes())
            .await
    }

    pub async fn save_metadata(&self, metadata: &Value) -> Result<(), BootstrapError> {
        let json = serde_json::to_vec_pretty(metadata)?;
        self.write_instance_file(CloudPaths::metadata_file, &json).await
    }

    pub async fn save_network_config(&self, config: &Value) -> Result<(), BootstrapError> {
        let json = serde_json::to_vec_pretty(config)?;
        self.write_instance_file(CloudPaths::network_config, &json)
            .await
    }

    /// Read back the cached instance id, if any
    pub async fn load_cached_instance_id(&mut self) -> Result<Option<String>, BootstrapError> {
        let path = self.paths.cached_instance_id();
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let id = fs::read_to_string(&path).await?.trim().to_string();
        if id.is_empty() {
            return Ok(None);
        }
        self.instance_id = Some(id.clone());
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_state() -> (InstanceState, TempDir) {
        let temp = TempDir::new().unwrap();
        let state = InstanceState::with_paths(CloudPaths::with_base(temp.path()));
        (state, temp)
    }

    #[tokio::test]
    async fn test_initialize() {
        let (state, temp) = create_test_state();
        state.initialize().await.unwrap();

        assert!(temp.path().join("data").exists());
        assert!(temp.path().join("scripts/per-instance").exists());
    }

    #[tokio::test]
    async fn test_set_instance_id() {
        let (mut state, temp) = create_test_state();
        state.initialize().await.unwrap();

        assert!(state.set_instance_id("i-12345").await.unwrap());
        assert_eq!(state.instance_id(), Some("i-12345"));
        assert!(temp.path().join("instances/i-12345/handlers").exists());
        assert!(temp.path().join("instances/i-12345/data/urlcache").exists());
        assert!(temp.path().join("instance").is_symlink());

        assert!(!state.set_instance_id("i-12345").await.unwrap());
    }

    #[tokio::test]
    async fn test_instance_change_records_previous() {
        let (mut state, temp) = create_test_state();
        state.initialize().await.unwrap();

        state.set_instance_id("i-old").await.unwrap();
        assert!(state.set_instance_id("i-new").await.unwrap());

        let prev = fs::read_to_string(temp.path().join("data/previous-instance-id"))
            .await
            .unwrap();
        assert_eq!(prev.trim(), "i-old");
    }

    #[tokio::test]
    async fn test_rejects_path_like_id() {
        let (mut state, _temp) = create_test_state();
        assert!(state.set_instance_id("../etc").await.is_err());
        assert!(state.set_instance_id("").await.is_err());
    }

    #[tokio::test]
    async fn test_save_files() {
        let (mut state, temp) = create_test_state();
        state.set_instance_id("i-test").await.unwrap();

        state.save_userdata(b"#cloud-config\nhostname: test").await.unwrap();
        state.save_datasource("guestinfo (guestinfo.metadata)").await.unwrap();
        state.save_metadata(&json!({"instance-id": "i-test"})).await.unwrap();

        let dir = temp.path().join("instances/i-test");
        let userdata = fs::read_to_string(dir.join("user-data.txt")).await.unwrap();
        assert!(userdata.contains("hostname: test"));
        let ds = fs::read_to_string(dir.join("datasource")).await.unwrap();
        assert_eq!(ds, "guestinfo (guestinfo.metadata)");
        assert!(dir.join("metadata.json").exists());
    }

    #[tokio::test]
    async fn test_save_without_instance_is_noop() {
        let (state, temp) = create_test_state();
        state.save_userdata(b"data").await.unwrap();
        assert!(!temp.path().join("instances").exists());
    }

    #[tokio::test]
    async fn test_load_cached_instance_id() {
        let (mut state, temp) = create_test_state();
        state.set_instance_id("i-cached").await.unwrap();

        let mut fresh = InstanceState::with_paths(CloudPaths::with_base(temp.path()));
        assert_eq!(fresh.load_cached_instance_id().await.unwrap().as_deref(), Some("i-cached"));
    }
}
