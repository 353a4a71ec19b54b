//! On-disk layout
//!
//! ```text
//! /var/lib/cloud/
//!   data/instance-id, data/previous-instance-id
//!   instance -> instances/<id>
//!   instances/<id>/{user-data.txt, vendor-data.txt, cloud-config.txt, ...}
//!   scripts/per-{boot,instance,once}
//! /etc/cloud/bootstrap.cfg, /etc/cloud/bootstrap.cfg.d/
//! ```

use std::path::{Path, PathBuf};

/// Base directory for instance state
pub const CLOUD_DIR: &str = "/var/lib/cloud";

/// System configuration directory
pub const CONFIG_DIR: &str = "/etc/cloud";

/// Filesystem layout rooted at a base and a config directory
#[derive(Debug, Clone)]
pub struct CloudPaths {
    pub base: PathBuf,
    pub config: PathBuf,
}

impl Default for CloudPaths {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudPaths {
    pub fn new() -> Self {
        Self {
            base: PathBuf::from(CLOUD_DIR),
            config: PathBuf::from(CONFIG_DIR),
        }
    }

    /// Custom state directory, standard config directory
    pub fn with_base(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            config: PathBuf::from(CONFIG_DIR),
        }
    }

    pub fn with_dirs(base: impl AsRef<Path>, config: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
            config: config.as_ref().to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.base.join("instances")
    }

    /// Symlink to the current instance directory
    pub fn instance_link(&self) -> PathBuf {
        self.base.join("instance")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.base.join("scripts")
    }

    pub fn scripts_per_boot(&self) -> PathBuf {
        self.scripts_dir().join("per-boot")
    }

    pub fn scripts_per_instance(&self) -> PathBuf {
        self.scripts_dir().join("per-instance")
    }

    pub fn scripts_per_once(&self) -> PathBuf {
        self.scripts_dir().join("per-once")
    }

    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.instances_dir().join(instance_id)
    }

    /// Raw user-data as received
    pub fn user_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("user-data.txt")
    }

    pub fn vendor_data(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("vendor-data.txt")
    }

    /// Merged cloud-config from user-data
    pub fn cloud_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("cloud-config.txt")
    }

    /// Merged cloud-config from vendor-data
    pub fn vendor_cloud_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("vendor-cloud-config.txt")
    }

    /// Provenance of the instance data
    pub fn datasource_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("datasource")
    }

    pub fn metadata_file(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("metadata.json")
    }

    pub fn network_config(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("network-config.json")
    }

    /// Persisted external part handlers
    pub fn handlers_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("handlers")
    }

    pub fn boothooks_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("boothooks")
    }

    /// User-data shell scripts
    pub fn instance_scripts_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("scripts")
    }

    /// Vendor-data shell scripts
    pub fn vendor_scripts_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("vendor-scripts")
    }

    /// Cache for `#include-once` downloads
    pub fn urlcache_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("data").join("urlcache")
    }

    pub fn main_config(&self) -> PathBuf {
        self.config.join("bootstrap.cfg")
    }

    pub fn config_d(&self) -> PathBuf {
        self.config.join("bootstrap.cfg.d")
    }

    pub fn cached_instance_id(&self) -> PathBuf {
        self.data_dir().join("instance-id")
    }

    pub fn previous_instance_id(&self) -> PathBuf {
        self.data_dir().join("previous-instance-id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let paths = CloudPaths::new();
        assert_eq!(paths.base, PathBuf::from("/var/lib/cloud"));
        assert_eq!(paths.main_config(), PathBuf::from("/etc/cloud/bootstrap.cfg"));
        assert_eq!(paths.config_d(), PathBuf::from("/etc/cloud/bootstrap.cfg.d"));
    }

    #[test]
    fn test_instance_paths() {
        let paths = CloudPaths::with_base("/tmp/cloud");
        let id = "4213e8b5-05a8-4fa1-8a54-4e6e7f2c0e4b";

        assert_eq!(
            paths.user_data(id),
            PathBuf::from("/tmp/cloud/instances/4213e8b5-05a8-4fa1-8a54-4e6e7f2c0e4b/user-data.txt")
        );
        assert_eq!(
            paths.urlcache_dir("i-1"),
            PathBuf::from("/tmp/cloud/instances/i-1/data/urlcache")
        );
        assert_eq!(
            paths.handlers_dir("i-1"),
            PathBuf::from("/tmp/cloud/instances/i-1/handlers")
        );
    }

    #[test]
    fn test_scripts_paths() {
        let paths = CloudPaths::new();
        assert_eq!(paths.scripts_per_boot(), PathBuf::from("/var/lib/cloud/scripts/per-boot"));
        assert_eq!(paths.scripts_per_once(), PathBuf::from("/var/lib/cloud/scripts/per-once"));
    }
}
