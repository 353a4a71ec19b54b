//! Bootstrap configuration
//!
//! System configuration for the datasource and the user-data pipeline. Read
//! from `/etc/cloud/bootstrap.cfg` plus `/etc/cloud/bootstrap.cfg.d/*.cfg`:
//!
//! ```yaml
//! datasource:
//!   transports: [envvar, guestinfo, imc]
//!   redact_precedence: redact
//!   guestinfo:
//!     rpctool: vmware-rpctool
//!   imc:
//!     max_wait_secs: 15
//! userdata:
//!   max_include_depth: 10
//! ```

pub mod loader;
pub mod merge;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::BootstrapError;
use crate::datasources::metadata::RedactPrecedence;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    pub datasource: DatasourceConfig,
    pub userdata: UserDataConfig,
}

impl BootstrapConfig {
    /// Parse from YAML; an empty document gives the defaults
    pub fn from_yaml(yaml: &str) -> Result<Self, BootstrapError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| BootstrapError::Config(e.to_string()))
    }
}

/// Transports that can be listed in `datasource.transports`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Envvar,
    Guestinfo,
    Imc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasourceConfig {
    /// Vendor string expected in the DMI product name
    pub platform_vendor: String,
    pub product_name_path: PathBuf,
    pub product_uuid_path: PathBuf,
    /// Probe order
    pub transports: Vec<TransportKind>,
    pub redact_precedence: RedactPrecedence,
    /// Delay between network readiness checks
    pub wait_interval_ms: u64,
    pub guestinfo: GuestInfoConfig,
    pub envvar: EnvVarConfig,
    pub imc: ImcConfig,
}

impl Default for DatasourceConfig {
    fn default() -> Self {
        Self {
            platform_vendor: "vmware".to_string(),
            product_name_path: PathBuf::from("/sys/class/dmi/id/product_name"),
            product_uuid_path: PathBuf::from("/sys/class/dmi/id/product_uuid"),
            transports: vec![
                TransportKind::Envvar,
                TransportKind::Guestinfo,
                TransportKind::Imc,
            ],
            redact_precedence: RedactPrecedence::default(),
            wait_interval_ms: 1000,
            guestinfo: GuestInfoConfig::default(),
            envvar: EnvVarConfig::default(),
            imc: ImcConfig::default(),
        }
    }
}

impl DatasourceConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

/// RPC tools used by the guestinfo transport; empty disables a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestInfoConfig {
    pub rpctool: String,
    pub vmtoolsd: String,
    pub command_timeout_secs: u64,
}

impl Default for GuestInfoConfig {
    fn default() -> Self {
        Self {
            rpctool: "vmware-rpctool".to_string(),
            vmtoolsd: "vmtoolsd".to_string(),
            command_timeout_secs: 10,
        }
    }
}

/// Variable naming for the environment transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvVarConfig {
    pub prefix: String,
    pub namespace: String,
}

impl Default for EnvVarConfig {
    fn default() -> Self {
        Self {
            prefix: "VMX".to_string(),
            namespace: "GUESTINFO".to_string(),
        }
    }
}

/// Customization spool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImcConfig {
    pub dir: PathBuf,
    pub file_name: String,
    pub max_wait_secs: u64,
    pub poll_interval_secs: u64,
    pub allow_classic: bool,
    pub allow_raw_data: bool,
}

impl Default for ImcConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/run/vmware-imc"),
            file_name: "cust.cfg".to_string(),
            max_wait_secs: 15,
            poll_interval_secs: 5,
            allow_classic: true,
            allow_raw_data: true,
        }
    }
}

/// User-data pipeline settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserDataConfig {
    pub include_timeout_secs: u64,
    pub include_retries: u32,
    pub include_retry_delay_ms: u64,
    pub max_include_depth: usize,
    /// gpg executable for armored parts
    pub gpg: String,
    pub external_handler_timeout_secs: u64,
}

impl Default for UserDataConfig {
    fn default() -> Self {
        Self {
            include_timeout_secs: 5,
            include_retries: 10,
            include_retry_delay_ms: 1000,
            max_include_depth: 10,
            gpg: "gpg".to_string(),
            external_handler_timeout_secs: 60,
        }
    }
}
