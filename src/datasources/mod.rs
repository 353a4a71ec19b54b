//! Datasource acquisition
//!
//! Instance data is read through an ordered list of [`Transport`]s. The
//! first one that yields anything wins; later transports are never touched.
//! The [`controller`] normalizes the winning result and brings the instance
//! network up.

pub mod config_file;
pub mod controller;
pub mod decode;
pub mod envvar;
pub mod guestinfo;
pub mod hostinfo;
pub mod imc;
pub mod metadata;
pub mod mock;
pub mod network_wait;

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BootstrapError;
use hostinfo::HostInfo;
use metadata::Metadata;

/// Raw data read from one transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportData {
    pub metadata: Option<String>,
    pub userdata: Option<Vec<u8>>,
    pub vendordata: Option<Vec<u8>>,
}

impl TransportData {
    /// Nothing was found
    pub fn is_empty(&self) -> bool {
        self.metadata.as_deref().is_none_or(|m| m.trim().is_empty())
            && self.userdata.as_ref().is_none_or(|u| u.is_empty())
            && self.vendordata.as_ref().is_none_or(|v| v.is_empty())
    }
}

/// A channel instance data can be read from
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and provenance (e.g. "guestinfo")
    fn name(&self) -> &str;

    /// Whether the transport only makes sense on the confirmed platform
    fn requires_platform(&self) -> bool;

    /// How `key` is addressed on this transport, e.g. `guestinfo.metadata`
    fn key_name(&self, key: &str) -> String;

    /// Read metadata, userdata and vendordata
    async fn fetch(&self, cancel: &CancellationToken) -> Result<TransportData, BootstrapError>;

    /// Remove sensitive keys from the host side; failures are logged only
    async fn redact(&self, keys: &[String]) {
        if !keys.is_empty() {
            debug!("Transport {} does not support redaction", self.name());
        }
    }

    /// Publish the local addresses back to the host
    async fn advertise_addresses(&self, _host: &HostInfo) {}
}

/// Platform detection from DMI
#[derive(Debug, Clone)]
pub struct DmiPlatform {
    vendor: String,
    product_name_path: PathBuf,
}

impl DmiPlatform {
    pub fn new(vendor: impl Into<String>, product_name_path: impl Into<PathBuf>) -> Self {
        Self {
            vendor: vendor.into().to_lowercase(),
            product_name_path: product_name_path.into(),
        }
    }

    /// Whether we are running on the expected platform
    ///
    /// A hint (usually from the kernel command line or the CLI) replaces the
    /// DMI check.
    pub async fn confirm(&self, hint: Option<&str>) -> bool {
        if let Some(hint) = hint {
            let confirmed = hint.trim().eq_ignore_ascii_case(&self.vendor);
            debug!("Platform hint '{}' confirmed: {}", hint, confirmed);
            return confirmed;
        }

        match fs::read_to_string(&self.product_name_path).await {
            Ok(product) => {
                let confirmed = product.to_lowercase().contains(&self.vendor);
                debug!("DMI product '{}' confirmed: {}", product.trim(), confirmed);
                confirmed
            }
            Err(e) => {
                debug!(
                    "Cannot read {}: {}",
                    self.product_name_path.display(),
                    e
                );
                false
            }
        }
    }
}

/// Which transport produced the data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMethod {
    /// Position in the configured transport list
    pub index: usize,
    pub name: String,
    /// Key name the metadata was read from
    pub key_template: String,
}

impl std::fmt::Display for AccessMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.key_template)
    }
}

/// Outcome of a successful probe
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub metadata: Metadata,
    pub userdata: Option<Vec<u8>>,
    pub vendordata: Option<Vec<u8>>,
    pub access_method: AccessMethod,
}

/// Try each transport in order and return the first usable result
pub async fn probe(
    transports: &[Box<dyn Transport>],
    platform: &DmiPlatform,
    hint: Option<&str>,
    cancel: &CancellationToken,
) -> Result<ProbeResult, BootstrapError> {
    let mut platform_confirmed: Option<bool> = None;

    for (index, transport) in transports.iter().enumerate() {
        let name = transport.name();

        if transport.requires_platform() {
            let confirmed = match platform_confirmed {
                Some(confirmed) => confirmed,
                None => {
                    let confirmed = platform.confirm(hint).await;
                    platform_confirmed = Some(confirmed);
                    confirmed
                }
            };
            if !confirmed {
                debug!("Skipping {}: platform not confirmed", name);
                continue;
            }
        }

        if cancel.is_cancelled() {
            debug!("Skipping {}: cancelled", name);
            continue;
        }

        debug!("Probing transport {}", name);
        let fetched = tokio::select! {
            _ = cancel.cancelled() => Err(BootstrapError::transport(name, "cancelled")),
            result = transport.fetch(cancel) => result,
        };

        let data = match fetched {
            Ok(data) if data.is_empty() => {
                debug!("Transport {} returned no data", name);
                continue;
            }
            Ok(data) => data,
            Err(e) => {
                warn!("Transport {} failed: {}", name, e);
                continue;
            }
        };

        let metadata = match Metadata::parse(data.metadata.as_deref().unwrap_or_default()) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Transport {} returned unparsable metadata: {}", name, e);
                continue;
            }
        };

        let access_method = AccessMethod {
            index,
            name: name.to_string(),
            key_template: transport.key_name("metadata"),
        };
        info!("Found instance data via {}", access_method);

        return Ok(ProbeResult {
            metadata,
            userdata: data.userdata,
            vendordata: data.vendordata,
            access_method,
        });
    }

    Err(BootstrapError::NoDatasource)
}
