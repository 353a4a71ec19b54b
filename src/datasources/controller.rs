//! Datasource controller
//!
//! Owns the transports for one boot, runs the probe, normalizes the winning
//! metadata exactly once and brings the instance network up.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::envvar::EnvVar;
use super::guestinfo::GuestInfo;
use super::hostinfo::{HostInfo, HostInfoSource, SystemHostInfo};
use super::imc::Imc;
use super::metadata::{Metadata, RedactPrecedence};
use super::network_wait::{WaitOnNetwork, wait_on_network};
use super::{AccessMethod, DmiPlatform, ProbeResult, Transport, probe};
use crate::BootstrapError;
use crate::config::{DatasourceConfig, TransportKind};

/// Acquires and normalizes instance data
pub struct DatasourceController {
    transports: Vec<Box<dyn Transport>>,
    platform: DmiPlatform,
    product_uuid_path: PathBuf,
    redact_precedence: RedactPrecedence,
    host_source: Arc<dyn HostInfoSource>,
    wait_interval: Duration,
    result: Option<ProbeResult>,
    normalized: bool,
    instance_id: Option<String>,
}

impl DatasourceController {
    /// Controller over explicit transports, with system defaults elsewhere
    pub fn new(transports: Vec<Box<dyn Transport>>) -> Self {
        let defaults = DatasourceConfig::default();
        Self {
            transports,
            platform: DmiPlatform::new(defaults.platform_vendor, defaults.product_name_path),
            product_uuid_path: defaults.product_uuid_path,
            redact_precedence: defaults.redact_precedence,
            host_source: Arc::new(SystemHostInfo::new()),
            wait_interval: Duration::from_millis(defaults.wait_interval_ms),
            result: None,
            normalized: false,
            instance_id: None,
        }
    }

    /// Transports built from configuration, in configured order
    pub fn from_config(config: &DatasourceConfig) -> Self {
        let transports = config
            .transports
            .iter()
            .map(|kind| -> Box<dyn Transport> {
                match kind {
                    TransportKind::Envvar => Box::new(EnvVar::from_env(&config.envvar)),
                    TransportKind::Guestinfo => Box::new(GuestInfo::from_config(&config.guestinfo)),
                    TransportKind::Imc => Box::new(Imc::from_config(&config.imc)),
                }
            })
            .collect();

        Self::new(transports)
            .with_platform(DmiPlatform::new(
                config.platform_vendor.clone(),
                config.product_name_path.clone(),
            ))
            .with_product_uuid_path(config.product_uuid_path.clone())
            .with_redact_precedence(config.redact_precedence)
            .with_wait_interval(config.wait_interval())
    }

    pub fn with_platform(mut self, platform: DmiPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_product_uuid_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.product_uuid_path = path.into();
        self
    }

    pub fn with_redact_precedence(mut self, precedence: RedactPrecedence) -> Self {
        self.redact_precedence = precedence;
        self
    }

    pub fn with_host_source(mut self, source: Arc<dyn HostInfoSource>) -> Self {
        self.host_source = source;
        self
    }

    pub fn with_wait_interval(mut self, interval: Duration) -> Self {
        self.wait_interval = interval;
        self
    }

    /// Find instance data and normalize it
    ///
    /// Calling this again after a successful probe does nothing.
    pub async fn probe(
        &mut self,
        hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<&AccessMethod, BootstrapError> {
        if self.result.is_none() {
            let result = probe(&self.transports, &self.platform, hint, cancel).await?;
            self.result = Some(result);
        }

        self.normalize().await?;

        self.access_method().ok_or(BootstrapError::NoDatasource)
    }

    async fn normalize(&mut self) -> Result<(), BootstrapError> {
        if self.normalized {
            return Ok(());
        }

        let Some(result) = self.result.as_mut() else {
            return Err(BootstrapError::NoDatasource);
        };
        let instance_id = match result.metadata.instance_id() {
            Some(id) => id,
            None => read_product_uuid(&self.product_uuid_path).await?,
        };
        debug!("Instance id: {}", instance_id);

        let metadata = &mut result.metadata;
        metadata.extract_network();
        metadata.normalize_public_keys();
        metadata.insert("instance-id", Value::String(instance_id.clone()));
        self.instance_id = Some(instance_id);

        let keys = metadata.redact_keys(self.redact_precedence);
        let index = result.access_method.index;
        self.normalized = true;

        if !keys.is_empty() {
            match self.transports.get(index) {
                Some(transport) => transport.redact(&keys).await,
                None => warn!("No transport at index {} to redact with", index),
            }
        }

        Ok(())
    }

    /// Wait for the requested network and merge host details into metadata
    pub async fn setup(&mut self, cancel: &CancellationToken) -> Result<HostInfo, BootstrapError> {
        let Some(result) = self.result.as_mut() else {
            return Err(BootstrapError::NoDatasource);
        };

        let wait = WaitOnNetwork::from_metadata(result.metadata.as_map());
        let host = wait_on_network(self.host_source.as_ref(), wait, self.wait_interval, cancel).await?;

        if let Some(transport) = self.transports.get(result.access_method.index) {
            transport.advertise_addresses(&host).await;
        }

        result.metadata.merge_missing(&host.to_value());
        info!(
            "Host network: ipv4 {:?}, ipv6 {:?}",
            host.default_ipv4, host.default_ipv6
        );

        Ok(host)
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.result.as_ref().map(|r| &r.metadata)
    }

    pub fn userdata_raw(&self) -> Option<&[u8]> {
        self.result.as_ref()?.userdata.as_deref()
    }

    pub fn vendordata_raw(&self) -> Option<&[u8]> {
        self.result.as_ref()?.vendordata.as_deref()
    }

    pub fn network_config(&self) -> Option<&Value> {
        self.metadata()?.network_config()
    }

    pub fn access_method(&self) -> Option<&AccessMethod> {
        self.result.as_ref().map(|r| &r.access_method)
    }

    /// `"<transport> (<key>)"`, or `"unknown"` before a successful probe
    pub fn provenance(&self) -> String {
        self.access_method()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }
}

async fn read_product_uuid(path: &Path) -> Result<String, BootstrapError> {
    let uuid = fs::read_to_string(path).await.map_err(|e| {
        BootstrapError::InvalidData(format!(
            "no instance-id in metadata and {} unreadable: {e}",
            path.display()
        ))
    })?;

    let uuid = uuid.trim().to_lowercase();
    if uuid.is_empty() {
        return Err(BootstrapError::InvalidData(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::hostinfo::NetInterface;
    use crate::datasources::mock::{MockHostInfo, MockTransport};
    use tempfile::TempDir;

    fn host() -> HostInfo {
        let iface = NetInterface::new("eth0")
            .with_mac("00:50:56:aa:bb:cc")
            .with_addr("10.0.0.5".parse().unwrap(), 24);
        HostInfo::from_interfaces(Some("from-host".into()), vec![iface], Some("eth0"), None)
    }

    fn controller(transports: Vec<Box<dyn Transport>>, dir: &TempDir) -> DatasourceController {
        let uuid = dir.path().join("product_uuid");
        std::fs::write(&uuid, "4213E8B5-05A8-4FA1-8A54-4E6E7F2C0E4B\n").unwrap();
        DatasourceController::new(transports)
            .with_platform(DmiPlatform::new("vmware", dir.path().join("missing")))
            .with_product_uuid_path(uuid)
            .with_host_source(Arc::new(MockHostInfo::new(vec![host()])))
            .with_wait_interval(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_probe_normalizes_once() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new("guestinfo").with_metadata(
            "local-hostname: vm1\nnetwork: eyJ2ZXJzaW9uIjoxfQ==\nnetwork.encoding: base64\nredact: [userdata]\n",
        );
        let redactions = transport.redactions();
        let mut ctl = controller(vec![Box::new(transport)], &dir);
        let cancel = CancellationToken::new();

        ctl.probe(None, &cancel).await.unwrap();
        ctl.probe(None, &cancel).await.unwrap();

        assert_eq!(ctl.network_config(), Some(&serde_json::json!({"version": 1})));
        assert_eq!(ctl.instance_id(), Some("4213e8b5-05a8-4fa1-8a54-4e6e7f2c0e4b"));
        assert_eq!(*redactions.lock().unwrap(), vec![vec!["userdata".to_string()]]);
        assert_eq!(ctl.provenance(), "guestinfo (guestinfo.metadata)");
    }

    #[tokio::test]
    async fn test_explicit_instance_id_wins() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new("envvar").with_metadata("instance-id: i-explicit\n");
        let mut ctl = controller(vec![Box::new(transport)], &dir);

        ctl.probe(None, &CancellationToken::new()).await.unwrap();
        assert_eq!(ctl.instance_id(), Some("i-explicit"));
    }

    #[tokio::test]
    async fn test_unreadable_uuid_fails_probe() {
        let transport = MockTransport::new("envvar").with_userdata(b"#!/bin/sh\n");
        let mut ctl = DatasourceController::new(vec![Box::new(transport)])
            .with_product_uuid_path("/nonexistent/product_uuid");

        let err = ctl.probe(None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_no_datasource() {
        let dir = TempDir::new().unwrap();
        let mut ctl = controller(vec![Box::new(MockTransport::new("empty"))], &dir);

        let err = ctl.probe(None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BootstrapError::NoDatasource));
        assert_eq!(ctl.provenance(), "unknown");
        assert!(ctl.metadata().is_none());
    }

    #[tokio::test]
    async fn test_setup_merges_host_info() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new("guestinfo")
            .with_metadata("local-hostname: from-meta\nwait-on-network:\n  ipv4: true\n");
        let advertised = transport.advertised();
        let mut ctl = controller(vec![Box::new(transport)], &dir);
        let cancel = CancellationToken::new();

        ctl.probe(None, &cancel).await.unwrap();
        let host = ctl.setup(&cancel).await.unwrap();

        assert!(host.has_ipv4());
        let md = ctl.metadata().unwrap();
        assert_eq!(md.get_str("local-hostname"), Some("from-meta"));
        assert_eq!(md.get_str("local-ipv4"), Some("10.0.0.5"));
        assert!(md.get("network").unwrap()["interfaces"]["by-mac"]["00:50:56:aa:bb:cc"].is_object());
        assert_eq!(advertised.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_setup_before_probe() {
        let mut ctl = DatasourceController::new(Vec::new());
        assert!(ctl.setup(&CancellationToken::new()).await.is_err());
    }
}
