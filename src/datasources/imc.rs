//! Guest customization spool transport
//!
//! The hypervisor drops a customization file into a spool directory
//! (`/var/run/vmware-imc/cust.cfg` by default) some time after boot. Two
//! flavors exist:
//!
//! - raw cloud-init data: `[CLOUDINIT] METADATA = <file>` (and optionally
//!   `USERDATA = <file>`) naming files beside the spool file
//! - classic customization: hostname, NICs and DNS settings, which are
//!   turned into metadata with a version 1 network config

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config_file::ConfigFile;
use super::{Transport, TransportData};
use crate::BootstrapError;
use crate::config::ImcConfig;

const TRANSPORT_NAME: &str = "imc";

/// Spool transport
#[derive(Debug, Clone)]
pub struct Imc {
    dir: PathBuf,
    file_name: String,
    max_wait: Duration,
    poll_interval: Duration,
    allow_classic: bool,
    allow_raw_data: bool,
}

impl Imc {
    pub fn from_config(config: &ImcConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            file_name: config.file_name.clone(),
            max_wait: Duration::from_secs(config.max_wait_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            allow_classic: config.allow_classic,
            allow_raw_data: config.allow_raw_data,
        }
    }

    /// Override both waiting parameters
    pub fn with_wait(mut self, max_wait: Duration, poll_interval: Duration) -> Self {
        self.max_wait = max_wait;
        self.poll_interval = poll_interval;
        self
    }

    pub fn spool_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Poll for the spool file; `Ok(false)` once `max_wait` has passed
    async fn wait_for_spool(&self, cancel: &CancellationToken) -> Result<bool, BootstrapError> {
        let path = self.spool_path();
        let deadline = Instant::now() + self.max_wait;

        loop {
            if fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("No customization file at {}", path.display());
                return Ok(false);
            }

            let pause = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BootstrapError::transport(TRANSPORT_NAME, "cancelled while waiting for spool"));
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn read_raw(&self, cfg: &ConfigFile) -> Result<TransportData, BootstrapError> {
        let Some(metadata_file) = cfg.get_non_empty("CLOUDINIT|METADATA") else {
            return Err(BootstrapError::transport(TRANSPORT_NAME, "empty CLOUDINIT|METADATA"));
        };

        let metadata = read_beside(&self.dir, metadata_file).await.map_err(|e| {
            BootstrapError::transport(
                TRANSPORT_NAME,
                format!("metadata file {metadata_file}: {e}"),
            )
        })?;

        let userdata = match cfg.get_non_empty("CLOUDINIT|USERDATA") {
            Some(file) => match read_beside(&self.dir, file).await {
                Ok(content) => Some(content.into_bytes()),
                Err(e) => {
                    warn!("Cannot read customization userdata {}: {}", file, e);
                    None
                }
            },
            None => None,
        };

        Ok(TransportData {
            metadata: Some(metadata),
            userdata,
            vendordata: None,
        })
    }
}

async fn read_beside(dir: &Path, name: &str) -> std::io::Result<String> {
    fs::read_to_string(dir.join(name)).await
}

/// Metadata for a classic customization spec
pub fn classic_metadata(cfg: &ConfigFile) -> Value {
    let mut md = Map::new();

    if let Some(host) = cfg.get_non_empty("NETWORK|HOSTNAME") {
        let fqdn = match cfg.get_non_empty("NETWORK|DOMAINNAME") {
            Some(domain) => format!("{host}.{domain}"),
            None => host.to_string(),
        };
        md.insert("local-hostname".into(), Value::String(fqdn));
    }

    if let Some(marker) = cfg
        .get_non_empty("MISC|MARKER-ID")
        .or_else(|| cfg.get_non_empty("MISC|MARKERID"))
    {
        md.insert("instance-id".into(), Value::String(marker.to_string()));
    }

    let network = classic_network(cfg);
    if !network.is_empty() {
        md.insert("network".into(), json!({ "version": 1, "config": network }));
    }

    Value::Object(md)
}

fn classic_network(cfg: &ConfigFile) -> Vec<Value> {
    let mut entries = Vec::new();

    for nic in cfg.get_list("NIC-CONFIG|NICS") {
        let Some(mac) = cfg.get_non_empty(&format!("{nic}|MACADDR")) else {
            warn!("Skipping {}: no MACADDR", nic);
            continue;
        };

        let proto = cfg
            .get(&format!("{nic}|BOOTPROTO"))
            .unwrap_or("dhcp")
            .to_lowercase();

        let subnet = if proto == "static" {
            let mut subnet = Map::new();
            subnet.insert("type".into(), json!("static"));
            if let Some(addr) = cfg.get_non_empty(&format!("{nic}|IPADDR")) {
                subnet.insert("address".into(), json!(addr));
            }
            if let Some(mask) = cfg.get_non_empty(&format!("{nic}|NETMASK")) {
                subnet.insert("netmask".into(), json!(mask));
            }
            if let Some(gw) = cfg.get_list(&format!("{nic}|GATEWAY")).first() {
                subnet.insert("gateway".into(), json!(gw));
            }
            Value::Object(subnet)
        } else {
            json!({ "type": "dhcp" })
        };

        entries.push(json!({
            "type": "physical",
            "name": nic,
            "mac_address": mac.to_lowercase(),
            "subnets": [subnet],
        }));
    }

    let nameservers = cfg.get_indexed("DNS|NAMESERVER");
    let search = cfg.get_indexed("DNS|SUFFIX");
    if !nameservers.is_empty() || !search.is_empty() {
        entries.push(json!({
            "type": "nameserver",
            "address": nameservers,
            "search": search,
        }));
    }

    entries
}

#[async_trait]
impl Transport for Imc {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn requires_platform(&self) -> bool {
        true
    }

    fn key_name(&self, key: &str) -> String {
        format!("vmware-imc.{key}")
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<TransportData, BootstrapError> {
        if !self.allow_classic && !self.allow_raw_data {
            debug!("Guest customization disabled");
            return Ok(TransportData::default());
        }

        if !self.wait_for_spool(cancel).await? {
            return Ok(TransportData::default());
        }

        let path = self.spool_path();
        let cfg = ConfigFile::load(&path).await.map_err(|e| {
            BootstrapError::transport(TRANSPORT_NAME, format!("{}: {e}", path.display()))
        })?;

        if cfg.get("CLOUDINIT|METADATA").is_some() {
            if !self.allow_raw_data {
                info!("Raw cloud-init customization data is disabled");
                return Ok(TransportData::default());
            }
            info!("Using raw cloud-init customization data from {}", path.display());
            return self.read_raw(&cfg).await;
        }

        if !self.allow_classic {
            info!("Classic guest customization is disabled");
            return Ok(TransportData::default());
        }

        info!("Using classic guest customization from {}", path.display());
        let metadata = serde_json::to_string(&classic_metadata(&cfg))?;
        Ok(TransportData {
            metadata: Some(metadata),
            userdata: None,
            vendordata: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CLASSIC: &str = r#"
[NETWORK]
NETWORKING = yes
HOSTNAME = web01
DOMAINNAME = example.com

[NIC-CONFIG]
NICS = NIC1, NIC2

[NIC1]
MACADDR = 00:50:56:A6:8C:08
BOOTPROTO = static
IPADDR = 10.20.87.154
NETMASK = 255.255.252.0
GATEWAY = 10.20.87.253, 10.20.87.105

[NIC2]
MACADDR = 00:50:56:a6:ef:7d
BOOTPROTO = dhcp

[DNS]
NAMESERVER|1 = 10.20.145.1
NAMESERVER|2 = 10.20.145.2
SUFFIX|1 = example.com

[MISC]
MARKER-ID = 12345345
"#;

    fn imc(dir: &TempDir) -> Imc {
        let config = ImcConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        Imc::from_config(&config).with_wait(Duration::ZERO, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_missing_spool_is_empty() {
        let dir = TempDir::new().unwrap();
        let data = imc(&dir).fetch(&CancellationToken::new()).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_waits_for_spool() {
        let dir = TempDir::new().unwrap();
        let transport = imc(&dir).with_wait(Duration::from_secs(5), Duration::from_millis(10));
        let spool = transport.spool_path();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fs::write(spool, CLASSIC).await.unwrap();
        });

        let data = transport.fetch(&CancellationToken::new()).await.unwrap();
        assert!(data.metadata.is_some());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let dir = TempDir::new().unwrap();
        let transport = imc(&dir).with_wait(Duration::from_secs(60), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(transport.fetch(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_classic_customization() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cust.cfg"), CLASSIC).await.unwrap();

        let data = imc(&dir).fetch(&CancellationToken::new()).await.unwrap();
        let md: Value = serde_json::from_str(data.metadata.as_deref().unwrap()).unwrap();

        assert_eq!(md["local-hostname"], "web01.example.com");
        assert_eq!(md["instance-id"], "12345345");
        let config = md["network"]["config"].as_array().unwrap();
        assert_eq!(config.len(), 3);
        assert_eq!(config[0]["mac_address"], "00:50:56:a6:8c:08");
        assert_eq!(config[0]["subnets"][0]["gateway"], "10.20.87.253");
        assert_eq!(config[1]["subnets"][0]["type"], "dhcp");
        assert_eq!(config[2]["address"], json!(["10.20.145.1", "10.20.145.2"]));
    }

    #[tokio::test]
    async fn test_raw_cloudinit_data() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("cust.cfg"),
            "[CLOUDINIT]\nMETADATA = test-meta\nUSERDATA = test-user\n",
        )
        .await
        .unwrap();
        fs::write(dir.path().join("test-meta"), "instance-id: raw-1\n").await.unwrap();
        fs::write(dir.path().join("test-user"), "#cloud-config\n").await.unwrap();

        let data = imc(&dir).fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(data.metadata.as_deref(), Some("instance-id: raw-1\n"));
        assert_eq!(data.userdata.as_deref(), Some(&b"#cloud-config\n"[..]));
    }

    #[tokio::test]
    async fn test_raw_missing_metadata_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cust.cfg"), "[CLOUDINIT]\nMETADATA = gone\n")
            .await
            .unwrap();
        assert!(imc(&dir).fetch(&CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_raw_data_disabled() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cust.cfg"), "[CLOUDINIT]\nMETADATA = m\n")
            .await
            .unwrap();
        let config = ImcConfig {
            dir: dir.path().to_path_buf(),
            max_wait_secs: 0,
            allow_raw_data: false,
            ..Default::default()
        };
        let data = Imc::from_config(&config)
            .fetch(&CancellationToken::new())
            .await
            .unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_spool_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cust.cfg"), "garbage without section\n")
            .await
            .unwrap();
        let err = imc(&dir).fetch(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BootstrapError::TransportUnavailable { .. }));
    }
}
