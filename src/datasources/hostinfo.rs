//! Local host network snapshot
//!
//! A [`HostInfo`] captures interfaces (by MAC, IPv4 and IPv6), the hostname
//! and the default IPv4/IPv6 addresses. Snapshots are taken fresh on every
//! readiness poll and merged into the instance metadata once.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

use crate::BootstrapError;
use crate::command::{CommandRunner, SystemRunner};

/// Kernel hostname location
const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// One address assigned to an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl InterfaceAddress {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    /// Loopback and link-local addresses do not count as connectivity
    pub fn is_usable(&self) -> bool {
        match self.addr {
            IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(v6) => {
                !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
            }
        }
    }

    fn to_value(self, mac: Option<&str>) -> Value {
        let mut entry = Map::new();
        entry.insert("addr".into(), Value::String(self.addr.to_string()));
        entry.insert("prefix".into(), json!(self.prefix_len));
        if let IpAddr::V4(_) = self.addr {
            entry.insert("netmask".into(), Value::String(v4_netmask(self.prefix_len).to_string()));
        }
        if let Some(mac) = mac {
            entry.insert("mac".into(), Value::String(mac.to_string()));
        }
        Value::Object(entry)
    }
}

fn v4_netmask(prefix_len: u8) -> Ipv4Addr {
    let bits = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(bits)
}

/// A network interface and its addresses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub mac: Option<String>,
    pub ipv4: Vec<InterfaceAddress>,
    pub ipv6: Vec<InterfaceAddress>,
}

impl NetInterface {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into().to_lowercase());
        self
    }

    /// Add an address, sorted into the right family
    pub fn with_addr(mut self, addr: IpAddr, prefix_len: u8) -> Self {
        self.push_addr(InterfaceAddress::new(addr, prefix_len));
        self
    }

    fn push_addr(&mut self, addr: InterfaceAddress) {
        match addr.addr {
            IpAddr::V4(_) => self.ipv4.push(addr),
            IpAddr::V6(_) => self.ipv6.push(addr),
        }
    }
}

/// Snapshot of the host's network state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: Option<String>,
    pub interfaces: Vec<NetInterface>,
    pub default_ipv4: Option<Ipv4Addr>,
    pub default_ipv6: Option<Ipv6Addr>,
}

impl HostInfo {
    /// Build a snapshot, keeping only usable addresses and resolving defaults
    ///
    /// The default address of a family is the single usable address of that
    /// family on the default-route interface. When there is no IPv6 default
    /// route, the IPv4 default-route interface is used for IPv6 as well. If
    /// the interface has zero or several addresses of the family the default
    /// stays undetermined.
    pub fn from_interfaces(
        hostname: Option<String>,
        interfaces: Vec<NetInterface>,
        default_v4_iface: Option<&str>,
        default_v6_iface: Option<&str>,
    ) -> Self {
        let interfaces: Vec<NetInterface> = interfaces
            .into_iter()
            .map(|mut iface| {
                iface.ipv4.retain(InterfaceAddress::is_usable);
                iface.ipv6.retain(InterfaceAddress::is_usable);
                iface
            })
            .collect();

        let find = |name: Option<&str>| {
            name.and_then(|n| interfaces.iter().find(|iface| iface.name == n))
        };

        let default_ipv4 = find(default_v4_iface).and_then(|iface| match iface.ipv4.as_slice() {
            [only] => match only.addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            },
            [] => None,
            _ => {
                debug!("Default IPv4 address is ambiguous on {}", iface.name);
                None
            }
        });

        let default_ipv6 = find(default_v6_iface.or(default_v4_iface)).and_then(|iface| {
            match iface.ipv6.as_slice() {
                [only] => match only.addr {
                    IpAddr::V6(v6) => Some(v6),
                    IpAddr::V4(_) => None,
                },
                [] => None,
                _ => {
                    debug!("Default IPv6 address is ambiguous on {}", iface.name);
                    None
                }
            }
        });

        Self {
            hostname: hostname.filter(|h| !h.is_empty()),
            interfaces,
            default_ipv4,
            default_ipv6,
        }
    }

    /// At least one interface has a usable IPv4 address
    pub fn has_ipv4(&self) -> bool {
        self.interfaces.iter().any(|i| !i.ipv4.is_empty())
    }

    /// At least one interface has a usable IPv6 address
    pub fn has_ipv6(&self) -> bool {
        self.interfaces.iter().any(|i| !i.ipv6.is_empty())
    }

    /// Metadata representation merged into the instance metadata
    pub fn to_value(&self) -> Value {
        let mut by_mac = Map::new();
        let mut by_ipv4 = Map::new();
        let mut by_ipv6 = Map::new();

        for iface in &self.interfaces {
            let mac = iface.mac.as_deref();

            if let Some(mac) = mac {
                let v4: Vec<Value> = iface.ipv4.iter().map(|a| a.to_value(None)).collect();
                let v6: Vec<Value> = iface.ipv6.iter().map(|a| a.to_value(None)).collect();
                by_mac.insert(mac.to_string(), json!({ "ipv4": v4, "ipv6": v6 }));
            }
            for addr in &iface.ipv4 {
                by_ipv4.insert(addr.addr.to_string(), addr.to_value(mac));
            }
            for addr in &iface.ipv6 {
                by_ipv6.insert(addr.addr.to_string(), addr.to_value(mac));
            }
        }

        let mut root = Map::new();
        if let Some(hostname) = &self.hostname {
            for key in ["hostname", "local-hostname", "local_hostname"] {
                root.insert(key.into(), Value::String(hostname.clone()));
            }
        }
        if let Some(v4) = self.default_ipv4 {
            root.insert("local-ipv4".into(), Value::String(v4.to_string()));
        }
        if let Some(v6) = self.default_ipv6 {
            root.insert("local-ipv6".into(), Value::String(v6.to_string()));
        }
        root.insert(
            "network".into(),
            json!({
                "interfaces": {
                    "by-mac": by_mac,
                    "by-ipv4": by_ipv4,
                    "by-ipv6": by_ipv6,
                }
            }),
        );

        Value::Object(root)
    }
}

/// Produces host network snapshots
#[async_trait]
pub trait HostInfoSource: Send + Sync {
    async fn snapshot(&self) -> Result<HostInfo, BootstrapError>;
}

/// Reads the live host state using the `ip` tool
pub struct SystemHostInfo {
    runner: Arc<dyn CommandRunner>,
    hostname_path: PathBuf,
    timeout: Duration,
}

impl SystemHostInfo {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            hostname_path: PathBuf::from(HOSTNAME_PATH),
            timeout: Duration::from_secs(5),
        }
    }

    /// Use a custom command runner
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Read the hostname from a custom path
    pub fn with_hostname_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.hostname_path = path.into();
        self
    }

    async fn ip(&self, args: &[&str]) -> Result<String, BootstrapError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.runner.run("ip", &args, self.timeout).await?;
        if !output.success() {
            return Err(BootstrapError::Command(format!(
                "ip {} exited with {:?}: {}",
                args.join(" "),
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn default_route_iface(&self, family: &str) -> Option<String> {
        match self.ip(&[family, "route", "show", "default"]).await {
            Ok(out) => parse_default_route(&out),
            Err(e) => {
                debug!("No {} default route: {}", family, e);
                None
            }
        }
    }
}

impl Default for SystemHostInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostInfoSource for SystemHostInfo {
    async fn snapshot(&self) -> Result<HostInfo, BootstrapError> {
        let links = self.ip(&["-o", "link", "show"]).await?;
        let addrs = self.ip(&["-o", "addr", "show"]).await?;

        let mut interfaces = parse_link_output(&links);
        merge_addr_output(&mut interfaces, &addrs);

        let default_v4 = self.default_route_iface("-4").await;
        let default_v6 = self.default_route_iface("-6").await;

        let hostname = match fs::read_to_string(&self.hostname_path).await {
            Ok(name) => Some(name.trim().to_string()),
            Err(e) => {
                warn!("Failed to read hostname from {}: {}", self.hostname_path.display(), e);
                None
            }
        };

        Ok(HostInfo::from_interfaces(
            hostname,
            interfaces,
            default_v4.as_deref(),
            default_v6.as_deref(),
        ))
    }
}

/// Interface name from an `ip -o` field (`eth0:` or `veth1@if5`)
fn iface_name(field: &str) -> &str {
    let name = field.trim_end_matches(':');
    name.split('@').next().unwrap_or(name)
}

/// Parse `ip -o link show`, skipping loopback devices
pub fn parse_link_output(output: &str) -> Vec<NetInterface> {
    let mut interfaces = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(name) = fields.get(1).map(|f| iface_name(f)) else {
            continue;
        };
        if fields.contains(&"link/loopback") {
            continue;
        }

        let mut iface = NetInterface::new(name);
        if let Some(pos) = fields.iter().position(|f| *f == "link/ether") {
            if let Some(mac) = fields.get(pos + 1) {
                iface = iface.with_mac(*mac);
            }
        }
        interfaces.push(iface);
    }

    interfaces
}

/// Merge `ip -o addr show` addresses into the interface list
pub fn merge_addr_output(interfaces: &mut Vec<NetInterface>, output: &str) {
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (Some(name), Some(family), Some(cidr)) = (fields.get(1), fields.get(2), fields.get(3))
        else {
            continue;
        };
        if *family != "inet" && *family != "inet6" {
            continue;
        }

        let name = iface_name(name);
        let (addr, prefix) = cidr.split_once('/').unwrap_or((cidr, ""));
        let Ok(addr) = addr.parse::<IpAddr>() else {
            debug!("Skipping unparsable address '{}' on {}", cidr, name);
            continue;
        };
        let default_prefix = if addr.is_ipv4() { 32 } else { 128 };
        let prefix_len = prefix.parse().unwrap_or(default_prefix);

        match interfaces.iter_mut().find(|i| i.name == name) {
            Some(iface) => iface.push_addr(InterfaceAddress::new(addr, prefix_len)),
            None if addr.is_loopback() => {}
            None => {
                let mut iface = NetInterface::new(name);
                iface.push_addr(InterfaceAddress::new(addr, prefix_len));
                interfaces.push(iface);
            }
        }
    }
}

/// Interface of the first `default ... dev <iface>` route
pub fn parse_default_route(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"default") {
            return None;
        }
        let pos = fields.iter().position(|f| *f == "dev")?;
        fields.get(pos + 1).map(|s| s.to_string())
    })
}
