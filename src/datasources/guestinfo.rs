//! Hypervisor guestinfo transport
//!
//! Values live in the VM's guestinfo namespace and are read with an RPC
//! tool running inside the guest:
//!
//! ```text
//! vmware-rpctool "info-get guestinfo.metadata"
//! vmtoolsd --cmd "info-get guestinfo.metadata"
//! ```
//!
//! Each value may carry a `<key>.encoding` sibling (see [`super::decode`]).

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decode::{self, Encoding};
use super::hostinfo::HostInfo;
use super::{Transport, TransportData};
use crate::BootstrapError;
use crate::command::{CommandOutput, CommandRunner, SystemRunner};
use crate::config::GuestInfoConfig;

const TRANSPORT_NAME: &str = "guestinfo";

/// Printed on stderr by both tools when a key is unset
const NO_VALUE: &str = "No value found";

/// Empty YAML document, treated as "no value"
const EMPTY_MARKER: &str = "---";

/// Value written over redacted keys
const REDACTED_VALUE: &str = " ";

/// Calling convention of an RPC tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// `vmware-rpctool "<rpc>"`
    Rpctool,
    /// `vmtoolsd --cmd "<rpc>"`
    Vmtoolsd,
}

/// An RPC tool and how to invoke it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcCommand {
    pub program: String,
    pub kind: ToolKind,
}

impl RpcCommand {
    pub fn rpctool(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            kind: ToolKind::Rpctool,
        }
    }

    pub fn vmtoolsd(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            kind: ToolKind::Vmtoolsd,
        }
    }

    fn args(&self, rpc: &str) -> Vec<String> {
        match self.kind {
            ToolKind::Rpctool => vec![rpc.to_string()],
            ToolKind::Vmtoolsd => vec!["--cmd".to_string(), rpc.to_string()],
        }
    }
}

/// Guestinfo transport
pub struct GuestInfo {
    runner: Arc<dyn CommandRunner>,
    primary: Option<RpcCommand>,
    fallback: Option<RpcCommand>,
    using_fallback: AtomicBool,
    timeout: Duration,
}

impl GuestInfo {
    pub fn new(primary: Option<RpcCommand>, fallback: Option<RpcCommand>) -> Self {
        Self {
            runner: Arc::new(SystemRunner),
            primary,
            fallback,
            using_fallback: AtomicBool::new(false),
            timeout: Duration::from_secs(10),
        }
    }

    /// Tools from configuration; an empty program name disables that tool
    pub fn from_config(config: &GuestInfoConfig) -> Self {
        let rpctool = Some(config.rpctool.trim())
            .filter(|p| !p.is_empty())
            .map(RpcCommand::rpctool);
        let vmtoolsd = Some(config.vmtoolsd.trim())
            .filter(|p| !p.is_empty())
            .map(RpcCommand::vmtoolsd);

        let (primary, fallback) = match rpctool {
            Some(rpctool) => (Some(rpctool), vmtoolsd),
            None => (vmtoolsd, None),
        };

        Self::new(primary, fallback).with_timeout(Duration::from_secs(config.command_timeout_secs))
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the fallback tool has taken over
    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback.load(Ordering::SeqCst)
    }

    async fn invoke(&self, tool: &RpcCommand, rpc: &str) -> Result<CommandOutput, String> {
        match self.runner.run(&tool.program, &tool.args(rpc), self.timeout).await {
            Ok(out) if out.success() || out.stderr.contains(NO_VALUE) => Ok(out),
            Ok(out) => Err(format!(
                "{} exited with {:?}: {}",
                tool.program,
                out.status,
                out.stderr.trim()
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Run one RPC, switching to the fallback tool on the first failure
    async fn exec(&self, rpc: &str) -> Result<CommandOutput, BootstrapError> {
        let on_fallback = self.is_using_fallback();
        let tool = if on_fallback {
            self.fallback.as_ref()
        } else {
            self.primary.as_ref()
        };
        let Some(tool) = tool else {
            return Err(BootstrapError::transport(TRANSPORT_NAME, "no RPC tool configured"));
        };

        let message = match self.invoke(tool, rpc).await {
            Ok(out) => return Ok(out),
            Err(message) => message,
        };
        warn!("Guestinfo RPC '{}' failed: {}", rpc, message);

        match (&self.fallback, on_fallback) {
            (Some(fallback), false) => {
                info!("Switching guestinfo access to {}", fallback.program);
                self.using_fallback.store(true, Ordering::SeqCst);
                self.invoke(fallback, rpc)
                    .await
                    .map_err(|m| BootstrapError::transport(TRANSPORT_NAME, m))
            }
            _ => Err(BootstrapError::transport(TRANSPORT_NAME, message)),
        }
    }

    /// Raw value of `guestinfo.<key>`; `None` when unset or empty
    pub async fn get_value(&self, key: &str) -> Result<Option<String>, BootstrapError> {
        let out = self.exec(&format!("info-get guestinfo.{key}")).await?;

        if out.stderr.contains(NO_VALUE) {
            debug!("No value found for guestinfo.{}", key);
            return Ok(None);
        }

        let value = out.stdout.trim_end_matches(['\r', '\n']);
        if value.trim().is_empty() || value.trim() == EMPTY_MARKER {
            debug!("Empty value for guestinfo.{}", key);
            return Ok(None);
        }

        Ok(Some(value.to_string()))
    }

    /// Value of `guestinfo.<key>` decoded with its `.encoding` sibling
    pub async fn get_decoded(&self, key: &str) -> Result<Option<Vec<u8>>, BootstrapError> {
        let Some(value) = self.get_value(key).await? else {
            return Ok(None);
        };
        let tag = self.get_value(&format!("{key}.encoding")).await?;
        decode::decode(key, Encoding::parse(tag.as_deref()), value.as_bytes()).map(Some)
    }

    /// Set `guestinfo.<key>` on the host
    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), BootstrapError> {
        self.exec(&format!("info-set guestinfo.{key} {value}"))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Transport for GuestInfo {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    fn requires_platform(&self) -> bool {
        true
    }

    fn key_name(&self, key: &str) -> String {
        format!("guestinfo.{key}")
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<TransportData, BootstrapError> {
        let mut data = TransportData::default();

        for key in ["metadata", "userdata", "vendordata"] {
            if cancel.is_cancelled() {
                return Err(BootstrapError::transport(TRANSPORT_NAME, "cancelled"));
            }
            let value = match self.get_decoded(key).await {
                Ok(value) => value,
                Err(e @ BootstrapError::Decode { .. }) if key != "metadata" => {
                    warn!("Ignoring {}: {}", self.key_name(key), e);
                    None
                }
                Err(e) => return Err(e),
            };
            match key {
                "metadata" => {
                    data.metadata = value.map(|v| String::from_utf8_lossy(&v).into_owned())
                }
                "userdata" => data.userdata = value,
                _ => data.vendordata = value,
            }
        }

        Ok(data)
    }

    async fn redact(&self, keys: &[String]) {
        for key in keys {
            info!("Redacting guestinfo.{}", key);
            if let Err(e) = self.set_value(key, REDACTED_VALUE).await {
                warn!("Failed to redact guestinfo.{}: {}", key, e);
            }
            if let Err(e) = self.set_value(&format!("{key}.encoding"), "").await {
                warn!("Failed to clear guestinfo.{}.encoding: {}", key, e);
            }
        }
    }

    async fn advertise_addresses(&self, host: &HostInfo) {
        let addresses = [
            ("local-ipv4", host.default_ipv4.map(|a| a.to_string())),
            ("local-ipv6", host.default_ipv6.map(|a| a.to_string())),
        ];

        for (key, addr) in addresses {
            let Some(addr) = addr else { continue };
            debug!("Advertising {} = {}", key, addr);
            if let Err(e) = self.set_value(key, &addr).await {
                warn!("Failed to advertise {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasources::mock::MockRunner;

    fn transport(runner: MockRunner) -> (GuestInfo, Arc<std::sync::Mutex<Vec<String>>>) {
        let calls = runner.calls();
        let guestinfo = GuestInfo::new(
            Some(RpcCommand::rpctool("vmware-rpctool")),
            Some(RpcCommand::vmtoolsd("vmtoolsd")),
        )
        .with_runner(Arc::new(runner));
        (guestinfo, calls)
    }

    fn no_value() -> CommandOutput {
        CommandOutput::failed(1, "No value found\n")
    }

    #[tokio::test]
    async fn test_absent_and_empty_values() {
        let runner = MockRunner::new()
            .on("vmware-rpctool", "guestinfo.userdata", no_value())
            .on("vmware-rpctool", "guestinfo.vendordata", CommandOutput::ok("---\n"))
            .on("vmware-rpctool", "guestinfo.metadata", CommandOutput::ok("\n"));
        let (guestinfo, calls) = transport(runner);

        assert_eq!(guestinfo.get_value("userdata").await.unwrap(), None);
        assert_eq!(guestinfo.get_value("vendordata").await.unwrap(), None);
        assert_eq!(guestinfo.get_value("metadata").await.unwrap(), None);
        assert!(!guestinfo.is_using_fallback());
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_decodes_values() {
        let runner = MockRunner::new()
            .on("vmware-rpctool", "guestinfo.metadata.encoding", CommandOutput::ok("base64\n"))
            .on("vmware-rpctool", "guestinfo.metadata", CommandOutput::ok("aW5zdGFuY2UtaWQ6IGktMQo=\n"))
            .on("vmware-rpctool", "guestinfo.userdata.encoding", no_value())
            .on("vmware-rpctool", "guestinfo.userdata", CommandOutput::ok("#!/bin/sh\necho hi\n"))
            .on("vmware-rpctool", "guestinfo.vendordata", no_value());
        let (guestinfo, _) = transport(runner);

        let data = guestinfo.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(data.metadata.as_deref(), Some("instance-id: i-1\n"));
        assert_eq!(data.userdata.as_deref(), Some(&b"#!/bin/sh\necho hi"[..]));
        assert_eq!(data.vendordata, None);
    }

    #[tokio::test]
    async fn test_fallback_once_is_sticky() {
        let runner = MockRunner::new()
            .on("vmware-rpctool", "", CommandOutput::failed(2, "rpc channel broken"))
            .on("vmtoolsd", "guestinfo.metadata", CommandOutput::ok("a: 1\n"))
            .on("vmtoolsd", "", no_value());
        let (guestinfo, calls) = transport(runner);

        assert_eq!(guestinfo.get_value("metadata").await.unwrap().as_deref(), Some("a: 1"));
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(guestinfo.is_using_fallback());

        // the primary is never tried again
        assert_eq!(guestinfo.get_value("userdata").await.unwrap(), None);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls[2].starts_with("vmtoolsd --cmd info-get guestinfo.userdata"));
    }

    #[tokio::test]
    async fn test_both_tools_fail() {
        let runner = MockRunner::new()
            .on_error("vmware-rpctool", "", "No such file or directory")
            .on("vmtoolsd", "", CommandOutput::failed(1, "backdoor not available"));
        let (guestinfo, calls) = transport(runner);

        let err = guestinfo.get_value("metadata").await.unwrap_err();
        assert!(matches!(err, BootstrapError::TransportUnavailable { .. }));
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_without_fallback() {
        let runner = MockRunner::new().on("vmware-rpctool", "", CommandOutput::failed(1, "nope"));
        let calls = runner.calls();
        let guestinfo = GuestInfo::new(Some(RpcCommand::rpctool("vmware-rpctool")), None)
            .with_runner(Arc::new(runner));

        assert!(guestinfo.get_value("metadata").await.is_err());
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_redact_sets_blank_and_clears_encoding() {
        let runner = MockRunner::new().on("vmware-rpctool", "info-set", CommandOutput::ok(""));
        let (guestinfo, calls) = transport(runner);

        guestinfo.redact(&["userdata".to_string()]).await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], "vmware-rpctool info-set guestinfo.userdata");
        assert_eq!(calls[1], "vmware-rpctool info-set guestinfo.userdata.encoding");
    }

    #[tokio::test]
    async fn test_redact_twice_is_harmless() {
        let runner = MockRunner::new().on("vmware-rpctool", "info-set", CommandOutput::ok(""));
        let invocations = runner.invocations();
        let (guestinfo, _) = transport(runner);
        let keys = ["userdata".to_string()];

        guestinfo.redact(&keys).await;
        guestinfo.redact(&keys).await;

        let invocations = invocations.lock().unwrap();
        let value_write = ["vmware-rpctool", "info-set guestinfo.userdata  "];
        let encoding_write = ["vmware-rpctool", "info-set guestinfo.userdata.encoding "];
        assert_eq!(
            *invocations,
            [value_write, encoding_write, value_write, encoding_write]
        );
    }

    #[tokio::test]
    async fn test_bad_vendordata_keeps_metadata() {
        let runner = MockRunner::new()
            .on("vmware-rpctool", "guestinfo.metadata.encoding", no_value())
            .on("vmware-rpctool", "guestinfo.metadata", CommandOutput::ok("instance-id: i-1\n"))
            .on("vmware-rpctool", "guestinfo.userdata", no_value())
            .on("vmware-rpctool", "guestinfo.vendordata.encoding", CommandOutput::ok("base64\n"))
            .on("vmware-rpctool", "guestinfo.vendordata", CommandOutput::ok("!!!\n"));
        let (guestinfo, _) = transport(runner);

        let data = guestinfo.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(data.metadata.as_deref(), Some("instance-id: i-1"));
        assert_eq!(data.userdata, None);
        assert_eq!(data.vendordata, None);
    }

    #[tokio::test]
    async fn test_redact_failure_is_swallowed() {
        let runner = MockRunner::new()
            .on("vmware-rpctool", "", CommandOutput::failed(1, "denied"))
            .on("vmtoolsd", "", CommandOutput::failed(1, "denied"));
        let (guestinfo, _) = transport(runner);
        guestinfo.redact(&["userdata".to_string()]).await;
    }

    #[tokio::test]
    async fn test_advertise_addresses() {
        use crate::datasources::hostinfo::NetInterface;

        let runner = MockRunner::new().on("vmware-rpctool", "info-set", CommandOutput::ok(""));
        let (guestinfo, calls) = transport(runner);
        let iface = NetInterface::new("eth0").with_addr("10.1.2.3".parse().unwrap(), 24);
        let host = HostInfo::from_interfaces(None, vec![iface], Some("eth0"), None);

        guestinfo.advertise_addresses(&host).await;

        let calls = calls.lock().unwrap();
        assert_eq!(*calls, ["vmware-rpctool info-set guestinfo.local-ipv4 10.1.2.3"]);
    }
}
