//! Test doubles for the datasource seams
//!
//! [`MockTransport`], [`MockHostInfo`] and [`MockRunner`] stand in for the
//! hypervisor channels, the host network state and external tools.
//!
//! # Example
//! ```
//! use cloud_bootstrap::datasources::mock::MockTransport;
//!
//! let transport = MockTransport::new("guestinfo")
//!     .with_metadata("instance-id: test-123\n")
//!     .with_userdata(b"#cloud-config\nhostname: mock\n");
//! let calls = transport.fetch_count();
//! assert_eq!(calls.get(), 0);
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::hostinfo::{HostInfo, HostInfoSource};
use super::{Transport, TransportData};
use crate::BootstrapError;
use crate::command::{CommandOutput, CommandRunner};

/// Shared call counter handed out before a mock is boxed
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Configurable transport
pub struct MockTransport {
    name: String,
    requires_platform: bool,
    data: TransportData,
    error: Option<String>,
    fetches: CallCounter,
    redactions: Arc<Mutex<Vec<Vec<String>>>>,
    advertised: Arc<Mutex<Vec<HostInfo>>>,
}

impl MockTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires_platform: false,
            data: TransportData::default(),
            error: None,
            fetches: CallCounter::default(),
            redactions: Arc::default(),
            advertised: Arc::default(),
        }
    }

    pub fn with_requires_platform(mut self, requires: bool) -> Self {
        self.requires_platform = requires;
        self
    }

    pub fn with_metadata(mut self, metadata: &str) -> Self {
        self.data.metadata = Some(metadata.to_string());
        self
    }

    pub fn with_userdata(mut self, userdata: &[u8]) -> Self {
        self.data.userdata = Some(userdata.to_vec());
        self
    }

    pub fn with_vendordata(mut self, vendordata: &[u8]) -> Self {
        self.data.vendordata = Some(vendordata.to_vec());
        self
    }

    /// Fail every fetch with this message
    pub fn with_error(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    pub fn fetch_count(&self) -> CallCounter {
        self.fetches.clone()
    }

    /// Key lists passed to `redact`, one entry per call
    pub fn redactions(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
        self.redactions.clone()
    }

    pub fn advertised(&self) -> Arc<Mutex<Vec<HostInfo>>> {
        self.advertised.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_platform(&self) -> bool {
        self.requires_platform
    }

    fn key_name(&self, key: &str) -> String {
        format!("{}.{}", self.name, key)
    }

    async fn fetch(&self, _cancel: &CancellationToken) -> Result<TransportData, BootstrapError> {
        self.fetches.bump();
        match &self.error {
            Some(message) => Err(BootstrapError::transport(&self.name, message.clone())),
            None => Ok(self.data.clone()),
        }
    }

    async fn redact(&self, keys: &[String]) {
        if let Ok(mut calls) = self.redactions.lock() {
            calls.push(keys.to_vec());
        }
    }

    async fn advertise_addresses(&self, host: &HostInfo) {
        if let Ok(mut calls) = self.advertised.lock() {
            calls.push(host.clone());
        }
    }
}

/// Replays a sequence of host snapshots; the last one repeats forever
pub struct MockHostInfo {
    snapshots: Vec<HostInfo>,
    calls: CallCounter,
}

impl MockHostInfo {
    pub fn new(snapshots: Vec<HostInfo>) -> Self {
        Self {
            snapshots,
            calls: CallCounter::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn call_counter(&self) -> CallCounter {
        self.calls.clone()
    }
}

#[async_trait]
impl HostInfoSource for MockHostInfo {
    async fn snapshot(&self) -> Result<HostInfo, BootstrapError> {
        let index = self.calls.get();
        self.calls.bump();
        self.snapshots
            .get(index)
            .or(self.snapshots.last())
            .cloned()
            .ok_or_else(|| BootstrapError::Command("no host snapshot scripted".into()))
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    Error(String),
}

/// Scripted command runner
///
/// Rules are matched in order against the program name and the space-joined
/// arguments. Unmatched commands behave like a missing executable.
#[derive(Default)]
pub struct MockRunner {
    rules: Vec<(String, String, Scripted)>,
    calls: Arc<Mutex<Vec<String>>>,
    invocations: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program` calls whose arguments contain `args_contain`
    pub fn on(mut self, program: &str, args_contain: &str, output: CommandOutput) -> Self {
        self.rules.push((
            program.to_string(),
            args_contain.to_string(),
            Scripted::Output(output),
        ));
        self
    }

    /// Make matching calls fail to spawn
    pub fn on_error(mut self, program: &str, args_contain: &str, message: &str) -> Self {
        self.rules.push((
            program.to_string(),
            args_contain.to_string(),
            Scripted::Error(message.to_string()),
        ));
        self
    }

    /// Every invocation as `program arg1 arg2 ...`
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    /// Every invocation as program followed by its exact arguments
    pub fn invocations(&self) -> Arc<Mutex<Vec<Vec<String>>>> {
        self.invocations.clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<CommandOutput, BootstrapError> {
        let joined = args.join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(format!("{program} {joined}").trim_end().to_string());
        }
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(std::iter::once(program.to_string()).chain(args.iter().cloned()).collect());
        }

        let rule = self
            .rules
            .iter()
            .find(|(p, needle, _)| p == program && joined.contains(needle.as_str()));

        match rule {
            Some((_, _, Scripted::Output(output))) => Ok(output.clone()),
            Some((_, _, Scripted::Error(message))) => {
                Err(BootstrapError::Command(format!("{program}: {message}")))
            }
            None => Err(BootstrapError::Command(format!("{program}: not found"))),
        }
    }
}
