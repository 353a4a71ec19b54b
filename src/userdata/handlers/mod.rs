//! Part handlers
//!
//! A handler claims a set of content types and receives every matching part
//! of a walk, bracketed by one `begin` and one `end` call. The
//! [`HandlerRegistry`] owns the handlers of one ingestion run and tracks
//! where each one is in that lifecycle.

pub mod boot_hook;
pub mod cloud_config;
pub mod external;
pub mod shell_script;

pub use boot_hook::BootHookHandler;
pub use cloud_config::CloudConfigHandler;
pub use external::ExternalPartHandler;
pub use shell_script::{ShellScriptByFrequencyHandler, ShellScriptHandler};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::document::Part;
use super::types::normalize_mime;
use crate::BootstrapError;
use crate::state::CloudPaths;

/// How often a handler runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    /// Every boot
    Always,
    /// First boot of each instance
    PerInstance,
    /// Once for the lifetime of the machine
    Once,
}

impl Frequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "always" | "per-always" | "per-boot" => Some(Self::Always),
            "per-instance" | "once-per-instance" | "instance" => Some(Self::PerInstance),
            "once" | "per-once" => Some(Self::Once),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::PerInstance => "once-per-instance",
            Self::Once => "once",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a handler of `handler` frequency runs in a walk at `walk`
pub fn should_run(handler: Frequency, walk: Frequency) -> bool {
    handler == Frequency::Always
        || (handler == Frequency::PerInstance && walk == Frequency::PerInstance)
}

/// What a handler declares about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSpec {
    pub content_types: Vec<String>,
    pub frequency: Frequency,
    pub version: u32,
}

impl HandlerSpec {
    /// Spec for `types`, running once per instance at version 1
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            content_types: types.into_iter().map(|t| normalize_mime(t.as_ref())).collect(),
            frequency: Frequency::PerInstance,
            version: 1,
        }
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// Consumer of user-data parts
#[async_trait]
pub trait PartHandler: Send + Sync {
    fn name(&self) -> &str;

    fn spec(&self) -> &HandlerSpec;

    /// Called once before the first part of a walk
    async fn begin(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
        Ok(())
    }

    async fn handle_part(&mut self, part: &Part, frequency: Frequency) -> Result<(), BootstrapError>;

    /// Called once after the last part of a walk
    async fn end(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
        Ok(())
    }
}

/// Where a handler is in its walk lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unseen,
    Begun,
    Ended,
}

struct Registered {
    handler: Box<dyn PartHandler>,
    state: Lifecycle,
}

/// Handlers of one ingestion run, indexed by content type
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Registered>,
    by_type: HashMap<String, usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in handlers for `origin` data
    pub fn with_defaults(paths: &CloudPaths, instance_id: &str, origin: DataOrigin) -> Self {
        let mut registry = Self::new();
        let (cloud_config, scripts) = match origin {
            DataOrigin::User => (
                paths.cloud_config(instance_id),
                paths.instance_scripts_dir(instance_id),
            ),
            DataOrigin::Vendor => (
                paths.vendor_cloud_config(instance_id),
                paths.vendor_scripts_dir(instance_id),
            ),
        };

        registry.register(Box::new(CloudConfigHandler::new(cloud_config)));
        registry.register(Box::new(ShellScriptHandler::new(scripts)));
        registry.register(Box::new(ShellScriptByFrequencyHandler::new(paths.scripts_dir())));
        registry.register(Box::new(BootHookHandler::new(
            paths.boothooks_dir(instance_id),
            instance_id,
        )));
        registry
    }

    /// Add a handler; its types override earlier registrations
    pub fn register(&mut self, handler: Box<dyn PartHandler>) -> usize {
        let index = self.handlers.len();
        for content_type in &handler.spec().content_types {
            self.by_type.insert(content_type.clone(), index);
        }
        self.handlers.push(Registered {
            handler,
            state: Lifecycle::Unseen,
        });
        index
    }

    /// Index of the handler for `content_type`
    pub fn lookup(&self, content_type: &str) -> Option<usize> {
        self.by_type.get(&normalize_mime(content_type)).copied()
    }

    pub fn handler(&self, index: usize) -> Option<&dyn PartHandler> {
        self.handlers.get(index).map(|r| r.handler.as_ref())
    }

    pub fn state(&self, index: usize) -> Option<Lifecycle> {
        self.handlers.get(index).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Content types with a handler, sorted
    pub fn content_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Make every handler eligible for a new walk
    pub fn reset(&mut self) {
        for registered in &mut self.handlers {
            registered.state = Lifecycle::Unseen;
        }
    }

    /// Begin the handler unless it already began; returns whether it did now
    pub async fn begin(&mut self, index: usize, frequency: Frequency) -> Result<bool, BootstrapError> {
        let Some(registered) = self.handlers.get_mut(index) else {
            return Ok(false);
        };
        if registered.state != Lifecycle::Unseen {
            return Ok(false);
        }

        registered.state = Lifecycle::Begun;
        registered.handler.begin(frequency).await?;
        Ok(true)
    }

    /// Hand `part` to a handler, beginning it first if needed
    pub async fn handle(
        &mut self,
        index: usize,
        part: &Part,
        frequency: Frequency,
    ) -> Result<(), BootstrapError> {
        self.begin(index, frequency).await?;
        match self.handlers.get_mut(index) {
            Some(registered) if registered.state == Lifecycle::Begun => {
                registered.handler.handle_part(part, frequency).await
            }
            Some(registered) => Err(BootstrapError::handler(
                registered.handler.name(),
                part.content_type.as_str(),
                "handler already ended",
            )),
            None => Ok(()),
        }
    }

    /// End a begun handler; returns whether it ended now
    pub async fn end(&mut self, index: usize, frequency: Frequency) -> Result<bool, BootstrapError> {
        let Some(registered) = self.handlers.get_mut(index) else {
            return Ok(false);
        };
        if registered.state != Lifecycle::Begun {
            return Ok(false);
        }

        registered.state = Lifecycle::Ended;
        registered.handler.end(frequency).await?;
        Ok(true)
    }

    /// Indexes of handlers that began and have not ended
    pub fn begun(&self) -> Vec<usize> {
        self.handlers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == Lifecycle::Begun)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Which data a handler set consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrigin {
    User,
    Vendor,
}

/// File name safe to create inside a handler directory
pub fn clean_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.trim() {
        "" | "." | ".." => "part".to_string(),
        name => name.to_string(),
    }
}

/// Write an executable (0700) file, creating its directory
pub(crate) async fn write_executable(dir: &Path, name: &str, content: &[u8]) -> Result<PathBuf, BootstrapError> {
    fs::create_dir_all(dir).await?;
    let path = dir.join(clean_filename(name));
    fs::write(&path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
    }

    Ok(path)
}

/// Payload without its first line when that line starts with `marker`
pub(crate) fn strip_marker_line<'a>(payload: &'a str, marker: &str) -> &'a str {
    let trimmed = payload.trim_start();
    if !trimmed.to_lowercase().starts_with(marker) {
        return payload;
    }
    trimmed.find('\n').map_or("", |idx| &trimmed[idx + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records lifecycle calls as strings
    struct Recorder {
        name: String,
        spec: HandlerSpec,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, spec: HandlerSpec) -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    name: name.to_string(),
                    spec,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    #[async_trait]
    impl PartHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn spec(&self) -> &HandlerSpec {
            &self.spec
        }

        async fn begin(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
            self.log.lock().unwrap().push("begin".into());
            Ok(())
        }

        async fn handle_part(&mut self, part: &Part, _frequency: Frequency) -> Result<(), BootstrapError> {
            self.log.lock().unwrap().push(format!("part {}", part.content_type));
            Ok(())
        }

        async fn end(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
            self.log.lock().unwrap().push("end".into());
            Ok(())
        }
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!(Frequency::parse("always"), Some(Frequency::Always));
        assert_eq!(Frequency::parse("once-per-instance"), Some(Frequency::PerInstance));
        assert_eq!(Frequency::parse("Per-Instance"), Some(Frequency::PerInstance));
        assert_eq!(Frequency::parse("once"), Some(Frequency::Once));
        assert_eq!(Frequency::parse("sometimes"), None);
    }

    #[test]
    fn test_should_run() {
        use Frequency::*;
        assert!(should_run(Always, Always));
        assert!(should_run(Always, PerInstance));
        assert!(should_run(PerInstance, PerInstance));
        assert!(!should_run(PerInstance, Always));
        assert!(!should_run(Once, PerInstance));
        assert!(!should_run(Once, Always));
    }

    #[test]
    fn test_spec_defaults() {
        let spec = HandlerSpec::new(["Text/X-Custom"]);
        assert_eq!(spec.content_types, ["text/x-custom"]);
        assert_eq!(spec.frequency, Frequency::PerInstance);
        assert_eq!(spec.version, 1);
    }

    #[test]
    fn test_later_registration_overrides_type() {
        let mut registry = HandlerRegistry::new();
        let (first, _) = Recorder::new("first", HandlerSpec::new(["text/a", "text/b"]));
        let (second, _) = Recorder::new("second", HandlerSpec::new(["text/b"]));

        registry.register(Box::new(first));
        let idx = registry.register(Box::new(second));

        assert_eq!(registry.lookup("text/b"), Some(idx));
        assert_eq!(registry.lookup("text/a"), Some(0));
        assert_eq!(registry.lookup("TEXT/B; charset=utf-8"), Some(idx));
        assert_eq!(registry.lookup("text/c"), None);
        assert_eq!(registry.content_types(), ["text/a", "text/b"]);
    }

    #[tokio::test]
    async fn test_lifecycle_transitions_once() {
        let mut registry = HandlerRegistry::new();
        let (recorder, log) = Recorder::new("rec", HandlerSpec::new(["text/a"]));
        let idx = registry.register(Box::new(recorder));
        let part = Part::new("text/a", "x");

        assert!(registry.begin(idx, Frequency::Always).await.unwrap());
        assert!(!registry.begin(idx, Frequency::Always).await.unwrap());
        registry.handle(idx, &part, Frequency::Always).await.unwrap();
        assert!(registry.end(idx, Frequency::Always).await.unwrap());
        assert!(!registry.end(idx, Frequency::Always).await.unwrap());
        assert_eq!(registry.state(idx), Some(Lifecycle::Ended));

        assert!(registry.handle(idx, &part, Frequency::Always).await.is_err());
        assert_eq!(*log.lock().unwrap(), ["begin", "part text/a", "end"]);
    }

    #[tokio::test]
    async fn test_handle_begins_implicitly() {
        let mut registry = HandlerRegistry::new();
        let (recorder, log) = Recorder::new("rec", HandlerSpec::new(["text/a"]));
        let idx = registry.register(Box::new(recorder));

        registry
            .handle(idx, &Part::new("text/a", "x"), Frequency::Always)
            .await
            .unwrap();
        assert_eq!(registry.begun(), [idx]);
        assert_eq!(*log.lock().unwrap(), ["begin", "part text/a"]);
    }

    #[test]
    fn test_with_defaults() {
        let paths = CloudPaths::with_base("/tmp/cloud");
        let registry = HandlerRegistry::with_defaults(&paths, "i-1", DataOrigin::User);

        for ctype in [
            "text/cloud-config",
            "text/x-shellscript",
            "text/x-shellscript-per-boot",
            "text/cloud-boothook",
        ] {
            assert!(registry.lookup(ctype).is_some(), "{ctype}");
        }
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("setup.sh"), "setup.sh");
        assert_eq!(clean_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(clean_filename(".."), "part");
        assert_eq!(clean_filename(""), "part");
    }

    #[test]
    fn test_strip_marker_line() {
        assert_eq!(strip_marker_line("#cloud-boothook\n#!/bin/sh\n", "#cloud-boothook"), "#!/bin/sh\n");
        assert_eq!(strip_marker_line("#!/bin/sh\n", "#cloud-boothook"), "#!/bin/sh\n");
        assert_eq!(strip_marker_line("#part-handler", "#part-handler"), "");
    }
}
