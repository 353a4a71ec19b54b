//! Part dispatch
//!
//! Walks a processed [`Document`] and hands each part to the handler that
//! claims its content type. Failures are counted and logged per part; the
//! walk itself always runs to the end.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::document::{Document, Part};
use super::handlers::{ExternalPartHandler, Frequency, HandlerRegistry, should_run};
use super::types::ContentType;

const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

/// Counts from one walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    /// Parts a handler accepted
    pub dispatched: usize,
    /// Parts whose handler failed
    pub failed: usize,
    /// Parts whose handler does not run at this frequency
    pub skipped: usize,
    /// Parts without a handler
    pub unhandled: usize,
    /// Part handlers registered from the document
    pub registered: usize,
}

/// Drives a [`HandlerRegistry`] over documents
pub struct Dispatcher {
    registry: HandlerRegistry,
    handlers_dir: Option<PathBuf>,
    handler_timeout: Duration,
    materialized: usize,
    warned: HashSet<String>,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry,
            handlers_dir: None,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            materialized: 0,
            warned: HashSet::new(),
        }
    }

    /// Directory where `#part-handler` parts are stored
    ///
    /// Without one, such parts are ignored.
    pub fn with_handlers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.handlers_dir = Some(dir.into());
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> HandlerRegistry {
        self.registry
    }

    /// Dispatch every part of `document` for a walk at `frequency`
    pub async fn walk(&mut self, document: &Document, frequency: Frequency) -> WalkSummary {
        self.warned.clear();
        self.registry.reset();
        let mut summary = WalkSummary::default();

        for index in 0..self.registry.len() {
            self.begin(index, frequency).await;
        }

        for part in document.parts() {
            if part.kind() == Some(ContentType::PartHandler) {
                self.register_part_handler(part, frequency, &mut summary).await;
                continue;
            }
            self.dispatch(part, frequency, &mut summary).await;
        }

        for index in self.registry.begun() {
            if let Err(e) = self.registry.end(index, frequency).await {
                warn!("Handler {} failed to finish: {}", self.handler_label(index), e);
            }
        }

        info!(
            "Dispatched {} part(s): {} failed, {} skipped, {} unhandled",
            summary.dispatched, summary.failed, summary.skipped, summary.unhandled
        );
        summary
    }

    async fn dispatch(&mut self, part: &Part, frequency: Frequency, summary: &mut WalkSummary) {
        let Some(index) = self.registry.lookup(&part.content_type) else {
            if part.payload.iter().all(u8::is_ascii_whitespace) {
                return;
            }
            summary.unhandled += 1;
            if self.warned.insert(part.content_type.clone()) {
                warn!(
                    "Unhandled non-multipart ({}) userdata: '{}'...",
                    part.content_type,
                    preview(part)
                );
            }
            return;
        };

        let Some(spec) = self.registry.handler(index).map(|h| h.spec().clone()) else {
            return;
        };
        if !should_run(spec.frequency, frequency) {
            debug!(
                "Skipping {} part: handler runs {}, walk is {}",
                part.content_type, spec.frequency, frequency
            );
            summary.skipped += 1;
            return;
        }

        match self.registry.handle(index, part, frequency).await {
            Ok(()) => summary.dispatched += 1,
            Err(e) => {
                summary.failed += 1;
                warn!(
                    "Failed to handle {} part {} with {} (version {}): {}",
                    part.content_type,
                    part.filename.as_deref().unwrap_or("<unnamed>"),
                    self.handler_label(index),
                    spec.version,
                    e
                );
            }
        }
    }

    async fn register_part_handler(&mut self, part: &Part, frequency: Frequency, summary: &mut WalkSummary) {
        let Some(dir) = self.handlers_dir.clone() else {
            warn!("No handler directory; ignoring part handler {:?}", part.filename);
            return;
        };

        let index = self.materialized + 1;
        match ExternalPartHandler::materialize(part, &dir, index, self.handler_timeout).await {
            Ok(handler) => {
                self.materialized = index;
                let registered = self.registry.register(Box::new(handler));
                summary.registered += 1;
                self.begin(registered, frequency).await;
            }
            Err(e) => warn!("Failed to register part handler {:?}: {}", part.filename, e),
        }
    }

    async fn begin(&mut self, index: usize, frequency: Frequency) {
        let Some(handler_frequency) = self.registry.handler(index).map(|h| h.spec().frequency) else {
            return;
        };
        if !should_run(handler_frequency, frequency) {
            return;
        }
        if let Err(e) = self.registry.begin(index, frequency).await {
            warn!("Handler {} failed to start: {}", self.handler_label(index), e);
        }
    }

    fn handler_label(&self, index: usize) -> String {
        self.registry
            .handler(index)
            .map(|h| h.name().to_string())
            .unwrap_or_else(|| format!("#{index}"))
    }
}

fn preview(part: &Part) -> String {
    part.text().chars().take(24).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BootstrapError;
    use crate::userdata::handlers::{HandlerSpec, Lifecycle, PartHandler};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        spec: HandlerSpec,
        fail_on: Option<String>,
        log: Log,
    }

    fn recorder(name: &str, types: &[&str], frequency: Frequency) -> (Recorder, Log) {
        let log: Log = Arc::default();
        (
            Recorder {
                name: name.to_string(),
                spec: HandlerSpec::new(types.iter().copied()).with_frequency(frequency),
                fail_on: None,
                log: log.clone(),
            },
            log,
        )
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
            self.log.lock().unwrap().push(part.text().into_owned());
            if self.fail_on.as_deref() == Some(&*part.text()) {
                return Err(BootstrapError::handler(&self.name, part.content_type.as_str(), "boom"));
            }
            Ok(())
        }

        async fn end(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
            self.log.lock().unwrap().push("end".into());
            Ok(())
        }
    }

    fn document(parts: Vec<Part>) -> Document {
        let mut document = Document::new();
        for part in parts {
            document.attach(part);
        }
        document
    }

    #[tokio::test]
    async fn test_always_handler_called_once_per_part() {
        let (handler, log) = recorder("sh", &["text/x-shellscript"], Frequency::Always);
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(handler));
        let mut dispatcher = Dispatcher::new(registry);

        let doc = document(vec![Part::new("text/x-shellscript", "#!/bin/sh")]);
        let summary = dispatcher.walk(&doc, Frequency::Always).await;

        assert_eq!(summary.dispatched, 1);
        assert_eq!(*log.lock().unwrap(), ["begin", "#!/bin/sh", "end"]);
    }

    #[tokio::test]
    async fn test_per_instance_handler_frequency_filter() {
        let (handler, log) = recorder("pi", &["text/x-a"], Frequency::PerInstance);
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(handler));
        let mut dispatcher = Dispatcher::new(registry);
        let doc = document(vec![Part::new("text/x-a", "a")]);

        let summary = dispatcher.walk(&doc, Frequency::Always).await;
        assert_eq!(summary.skipped, 1);
        assert!(log.lock().unwrap().is_empty());

        let summary = dispatcher.walk(&doc, Frequency::PerInstance).await;
        assert_eq!(summary.dispatched, 1);
        assert_eq!(*log.lock().unwrap(), ["begin", "a", "end"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_walk() {
        let (mut handler, log) = recorder("x", &["text/x-a"], Frequency::Always);
        handler.fail_on = Some("bad".into());
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(handler));
        let mut dispatcher = Dispatcher::new(registry);

        let doc = document(vec![
            Part::new("text/x-a", "one"),
            Part::new("text/x-a", "bad"),
            Part::new("text/x-a", "two"),
        ]);
        let summary = dispatcher.walk(&doc, Frequency::Always).await;

        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(*log.lock().unwrap(), ["begin", "one", "bad", "two", "end"]);
        assert_eq!(dispatcher.registry().state(0), Some(Lifecycle::Ended));
    }

    #[tokio::test]
    async fn test_unhandled_counted() {
        let mut dispatcher = Dispatcher::new(HandlerRegistry::new());
        let doc = document(vec![
            Part::new("text/x-not-multipart", "hello"),
            Part::new("text/x-not-multipart", "again"),
            Part::new("text/x-not-multipart", "  \n"),
        ]);

        let summary = dispatcher.walk(&doc, Frequency::Always).await;
        assert_eq!(summary.unhandled, 2);
        assert_eq!(dispatcher.warned.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_part_handler_registers_mid_walk() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut dispatcher = Dispatcher::new(HandlerRegistry::new()).with_handlers_dir(dir.path());

        let doc = document(vec![
            Part::new("text/x-custom", "before"),
            Part::new(
                "text/part-handler",
                "#part-handler\n#!/bin/sh\n# list_types: text/x-custom\n# frequency: always\necho \"$1 $(cat)\" >> calls.log\n",
            ),
            Part::new("text/x-custom", "after"),
        ]);
        let summary = dispatcher.walk(&doc, Frequency::Always).await;

        assert_eq!(summary.registered, 1);
        assert_eq!(summary.unhandled, 1);
        assert_eq!(summary.dispatched, 1);

        let log = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let lines: Vec<&str> = log.lines().map(str::trim_end).collect();
        assert_eq!(lines, ["__begin__", "text/x-custom after", "__end__"]);
        assert!(dir.path().join("part-handler-001").exists());
    }

    #[tokio::test]
    async fn test_part_handler_without_dir_ignored() {
        let mut dispatcher = Dispatcher::new(HandlerRegistry::new());
        let doc = document(vec![Part::new("text/part-handler", "#part-handler\n#!/bin/sh\n")]);

        let summary = dispatcher.walk(&doc, Frequency::Always).await;
        assert_eq!(summary.registered, 0);
        assert!(dispatcher.registry().is_empty());
    }
}
