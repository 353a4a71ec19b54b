//! Part handlers shipped inside user-data
//!
//! A `#part-handler` part is an executable that claims content types through
//! comment directives:
//!
//! ```text
//! #part-handler
//! #!/bin/sh
//! # list_types: text/x-custom, text/x-other
//! # frequency: always
//! # handler_version: 2
//! ```
//!
//! It is stored as `handlers/part-handler-NNN` and run once per call as
//! `<script> <content-type> <filename> <frequency>` with the payload on
//! stdin, an empty environment apart from `PATH`, and the handler directory
//! as working directory. `begin` and `end` use the content types
//! `__begin__` and `__end__`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::{Frequency, HandlerSpec, PartHandler, strip_marker_line, write_executable};
use crate::BootstrapError;
use crate::command::run_with_input;
use crate::userdata::document::Part;

const MARKER: &str = "#part-handler";
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const BEGIN: &str = "__begin__";
pub const END: &str = "__end__";

pub struct ExternalPartHandler {
    name: String,
    spec: HandlerSpec,
    path: PathBuf,
    workdir: PathBuf,
    timeout: Duration,
}

impl ExternalPartHandler {
    /// Spec declared by the handler's comment directives
    ///
    /// Missing or invalid values fall back to no types, per-instance and
    /// version 1.
    pub fn directives(source: &str) -> HandlerSpec {
        let mut types: Vec<String> = Vec::new();
        let mut frequency = None;
        let mut version = None;

        for line in source.lines() {
            let Some(comment) = line.trim().strip_prefix('#') else {
                continue;
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim().to_lowercase().as_str() {
                "list_types" | "list-types" => types.extend(
                    value
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|t| !t.is_empty())
                        .map(str::to_string),
                ),
                "frequency" => frequency = Frequency::parse(value),
                "handler_version" | "handler-version" => version = value.parse().ok(),
                _ => {}
            }
        }

        let mut spec = HandlerSpec::new(types);
        if let Some(frequency) = frequency {
            spec = spec.with_frequency(frequency);
        }
        if let Some(version) = version {
            spec = spec.with_version(version);
        }
        spec
    }

    /// Persist a `#part-handler` part as handler number `index` in `dir`
    pub async fn materialize(
        part: &Part,
        dir: &Path,
        index: usize,
        timeout: Duration,
    ) -> Result<Self, BootstrapError> {
        let text = part.text();
        let script = strip_marker_line(&text, MARKER);
        let spec = Self::directives(script);

        let name = format!("part-handler-{index:03}");
        let path = write_executable(dir, &name, script.as_bytes()).await?;
        info!(
            "Registered {} for {:?} ({}, version {})",
            name, spec.content_types, spec.frequency, spec.version
        );

        Ok(Self {
            name,
            spec,
            path,
            workdir: dir.to_path_buf(),
            timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn invoke(
        &self,
        content_type: &str,
        filename: &str,
        frequency: Frequency,
        payload: &[u8],
    ) -> Result<(), BootstrapError> {
        debug!("{} {} {}", self.name, content_type, filename);

        let mut command = Command::new(&self.path);
        command
            .args([content_type, filename, frequency.as_str()])
            .env_clear()
            .env("PATH", SAFE_PATH)
            .current_dir(&self.workdir);

        let output = run_with_input(command, payload, self.timeout)
            .await
            .map_err(|e| BootstrapError::handler(&self.name, content_type, e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(BootstrapError::handler(
                &self.name,
                content_type,
                format!(
                    "exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

#[async_trait]
impl PartHandler for ExternalPartHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    async fn begin(&mut self, frequency: Frequency) -> Result<(), BootstrapError> {
        self.invoke(BEGIN, "", frequency, b"").await
    }

    async fn handle_part(&mut self, part: &Part, frequency: Frequency) -> Result<(), BootstrapError> {
        let filename = part.filename.as_deref().unwrap_or_default();
        self.invoke(&part.content_type, filename, frequency, &part.payload)
            .await
    }

    async fn end(&mut self, frequency: Frequency) -> Result<(), BootstrapError> {
        self.invoke(END, "", frequency, b"").await
    }
}
