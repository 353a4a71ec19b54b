//! Shell script parts
//!
//! Scripts are only stored here; a later boot stage runs them.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::{Frequency, HandlerSpec, PartHandler, write_executable};
use crate::BootstrapError;
use crate::userdata::document::Part;
use crate::userdata::types::{
    SHELL_SCRIPT, SHELL_SCRIPT_PER_BOOT, SHELL_SCRIPT_PER_INSTANCE, SHELL_SCRIPT_PER_ONCE,
};

/// Stores `text/x-shellscript` parts in the instance scripts directory
pub struct ShellScriptHandler {
    spec: HandlerSpec,
    dir: PathBuf,
}

impl ShellScriptHandler {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            spec: HandlerSpec::new([SHELL_SCRIPT]).with_frequency(Frequency::Always),
            dir: dir.into(),
        }
    }
}

#[async_trait]
impl PartHandler for ShellScriptHandler {
    fn name(&self) -> &str {
        "shell-script"
    }

    fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    async fn handle_part(&mut self, part: &Part, _frequency: Frequency) -> Result<(), BootstrapError> {
        let name = part.filename.as_deref().unwrap_or("part");
        let path = write_executable(&self.dir, name, &part.payload).await?;
        debug!("Stored script {}", path.display());
        Ok(())
    }
}

/// Stores `text/x-shellscript-per-{boot,instance,once}` parts in the shared
/// `scripts/per-*` directories
pub struct ShellScriptByFrequencyHandler {
    spec: HandlerSpec,
    scripts_dir: PathBuf,
}

impl ShellScriptByFrequencyHandler {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec: HandlerSpec::new([
                SHELL_SCRIPT_PER_BOOT,
                SHELL_SCRIPT_PER_INSTANCE,
                SHELL_SCRIPT_PER_ONCE,
            ])
            .with_frequency(Frequency::Always),
            scripts_dir: scripts_dir.into(),
        }
    }

    fn target_dir(&self, content_type: &str) -> Option<PathBuf> {
        let sub = match content_type {
            SHELL_SCRIPT_PER_BOOT => "per-boot",
            SHELL_SCRIPT_PER_INSTANCE => "per-instance",
            SHELL_SCRIPT_PER_ONCE => "per-once",
            _ => return None,
        };
        Some(self.scripts_dir.join(sub))
    }
}

#[async_trait]
impl PartHandler for ShellScriptByFrequencyHandler {
    fn name(&self) -> &str {
        "shell-script-by-frequency"
    }

    fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    async fn handle_part(&mut self, part: &Part, _frequency: Frequency) -> Result<(), BootstrapError> {
        let dir = self.target_dir(&part.content_type).ok_or_else(|| {
            BootstrapError::handler(self.name(), part.content_type.as_str(), "unexpected content type")
        })?;

        let name = part.filename.as_deref().unwrap_or("part");
        let path = write_executable(&dir, name, &part.payload).await?;
        debug!("Stored script {}", path.display());
        Ok(())
    }
}
