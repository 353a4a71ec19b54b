//! `#cloud-boothook` parts: stored and run right away, every boot

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use super::{Frequency, HandlerSpec, PartHandler, strip_marker_line, write_executable};
use crate::BootstrapError;
use crate::command::run_with_input;
use crate::userdata::document::Part;
use crate::userdata::types::CLOUD_BOOTHOOK;

const NAME: &str = "boothook";
const MARKER: &str = "#cloud-boothook";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct BootHookHandler {
    spec: HandlerSpec,
    dir: PathBuf,
    instance_id: String,
    timeout: Duration,
}

impl BootHookHandler {
    pub fn new(dir: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self {
            spec: HandlerSpec::new([CLOUD_BOOTHOOK]).with_frequency(Frequency::Always),
            dir: dir.into(),
            instance_id: instance_id.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PartHandler for BootHookHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    async fn handle_part(&mut self, part: &Part, _frequency: Frequency) -> Result<(), BootstrapError> {
        let text = part.text();
        let script = strip_marker_line(&text, MARKER);
        let name = part.filename.as_deref().unwrap_or("part");
        let path = write_executable(&self.dir, name, script.as_bytes()).await?;

        let mut command = Command::new(&path);
        command.env("INSTANCE_ID", &self.instance_id);
        let output = run_with_input(command, b"", self.timeout)
            .await
            .map_err(|e| BootstrapError::handler(NAME, CLOUD_BOOTHOOK, e.to_string()))?;

        if !output.status.success() {
            return Err(BootstrapError::handler(
                NAME,
                CLOUD_BOOTHOOK,
                format!(
                    "{} exited with {:?}: {}",
                    path.display(),
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        info!("Ran boothook {}", path.display());
        Ok(())
    }
}
