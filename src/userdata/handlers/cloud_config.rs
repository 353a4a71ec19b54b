//! Cloud-config parts
//!
//! Every `#cloud-config` part of a walk is merged into one document, written
//! out when the walk ends. A part picks its list handling with `merge_how`
//! (or `merge_type`) in its body or a `Merge-Type` header.

use async_trait::async_trait;
use serde_yaml::Value;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

use super::{Frequency, HandlerSpec, PartHandler};
use crate::BootstrapError;
use crate::config::merge::{ListMergeStrategy, merge_yaml_values, take_merge_how};
use crate::userdata::document::Part;
use crate::userdata::types::CLOUD_CONFIG;

const NAME: &str = "cloud-config";

pub struct CloudConfigHandler {
    spec: HandlerSpec,
    output: PathBuf,
    merged: Value,
    parts: usize,
}

impl CloudConfigHandler {
    /// Handler writing the merged result to `output`
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            spec: HandlerSpec::new([CLOUD_CONFIG]).with_frequency(Frequency::Always),
            output: output.into(),
            merged: Value::Null,
            parts: 0,
        }
    }

    /// Merge result so far
    pub fn merged(&self) -> &Value {
        &self.merged
    }

    fn strategy_from_headers(part: &Part) -> Option<ListMergeStrategy> {
        ["merge-type", "merge-how"]
            .iter()
            .find_map(|name| part.header(name))
            .map(|how| ListMergeStrategy::from_merge_how(&Value::String(how.to_string())))
    }
}

#[async_trait]
impl PartHandler for CloudConfigHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    async fn begin(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
        self.merged = Value::Null;
        self.parts = 0;
        Ok(())
    }

    async fn handle_part(&mut self, part: &Part, _frequency: Frequency) -> Result<(), BootstrapError> {
        let doc: Value = serde_yaml::from_slice(&part.payload).map_err(|e| {
            BootstrapError::handler(NAME, part.content_type.as_str(), format!("invalid YAML: {e}"))
        })?;

        let (doc, how) = take_merge_how(doc);
        match doc {
            Value::Null => {
                debug!("Empty cloud-config part");
                return Ok(());
            }
            Value::Mapping(_) => {}
            _ => {
                return Err(BootstrapError::handler(
                    NAME,
                    part.content_type.as_str(),
                    "cloud-config is not a mapping",
                ));
            }
        }

        let strategy = how
            .or_else(|| Self::strategy_from_headers(part))
            .unwrap_or_default();

        self.merged = if self.merged.is_null() {
            doc
        } else {
            merge_yaml_values(&self.merged, &doc, strategy)
        };
        self.parts += 1;
        Ok(())
    }

    async fn end(&mut self, _frequency: Frequency) -> Result<(), BootstrapError> {
        if self.parts == 0 {
            return Ok(());
        }

        let body = serde_yaml::to_string(&self.merged)?;
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.output, format!("#cloud-config\n{body}")).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.output, std::fs::Permissions::from_mode(0o600)).await?;
        }

        info!(
            "Wrote cloud-config from {} part(s) to {}",
            self.parts,
            self.output.display()
        );
        Ok(())
    }
}
