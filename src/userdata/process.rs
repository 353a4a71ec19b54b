//! User-data processing
//!
//! Flattens a parsed part tree into a [`Document`] of dispatchable leaf
//! parts: placeholder types are sniffed, gzip parts inflated, includes
//! fetched, archives exploded, templates rendered and PGP messages
//! decrypted. Everything that fails below the document level is logged and
//! dropped so one bad part never costs the rest of the user-data.

use serde_yaml::Value;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::document::{Document, Part, parse_document};
use super::include::{Fetcher, HttpFetcher, IncludeCache, fetch_or_empty, include_urls};
use super::types::{CLOUD_CONFIG, ContentType};
use crate::BootstrapError;
use crate::command::run_with_input;
use crate::config::UserDataConfig;
use crate::datasources::decode::decompress_if_needed;
use crate::datasources::metadata::Metadata;
use crate::template::render_template;

/// Archive entry keys that are not copied as headers
const ARCHIVE_RESERVED: [&str; 6] = [
    "content",
    "filename",
    "type",
    "launch-index",
    "content-disposition",
    "content-type",
];

type WalkFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Resolves raw user-data into a flat [`Document`]
pub struct UserDataProcessor {
    fetcher: Arc<dyn Fetcher>,
    cache: Option<IncludeCache>,
    metadata: Metadata,
    gpg: String,
    gpg_timeout: Duration,
    max_depth: usize,
}

impl UserDataProcessor {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        let defaults = UserDataConfig::default();
        Self {
            fetcher,
            cache: None,
            metadata: Metadata::new(),
            gpg: defaults.gpg,
            gpg_timeout: Duration::from_secs(defaults.external_handler_timeout_secs),
            max_depth: defaults.max_include_depth,
        }
    }

    /// Processor with an HTTP fetcher built from `config`
    pub fn from_config(config: &UserDataConfig) -> Result<Self, BootstrapError> {
        let fetcher = HttpFetcher::from_config(config)?;
        Ok(Self::new(Arc::new(fetcher))
            .with_gpg(config.gpg.clone())
            .with_max_depth(config.max_include_depth))
    }

    /// Enable the `#include-once` cache under `dir`
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache = Some(IncludeCache::new(dir));
        self
    }

    /// Metadata that Jinja templates render against
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_gpg(mut self, program: impl Into<String>) -> Self {
        self.gpg = program.into();
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Parse and resolve `raw`
    ///
    /// Only a blob that cannot be parsed at all is an error.
    pub async fn process(&self, raw: &[u8]) -> Result<Document, BootstrapError> {
        let mut document = Document::new();
        if raw.iter().all(u8::is_ascii_whitespace) {
            debug!("No user-data to process");
            return Ok(document);
        }

        let root = parse_document(raw)?;
        self.walk(root, &mut document, 0).await;

        info!("User-data resolved to {} part(s)", document.len());
        Ok(document)
    }

    fn walk<'a>(&'a self, part: Part, document: &'a mut Document, depth: usize) -> WalkFuture<'a> {
        Box::pin(async move {
            if part.is_multipart() {
                for child in part.children {
                    self.walk(child, document, depth).await;
                }
                return;
            }

            let part = resolve_type(part);
            match part.kind() {
                Some(ContentType::IncludeUrl | ContentType::IncludeOnceUrl) => {
                    self.include(&part, document, depth).await
                }
                Some(ContentType::CloudConfigArchive) => explode_archive(&part, document),
                Some(ContentType::JinjaTemplate) => match render_template(&part.text(), &self.metadata) {
                    Ok(rendered) => {
                        self.descend(&part, rendered.as_bytes(), document, depth).await
                    }
                    Err(e) => warn!("Dropping template {}: {}", display_name(&part), e),
                },
                Some(ContentType::PgpArmored) => match self.decrypt(&part.payload).await {
                    Ok(plain) => self.descend(&part, &plain, document, depth).await,
                    Err(e) => warn!("Dropping encrypted part {}: {}", display_name(&part), e),
                },
                _ => document.attach(part),
            }
        })
    }

    /// Parse content derived from `origin` and walk it one level deeper
    ///
    /// A derived blob that is a single plain part keeps the origin's
    /// filename and headers.
    async fn descend(&self, origin: &Part, data: &[u8], document: &mut Document, depth: usize) {
        if depth >= self.max_depth {
            warn!(
                "Skipping content from {}: nested deeper than {}",
                display_name(origin),
                self.max_depth
            );
            return;
        }
        if data.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match parse_document(data) {
            Ok(mut nested) => {
                if !nested.is_multipart() {
                    nested.filename = origin.filename.clone();
                    nested.headers = origin.headers.clone();
                }
                self.walk(nested, document, depth + 1).await;
            }
            Err(e) => warn!("Unparsable content from {}: {}", display_name(origin), e),
        }
    }

    async fn include(&self, part: &Part, document: &mut Document, depth: usize) {
        if depth >= self.max_depth {
            warn!(
                "Skipping include {}: nested deeper than {}",
                display_name(part),
                self.max_depth
            );
            return;
        }
        let once_by_default = part.kind() == Some(ContentType::IncludeOnceUrl);

        for (url, once) in include_urls(&part.text(), once_by_default) {
            let content = match (&self.cache, once) {
                (Some(cache), true) => cache.get_or_fetch(&url, self.fetcher.as_ref()).await,
                _ => fetch_or_empty(&url, self.fetcher.as_ref())
                    .await
                    .unwrap_or_default(),
            };

            debug!("Include {} gave {} bytes", url, content.len());
            let origin = Part::new(part.content_type.as_str(), Vec::new()).with_filename(url);
            self.descend(&origin, &content, document, depth).await;
        }
    }

    async fn decrypt(&self, armored: &[u8]) -> Result<Vec<u8>, BootstrapError> {
        let mut command = Command::new(&self.gpg);
        command.args(["--batch", "--quiet", "--decrypt"]);

        let output = run_with_input(command, armored, self.gpg_timeout).await?;
        if !output.status.success() {
            return Err(BootstrapError::Command(format!(
                "{} exited with {:?}: {}",
                self.gpg,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

/// Settle the real type of a leaf part
fn resolve_type(mut part: Part) -> Part {
    match part.kind() {
        Some(ContentType::Gzip) => match decompress_if_needed(&part.payload) {
            Ok(inflated) => {
                part.payload = inflated;
                if let Some(kind) = ContentType::sniff(&part.payload) {
                    part.content_type = kind.mime_type().to_string();
                }
            }
            Err(e) => warn!("Failed to inflate {}: {}", display_name(&part), e),
        },
        Some(kind) if kind.is_placeholder() => {
            if let Some(sniffed) = ContentType::sniff(&part.payload) {
                debug!("Sniffed {} as {}", display_name(&part), sniffed);
                part.content_type = sniffed.mime_type().to_string();
            }
        }
        _ => {}
    }
    part
}

/// Attach every entry of a `#cloud-config-archive` part
fn explode_archive(part: &Part, document: &mut Document) {
    let entries: Value = match serde_yaml::from_slice(&part.payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Invalid cloud-config archive {}: {}", display_name(part), e);
            return;
        }
    };
    let Value::Sequence(entries) = entries else {
        warn!("Cloud-config archive {} is not a list", display_name(part));
        return;
    };

    for entry in entries {
        match archive_entry(entry) {
            Some(part) => document.attach(part),
            None => debug!("Skipping archive entry that is neither text nor a mapping"),
        }
    }
}

fn archive_entry(entry: Value) -> Option<Part> {
    let map = match entry {
        Value::String(content) => {
            let kind = ContentType::sniff(content.as_bytes())
                .map(|k| k.mime_type())
                .unwrap_or(CLOUD_CONFIG);
            return Some(Part::new(kind, content));
        }
        Value::Mapping(map) => map,
        _ => return None,
    };

    let field = |name: &str| map.get(name).and_then(scalar_string);
    let content = field("content").unwrap_or_default();
    let content_type = field("type").unwrap_or_else(|| {
        ContentType::sniff(content.as_bytes())
            .map(|k| k.mime_type())
            .unwrap_or(CLOUD_CONFIG)
            .to_string()
    });

    let mut part = Part::new(content_type, content);
    part.filename = field("filename");

    for (key, value) in &map {
        let (Some(key), Some(value)) = (key.as_str(), scalar_string(value)) else {
            continue;
        };
        if !ARCHIVE_RESERVED.contains(&key.to_lowercase().as_str()) {
            part = part.with_header(key, value);
        }
    }

    Some(part)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn display_name(part: &Part) -> String {
    match &part.filename {
        Some(name) => format!("'{}' ({})", name, part.content_type),
        None => part.content_type.clone(),
    }
}
