//! Key/value store for guest customization blobs
//!
//! Parses the line-oriented `[SECTION]` / `KEY = VALUE` format written by the
//! hypervisor into a customization spool. Keys are flattened to
//! `SECTION|KEY`, and repeated fields use an index suffix
//! (`DNS|NAMESERVER|1`, `DNS|NAMESERVER|2`, ...).

use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::BootstrapError;

/// Separator between the section, key and index parts of a key
pub const KEY_SEPARATOR: char = '|';

/// Ordered key/value lookup built from one customization blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    entries: Vec<(String, String)>,
}

impl ConfigFile {
    /// Parse a customization blob
    pub fn parse(text: &str) -> Result<Self, BootstrapError> {
        let mut entries: Vec<(String, String)> = Vec::new();
        let mut section: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if name.is_empty() {
                    return Err(BootstrapError::Parse(format!(
                        "line {}: empty section header",
                        lineno + 1
                    )));
                }
                section = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(BootstrapError::Parse(format!(
                    "line {}: expected [SECTION] or KEY = VALUE, got '{}'",
                    lineno + 1,
                    line
                )));
            };

            let Some(section) = &section else {
                return Err(BootstrapError::Parse(format!(
                    "line {}: key '{}' appears before any section",
                    lineno + 1,
                    key.trim()
                )));
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(BootstrapError::Parse(format!("line {}: empty key", lineno + 1)));
            }

            let full_key = format!("{section}{KEY_SEPARATOR}{key}");
            let value = value.trim().to_string();

            match entries.iter_mut().find(|(k, _)| *k == full_key) {
                Some(entry) => entry.1 = value,
                None => entries.push((full_key, value)),
            }
        }

        debug!("Parsed customization config with {} keys", entries.len());
        Ok(Self { entries })
    }

    /// Read and parse a customization file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Self::parse(&content)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty value for `key`
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// Boolean value (`yes/no`, `true/false`, `1/0`)
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)?.to_lowercase().as_str() {
            "yes" | "true" | "1" | "on" => Some(true),
            "no" | "false" | "0" | "off" => Some(false),
            _ => None,
        }
    }

    /// Comma separated list value
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of keys starting with `prefix`
    pub fn count_with_prefix(&self, prefix: &str) -> usize {
        self.entries.iter().filter(|(k, _)| k.starts_with(prefix)).count()
    }

    /// Values of a repeated field, `prefix|1` through `prefix|N`
    pub fn get_indexed(&self, prefix: &str) -> Vec<String> {
        let count = self.count_with_prefix(&format!("{prefix}{KEY_SEPARATOR}"));
        (1..=count)
            .filter_map(|i| self.get_non_empty(&format!("{prefix}{KEY_SEPARATOR}{i}")))
            .map(str::to_string)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
