//! Instance metadata document
//!
//! Metadata arrives as JSON or YAML text from a transport and is held as a
//! JSON object. Normalization (network extraction, key cleanup, redaction
//! key selection) lives here; the controller decides when it runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::decode;
use crate::BootstrapError;

/// Metadata key listing transport keys to redact after reading
pub const REDACT_KEY: &str = "redact";

/// Legacy spelling of [`REDACT_KEY`]
pub const CLEANUP_KEY: &str = "cleanup";

/// Older guestinfo-specific form of [`CLEANUP_KEY`]
pub const CLEANUP_GUESTINFO_KEY: &str = "cleanup-guestinfo";

/// Which list wins when both redaction keys are present
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactPrecedence {
    /// `redact` wins, `cleanup` is only used when `redact` is absent
    #[default]
    Redact,
    /// `cleanup` wins
    Cleanup,
    /// Both lists are combined
    Union,
}

/// Parsed instance metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    data: Map<String, Value>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse JSON or YAML text; empty text gives empty metadata
    pub fn parse(text: &str) -> Result<Self, BootstrapError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let value: Value = serde_yaml::from_str(text)
            .map_err(|e| BootstrapError::Parse(format!("metadata: {e}")))?;

        match value {
            Value::Object(data) => Ok(Self { data }),
            Value::Null => Ok(Self::default()),
            other => Err(BootstrapError::Parse(format!(
                "metadata must be a mapping, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn from_map(data: Map<String, Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Cloned JSON value of the whole document
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Explicit `instance-id`, string or number
    pub fn instance_id(&self) -> Option<String> {
        match self.data.get("instance-id")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Pull `network` / `network.encoding` out and reinsert as `{"config": ..}`
    ///
    /// A mapping is copied as is. A string is decoded with its encoding tag and
    /// parsed as JSON/YAML. On failure the key is dropped and the error logged.
    pub fn extract_network(&mut self) {
        let raw = self.data.remove("network");
        let encoding = self.data.remove("network.encoding");

        let Some(raw) = raw else {
            return;
        };

        let config = match raw {
            Value::Object(map) => Value::Object(map),
            Value::String(text) => {
                let tag = encoding.as_ref().and_then(Value::as_str);
                match decode::decode_value("network", tag, &text).and_then(|t| parse_network(&t)) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Dropping unusable network config: {}", e);
                        return;
                    }
                }
            }
            other => {
                warn!("Ignoring network config of type {}", type_name(&other));
                return;
            }
        };

        let mut wrapped = Map::new();
        wrapped.insert("config".into(), config);
        self.data.insert("network".into(), Value::Object(wrapped));
    }

    /// Split a `public-keys` string into its non-empty lines
    pub fn normalize_public_keys(&mut self) {
        if let Some(Value::String(keys)) = self.data.get("public-keys") {
            let list: Vec<Value> = keys
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| Value::String(l.to_string()))
                .collect();
            self.data.insert("public-keys".into(), Value::Array(list));
        }
    }

    /// Keys the transport should redact
    pub fn redact_keys(&self, precedence: RedactPrecedence) -> Vec<String> {
        let redact = self.data.get(REDACT_KEY).map(key_list);
        let cleanup = [CLEANUP_KEY, CLEANUP_GUESTINFO_KEY]
            .iter()
            .filter_map(|key| self.data.get(*key).map(key_list))
            .reduce(|mut keys, more| {
                for key in more {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            });

        let keys = match (precedence, redact, cleanup) {
            (RedactPrecedence::Union, r, c) => {
                let mut keys = r.unwrap_or_default();
                for key in c.unwrap_or_default() {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
                keys
            }
            (RedactPrecedence::Redact, Some(r), _) => r,
            (RedactPrecedence::Cleanup, _, Some(c)) => c,
            (_, r, c) => r.or(c).unwrap_or_default(),
        };

        debug!("Keys to redact: {:?}", keys);
        keys
    }

    /// Network configuration, unwrapping a nested `network` key
    pub fn network_config(&self) -> Option<&Value> {
        let config = self.data.get("network")?.get("config")?;
        match config.get("network") {
            Some(inner) if inner.is_object() => Some(inner),
            _ => Some(config),
        }
    }

    /// Merge `other` into this document; keys already present win
    pub fn merge_missing(&mut self, other: &Value) {
        if let Value::Object(other) = other {
            merge_missing_map(&mut self.data, other);
        }
    }
}

fn merge_missing_map(base: &mut Map<String, Value>, other: &Map<String, Value>) {
    for (key, value) in other {
        match base.get_mut(key) {
            Some(Value::Object(existing)) => {
                if let Value::Object(incoming) = value {
                    merge_missing_map(existing, incoming);
                }
            }
            Some(_) => {}
            None => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn parse_network(text: &str) -> Result<Value, BootstrapError> {
    serde_yaml::from_str(text).map_err(|e| BootstrapError::Parse(format!("network config: {e}")))
}

/// A key list given either as a YAML list or a single string
fn key_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}
