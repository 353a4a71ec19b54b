//! YAML merging
//!
//! Used for configuration drop-ins (later files win) and for combining
//! cloud-config parts, where each part may steer list handling with a
//! `merge_how` / `merge_type` key.

use serde_yaml::Value;
use tracing::debug;

/// Keys that control merging and are not part of the merged result
pub const MERGE_KEYS: [&str; 2] = ["merge_how", "merge_type"];

/// Merge strategy for list fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMergeStrategy {
    /// Append new items to existing list
    Append,
    /// Prepend new items to existing list
    Prepend,
    /// Replace entire list
    #[default]
    Replace,
    /// No change (keep original)
    NoReplace,
}

impl ListMergeStrategy {
    /// Parse a single list setting
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "append" => Self::Append,
            "prepend" => Self::Prepend,
            "no_replace" | "noreplace" => Self::NoReplace,
            _ => Self::Replace,
        }
    }

    /// List strategy from a `merge_how` value
    ///
    /// Accepts the string form `list(append)+dict(recurse_array)+str()` and
    /// the list form `[{name: list, settings: [append]}]`. Anything without a
    /// list merger gives the default.
    pub fn from_merge_how(value: &Value) -> Self {
        match value {
            Value::String(spec) => spec
                .split('+')
                .find_map(|merger| {
                    let merger = merger.trim();
                    let settings = merger.strip_prefix("list(")?.strip_suffix(')')?;
                    Some(Self::from_settings(settings.split(',')))
                })
                .unwrap_or_default(),
            Value::Sequence(mergers) => mergers
                .iter()
                .find(|m| m.get("name").and_then(Value::as_str) == Some("list"))
                .map(|m| {
                    let settings = m
                        .get("settings")
                        .and_then(Value::as_sequence)
                        .map(|s| s.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                        .unwrap_or_default();
                    Self::from_settings(settings.into_iter())
                })
                .unwrap_or_default(),
            _ => Self::default(),
        }
    }

    fn from_settings<'a>(settings: impl Iterator<Item = &'a str>) -> Self {
        settings
            .map(Self::parse)
            .find(|s| *s != Self::Replace)
            .unwrap_or_default()
    }
}

/// Strategy requested by a document, and the document without merge keys
pub fn take_merge_how(mut value: Value) -> (Value, Option<ListMergeStrategy>) {
    let mut strategy = None;
    if let Value::Mapping(map) = &mut value {
        for key in MERGE_KEYS {
            if let Some(how) = map.remove(key) {
                strategy.get_or_insert(ListMergeStrategy::from_merge_how(&how));
            }
        }
    }
    (value, strategy)
}

/// Merge two YAML values recursively; `overlay` wins for scalars
pub fn merge_yaml_values(base: &Value, overlay: &Value, list_strategy: ListMergeStrategy) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut result = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let merged = match result.get(key) {
                    Some(base_value) => merge_yaml_values(base_value, overlay_value, list_strategy),
                    None => overlay_value.clone(),
                };
                result.insert(key.clone(), merged);
            }
            Value::Mapping(result)
        }

        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => match list_strategy {
            ListMergeStrategy::Append => {
                let mut result = base_seq.clone();
                result.extend(overlay_seq.iter().filter(|i| !base_seq.contains(*i)).cloned());
                Value::Sequence(result)
            }
            ListMergeStrategy::Prepend => {
                let mut result = overlay_seq.clone();
                result.extend(base_seq.iter().filter(|i| !overlay_seq.contains(*i)).cloned());
                Value::Sequence(result)
            }
            ListMergeStrategy::Replace => Value::Sequence(overlay_seq.clone()),
            ListMergeStrategy::NoReplace => Value::Sequence(base_seq.clone()),
        },

        (base_value, Value::Null) => base_value.clone(),

        (_, overlay_value) => overlay_value.clone(),
    }
}

/// Merge documents in order, later ones winning
pub fn merge_all(values: &[Value], list_strategy: ListMergeStrategy) -> Value {
    values.iter().fold(Value::Null, |acc, value| {
        debug!("Merging YAML document");
        if acc.is_null() {
            value.clone()
        } else {
            merge_yaml_values(&acc, value, list_strategy)
        }
    })
}
