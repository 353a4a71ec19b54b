//! Template context building
//!
//! Builds the Jinja context from normalized instance metadata. Metadata keys
//! use dashes (`local-hostname`), which Jinja cannot address, so every
//! mapping also gets an underscore alias for each dashed key.

use minijinja::value::Value;
use serde_json::{Map, Value as Json};
use std::collections::HashMap;

use crate::datasources::metadata::Metadata;

/// Cloud name reported in `v1` when metadata names none
pub const DEFAULT_CLOUD_NAME: &str = "vmware";

/// Build the template context from instance metadata
///
/// * `ds.meta_data` – the full metadata tree
/// * `v1` – the standardized subset (`instance_id`, `local_hostname`, ...)
/// * every top-level metadata key, dashes replaced by underscores
pub fn build_context(metadata: &Metadata) -> HashMap<String, Value> {
    let safe = jinja_safe(&metadata.to_value());

    let mut ctx: HashMap<String, Value> = match &safe {
        Json::Object(map) => map
            .iter()
            .filter(|(key, _)| !key.contains('-'))
            .map(|(key, value)| (key.clone(), Value::from_serialize(value)))
            .collect(),
        _ => HashMap::new(),
    };

    ctx.insert(
        "ds".to_string(),
        Value::from_serialize(serde_json::json!({ "meta_data": safe })),
    );
    ctx.insert("v1".to_string(), build_v1_context(metadata));

    ctx
}

/// Standardized keys, stable across datasources
fn build_v1_context(metadata: &Metadata) -> Value {
    let mut v1 = HashMap::new();

    let str_of = |key: &str| metadata.get_str(key).map(str::to_string);

    v1.insert("instance_id", metadata.instance_id());
    v1.insert("local_hostname", str_of("local-hostname"));
    v1.insert("local_ipv4", str_of("local-ipv4"));
    v1.insert("local_ipv6", str_of("local-ipv6"));
    v1.insert(
        "cloud_name",
        Some(str_of("cloud-name").unwrap_or_else(|| DEFAULT_CLOUD_NAME.to_string())),
    );
    v1.insert("region", str_of("region"));
    v1.insert("availability_zone", str_of("availability-zone"));

    Value::from_serialize(&v1)
}

/// Copy of `value` where each mapping with dashed keys also carries the
/// underscore form of those keys
pub fn jinja_safe(value: &Json) -> Json {
    match value {
        Json::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let inner = jinja_safe(inner);
                if key.contains('-') {
                    out.entry(key.replace('-', "_")).or_insert_with(|| inner.clone());
                }
                out.insert(key.clone(), inner);
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(jinja_safe).collect()),
        other => other.clone(),
    }
}
