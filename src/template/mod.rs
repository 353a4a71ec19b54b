//! Jinja2-compatible template rendering
//!
//! User-data parts starting with `## template: jinja` are rendered against
//! instance metadata before they are processed any further.

pub mod context;

pub use context::{build_context, jinja_safe};

use minijinja::{Environment, UndefinedBehavior};
use std::collections::HashMap;
use tracing::debug;

use crate::BootstrapError;
use crate::datasources::metadata::Metadata;

/// Check if content is a Jinja template (has the template marker)
pub fn is_jinja_template(content: &str) -> bool {
    let trimmed = content.trim_start().to_lowercase();
    trimmed.starts_with("## template: jinja") || trimmed.starts_with("## template:jinja")
}

/// Strip the marker line from a template
///
/// Content without the marker is returned unchanged.
pub fn strip_template_marker(content: &str) -> &str {
    if !is_jinja_template(content) {
        return content;
    }

    let trimmed = content.trim_start();
    match trimmed.find('\n') {
        Some(idx) => &trimmed[idx + 1..],
        None => "",
    }
}

/// Render a template against instance metadata
pub fn render_template(template: &str, metadata: &Metadata) -> Result<String, BootstrapError> {
    render_template_with_context(template, &build_context(metadata))
}

/// Render a template with a custom context
///
/// Undefined variables render as empty, attribute access on them fails.
pub fn render_template_with_context(
    template: &str,
    context: &HashMap<String, minijinja::Value>,
) -> Result<String, BootstrapError> {
    debug!("Rendering Jinja template");

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.set_keep_trailing_newline(true);

    env.add_template("user-data", strip_template_marker(template))
        .map_err(|e| BootstrapError::Parse(format!("template: {e}")))?;

    env.get_template("user-data")
        .and_then(|tmpl| tmpl.render(context))
        .map_err(|e| BootstrapError::Parse(format!("template render: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_metadata() -> Metadata {
        Metadata::parse("instance-id: i-0abc\nlocal-hostname: vm-01\nregion: dc1\n").unwrap()
    }

    #[test]
    fn test_is_jinja_template() {
        assert!(is_jinja_template("## template: jinja\n#cloud-config"));
        assert!(is_jinja_template("## template:jinja\n#cloud-config"));
        assert!(is_jinja_template("  ## Template: Jinja\n"));
        assert!(!is_jinja_template("#cloud-config\nhostname: test"));
        assert!(!is_jinja_template("#!/bin/bash"));
    }

    #[test]
    fn test_strip_template_marker() {
        assert_eq!(
            strip_template_marker("## template: jinja\n#cloud-config\nhostname: test"),
            "#cloud-config\nhostname: test"
        );
        assert_eq!(
            strip_template_marker("## template: jinja   \r\n#!/bin/sh"),
            "#!/bin/sh"
        );
        assert_eq!(
            strip_template_marker("#cloud-config\nhostname: test"),
            "#cloud-config\nhostname: test"
        );
    }

    #[test]
    fn test_render_top_level_variable() {
        let template = "## template: jinja\n#cloud-config\nhostname: {{ local_hostname }}\n";
        let rendered = render_template(template, &test_metadata()).unwrap();
        assert_eq!(rendered, "#cloud-config\nhostname: vm-01\n");
    }

    #[test]
    fn test_render_ds_and_v1() {
        let template = "## template: jinja\n{{ ds.meta_data.instance_id }} {{ ds.meta_data['local-hostname'] }} {{ v1.region }}";
        let rendered = render_template(template, &test_metadata()).unwrap();
        assert_eq!(rendered, "i-0abc vm-01 dc1");
    }

    #[test]
    fn test_render_conditional() {
        let template = r#"## template: jinja
#cloud-config
{% if instance_id %}
hostname: {{ local_hostname }}
{% else %}
hostname: default
{% endif %}"#;

        let rendered = render_template(template, &test_metadata()).unwrap();
        assert!(rendered.contains("hostname: vm-01"));
        assert!(!rendered.contains("default"));
    }

    #[test]
    fn test_render_custom_context() {
        let mut ctx = HashMap::new();
        ctx.insert("custom".to_string(), minijinja::Value::from("value"));

        let rendered = render_template_with_context("## template: jinja\n{{ custom }}", &ctx).unwrap();
        assert_eq!(rendered, "value");
    }

    #[test]
    fn test_render_missing_variable() {
        let template = "## template: jinja\nvalue: {{ missing_var }}";
        let rendered = render_template(template, &Metadata::new()).unwrap();
        assert_eq!(rendered, "value: ");
    }

    #[test]
    fn test_render_invalid_syntax() {
        let template = "## template: jinja\nvalue: {{ invalid";
        let result = render_template(template, &Metadata::new());
        assert!(matches!(result, Err(BootstrapError::Parse(_))));
    }
}
