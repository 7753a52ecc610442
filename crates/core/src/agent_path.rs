//! Agent path templates.
//!
//! Node attestors derive the path portion of an agent SPIFFE ID from a
//! configurable template populated with fields of the attested credential,
//! e.g. `/{{ PluginName }}/{{ Fingerprint }}`. Templates are compiled once at
//! configuration time; a template that does not compile is a configuration
//! error, while a template that references a field the credential does not
//! provide fails at render time.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{CoreError, Result};

/// Template used when a node attestor is not given one explicitly.
pub const DEFAULT_AGENT_PATH_TEMPLATE: &str = "/{{ PluginName }}/{{ Fingerprint }}";

const TEMPLATE_NAME: &str = "agent_path";

/// Compiled agent path template.
#[derive(Debug, Clone)]
pub struct AgentPathTemplate {
    source: String,
    registry: Handlebars<'static>,
}

impl AgentPathTemplate {
    /// Compile a template string.
    pub fn parse(source: &str) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(|e| {
                CoreError::Config(format!("failed to parse agent path template {source:?}: {e}"))
            })?;

        Ok(Self {
            source: source.to_string(),
            registry,
        })
    }

    /// Compile the default template.
    pub fn default_template() -> Result<Self> {
        Self::parse(DEFAULT_AGENT_PATH_TEMPLATE)
    }

    /// Compile `source` when given, otherwise the default template.
    pub fn parse_or_default(source: Option<&str>) -> Result<Self> {
        match source {
            Some(source) if !source.is_empty() => Self::parse(source),
            _ => Self::default_template(),
        }
    }

    /// Render the template against the attested credential's fields.
    pub fn render<T: Serialize>(&self, data: &T) -> Result<String> {
        self.registry
            .render(TEMPLATE_NAME, data)
            .map_err(|e| CoreError::Template(format!("{}: {e}", self.source)))
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_template_renders() {
        let tmpl = AgentPathTemplate::default_template().unwrap();
        let path = tmpl
            .render(&json!({ "PluginName": "x509pop", "Fingerprint": "ab/cd" }))
            .unwrap();
        // No HTML escaping of path characters
        assert_eq!(path, "/x509pop/ab/cd");
    }

    #[test]
    fn test_unparseable_template_is_config_error() {
        let err = AgentPathTemplate::parse("/{{ PluginName }/oops").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_field_fails_at_render() {
        let tmpl = AgentPathTemplate::parse("/{{ PluginName }}/{{ Hostname }}").unwrap();
        let err = tmpl.render(&json!({ "PluginName": "sshpop" })).unwrap_err();
        assert!(matches!(err, CoreError::Template(_)));
    }

    #[test]
    fn test_parse_or_default() {
        assert_eq!(
            AgentPathTemplate::parse_or_default(None).unwrap().source(),
            DEFAULT_AGENT_PATH_TEMPLATE
        );
        assert_eq!(
            AgentPathTemplate::parse_or_default(Some("")).unwrap().source(),
            DEFAULT_AGENT_PATH_TEMPLATE
        );
        assert_eq!(
            AgentPathTemplate::parse_or_default(Some("/{{ Hostname }}"))
                .unwrap()
                .source(),
            "/{{ Hostname }}"
        );
    }
}
