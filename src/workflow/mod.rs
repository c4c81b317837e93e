//! YAML-defined multi-step tool pipelines.
//!
//! A workflow names a sequence of tool invocations with template-driven
//! argument wiring. Definitions live on disk (user and project directories,
//! project winning by name), are validated at load time, and are republished
//! as `action_<name>` tools whenever every step tool is present in the
//! catalog.

pub mod executor;
pub mod manage;
pub mod store;
pub mod template;

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object"})
}

fn default_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A workflow as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Whether agents may rewrite this workflow through the management
    /// tools. Informational; enforcement is the client's business.
    #[serde(
        default,
        rename = "agentModifiable",
        skip_serializing_if = "Option::is_none"
    )]
    pub agent_modifiable: Option<bool>,

    /// JSON-Schema-like object describing the workflow inputs.
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,

    pub steps: Vec<WorkflowStep>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    /// Unique within the workflow.
    pub id: String,

    /// Exposed tool name to invoke.
    pub tool: String,

    /// Possibly-templated arguments.
    #[serde(default = "default_args")]
    pub args: Value,

    /// Bind the step result under this key in `results.*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("workflow validation failed: {0}")]
    Validation(String),

    #[error("workflow '{0}' not found")]
    NotFound(String),

    #[error("workflow '{0}' is read-only")]
    ReadOnly(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("template references non-existent variable '{0}'")]
    TemplateMissingKey(String),

    #[error("step '{step}' references unknown tool '{tool}'")]
    UnknownStepTool { step: String, tool: String },

    #[error("failed to persist workflow '{name}': {reason}")]
    Persist { name: String, reason: String },
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-zA-Z][a-zA-Z0-9_]*$").expect("valid pattern"))
}

/// Structural validation applied at load time and before any persistence.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::Validation("name must not be empty".into()));
    }
    if !name_pattern().is_match(&def.name) {
        return Err(WorkflowError::Validation(format!(
            "name '{}' must match ^[a-zA-Z][a-zA-Z0-9_]*$",
            def.name
        )));
    }
    if !def.input_schema.is_object() {
        return Err(WorkflowError::Validation(
            "inputSchema must be an object".into(),
        ));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::Validation(
            "workflow must have at least one step".into(),
        ));
    }

    let mut seen = HashSet::new();
    for (index, step) in def.steps.iter().enumerate() {
        if step.id.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "step {index} has an empty id"
            )));
        }
        if step.tool.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "step '{}' has an empty tool",
                step.id
            )));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }
    Ok(())
}

/// A workflow is available iff every step tool is present in the catalog.
pub fn is_available(def: &WorkflowDefinition, tool_names: &HashSet<String>) -> bool {
    def.steps.iter().all(|step| tool_names.contains(&step.tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn definition_from_yaml(yaml: &str) -> WorkflowDefinition {
        serde_yaml_ng::from_str(yaml).expect("valid workflow yaml")
    }

    #[test]
    fn parses_full_yaml_shape() {
        let def = definition_from_yaml(
            r#"
name: connect_cluster
description: Log into a cluster and capture the active context
icon: "🔗"
agentModifiable: false
inputSchema:
  type: object
  properties:
    cluster:
      type: string
      description: Cluster to connect to
  required: [cluster]
steps:
  - id: login
    tool: teleport_kube
    args:
      command: login
      cluster: "{{ .input.cluster }}"
  - id: ctx
    tool: kubectl_context
    args:
      operation: get
    store: current_context
"#,
        );

        assert_eq!(def.name, "connect_cluster");
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[1].store.as_deref(), Some("current_context"));
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn input_schema_defaults_to_object() {
        let def = definition_from_yaml(
            r#"
name: minimal
steps:
  - id: only
    tool: some_tool
"#,
        );
        assert_eq!(def.input_schema, serde_json::json!({"type": "object"}));
        assert!(validate_definition(&def).is_ok());
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "1starts_with_digit", "has-dash", "has space"] {
            let def = WorkflowDefinition {
                name: name.to_string(),
                description: String::new(),
                version: None,
                icon: None,
                agent_modifiable: None,
                input_schema: default_input_schema(),
                steps: vec![WorkflowStep {
                    id: "a".into(),
                    tool: "t".into(),
                    args: default_args(),
                    store: None,
                }],
            };
            assert!(validate_definition(&def).is_err(), "name {name:?}");
        }
    }

    #[test]
    fn rejects_empty_steps_and_duplicate_ids() {
        let mut def = definition_from_yaml(
            r#"
name: dup
steps:
  - id: a
    tool: x
  - id: a
    tool: y
"#,
        );
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));

        def.steps.clear();
        let err = validate_definition(&def).unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn availability_tracks_the_catalog() {
        let def = definition_from_yaml(
            r#"
name: needs_tools
steps:
  - id: a
    tool: alpha
  - id: b
    tool: beta
"#,
        );
        let mut names: HashSet<String> = ["alpha".to_string()].into_iter().collect();
        assert!(!is_available(&def, &names));
        names.insert("beta".to_string());
        assert!(is_available(&def, &names));
    }
}
