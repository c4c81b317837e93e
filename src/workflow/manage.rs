//! Workflow management tools.
//!
//! A fixed table of aggregator-owned tools for listing, inspecting, and
//! mutating workflow definitions. Every mutation validates structurally
//! before anything touches disk.

use rmcp::model::{CallToolResult, Content, JsonObject};
use serde_json::{Value, json};

use super::store::WorkflowStore;
use super::{WorkflowDefinition, validate_definition};
use crate::backend::ToolSpec;

pub const WORKFLOW_LIST: &str = "workflow_list";
pub const WORKFLOW_GET: &str = "workflow_get";
pub const WORKFLOW_CREATE: &str = "workflow_create";
pub const WORKFLOW_UPDATE: &str = "workflow_update";
pub const WORKFLOW_DELETE: &str = "workflow_delete";
pub const WORKFLOW_VALIDATE: &str = "workflow_validate";
pub const WORKFLOW_SPEC: &str = "workflow_spec";

pub const MANAGEMENT_TOOLS: &[&str] = &[
    WORKFLOW_LIST,
    WORKFLOW_GET,
    WORKFLOW_CREATE,
    WORKFLOW_UPDATE,
    WORKFLOW_DELETE,
    WORKFLOW_VALIDATE,
    WORKFLOW_SPEC,
];

pub fn is_management_tool(name: &str) -> bool {
    MANAGEMENT_TOOLS.contains(&name)
}

fn name_arg_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": {"type": "string", "description": "Workflow name"}
        },
        "required": ["name"]
    })
}

fn definition_arg_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "definition": {"type": "object", "description": "Workflow definition as a JSON object"},
            "yaml": {"type": "string", "description": "Workflow definition as YAML text"}
        }
    })
}

/// Tool descriptors for publication (the aggregator prefix is applied by
/// the reconciler).
pub fn management_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: WORKFLOW_LIST.to_string(),
            description: "List all workflow definitions".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolSpec {
            name: WORKFLOW_GET.to_string(),
            description: "Get one workflow definition by name".to_string(),
            input_schema: name_arg_schema(),
        },
        ToolSpec {
            name: WORKFLOW_CREATE.to_string(),
            description: "Create and persist a new workflow definition".to_string(),
            input_schema: definition_arg_schema(),
        },
        ToolSpec {
            name: WORKFLOW_UPDATE.to_string(),
            description: "Update and persist an existing workflow definition".to_string(),
            input_schema: definition_arg_schema(),
        },
        ToolSpec {
            name: WORKFLOW_DELETE.to_string(),
            description: "Delete a workflow definition".to_string(),
            input_schema: name_arg_schema(),
        },
        ToolSpec {
            name: WORKFLOW_VALIDATE.to_string(),
            description: "Structurally validate a workflow definition without persisting it"
                .to_string(),
            input_schema: definition_arg_schema(),
        },
        ToolSpec {
            name: WORKFLOW_SPEC.to_string(),
            description: "Describe the workflow YAML schema".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

/// Dispatch one management tool by its unprefixed name.
pub async fn handle(store: &WorkflowStore, tool: &str, args: Option<JsonObject>) -> CallToolResult {
    match tool {
        WORKFLOW_LIST => handle_list(store),
        WORKFLOW_GET => handle_get(store, args),
        WORKFLOW_CREATE => handle_create(store, args),
        WORKFLOW_UPDATE => handle_update(store, args),
        WORKFLOW_DELETE => handle_delete(store, args),
        WORKFLOW_VALIDATE => handle_validate(args),
        WORKFLOW_SPEC => success_text(WORKFLOW_SCHEMA_DOC.trim().to_string()),
        other => error_text(format!("unknown workflow management tool '{other}'")),
    }
}

fn handle_list(store: &WorkflowStore) -> CallToolResult {
    let listing: Vec<Value> = store
        .list()
        .iter()
        .map(|def| {
            json!({
                "name": def.name,
                "description": def.description,
                "steps": def.steps.len(),
            })
        })
        .collect();
    json_result(&json!({"workflows": listing}))
}

fn handle_get(store: &WorkflowStore, args: Option<JsonObject>) -> CallToolResult {
    let Some(name) = string_arg(&args, "name") else {
        return error_text("missing required argument 'name'".to_string());
    };
    match store.get(&name) {
        Some(def) => json_result(&serde_json::to_value(def.as_ref()).unwrap_or(Value::Null)),
        None => error_text(format!("workflow '{name}' not found")),
    }
}

fn handle_create(store: &WorkflowStore, args: Option<JsonObject>) -> CallToolResult {
    let def = match parse_definition(&args) {
        Ok(def) => def,
        Err(message) => return error_text(message),
    };
    match store.create(&def) {
        Ok(()) => success_text(format!("workflow '{}' created", def.name)),
        Err(e) => error_text(e.to_string()),
    }
}

fn handle_update(store: &WorkflowStore, args: Option<JsonObject>) -> CallToolResult {
    let def = match parse_definition(&args) {
        Ok(def) => def,
        Err(message) => return error_text(message),
    };
    match store.update(&def) {
        Ok(()) => success_text(format!("workflow '{}' updated", def.name)),
        Err(e) => error_text(e.to_string()),
    }
}

fn handle_delete(store: &WorkflowStore, args: Option<JsonObject>) -> CallToolResult {
    let Some(name) = string_arg(&args, "name") else {
        return error_text("missing required argument 'name'".to_string());
    };
    match store.delete(&name) {
        Ok(()) => success_text(format!("workflow '{name}' deleted")),
        Err(e) => error_text(e.to_string()),
    }
}

fn handle_validate(args: Option<JsonObject>) -> CallToolResult {
    match parse_definition(&args) {
        Ok(def) => match validate_definition(&def) {
            Ok(()) => json_result(&json!({"valid": true, "name": def.name})),
            Err(e) => json_result(&json!({"valid": false, "error": e.to_string()})),
        },
        Err(message) => json_result(&json!({"valid": false, "error": message})),
    }
}

/// Accept a definition as `definition` (object) or `yaml` (string).
fn parse_definition(args: &Option<JsonObject>) -> Result<WorkflowDefinition, String> {
    let Some(args) = args else {
        return Err("missing workflow definition".to_string());
    };

    if let Some(yaml) = args.get("yaml").and_then(Value::as_str) {
        return serde_yaml_ng::from_str(yaml).map_err(|e| format!("invalid workflow YAML: {e}"));
    }
    if let Some(definition) = args.get("definition") {
        return serde_json::from_value(definition.clone())
            .map_err(|e| format!("invalid workflow definition: {e}"));
    }
    Err("provide either 'definition' (object) or 'yaml' (string)".to_string())
}

fn string_arg(args: &Option<JsonObject>, key: &str) -> Option<String> {
    args.as_ref()?
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn json_result(value: &Value) -> CallToolResult {
    match serde_json::to_string_pretty(value) {
        Ok(text) => CallToolResult::success(vec![Content::text(text)]),
        Err(e) => error_text(e.to_string()),
    }
}

fn success_text(text: String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(text)])
}

fn error_text(text: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(text)])
}

const WORKFLOW_SCHEMA_DOC: &str = r#"
# Workflow definition schema

Top-level keys:
- name (required): ^[a-zA-Z][a-zA-Z0-9_]*$
- description: free text
- icon: optional display icon
- agentModifiable: optional bool
- inputSchema: {type: "object", properties: {<key>: {type, description, default?}}, required: [<key>...]}
  Defaults to {type: "object"} when absent.
- steps (required, non-empty): list of steps executed in order.

Each step:
- id (required): unique within the workflow
- tool (required): exposed tool name to invoke
- args: arguments; a string value of exactly "{{ <path> }}" is substituted
  from input.*, vars.*, or results.* before the call
- store: optional key binding the step result under results.<key>

Example:

name: connect_cluster
description: Log into a cluster and capture the active context
inputSchema:
  type: object
  properties:
    cluster:
      type: string
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
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::first_text;
    use std::sync::Arc;

    fn project_store() -> (tempfile::TempDir, Arc<WorkflowStore>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(WorkflowStore::new(
            None,
            Some(tmp.path().join("workflows")),
            None,
        ));
        store.load();
        (tmp, store)
    }

    fn args(value: Value) -> Option<JsonObject> {
        value.as_object().cloned()
    }

    #[tokio::test]
    async fn create_list_get_delete_cycle() {
        let (_tmp, store) = project_store();

        let result = handle(
            &store,
            WORKFLOW_CREATE,
            args(json!({"yaml": "name: demo\ndescription: example\nsteps:\n  - id: a\n    tool: t\n"})),
        )
        .await;
        assert_ne!(result.is_error, Some(true));

        let result = handle(&store, WORKFLOW_LIST, None).await;
        let listing: Value = serde_json::from_str(&first_text(&result).unwrap()).unwrap();
        assert_eq!(listing["workflows"][0]["name"], "demo");
        assert_eq!(listing["workflows"][0]["steps"], 1);

        let result = handle(&store, WORKFLOW_GET, args(json!({"name": "demo"}))).await;
        let def: Value = serde_json::from_str(&first_text(&result).unwrap()).unwrap();
        assert_eq!(def["description"], "example");

        let result = handle(&store, WORKFLOW_DELETE, args(json!({"name": "demo"}))).await;
        assert_ne!(result.is_error, Some(true));
        assert!(store.get("demo").is_none());
    }

    #[tokio::test]
    async fn create_rejects_invalid_definitions() {
        let (_tmp, store) = project_store();

        let result = handle(
            &store,
            WORKFLOW_CREATE,
            args(json!({"definition": {"name": "bad-name!", "steps": [{"id": "a", "tool": "t"}]}})),
        )
        .await;
        assert_eq!(result.is_error, Some(true));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn validate_reports_both_verdicts() {
        let (_tmp, store) = project_store();

        let result = handle(
            &store,
            WORKFLOW_VALIDATE,
            args(json!({"definition": {"name": "fine", "steps": [{"id": "a", "tool": "t"}]}})),
        )
        .await;
        let verdict: Value = serde_json::from_str(&first_text(&result).unwrap()).unwrap();
        assert_eq!(verdict["valid"], true);

        let result = handle(
            &store,
            WORKFLOW_VALIDATE,
            args(json!({"definition": {"name": "empty", "steps": []}})),
        )
        .await;
        let verdict: Value = serde_json::from_str(&first_text(&result).unwrap()).unwrap();
        assert_eq!(verdict["valid"], false);
        // Validation never persists anything.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn get_missing_and_bad_args_are_tool_errors() {
        let (_tmp, store) = project_store();

        let result = handle(&store, WORKFLOW_GET, args(json!({"name": "ghost"}))).await;
        assert_eq!(result.is_error, Some(true));

        let result = handle(&store, WORKFLOW_GET, None).await;
        assert_eq!(result.is_error, Some(true));

        let result = handle(&store, WORKFLOW_CREATE, args(json!({"yaml": ": not yaml"}))).await;
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn spec_returns_schema_documentation() {
        let (_tmp, store) = project_store();
        let result = handle(&store, WORKFLOW_SPEC, None).await;
        let text = first_text(&result).unwrap();
        assert!(text.contains("inputSchema"));
        assert!(text.contains("steps"));
    }

    #[test]
    fn tool_table_is_complete() {
        let specs = management_tool_specs();
        assert_eq!(specs.len(), MANAGEMENT_TOOLS.len());
        for spec in &specs {
            assert!(is_management_tool(&spec.name));
        }
        assert!(!is_management_tool("workflow_unknown"));
    }
}
