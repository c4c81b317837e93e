//! Sequential workflow execution with result chaining.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::model::{CallToolResult, Content, JsonObject, RawContent};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::store::WorkflowStore;
use super::{WorkflowDefinition, WorkflowError, template};

/// Per-invocation binding of `input`, `vars`, and `results`. One context per
/// execution; concurrent invocations of the same workflow never share state.
pub struct ExecutionContext {
    pub input: Value,
    pub variables: Value,
    pub results: Value,
}

impl ExecutionContext {
    pub fn new(input: JsonObject) -> Self {
        Self {
            input: Value::Object(input),
            variables: Value::Object(serde_json::Map::new()),
            results: Value::Object(serde_json::Map::new()),
        }
    }
}

/// The executor's view of the front-end: availability checks and internal
/// tool dispatch.
#[async_trait]
pub trait InternalToolInvoker: Send + Sync {
    fn has_tool(&self, name: &str) -> bool;

    async fn call_tool_internal(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> anyhow::Result<CallToolResult>;
}

/// Validate invocation arguments against a workflow input schema.
///
/// Basic checks only: required fields must be present, provided fields must
/// match the declared `type` (`string`, `number`, `integer`, `boolean`,
/// `array`, `object`), and defaults fill in missing optional fields.
pub fn validate_input(
    schema: &Value,
    args: Option<JsonObject>,
) -> Result<JsonObject, WorkflowError> {
    let mut provided = args.unwrap_or_default();

    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !provided.contains_key(field) {
                return Err(WorkflowError::InvalidInput(format!(
                    "missing required field '{field}'"
                )));
            }
        }
    }

    for (field, prop) in &properties {
        match provided.get(field) {
            Some(value) => {
                if let Some(expected) = prop.get("type").and_then(Value::as_str) {
                    if !type_matches(expected, value) {
                        return Err(WorkflowError::InvalidInput(format!(
                            "field '{field}' must be of type {expected}"
                        )));
                    }
                }
            }
            None => {
                if let Some(default) = prop.get("default") {
                    provided.insert(field.clone(), default.clone());
                }
            }
        }
    }

    Ok(provided)
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// Runs workflows from the store against the front-end catalog.
pub struct WorkflowExecutor {
    store: Arc<WorkflowStore>,
    cancel: Option<CancellationToken>,
}

impl WorkflowExecutor {
    pub fn new(store: Arc<WorkflowStore>) -> Self {
        Self {
            store,
            cancel: None,
        }
    }

    /// Bind executions to a shutdown token; in-flight workflows stop
    /// between steps once it fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn store(&self) -> &Arc<WorkflowStore> {
        &self.store
    }

    /// Look up a workflow by name and execute it.
    pub async fn run(
        &self,
        name: &str,
        args: Option<JsonObject>,
        invoker: &dyn InternalToolInvoker,
    ) -> Result<CallToolResult, WorkflowError> {
        let def = self
            .store
            .get(name)
            .ok_or_else(|| WorkflowError::NotFound(name.to_string()))?;
        self.run_definition(&def, args, invoker).await
    }

    /// Execute one definition. Steps are strictly sequential; the first
    /// failing step ends the workflow with its result.
    pub async fn run_definition(
        &self,
        def: &WorkflowDefinition,
        args: Option<JsonObject>,
        invoker: &dyn InternalToolInvoker,
    ) -> Result<CallToolResult, WorkflowError> {
        let input = validate_input(&def.input_schema, args)?;
        let mut ctx = ExecutionContext::new(input);

        for step in &def.steps {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Ok(CallToolResult::error(vec![Content::text(format!(
                    "workflow '{}' cancelled before step '{}'",
                    def.name, step.id
                ))]));
            }

            let resolved = template::resolve_args(&step.args, &ctx)?;

            if !invoker.has_tool(&step.tool) {
                return Err(WorkflowError::UnknownStepTool {
                    step: step.id.clone(),
                    tool: step.tool.clone(),
                });
            }

            let arguments = match resolved {
                Value::Object(map) => Some(map),
                Value::Null => None,
                other => {
                    return Err(WorkflowError::InvalidInput(format!(
                        "step '{}' arguments must resolve to an object, got {other}",
                        step.id
                    )));
                }
            };

            debug!(workflow = %def.name, step = %step.id, tool = %step.tool, "dispatching step");
            let result = match invoker.call_tool_internal(&step.tool, arguments).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(workflow = %def.name, step = %step.id, error = %e, "step dispatch failed");
                    return Ok(CallToolResult::error(vec![Content::text(format!(
                        "step '{}' failed: {e}",
                        step.id
                    ))]));
                }
            };

            if result.is_error == Some(true) {
                debug!(workflow = %def.name, step = %step.id, "step returned an error; stopping");
                return Ok(result);
            }

            if let Some(key) = &step.store {
                let decoded = first_text_content(&result)
                    .map(|text| decode_stored(&text))
                    .unwrap_or(Value::Null);
                if let Value::Object(results) = &mut ctx.results {
                    results.insert(key.clone(), decoded);
                }
            }
        }

        let payload = serde_json::json!({
            "workflow": def.name,
            "results": ctx.results,
            "status": "completed",
        });
        Ok(CallToolResult::success(vec![Content::text(
            payload.to_string(),
        )]))
    }
}

fn first_text_content(result: &CallToolResult) -> Option<String> {
    result.content.iter().find_map(|content| {
        if let RawContent::Text(text) = &content.raw {
            Some(text.text.clone())
        } else {
            None
        }
    })
}

/// Stored step output: JSON when it parses, raw text otherwise.
fn decode_stored(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct ScriptedInvoker {
        tools: HashSet<String>,
        responses: HashMap<String, CallToolResult>,
        calls: Mutex<Vec<(String, Option<JsonObject>)>>,
    }

    impl ScriptedInvoker {
        fn new(tools: &[&str]) -> Self {
            Self {
                tools: tools.iter().map(|s| s.to_string()).collect(),
                responses: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn respond(mut self, tool: &str, text: &str) -> Self {
            self.responses.insert(
                tool.to_string(),
                CallToolResult::success(vec![Content::text(text.to_string())]),
            );
            self
        }

        fn respond_error(mut self, tool: &str, text: &str) -> Self {
            self.responses.insert(
                tool.to_string(),
                CallToolResult::error(vec![Content::text(text.to_string())]),
            );
            self
        }

        fn calls(&self) -> Vec<(String, Option<JsonObject>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InternalToolInvoker for ScriptedInvoker {
        fn has_tool(&self, name: &str) -> bool {
            self.tools.contains(name)
        }

        async fn call_tool_internal(
            &self,
            name: &str,
            arguments: Option<JsonObject>,
        ) -> anyhow::Result<CallToolResult> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            Ok(self
                .responses
                .get(name)
                .cloned()
                .unwrap_or_else(|| CallToolResult::success(vec![Content::text("ok")])))
        }
    }

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::new(Arc::new(WorkflowStore::in_memory()))
    }

    fn connect_cluster() -> WorkflowDefinition {
        serde_yaml_ng::from_str(
            r#"
name: connect_cluster
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
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn happy_path_chains_steps_and_stores_results() {
        let invoker = ScriptedInvoker::new(&["teleport_kube", "kubectl_context"])
            .respond("kubectl_context", r#"{"context": "prod-eu-1"}"#);
        let def = connect_cluster();

        let result = executor()
            .run_definition(
                &def,
                Some(json!({"cluster": "prod-eu"}).as_object().unwrap().clone()),
                &invoker,
            )
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));

        let calls = invoker.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "teleport_kube");
        assert_eq!(
            Value::Object(calls[0].1.clone().unwrap()),
            json!({"command": "login", "cluster": "prod-eu"})
        );
        assert_eq!(calls[1].0, "kubectl_context");
        assert_eq!(
            Value::Object(calls[1].1.clone().unwrap()),
            json!({"operation": "get"})
        );

        let text = first_text_content(&result).unwrap();
        let payload: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(payload["workflow"], "connect_cluster");
        assert_eq!(payload["status"], "completed");
        assert_eq!(
            payload["results"]["current_context"],
            json!({"context": "prod-eu-1"})
        );
    }

    #[tokio::test]
    async fn missing_template_variable_fails_before_any_dispatch() {
        let invoker = ScriptedInvoker::new(&["teleport_kube", "kubectl_context"]);
        let mut def = connect_cluster();
        def.steps[0].args = json!({"cluster": "{{ .input.missing }}"});
        // The required field is satisfied; the template itself is broken.
        let err = executor()
            .run_definition(
                &def,
                Some(json!({"cluster": "prod-eu"}).as_object().unwrap().clone()),
                &invoker,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::TemplateMissingKey(_)));
        assert!(invoker.calls().is_empty());
    }

    #[tokio::test]
    async fn identity_workflow_returns_exactly_its_input() {
        let invoker = ScriptedInvoker::new(&["echo"]);
        let def: WorkflowDefinition = serde_yaml_ng::from_str(
            r#"
name: identity
inputSchema:
  type: object
  properties:
    payload:
      type: object
steps:
  - id: only
    tool: echo
    args: "{{ .input.payload }}"
    store: echoed
"#,
        )
        .unwrap();

        let input = json!({"payload": {"k": "v", "n": 3}});
        let result = executor()
            .run_definition(
                &def,
                Some(input.as_object().unwrap().clone()),
                &invoker,
            )
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));

        // The step received the payload verbatim.
        let calls = invoker.calls();
        assert_eq!(
            Value::Object(calls[0].1.clone().unwrap()),
            json!({"k": "v", "n": 3})
        );
    }

    #[tokio::test]
    async fn step_error_result_stops_the_workflow() {
        let invoker = ScriptedInvoker::new(&["teleport_kube", "kubectl_context"])
            .respond_error("teleport_kube", "login denied");
        let def = connect_cluster();

        let result = executor()
            .run_definition(
                &def,
                Some(json!({"cluster": "prod-eu"}).as_object().unwrap().clone()),
                &invoker,
            )
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert_eq!(first_text_content(&result).as_deref(), Some("login denied"));
        // The second step never ran.
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn unknown_step_tool_is_an_error() {
        let invoker = ScriptedInvoker::new(&["teleport_kube"]);
        let def = connect_cluster();
        let err = executor()
            .run_definition(
                &def,
                Some(json!({"cluster": "prod"}).as_object().unwrap().clone()),
                &invoker,
            )
            .await
            .unwrap_err();
        match err {
            WorkflowError::UnknownStepTool { step, tool } => {
                assert_eq!(step, "ctx");
                assert_eq!(tool, "kubectl_context");
            }
            other => panic!("unexpected error: {other}"),
        }
        // The first step did run; only the unknown one failed.
        assert_eq!(invoker.calls().len(), 1);
    }

    #[tokio::test]
    async fn raw_text_results_are_stored_as_strings() {
        let invoker =
            ScriptedInvoker::new(&["shell"]).respond("shell", "not json at all");
        let def: WorkflowDefinition = serde_yaml_ng::from_str(
            r#"
name: raw_store
steps:
  - id: run
    tool: shell
    store: output
"#,
        )
        .unwrap();

        let result = executor()
            .run_definition(&def, None, &invoker)
            .await
            .unwrap();
        let payload: Value =
            serde_json::from_str(&first_text_content(&result).unwrap()).unwrap();
        assert_eq!(payload["results"]["output"], json!("not json at all"));
    }

    #[test]
    fn input_validation_rules() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string"},
                "count": {"type": "number", "default": 1},
                "deep": {"type": "object"},
                "flags": {"type": "array"},
                "dry_run": {"type": "boolean", "default": false}
            },
            "required": ["name"]
        });

        // Missing required field.
        let err = validate_input(&schema, None).unwrap_err();
        assert!(err.to_string().contains("missing required field 'name'"));

        // Wrong type.
        let err = validate_input(
            &schema,
            Some(json!({"name": 42}).as_object().unwrap().clone()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be of type string"));

        // Defaults fill in.
        let validated = validate_input(
            &schema,
            Some(json!({"name": "x"}).as_object().unwrap().clone()),
        )
        .unwrap();
        assert_eq!(validated.get("count"), Some(&json!(1)));
        assert_eq!(validated.get("dry_run"), Some(&json!(false)));

        // Provided values win over defaults.
        let validated = validate_input(
            &schema,
            Some(json!({"name": "x", "count": 9}).as_object().unwrap().clone()),
        )
        .unwrap();
        assert_eq!(validated.get("count"), Some(&json!(9)));
    }
}
