//! Strict whole-value template substitution for step arguments.
//!
//! A template is a string whose entire (trimmed) content is `{{ … }}`; this
//! layer does not interpolate inside longer strings. References use dotted
//! paths rooted at `input`, `vars`, or `results` (an optional leading dot is
//! tolerated, Go-template style). Resolution is strict: a missing key fails
//! the step. A resolved string is re-parsed as JSON, then YAML, to restore
//! typed values; anything else passes through with its type intact.

use serde_json::Value;

use super::WorkflowError;
use super::executor::ExecutionContext;

/// Recursively substitute templates in `args`.
pub fn resolve_args(args: &Value, ctx: &ExecutionContext) -> Result<Value, WorkflowError> {
    match args {
        Value::String(s) => match template_expr(s) {
            Some(expr) => {
                let resolved = resolve_path(expr, ctx)?;
                Ok(match resolved {
                    Value::String(text) => retype(&text),
                    other => other,
                })
            }
            None => Ok(args.clone()),
        },
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve_args(value, ctx)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_args(item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

/// Extract the inner expression when the whole value is one template.
fn template_expr(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    // An embedded closer ("{{a}} and {{b}}") means this is not a single
    // whole-value template; leave it untouched.
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Walk a dotted path through the execution context.
fn resolve_path<'a>(expr: &str, ctx: &'a ExecutionContext) -> Result<Value, WorkflowError> {
    let path = expr.strip_prefix('.').unwrap_or(expr);
    let mut segments = path.split('.');

    let root = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WorkflowError::TemplateMissingKey(expr.to_string()))?;

    let mut current: &'a Value = match root {
        "input" => &ctx.input,
        "vars" => &ctx.variables,
        "results" => &ctx.results,
        _ => return Err(WorkflowError::TemplateMissingKey(expr.to_string())),
    };

    for segment in segments {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| WorkflowError::TemplateMissingKey(expr.to_string()))?,
            _ => return Err(WorkflowError::TemplateMissingKey(expr.to_string())),
        };
    }
    Ok(current.clone())
}

/// Restore typed values from rendered text: JSON first, YAML second, raw
/// string last.
fn retype(text: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return value;
    }
    if let Ok(value) = serde_yaml_ng::from_str::<Value>(text) {
        return value;
    }
    Value::String(text.to_string())
}
