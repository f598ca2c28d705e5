//! Virtual-tool engine (§4.E): executes an ordered recipe of upstream tool
//! calls against the Router, threading a context map through `${...}`
//! substitution between steps.

use std::collections::HashMap;

use serde_json::Value;

use crate::config::model::VirtualToolConfig;
use crate::error::GatewayResult;
use crate::router::Router;

/// Final return of [`execute`]: the last step's raw result (success path),
/// or a partial-results summary when a non-fatal error was captured along
/// the way.
#[derive(Debug, Clone)]
pub struct VirtualToolResult {
    pub result: Value,
    pub errors: Vec<(usize, String)>,
}

/// Run `vt`'s ops in strict sequence against `router`, seeding the context
/// with `input.*` from the caller's arguments.
///
/// # Errors
///
/// Returns the first step's error when `stop_on_error` is `true`; otherwise
/// never returns early — failures are folded into the final
/// [`VirtualToolResult::errors`] list instead.
pub async fn execute(router: &Router, vt: &VirtualToolConfig, arguments: Value) -> GatewayResult<VirtualToolResult> {
    let mut context: HashMap<String, Value> = HashMap::new();
    context.insert("input".to_string(), arguments);

    let mut errors = Vec::new();
    let mut last_result = Value::Null;

    for (i, op) in vt.ops.iter().enumerate() {
        let substituted = substitute(&op.args, &context);
        let outcome = run_one(router, &op.tool, substituted).await;

        match outcome {
            Ok(result) => {
                context.insert(format!("step_{i}"), result.clone());
                if let Some(data) = parse_text_content_as_json(&result) {
                    context.insert(format!("step_{i}_data"), data);
                }
                last_result = result;
            }
            Err(e) => {
                let message = e.to_string();
                errors.push((i, message.clone()));
                context.insert(
                    format!("step_{i}"),
                    serde_json::json!({ "error": message }),
                );
                if vt.stop_on_error {
                    return Err(e);
                }
            }
        }
    }

    Ok(VirtualToolResult { result: last_result, errors })
}

async fn run_one(router: &Router, tool: &str, args: Value) -> GatewayResult<Value> {
    let arguments = match args {
        Value::Object(map) => Some(map.into_iter().collect::<HashMap<_, _>>()),
        Value::Null => None,
        other => Some(HashMap::from([("value".to_string(), other)])),
    };
    router.call_tool(tool, arguments).await.map(|outcome| outcome.result)
}

/// If a tool result's content array's first element is `{type:"text", text}`
/// and that text parses as JSON, expose it under `step_N_data` so later ops
/// can address fields directly instead of re-parsing.
fn parse_text_content_as_json(result: &Value) -> Option<Value> {
    let text = result.get("content")?.as_array()?.first()?.get("text")?.as_str()?;
    serde_json::from_str(text).ok()
}

/// Replace any string value that matches `${name.path.parts}` in its
/// entirety with the dotted lookup into `context`. A value that is only
/// partially a substitution (e.g. `"prefix-${x}"`) is left as-is — the spec
/// defines substitution only for whole-value placeholders. Missing lookups
/// leave the literal placeholder untouched, to aid debugging.
fn substitute(args: &Value, context: &HashMap<String, Value>) -> Value {
    match args {
        Value::String(s) => substitute_string(s, context),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, context)).collect()),
        Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), substitute(v, context))).collect()),
        other => other.clone(),
    }
}

fn substitute_string(s: &str, context: &HashMap<String, Value>) -> Value {
    let Some(path) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) else {
        return Value::String(s.to_string());
    };

    let mut parts = path.split('.');
    let Some(root) = parts.next() else {
        return Value::String(s.to_string());
    };
    let Some(mut current) = context.get(root) else {
        return Value::String(s.to_string());
    };
    for part in parts {
        match current.get(part) {
            Some(next) => current = next,
            None => return Value::String(s.to_string()),
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_resolves_a_dotted_path() {
        let mut ctx = HashMap::new();
        ctx.insert("step_0_data".to_string(), serde_json::json!({ "content": "hi" }));
        let resolved = substitute(&serde_json::json!("${step_0_data.content}"), &ctx);
        assert_eq!(resolved, serde_json::json!("hi"));
    }

    #[test]
    fn substitution_leaves_missing_lookups_as_literal() {
        let ctx = HashMap::new();
        let resolved = substitute(&serde_json::json!("${missing.path}"), &ctx);
        assert_eq!(resolved, serde_json::json!("${missing.path}"));
    }

    #[test]
    fn substitution_recurses_into_nested_structures() {
        let mut ctx = HashMap::new();
        ctx.insert("input".to_string(), serde_json::json!({ "path": "/etc/motd" }));
        let resolved = substitute(&serde_json::json!({ "path": "${input.path}", "other": 1 }), &ctx);
        assert_eq!(resolved, serde_json::json!({ "path": "/etc/motd", "other": 1 }));
    }

    #[test]
    fn non_string_values_pass_through_untouched() {
        let ctx = HashMap::new();
        assert_eq!(substitute(&serde_json::json!(42), &ctx), serde_json::json!(42));
        assert_eq!(substitute(&serde_json::json!(true), &ctx), serde_json::json!(true));
    }

    #[test]
    fn text_content_parses_as_json_when_possible() {
        let result = serde_json::json!({ "content": [{ "type": "text", "text": "{\"content\":\"hi\"}" }] });
        let parsed = parse_text_content_as_json(&result);
        assert_eq!(parsed, Some(serde_json::json!({ "content": "hi" })));
    }

    #[test]
    fn text_content_that_is_not_json_yields_none() {
        let result = serde_json::json!({ "content": [{ "type": "text", "text": "not json" }] });
        assert_eq!(parse_text_content_as_json(&result), None);
    }
}
