/*!
 * Workflow executor.
 *
 * Interprets a declared step list. Steps run sequentially, parallel groups
 * concurrently; all share a working-memory map addressed by
 * `${stepId.field}` references. Per-step retries and timeouts are honoured
 * as declared.
 */

use super::{ContextBundle, ExecutionContext, Handler};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use rcrt_runner_core::jsonpath;
use rcrt_runner_core::models::{WorkflowConfig, WorkflowStep};
use rcrt_runner_core::{Breadcrumb, RunnerError};
use serde_json::{json, Map, Value as JsonValue};
use std::time::Duration;
use tracing::debug;

const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct WorkflowHandler {
    pub consumer_id: String,
    pub config: WorkflowConfig,
    pub ctx: ExecutionContext,
}

#[async_trait]
impl Handler for WorkflowHandler {
    async fn execute(
        &self,
        trigger: &Breadcrumb,
        _context: &ContextBundle,
    ) -> Result<JsonValue, RunnerError> {
        let mut memory = Map::new();
        memory.insert("trigger".to_string(), trigger.context.clone());

        for step in &self.config.steps {
            let snapshot = JsonValue::Object(memory.clone());
            let results = run_step(&self.ctx, step, snapshot).await?;
            for (id, value) in results {
                memory.insert(id, value);
            }
        }

        memory.remove("trigger");
        Ok(json!({"steps": JsonValue::Object(memory), "status": "success"}))
    }
}

/// Run one step against a memory snapshot, returning the `(step id, result)`
/// entries it produced. Parallel groups interpolate every branch against
/// the same pre-group snapshot.
fn run_step<'a>(
    ctx: &'a ExecutionContext,
    step: &'a WorkflowStep,
    memory: JsonValue,
) -> BoxFuture<'a, Result<Vec<(String, JsonValue)>, RunnerError>> {
    Box::pin(async move {
        match step {
            WorkflowStep::Tool {
                id,
                tool,
                input,
                retries,
                timeout_seconds,
            } => {
                let input = interpolate(input, &memory);
                let output = attempt(
                    retries.unwrap_or(0),
                    step_timeout(*timeout_seconds),
                    || ctx.call_tool(tool, input.clone(), Some(step_timeout(*timeout_seconds))),
                )
                .await
                .map_err(|e| step_error(id, e))?;
                debug!("Workflow step {} done", id);
                Ok(vec![(id.clone(), json!({"output": output, "status": "success"}))])
            }

            WorkflowStep::Llm {
                id,
                prompt,
                model,
                retries,
                timeout_seconds,
            } => {
                let prompt = interpolate_to_string(prompt, &memory);
                let mut input = json!({"messages": [{"role": "user", "content": prompt}]});
                if let Some(model) = model {
                    input["model"] = json!(model);
                }
                let output = attempt(
                    retries.unwrap_or(0),
                    step_timeout(*timeout_seconds),
                    || ctx.call_tool("openrouter", input.clone(), Some(step_timeout(*timeout_seconds))),
                )
                .await
                .map_err(|e| step_error(id, e))?;
                Ok(vec![(id.clone(), json!({"output": output, "status": "success"}))])
            }

            WorkflowStep::Parallel { id, steps } => {
                let branches = steps
                    .iter()
                    .map(|s| run_step(ctx, s, memory.clone()));
                let mut merged = Vec::new();
                for branch in join_all(branches).await {
                    merged.extend(branch.map_err(|e| step_error(id, e))?);
                }
                Ok(merged)
            }
        }
    })
}

fn step_timeout(declared: Option<u64>) -> Duration {
    declared.map(Duration::from_secs).unwrap_or(DEFAULT_STEP_TIMEOUT)
}

fn step_error(id: &str, e: RunnerError) -> RunnerError {
    RunnerError::Fatal(format!("step '{id}': {e}"))
}

async fn attempt<F, Fut>(retries: usize, timeout: Duration, f: F) -> Result<JsonValue, RunnerError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<JsonValue, RunnerError>>,
{
    let mut last = RunnerError::Fatal("no attempts made".into());
    for _ in 0..=retries {
        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => last = e,
            Err(_) => last = RunnerError::Timeout(timeout),
        }
    }
    Err(last)
}

// -- ${stepId.field} interpolation ------------------------------------------

/// Recursively interpolate every string in `value` against `memory`.
pub(crate) fn interpolate(value: &JsonValue, memory: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => interpolate_string(s, memory),
        JsonValue::Array(items) => {
            JsonValue::Array(items.iter().map(|v| interpolate(v, memory)).collect())
        }
        JsonValue::Object(fields) => JsonValue::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), interpolate(v, memory)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A string that is exactly one `${ref}` resolves to the referenced JSON
/// value; mixed text substitutes each reference inline. Unresolvable
/// references stay literal so failures are visible downstream.
pub(crate) fn interpolate_string(s: &str, memory: &JsonValue) -> JsonValue {
    if let Some(path) = sole_reference(s) {
        if let Some(value) = jsonpath::resolve(memory, path) {
            return value.clone();
        }
        return JsonValue::String(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let path = &after[..end];
        match jsonpath::resolve(memory, path) {
            Some(JsonValue::String(v)) => out.push_str(v),
            Some(other) => out.push_str(&other.to_string()),
            None => {
                out.push_str("${");
                out.push_str(path);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    JsonValue::String(out)
}

pub(crate) fn interpolate_to_string(s: &str, memory: &JsonValue) -> String {
    match interpolate_string(s, memory) {
        JsonValue::String(out) => out,
        other => other.to_string(),
    }
}

fn sole_reference(s: &str) -> Option<&str> {
    let stripped = s.strip_prefix("${")?.strip_suffix('}')?;
    if stripped.contains("${") || stripped.contains('}') {
        return None;
    }
    Some(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> JsonValue {
        json!({
            "trigger": {"content": "hello"},
            "fetch": {"output": {"items": [1, 2, 3], "count": 3}, "status": "success"}
        })
    }

    #[test]
    fn sole_reference_returns_typed_value() {
        let v = interpolate_string("${fetch.output.items}", &memory());
        assert_eq!(v, json!([1, 2, 3]));

        let n = interpolate_string("${fetch.output.count}", &memory());
        assert_eq!(n, json!(3));
    }

    #[test]
    fn mixed_text_substitutes_inline() {
        let v = interpolate_string("got ${fetch.output.count} items from ${trigger.content}", &memory());
        assert_eq!(v, json!("got 3 items from hello"));
    }

    #[test]
    fn unresolved_reference_stays_literal() {
        let v = interpolate_string("${missing.path}", &memory());
        assert_eq!(v, json!("${missing.path}"));

        let mixed = interpolate_string("x ${missing.path} y", &memory());
        assert_eq!(mixed, json!("x ${missing.path} y"));
    }

    #[test]
    fn interpolate_recurses_into_objects_and_arrays() {
        let input = json!({
            "query": "${trigger.content}",
            "nested": {"n": "${fetch.output.count}"},
            "list": ["${fetch.status}", "plain"]
        });
        let out = interpolate(&input, &memory());
        assert_eq!(
            out,
            json!({
                "query": "hello",
                "nested": {"n": 3},
                "list": ["success", "plain"]
            })
        );
    }

    #[test]
    fn unterminated_reference_is_kept() {
        let v = interpolate_string("broken ${fetch.output", &memory());
        assert_eq!(v, json!("broken ${fetch.output"));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_retries_then_surfaces_last_error() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let result = attempt(2, Duration::from_secs(1), || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err::<JsonValue, _>(RunnerError::Transient("boom".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
