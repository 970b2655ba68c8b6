/*!
 * Tool executor.
 *
 * Tools are locally registered async functions keyed by name. A `tool.v1`
 * consumer definition binds a name to its trigger selectors; inputs are
 * validated against the tool's declared JSON schema before invocation.
 * Every tool receives the shared [`ExecutionContext`] so it can itself
 * orchestrate downstream tools over the bus.
 */

use super::{ContextBundle, ExecutionContext, Handler};
use crate::rcrt_client::SearchQuery;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use rcrt_runner_core::models::{Capabilities, ToolConfig};
use rcrt_runner_core::{Breadcrumb, BreadcrumbCreate, RunnerError};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub type ToolFn =
    Arc<dyn Fn(JsonValue, ExecutionContext) -> BoxFuture<'static, Result<JsonValue, RunnerError>> + Send + Sync>;

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolFn>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-loaded with the builtin tool set.
    pub fn with_builtins() -> Self {
        let registry = ToolRegistry::new();
        registry.register("echo", |input, _ctx| {
            Box::pin(async move { Ok(input) })
        });
        registry.register("get_time", |_input, _ctx| {
            Box::pin(async move { Ok(json!({"now": Utc::now().to_rfc3339()})) })
        });
        registry.register("breadcrumb_search", |input, ctx| {
            Box::pin(async move { breadcrumb_search(input, ctx).await })
        });
        registry.register("breadcrumb_create", |input, ctx| {
            Box::pin(async move { breadcrumb_create(input, ctx).await })
        });
        registry.register("breadcrumb_delete", |input, ctx| {
            Box::pin(async move { breadcrumb_delete(input, ctx).await })
        });
        registry.register("openrouter", |input, ctx| {
            Box::pin(async move { openrouter(input, ctx).await })
        });
        registry
    }

    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(JsonValue, ExecutionContext) -> BoxFuture<'static, Result<JsonValue, RunnerError>>
            + Send
            + Sync
            + 'static,
    {
        self.tools
            .write()
            .expect("tool registry lock")
            .insert(name.to_string(), Arc::new(f));
    }

    pub fn get(&self, name: &str) -> Option<ToolFn> {
        self.tools.read().expect("tool registry lock").get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("tool registry lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

pub struct ToolHandler {
    pub config: ToolConfig,
    pub capabilities: Capabilities,
    pub ctx: ExecutionContext,
    pub registry: Arc<ToolRegistry>,
}

#[async_trait]
impl Handler for ToolHandler {
    async fn execute(
        &self,
        trigger: &Breadcrumb,
        _context: &ContextBundle,
    ) -> Result<JsonValue, RunnerError> {
        // An emit-stripped consumer must not write through a tool either;
        // builtins like breadcrumb_create create records mid-handler, so
        // refuse before the function runs.
        if !self.capabilities.emit {
            return Err(RunnerError::Validation(format!(
                "tool '{}' requires the emit capability",
                self.config.tool
            )));
        }
        if self.config.requires_delete && !self.capabilities.delete {
            return Err(RunnerError::Validation(format!(
                "tool '{}' requires the delete capability",
                self.config.tool
            )));
        }

        let input = trigger
            .context
            .get("input")
            .cloned()
            .unwrap_or_else(|| json!({}));

        if let Some(schema) = &self.config.input_schema {
            validate_input(schema, &input)?;
        }

        let tool = self.registry.get(&self.config.tool).ok_or_else(|| {
            RunnerError::Validation(format!("unknown tool '{}'", self.config.tool))
        })?;

        debug!("Running tool {}", self.config.tool);
        tool(input, self.ctx.clone()).await
    }
}

/// Minimal JSON-schema check: top-level `type`, `required` and per-property
/// `type`. Enough to reject malformed tool requests before they run.
pub fn validate_input(schema: &JsonValue, input: &JsonValue) -> Result<(), RunnerError> {
    if let Some(expected) = schema.get("type").and_then(|v| v.as_str()) {
        if !type_matches(expected, input) {
            return Err(RunnerError::Validation(format!(
                "input is not of type '{expected}'"
            )));
        }
    }

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for field in required.iter().filter_map(|v| v.as_str()) {
            if input.get(field).is_none() {
                return Err(RunnerError::Validation(format!(
                    "missing required field '{field}'"
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|v| v.as_object()) {
        for (name, property) in properties {
            let Some(value) = input.get(name) else { continue };
            if let Some(expected) = property.get("type").and_then(|v| v.as_str()) {
                if !type_matches(expected, value) {
                    return Err(RunnerError::Validation(format!(
                        "field '{name}' is not of type '{expected}'"
                    )));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &JsonValue) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

// -- Builtins ---------------------------------------------------------------

async fn breadcrumb_search(
    input: JsonValue,
    ctx: ExecutionContext,
) -> Result<JsonValue, RunnerError> {
    let query = SearchQuery {
        schema_name: input
            .get("schema_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        tags: input
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default(),
        limit: input.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize),
        include_context: input
            .get("include_context")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    };
    let items = ctx.client.search(&query).await?;
    Ok(serde_json::to_value(items)?)
}

async fn breadcrumb_create(
    input: JsonValue,
    ctx: ExecutionContext,
) -> Result<JsonValue, RunnerError> {
    let schema_name = input
        .get("schema_name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RunnerError::Validation("schema_name is required".into()))?;
    let mut tags: Vec<String> = input
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    if !tags.contains(&ctx.workspace) {
        tags.push(ctx.workspace.clone());
    }

    let created = ctx
        .client
        .create(
            &BreadcrumbCreate {
                schema_name: schema_name.to_string(),
                title: input
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or(schema_name)
                    .to_string(),
                tags,
                context: input.get("context").cloned().unwrap_or_else(|| json!({})),
                ttl: None,
                visibility: None,
                sensitivity: None,
            },
            None,
        )
        .await?;
    Ok(json!({"id": created.id, "version": created.version}))
}

async fn breadcrumb_delete(
    input: JsonValue,
    ctx: ExecutionContext,
) -> Result<JsonValue, RunnerError> {
    let id = input
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
        .ok_or_else(|| RunnerError::Validation("id must be a breadcrumb uuid".into()))?;
    ctx.client.delete(id).await?;
    Ok(json!({"deleted": id}))
}

/// LLM chat completion via an OpenRouter-style endpoint. The API key comes
/// from the store's secret vault, never from the environment.
async fn openrouter(input: JsonValue, ctx: ExecutionContext) -> Result<JsonValue, RunnerError> {
    let messages = input
        .get("messages")
        .cloned()
        .ok_or_else(|| RunnerError::Validation("messages is required".into()))?;
    let model = input
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("openrouter/auto");

    let secret = ctx
        .client
        .get_secret_by_name("openrouter_api_key", "llm")
        .await?;

    let mut body = json!({"model": model, "messages": messages});
    if let Some(temperature) = input.get("temperature") {
        body["temperature"] = temperature.clone();
    }

    let response = reqwest::Client::new()
        .post("https://openrouter.ai/api/v1/chat/completions")
        .bearer_auth(&secret.value)
        .json(&body)
        .send()
        .await
        .map_err(|e| RunnerError::Transient(format!("openrouter: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(RunnerError::from_status(status.as_u16(), text));
    }

    let parsed: JsonValue = response
        .json()
        .await
        .map_err(|e| RunnerError::Transient(format!("openrouter decode: {e}")))?;
    let content = parsed
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .cloned()
        .unwrap_or(JsonValue::Null);

    Ok(json!({
        "content": content,
        "model": parsed.get("model").cloned().unwrap_or(json!(model)),
        "usage": parsed.get("usage").cloned().unwrap_or(JsonValue::Null),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::EventBridge;
    use crate::rcrt_client::RcrtClient;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_ctx() -> ExecutionContext {
        ExecutionContext {
            client: Arc::new(RcrtClient::unconnected("http://localhost:9")),
            bridge: Arc::new(EventBridge::new()),
            workspace: "workspace:test".to_string(),
            agent_id: "test-runner".to_string(),
            wait_timeout: Duration::from_secs(1),
        }
    }

    fn request_trigger(context: JsonValue) -> Breadcrumb {
        Breadcrumb {
            id: Uuid::new_v4(),
            schema_name: "tool.request.v1".into(),
            title: None,
            tags: vec!["tool:request".into()],
            context,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: None,
            ttl: None,
            visibility: None,
            sensitivity: None,
            embedding: None,
        }
    }

    fn empty_bundle(trigger: &Breadcrumb) -> ContextBundle {
        ContextBundle {
            trigger: Arc::new(trigger.clone()),
            buckets: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn echo_round_trips_its_input() {
        let handler = ToolHandler {
            config: ToolConfig {
                tool: "echo".into(),
                input_schema: Some(json!({"type": "object"})),
                description: None,
                requires_delete: false,
            },
            capabilities: Capabilities::default(),
            ctx: test_ctx(),
            registry: Arc::new(ToolRegistry::with_builtins()),
        };
        let trigger = request_trigger(json!({"tool": "echo", "input": {"x": 1}, "requestId": "r-1"}));
        let out = handler.execute(&trigger, &empty_bundle(&trigger)).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn schema_violation_is_rejected_before_invocation() {
        let handler = ToolHandler {
            config: ToolConfig {
                tool: "echo".into(),
                input_schema: Some(json!({"type": "object", "required": ["x"]})),
                description: None,
                requires_delete: false,
            },
            capabilities: Capabilities::default(),
            ctx: test_ctx(),
            registry: Arc::new(ToolRegistry::with_builtins()),
        };
        let trigger = request_trigger(json!({"tool": "echo", "input": {}}));
        let err = handler.execute(&trigger, &empty_bundle(&trigger)).await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let handler = ToolHandler {
            config: ToolConfig {
                tool: "does-not-exist".into(),
                input_schema: None,
                description: None,
                requires_delete: false,
            },
            capabilities: Capabilities::default(),
            ctx: test_ctx(),
            registry: Arc::new(ToolRegistry::with_builtins()),
        };
        let trigger = request_trigger(json!({"tool": "does-not-exist", "input": {}}));
        let err = handler.execute(&trigger, &empty_bundle(&trigger)).await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[tokio::test]
    async fn emitless_consumer_cannot_run_tools() {
        let handler = ToolHandler {
            config: ToolConfig {
                tool: "breadcrumb_create".into(),
                input_schema: None,
                description: None,
                requires_delete: false,
            },
            capabilities: Capabilities { emit: false, delete: false },
            ctx: test_ctx(),
            registry: Arc::new(ToolRegistry::with_builtins()),
        };
        let trigger = request_trigger(json!({
            "tool": "breadcrumb_create",
            "input": {"schema_name": "note.v1", "context": {"content": "x"}}
        }));
        let err = handler.execute(&trigger, &empty_bundle(&trigger)).await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[tokio::test]
    async fn destructive_tool_needs_the_delete_capability() {
        let handler = ToolHandler {
            config: ToolConfig {
                tool: "breadcrumb_delete".into(),
                input_schema: None,
                description: None,
                requires_delete: true,
            },
            // Default capabilities: emit yes, delete no.
            capabilities: Capabilities::default(),
            ctx: test_ctx(),
            registry: Arc::new(ToolRegistry::with_builtins()),
        };
        let trigger = request_trigger(json!({
            "tool": "breadcrumb_delete",
            "input": {"id": Uuid::new_v4().to_string()}
        }));
        let err = handler.execute(&trigger, &empty_bundle(&trigger)).await.unwrap_err();
        assert!(matches!(err, RunnerError::Validation(_)));
    }

    #[test]
    fn builtin_registry_has_the_expected_tools() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec![
                "breadcrumb_create",
                "breadcrumb_delete",
                "breadcrumb_search",
                "echo",
                "get_time",
                "openrouter"
            ]
        );
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn validation_checks_required_fields() {
        let schema = json!({
            "type": "object",
            "required": ["x"],
            "properties": {"x": {"type": "number"}, "label": {"type": "string"}}
        });
        assert!(validate_input(&schema, &json!({"x": 1})).is_ok());
        assert!(validate_input(&schema, &json!({"x": 1, "label": "a"})).is_ok());
        assert!(validate_input(&schema, &json!({})).is_err());
        assert!(validate_input(&schema, &json!({"x": "one"})).is_err());
        assert!(validate_input(&schema, &json!({"x": 1, "label": 2})).is_err());
    }

    #[test]
    fn validation_checks_top_level_type() {
        let schema = json!({"type": "object"});
        assert!(validate_input(&schema, &json!([1, 2])).is_err());
        assert!(validate_input(&schema, &json!({})).is_ok());
    }
}
