/*!
 * Universal executor lifecycle.
 *
 * One flow for every consumer variant: a matched trigger is fetched,
 * guarded against self-loops, its deferred predicates re-checked, context
 * assembled from the consumer's context subscriptions, the handler invoked
 * under a timeout, and exactly one response breadcrumb emitted (success or
 * error). Handler failures never escape the lifecycle.
 */

pub mod agent;
pub mod tool;
pub mod workflow;

use crate::bridge::{EventBridge, WaitCriteria};
use crate::context::fetch::{self, FetchPlan};
use crate::rcrt_client::RcrtClient;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rcrt_runner_core::matcher::{self, EventView};
use rcrt_runner_core::models::{schemas, ConsumerDefinition, ExecStatus, ResponsePayload};
use rcrt_runner_core::{Breadcrumb, BreadcrumbCreate, RunnerError};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-invocation context map, keyed by each context subscription's key.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub trigger: Arc<Breadcrumb>,
    pub buckets: BTreeMap<String, JsonValue>,
}

impl ContextBundle {
    /// Render the bundle for prompt embedding: one short section per key.
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.buckets {
            out.push_str("## ");
            out.push_str(key);
            out.push('\n');
            match value {
                JsonValue::String(s) => out.push_str(s),
                other => out.push_str(&serde_json::to_string_pretty(other).unwrap_or_default()),
            }
            out.push('\n');
        }
        out
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn execute(
        &self,
        trigger: &Breadcrumb,
        context: &ContextBundle,
    ) -> Result<JsonValue, RunnerError>;
}

/// Shared services a handler can reach: the record client, the event
/// bridge wait, the workspace scope and this runner's identity.
#[derive(Clone)]
pub struct ExecutionContext {
    pub client: Arc<RcrtClient>,
    pub bridge: Arc<EventBridge>,
    pub workspace: String,
    pub agent_id: String,
    pub wait_timeout: Duration,
}

impl ExecutionContext {
    /// Invoke a tool over the bus: emit `tool.request.v1`, await the
    /// correlated `tool.response.v1`.
    pub async fn call_tool(
        &self,
        tool: &str,
        input: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<JsonValue, RunnerError> {
        let request_id = Uuid::new_v4().to_string();
        self.client
            .create(
                &BreadcrumbCreate {
                    schema_name: schemas::TOOL_REQUEST.to_string(),
                    title: format!("{tool} request"),
                    tags: vec!["tool:request".to_string(), self.workspace.clone()],
                    context: json!({
                        "tool": tool,
                        "input": input,
                        "request_id": request_id,
                        "requested_by": self.agent_id,
                    }),
                    ttl: None,
                    visibility: None,
                    sensitivity: None,
                },
                None,
            )
            .await?;

        let response = self
            .bridge
            .wait(
                WaitCriteria::schema(schemas::TOOL_RESPONSE).with_request_id(&request_id),
                Some(timeout.unwrap_or(self.wait_timeout)),
            )
            .await?;

        let status = response.context.get("status").and_then(|v| v.as_str());
        if status == Some("error") {
            let message = response
                .context
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("tool failed");
            return Err(RunnerError::Fatal(format!("{tool}: {message}")));
        }
        Ok(response
            .context
            .get("output")
            .cloned()
            .unwrap_or(JsonValue::Null))
    }
}

/// One registered consumer: its definition plus the handler variant built
/// for it.
pub struct ExecutorInstance {
    pub definition: ConsumerDefinition,
    pub handler: Arc<dyn Handler>,
}

pub struct ExecutorRuntime {
    pub ctx: ExecutionContext,
    pub handler_timeout: Duration,
}

impl ExecutorRuntime {
    /// Full lifecycle for one (consumer, trigger) pair. Always terminates
    /// without propagating handler failures; emits at most one response.
    pub async fn run_trigger(&self, executor: &ExecutorInstance, trigger: Arc<Breadcrumb>) {
        let consumer = &executor.definition;

        // Self-loop guard: never react to our own emissions. The store
        // stamps created_by with the process identity, so responses also
        // carry the logical consumer id in their payload.
        let emitted_by = trigger.context.get("emitted_by").and_then(|v| v.as_str());
        if trigger.created_by.as_deref() == Some(consumer.id.as_str())
            || emitted_by == Some(consumer.id.as_str())
        {
            debug!("Skipping self-created trigger {} for {}", trigger.id, consumer.id);
            return;
        }

        // Deferred predicates: the thin SSE event was routed optimistically,
        // re-check against the full payload.
        let view = EventView::from_breadcrumb(&trigger);
        let trigger_selectors: Vec<_> = consumer.trigger_selectors().cloned().collect();
        let matched = trigger_selectors.iter().find(|sel| {
            matcher::matches(view, sel) && matcher::predicates_hold(&trigger.context, sel)
        });
        if matched.is_none() {
            debug!(
                "Trigger {} no longer matches {} after full fetch, skipping",
                trigger.id, consumer.id
            );
            return;
        }

        let started = Instant::now();
        let bundle = self.assemble_bundle(consumer, &trigger).await;

        let run = async {
            executor.handler.execute(&trigger, &bundle).await
        };
        let outcome = match tokio::time::timeout(
            self.handler_timeout,
            std::panic::AssertUnwindSafe(run).catch_unwind(),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(RunnerError::Fatal("handler panicked".into())),
            Err(_) => Err(RunnerError::Timeout(self.handler_timeout)),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (status, output, error) = match outcome {
            Ok(output) => (ExecStatus::Success, output, None),
            Err(e) => {
                warn!("Handler {} failed on {}: {}", consumer.id, trigger.id, e);
                (ExecStatus::Error, JsonValue::Null, Some(e.to_string()))
            }
        };

        if !consumer.capabilities.emit {
            warn!(
                "Consumer {} lacks the emit capability, dropping response for {}",
                consumer.id, trigger.id
            );
            return;
        }

        if let Err(e) = self
            .emit_response(consumer, &trigger, status, output, error, elapsed_ms)
            .await
        {
            warn!("Failed to emit response for {} / {}: {}", consumer.id, trigger.id, e);
        }
    }

    /// Execute every `role=context` subscription and collect the results
    /// into the bundle, keyed per subscription.
    async fn assemble_bundle(
        &self,
        consumer: &ConsumerDefinition,
        trigger: &Arc<Breadcrumb>,
    ) -> ContextBundle {
        let mut buckets = BTreeMap::new();
        for selector in consumer.context_selectors() {
            let Some(key) = selector.bucket_key() else {
                continue;
            };
            let plan = FetchPlan::from_selector(selector);
            match fetch::fetch(&self.ctx.client, &plan, Some(trigger)).await {
                Ok(items) => {
                    let value = if plan.is_singular() {
                        items
                            .into_iter()
                            .next()
                            .map(|i| i.context)
                            .unwrap_or(JsonValue::Null)
                    } else {
                        JsonValue::Array(items.into_iter().map(|i| i.context).collect())
                    };
                    buckets.insert(key.to_string(), value);
                }
                Err(e) => {
                    warn!("Context fetch '{}' failed for {}: {}", key, consumer.id, e);
                }
            }
        }
        ContextBundle {
            trigger: trigger.clone(),
            buckets,
        }
    }

    async fn emit_response(
        &self,
        consumer: &ConsumerDefinition,
        trigger: &Breadcrumb,
        status: ExecStatus,
        output: JsonValue,
        error: Option<String>,
        elapsed_ms: u64,
    ) -> Result<(), RunnerError> {
        let kind = consumer
            .kind
            .ok_or_else(|| RunnerError::Validation(format!("{} has no kind", consumer.id)))?;

        // Correlate by the caller-supplied request id when present, else by
        // the trigger breadcrumb id.
        let request_id = trigger
            .context
            .get("request_id")
            .or_else(|| trigger.context.get("requestId"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| trigger.id.to_string());

        let payload = ResponsePayload {
            request_id,
            output,
            status,
            error,
            execution_time_ms: elapsed_ms,
            timestamp: Utc::now(),
        };
        let mut context = serde_json::to_value(&payload)?;
        context["emitted_by"] = serde_json::Value::String(consumer.id.clone());

        // Keep the response in the conversation's workspace as well as the
        // consumer's own scope.
        let mut tags = vec![format!("response:{}", trigger.id), self.ctx.workspace.clone()];
        for tag in trigger.tags.iter().filter(|t| t.starts_with("workspace:")) {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        self.ctx
            .client
            .create(
                &BreadcrumbCreate {
                    schema_name: kind.response_schema().to_string(),
                    title: format!("{} response", consumer.id),
                    tags,
                    context,
                    ttl: None,
                    visibility: None,
                    sensitivity: None,
                },
                None,
            )
            .await?;

        info!(
            "Emitted {} for {} ({}, {}ms)",
            kind.response_schema(),
            consumer.id,
            match status {
                ExecStatus::Success => "success",
                ExecStatus::Error => "error",
            },
            elapsed_ms
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tool::{ToolHandler, ToolRegistry};
    use rcrt_runner_core::models::ToolConfig;

    fn test_runtime() -> ExecutorRuntime {
        ExecutorRuntime {
            ctx: ExecutionContext {
                client: Arc::new(crate::rcrt_client::RcrtClient::unconnected("http://localhost:9")),
                bridge: Arc::new(EventBridge::new()),
                workspace: "workspace:test".to_string(),
                agent_id: "test-runner".to_string(),
                wait_timeout: Duration::from_secs(1),
            },
            handler_timeout: Duration::from_secs(1),
        }
    }

    fn echo_executor(consumer_id: &str) -> ExecutorInstance {
        let definition = rcrt_runner_core::ConsumerDefinition::from_breadcrumb_context(
            schemas::TOOL_DEF,
            &json!({
                "id": consumer_id,
                "subscriptions": {"selectors": [{
                    "schema_name": "tool.request.v1",
                    "context_match": [{"path": "$.tool", "op": "eq", "value": "echo"}],
                    "role": "trigger"
                }]},
                "tool": {"tool": "echo"}
            }),
        )
        .unwrap();
        let handler = Arc::new(ToolHandler {
            config: ToolConfig {
                tool: "echo".into(),
                input_schema: None,
                description: None,
                requires_delete: false,
            },
            capabilities: definition.capabilities.clone(),
            ctx: test_runtime().ctx,
            registry: Arc::new(ToolRegistry::with_builtins()),
        });
        ExecutorInstance { definition, handler }
    }

    fn trigger(context: JsonValue) -> Arc<Breadcrumb> {
        Arc::new(Breadcrumb {
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
        })
    }

    #[tokio::test]
    async fn self_emitted_trigger_is_skipped() {
        // Neither the handler nor the store is touched: the guard fires
        // before any I/O, so an unconnected client is safe here.
        let runtime = test_runtime();
        let executor = echo_executor("tool:echo");
        let own = trigger(json!({"tool": "echo", "input": {}, "emitted_by": "tool:echo"}));
        runtime.run_trigger(&executor, own).await;
    }

    #[tokio::test]
    async fn failed_deferred_predicate_skips_the_run() {
        let runtime = test_runtime();
        let executor = echo_executor("tool:echo");
        // Routed optimistically off a thin event, but the full payload
        // names a different tool.
        let other = trigger(json!({"tool": "get_time", "input": {}}));
        runtime.run_trigger(&executor, other).await;
    }

    #[test]
    fn bundle_prompt_text_renders_sections() {
        let trigger = Arc::new(Breadcrumb {
            id: Uuid::new_v4(),
            schema_name: "user.message.v1".into(),
            title: None,
            tags: vec![],
            context: json!({"content": "hi"}),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            created_by: None,
            ttl: None,
            visibility: None,
            sensitivity: None,
            embedding: None,
        });
        let mut buckets = BTreeMap::new();
        buckets.insert("history".to_string(), json!([{"content": "earlier"}]));
        buckets.insert("profile".to_string(), JsonValue::String("likes rust".into()));
        let bundle = ContextBundle { trigger, buckets };

        let text = bundle.to_prompt_text();
        assert!(text.contains("## history"));
        assert!(text.contains("## profile"));
        assert!(text.contains("likes rust"));
    }
}
