/*!
 * Agent executor.
 *
 * An agent's handler builds an LLM request from its system prompt, the
 * assembled context bundle and the trigger, then calls the model through
 * the `openrouter` tool over the bus. When the model answers with a tool
 * call, the agent runs it and feeds the result back, up to a bounded loop
 * depth, before emitting its final response.
 */

use super::{ContextBundle, ExecutionContext, Handler};
use async_trait::async_trait;
use rcrt_runner_core::models::AgentConfig;
use rcrt_runner_core::{Breadcrumb, RunnerError};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

const DEFAULT_TOOL_LOOPS: usize = 4;

pub struct AgentHandler {
    pub consumer_id: String,
    pub config: AgentConfig,
    pub ctx: ExecutionContext,
}

/// A tool call the model embedded in its reply: `{"tool": ..., "input": ...}`.
#[derive(Debug, PartialEq)]
pub(crate) struct ToolCall {
    pub tool: String,
    pub input: JsonValue,
}

pub(crate) fn parse_tool_call(content: &str) -> Option<ToolCall> {
    let trimmed = content.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let parsed: JsonValue = serde_json::from_str(trimmed).ok()?;
    let tool = parsed.get("tool")?.as_str()?.to_string();
    let input = parsed.get("input").cloned().unwrap_or_else(|| json!({}));
    Some(ToolCall { tool, input })
}

#[async_trait]
impl Handler for AgentHandler {
    async fn execute(
        &self,
        trigger: &Breadcrumb,
        context: &ContextBundle,
    ) -> Result<JsonValue, RunnerError> {
        let mut system = self.config.system_prompt.clone();
        let context_text = context.to_prompt_text();
        if !context_text.is_empty() {
            system.push_str("\n\n# Context\n");
            system.push_str(&context_text);
        }

        let mut messages = vec![
            json!({"role": "system", "content": system}),
            json!({"role": "user", "content": trigger.content_or_text()}),
        ];

        let max_loops = self.config.max_tool_loops.unwrap_or(DEFAULT_TOOL_LOOPS);
        for depth in 0..=max_loops {
            let mut input = json!({"messages": messages});
            if let Some(model) = &self.config.model {
                input["model"] = json!(model);
            }
            if let Some(temperature) = self.config.temperature {
                input["temperature"] = json!(temperature);
            }

            let output = self.ctx.call_tool("openrouter", input, None).await?;
            let content = output
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let Some(call) = parse_tool_call(&content) else {
                return Ok(json!({"content": content}));
            };

            if depth == max_loops {
                return Err(RunnerError::Fatal(format!(
                    "tool loop limit ({max_loops}) reached in {}",
                    self.consumer_id
                )));
            }

            debug!("Agent {} calling tool {} (depth {})", self.consumer_id, call.tool, depth + 1);
            let result = self.ctx.call_tool(&call.tool, call.input, None).await;
            messages.push(json!({"role": "assistant", "content": content}));
            match result {
                Ok(value) => messages.push(json!({
                    "role": "user",
                    "content": format!("Tool {} returned: {}", call.tool, value),
                })),
                Err(e) => messages.push(json!({
                    "role": "user",
                    "content": format!("Tool {} failed: {}", call.tool, e),
                })),
            }
        }

        Err(RunnerError::Fatal(format!(
            "tool loop limit ({max_loops}) reached in {}",
            self.consumer_id
        )))
    }
}
