/*!
 * Bootstrap loader.
 *
 * Idempotent seeding of the schemas, system tools, agents, workflows and
 * context configs a fresh environment needs. Items are looked up before
 * creation and carry stable idempotency keys, so re-running is safe; a
 * `.bootstrapped` marker file gates the whole pass.
 */

use crate::config::{Config, DeploymentMode};
use crate::rcrt_client::{RcrtClient, SearchQuery};
use anyhow::{Context, Result};
use rcrt_runner_core::idempotency::idempotency_key;
use rcrt_runner_core::models::schemas;
use rcrt_runner_core::BreadcrumbCreate;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{info, warn};

const MARKER_FILE: &str = ".bootstrapped";
const STORE_WAIT_ATTEMPTS: u32 = 30;

#[derive(Debug, Clone)]
pub struct SeedItem {
    pub schema_name: String,
    pub title: String,
    pub tags: Vec<String>,
    pub context: JsonValue,
}

pub async fn run(client: &Arc<RcrtClient>, config: &Config) -> Result<()> {
    let marker = config.runtime_root.join(MARKER_FILE);
    if marker.exists() {
        info!("Bootstrap marker present, skipping seeding");
        return Ok(());
    }

    if config.deployment_mode == DeploymentMode::Docker {
        wait_for_store(client).await?;
        if std::env::var("LOCAL_KEK_BASE64").is_err() {
            warn!("LOCAL_KEK_BASE64 is not set; the store cannot encrypt secrets at rest");
        }
    }

    let items = seed_items(&config.workspace);
    let mut created = 0usize;
    for item in &items {
        if seed(client, item).await? {
            created += 1;
        }
    }
    info!("🌱 Bootstrap seeded {} of {} item(s)", created, items.len());

    // Marker breadcrumb first (the durable record), then the local gate.
    let marker_tags = vec!["bootstrap".to_string(), config.workspace.clone()];
    let key = idempotency_key(schemas::BOOTSTRAP_MARKER, &marker_tags, "bootstrap complete");
    client
        .create(
            &BreadcrumbCreate {
                schema_name: schemas::BOOTSTRAP_MARKER.to_string(),
                title: "bootstrap complete".to_string(),
                tags: marker_tags,
                context: json!({
                    "completed_at": chrono::Utc::now().to_rfc3339(),
                    "items": items.len(),
                }),
                ttl: None,
                visibility: None,
                sensitivity: None,
            },
            Some(&key),
        )
        .await
        .context("writing bootstrap marker breadcrumb")?;

    std::fs::write(&marker, chrono::Utc::now().to_rfc3339())
        .with_context(|| format!("writing {}", marker.display()))?;
    info!("✅ Bootstrap complete");
    Ok(())
}

/// Create the item unless an equivalent record already exists. Returns
/// true when a create happened.
async fn seed(client: &Arc<RcrtClient>, item: &SeedItem) -> Result<bool> {
    let existing = client
        .search(&SearchQuery {
            schema_name: Some(item.schema_name.clone()),
            tags: item.tags.clone(),
            limit: Some(1),
            include_context: false,
        })
        .await?;
    if !existing.is_empty() {
        return Ok(false);
    }

    let key = idempotency_key(&item.schema_name, &item.tags, &item.title);
    client
        .create(
            &BreadcrumbCreate {
                schema_name: item.schema_name.clone(),
                title: item.title.clone(),
                tags: item.tags.clone(),
                context: item.context.clone(),
                ttl: None,
                visibility: None,
                sensitivity: None,
            },
            Some(&key),
        )
        .await
        .with_context(|| format!("seeding {}", item.title))?;
    info!("  + seeded {} ({})", item.title, item.schema_name);
    Ok(true)
}

async fn wait_for_store(client: &Arc<RcrtClient>) -> Result<()> {
    for attempt in 0..STORE_WAIT_ATTEMPTS {
        match client.health().await {
            Ok(()) => {
                info!("Record store is healthy");
                return Ok(());
            }
            Err(e) => {
                if attempt + 1 == STORE_WAIT_ATTEMPTS {
                    anyhow::bail!("record store never became healthy: {e}");
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
    Ok(())
}

/// The full seed set in dependency order: schemas, tools, agents,
/// workflows, context configs, demo data.
pub fn seed_items(workspace: &str) -> Vec<SeedItem> {
    let ws = workspace.to_string();
    let mut items = Vec::new();

    // Schemas the runner emits or reacts to.
    for (name, description) in [
        (schemas::USER_MESSAGE, "A message a user sent into a workspace"),
        (schemas::TOOL_REQUEST, "Request for a registered tool invocation"),
        (schemas::TOOL_RESPONSE, "Result of a tool invocation"),
        (schemas::AGENT_RESPONSE, "Final answer an agent produced"),
        (schemas::AGENT_CONTEXT, "Rolling assembled context for one consumer"),
        (schemas::WORKFLOW_RESULT, "Outcome of a workflow run"),
    ] {
        items.push(SeedItem {
            schema_name: "schema.def.v1".to_string(),
            title: name.to_string(),
            tags: vec![format!("schema:{name}"), ws.clone()],
            context: json!({"name": name, "description": description}),
        });
    }

    // Builtin tools.
    for (name, description, input_schema) in [
        (
            "echo",
            "Returns its input unchanged",
            json!({"type": "object"}),
        ),
        (
            "get_time",
            "Current UTC timestamp",
            json!({"type": "object"}),
        ),
        (
            "breadcrumb_search",
            "Selector search over the record store",
            json!({
                "type": "object",
                "properties": {
                    "schema_name": {"type": "string"},
                    "tags": {"type": "array"},
                    "limit": {"type": "integer"}
                }
            }),
        ),
        (
            "breadcrumb_create",
            "Create a breadcrumb in the current workspace",
            json!({
                "type": "object",
                "required": ["schema_name"],
                "properties": {
                    "schema_name": {"type": "string"},
                    "title": {"type": "string"},
                    "tags": {"type": "array"},
                    "context": {"type": "object"}
                }
            }),
        ),
        (
            "openrouter",
            "LLM chat completion via OpenRouter",
            json!({
                "type": "object",
                "required": ["messages"],
                "properties": {
                    "model": {"type": "string"},
                    "messages": {"type": "array"},
                    "temperature": {"type": "number"}
                }
            }),
        ),
    ] {
        items.push(SeedItem {
            schema_name: schemas::TOOL_DEF.to_string(),
            title: name.to_string(),
            tags: vec![format!("tool:{name}"), ws.clone()],
            context: json!({
                "id": format!("tool:{name}"),
                "title": name,
                "subscriptions": {"selectors": [{
                    "schema_name": schemas::TOOL_REQUEST,
                    "any_tags": ["tool:request"],
                    "context_match": [{"path": "$.tool", "op": "eq", "value": name}],
                    "role": "trigger"
                }]},
                "capabilities": {"emit": true, "delete": false},
                "tool": {
                    "tool": name,
                    "description": description,
                    "input_schema": input_schema
                }
            }),
        });
    }

    // The one destructive builtin carries the delete capability explicitly.
    items.push(SeedItem {
        schema_name: schemas::TOOL_DEF.to_string(),
        title: "breadcrumb_delete".to_string(),
        tags: vec!["tool:breadcrumb_delete".to_string(), ws.clone()],
        context: json!({
            "id": "tool:breadcrumb_delete",
            "title": "breadcrumb_delete",
            "subscriptions": {"selectors": [{
                "schema_name": schemas::TOOL_REQUEST,
                "any_tags": ["tool:request"],
                "context_match": [{"path": "$.tool", "op": "eq", "value": "breadcrumb_delete"}],
                "role": "trigger"
            }]},
            "capabilities": {"emit": true, "delete": true},
            "tool": {
                "tool": "breadcrumb_delete",
                "description": "Delete a breadcrumb by id",
                "requires_delete": true,
                "input_schema": {
                    "type": "object",
                    "required": ["id"],
                    "properties": {"id": {"type": "string"}}
                }
            }
        }),
    });

    // The system chat agent: triggered by its rolling context breadcrumb,
    // with recent history as an extra bundle source.
    items.push(SeedItem {
        schema_name: schemas::AGENT_DEF.to_string(),
        title: "chat-assistant".to_string(),
        tags: vec!["agent:chat-assistant".to_string(), ws.clone()],
        context: json!({
            "id": "agent:chat-assistant",
            "title": "Chat assistant",
            "subscriptions": {"selectors": [
                {
                    "schema_name": schemas::AGENT_CONTEXT,
                    "all_tags": ["consumer:agent:chat-assistant"],
                    "role": "trigger"
                },
                {
                    "schema_name": schemas::USER_MESSAGE,
                    "all_tags": ["workspace:chat"],
                    "role": "context",
                    "key": "history",
                    "fetch": {"method": "recent", "limit": 10}
                }
            ]},
            "capabilities": {"emit": true, "delete": false},
            "agent": {
                "system_prompt": "You are a helpful assistant. Answer using the provided context. To call a tool, reply with JSON: {\"tool\": \"<name>\", \"input\": {...}}.",
                "model": "openrouter/auto",
                "max_tool_loops": 4
            }
        }),
    });

    // Demo workflow.
    items.push(SeedItem {
        schema_name: schemas::WORKFLOW_DEF.to_string(),
        title: "daily-brief".to_string(),
        tags: vec!["workflow:daily-brief".to_string(), ws.clone()],
        context: json!({
            "id": "workflow:daily-brief",
            "title": "Daily brief",
            "subscriptions": {"selectors": [{
                "schema_name": "workflow.request.v1",
                "context_match": [{"path": "$.workflow", "op": "eq", "value": "workflow:daily-brief"}],
                "role": "trigger"
            }]},
            "capabilities": {"emit": true, "delete": false},
            "workflow": {"steps": [
                {"type": "tool", "id": "now", "tool": "get_time"},
                {"type": "parallel", "id": "gather", "steps": [
                    {"type": "tool", "id": "recent", "tool": "breadcrumb_search",
                     "input": {"schema_name": "user.message.v1", "limit": 5}},
                    {"type": "tool", "id": "stamp", "tool": "echo",
                     "input": {"as_of": "${now.output.now}"}}
                ]},
                {"type": "llm", "id": "brief", "retries": 1,
                 "prompt": "Summarize the recent activity as of ${now.output.now}: ${recent.output}"}
            ]}
        }),
    });

    // Context config feeding the chat agent.
    items.push(SeedItem {
        schema_name: schemas::CONTEXT_CONFIG.to_string(),
        title: "chat-assistant context".to_string(),
        tags: vec!["consumer:agent:chat-assistant".to_string(), ws.clone()],
        context: json!({
            "id": "agent:chat-assistant",
            "sources": [
                {"schema_name": schemas::USER_MESSAGE, "method": "recent", "limit": 10,
                 "key": "history", "all_tags": ["workspace:chat"]},
                {"schema_name": schemas::USER_MESSAGE, "method": "vector", "nn": 3,
                 "key": "related"},
                {"method": "event_data", "key": "trigger"}
            ],
            "update_triggers": [{
                "schema_name": schemas::USER_MESSAGE,
                "all_tags": ["workspace:chat"],
                "role": "trigger"
            }],
            "output": {
                "schema_name": schemas::AGENT_CONTEXT,
                "tags": ["agent:context", "consumer:agent:chat-assistant"],
                "ttl_seconds": 3600
            },
            "formatting": {"max_tokens": 4000, "deduplication_threshold": 0.95}
        }),
    });

    // Demo breadcrumb so a fresh workspace has something to look at.
    items.push(SeedItem {
        schema_name: schemas::USER_MESSAGE.to_string(),
        title: "Welcome".to_string(),
        tags: vec!["workspace:chat".to_string(), ws],
        context: json!({"content": "Hello! The runner is up.", "role": "user"}),
    });

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(items: &[SeedItem], schema: &str) -> usize {
        items.iter().position(|i| i.schema_name == schema).unwrap()
    }

    #[test]
    fn seed_order_is_dependency_first() {
        let items = seed_items("workspace:agents");
        let schema_pos = position(&items, "schema.def.v1");
        let tool_pos = position(&items, schemas::TOOL_DEF);
        let agent_pos = position(&items, schemas::AGENT_DEF);
        let workflow_pos = position(&items, schemas::WORKFLOW_DEF);
        let config_pos = position(&items, schemas::CONTEXT_CONFIG);
        let demo_pos = position(&items, schemas::USER_MESSAGE);

        assert!(schema_pos < tool_pos);
        assert!(tool_pos < agent_pos);
        assert!(agent_pos < workflow_pos);
        assert!(workflow_pos < config_pos);
        assert!(config_pos < demo_pos);
    }

    #[test]
    fn every_item_is_workspace_tagged() {
        let items = seed_items("workspace:test");
        for item in &items {
            assert!(
                item.tags.iter().any(|t| t == "workspace:test"),
                "{} missing workspace tag",
                item.title
            );
        }
    }

    #[test]
    fn tool_definitions_decode_as_consumers() {
        use rcrt_runner_core::ConsumerDefinition;
        let items = seed_items("workspace:agents");
        for item in items.iter().filter(|i| i.schema_name == schemas::TOOL_DEF) {
            let def =
                ConsumerDefinition::from_breadcrumb_context(&item.schema_name, &item.context)
                    .unwrap();
            assert!(def.tool.is_some(), "{} lacks tool config", item.title);
            assert_eq!(def.trigger_selectors().count(), 1);
        }
    }

    #[test]
    fn agent_definition_decodes() {
        use rcrt_runner_core::ConsumerDefinition;
        let items = seed_items("workspace:agents");
        let agent = items
            .iter()
            .find(|i| i.schema_name == schemas::AGENT_DEF)
            .unwrap();
        let def =
            ConsumerDefinition::from_breadcrumb_context(&agent.schema_name, &agent.context).unwrap();
        assert!(def.agent.is_some());
        assert_eq!(def.context_selectors().count(), 1);
    }

    #[test]
    fn context_config_decodes_for_the_service() {
        let items = seed_items("workspace:agents");
        let cfg = items
            .iter()
            .find(|i| i.schema_name == schemas::CONTEXT_CONFIG)
            .unwrap();
        let parsed: crate::registry::ContextConfigDef =
            serde_json::from_value(cfg.context.clone()).unwrap();
        assert_eq!(parsed.id, "agent:chat-assistant");
        assert_eq!(parsed.config.sources.len(), 3);
    }
}
