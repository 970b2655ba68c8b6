/*!
 * Subscription registry and auto-discovery.
 *
 * Loads every consumer definition in the workspace at startup, builds the
 * right executor variant for each, and hot-binds additions, updates and
 * removals forwarded by the dispatcher. Readers get a copy-on-write
 * snapshot and never block writers.
 */

use crate::context::ContextService;
use crate::executor::agent::AgentHandler;
use crate::executor::tool::{ToolHandler, ToolRegistry};
use crate::executor::workflow::WorkflowHandler;
use crate::executor::{ExecutionContext, ExecutorInstance, Handler};
use crate::rcrt_client::SearchQuery;
use rcrt_runner_core::matcher::{self, EventView};
use rcrt_runner_core::models::{schemas, ContextBuilderConfig};
use rcrt_runner_core::{ConsumerDefinition, ConsumerKind, RunnerError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A `context.config.v1` payload: a consumer id plus the builder config.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfigDef {
    pub id: String,
    #[serde(flatten)]
    pub config: ContextBuilderConfig,
}

pub struct Registry {
    executors: RwLock<Arc<HashMap<String, Arc<ExecutorInstance>>>>,
    /// Definition breadcrumb id -> consumer id, for deletion events that
    /// carry only metadata.
    by_breadcrumb: Mutex<HashMap<Uuid, String>>,
    ctx: ExecutionContext,
    tools: Arc<ToolRegistry>,
    context_service: Arc<ContextService>,
}

impl Registry {
    pub fn new(
        ctx: ExecutionContext,
        tools: Arc<ToolRegistry>,
        context_service: Arc<ContextService>,
    ) -> Arc<Self> {
        Arc::new(Registry {
            executors: RwLock::new(Arc::new(HashMap::new())),
            by_breadcrumb: Mutex::new(HashMap::new()),
            ctx,
            tools,
            context_service,
        })
    }

    /// Discover every consumer definition in scope. Returns how many were
    /// bound.
    pub async fn load_all(self: &Arc<Self>) -> Result<usize, RunnerError> {
        let mut bound = 0usize;
        for schema in schemas::CONSUMER_DEFS {
            let items = self
                .ctx
                .client
                .search(&SearchQuery {
                    schema_name: Some(schema.to_string()),
                    tags: vec![self.ctx.workspace.clone()],
                    limit: Some(500),
                    include_context: true,
                })
                .await?;
            for item in items {
                let Some(context) = item.context.as_ref() else {
                    continue;
                };
                if self.install(schema, item.id, context) {
                    bound += 1;
                }
            }
        }
        info!("📚 Registry loaded: {} consumer(s) bound", bound);
        Ok(bound)
    }

    /// Bind (or re-bind) one definition. Returns false when the payload
    /// does not decode as its schema demands.
    pub fn install(
        self: &Arc<Self>,
        schema_name: &str,
        breadcrumb_id: Uuid,
        context: &serde_json::Value,
    ) -> bool {
        if schema_name == schemas::CONTEXT_CONFIG {
            let parsed: ContextConfigDef = match serde_json::from_value(context.clone()) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Bad context config {}: {}", breadcrumb_id, e);
                    return false;
                }
            };
            self.remember_breadcrumb(breadcrumb_id, &parsed.id);
            self.context_service.register(&parsed.id, parsed.config);
            return true;
        }

        let definition = match ConsumerDefinition::from_breadcrumb_context(schema_name, context) {
            Ok(d) => d,
            Err(e) => {
                warn!("Bad consumer definition {}: {}", breadcrumb_id, e);
                return false;
            }
        };
        let Some(handler) = self.build_handler(&definition) else {
            return false;
        };

        self.remember_breadcrumb(breadcrumb_id, &definition.id);
        let consumer_id = definition.id.clone();
        let instance = Arc::new(ExecutorInstance { definition, handler });

        let mut guard = self.executors.write().expect("registry lock");
        let mut next = (**guard).clone();
        let replaced = next.insert(consumer_id.clone(), instance).is_some();
        *guard = Arc::new(next);
        drop(guard);

        if replaced {
            debug!("Re-registered consumer {}", consumer_id);
        } else {
            info!("🔌 Registered consumer {}", consumer_id);
        }
        true
    }

    /// Idempotent removal by consumer id.
    pub fn remove(&self, consumer_id: &str) {
        let mut guard = self.executors.write().expect("registry lock");
        if guard.contains_key(consumer_id) {
            let mut next = (**guard).clone();
            next.remove(consumer_id);
            *guard = Arc::new(next);
            info!("Deregistered consumer {}", consumer_id);
        }
        drop(guard);
        self.context_service.deregister(consumer_id);
    }

    /// Removal keyed by the definition breadcrumb id (deletion events are
    /// thin).
    pub fn remove_by_breadcrumb(&self, breadcrumb_id: Uuid) {
        let consumer_id = {
            let mut map = self.by_breadcrumb.lock().expect("registry index lock");
            map.remove(&breadcrumb_id)
        };
        if let Some(id) = consumer_id {
            self.remove(&id);
        }
    }

    /// Is this a schema the registry watches for?
    pub fn is_definition_schema(schema_name: &str) -> bool {
        schemas::CONSUMER_DEFS.contains(&schema_name)
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<ExecutorInstance>>> {
        self.executors.read().expect("registry lock").clone()
    }

    /// Executors with at least one trigger selector matching the event.
    pub fn matching_executors(&self, view: EventView<'_>) -> Vec<Arc<ExecutorInstance>> {
        self.snapshot()
            .values()
            .filter(|ex| {
                ex.definition
                    .trigger_selectors()
                    .any(|sel| matcher::matches(view, sel))
            })
            .cloned()
            .collect()
    }

    fn remember_breadcrumb(&self, breadcrumb_id: Uuid, consumer_id: &str) {
        self.by_breadcrumb
            .lock()
            .expect("registry index lock")
            .insert(breadcrumb_id, consumer_id.to_string());
    }

    fn build_handler(&self, definition: &ConsumerDefinition) -> Option<Arc<dyn Handler>> {
        match definition.kind {
            Some(ConsumerKind::Agent) => {
                let Some(config) = definition.agent.clone() else {
                    warn!("Agent {} has no agent config", definition.id);
                    return None;
                };
                Some(Arc::new(AgentHandler {
                    consumer_id: definition.id.clone(),
                    config,
                    ctx: self.ctx.clone(),
                }))
            }
            Some(ConsumerKind::Tool) => {
                let Some(config) = definition.tool.clone() else {
                    warn!("Tool {} has no tool config", definition.id);
                    return None;
                };
                if self.tools.get(&config.tool).is_none() {
                    warn!(
                        "Tool {} binds unregistered function '{}'; requests will fail",
                        definition.id, config.tool
                    );
                }
                Some(Arc::new(ToolHandler {
                    config,
                    capabilities: definition.capabilities.clone(),
                    ctx: self.ctx.clone(),
                    registry: self.tools.clone(),
                }))
            }
            Some(ConsumerKind::Workflow) => {
                let Some(config) = definition.workflow.clone() else {
                    warn!("Workflow {} has no step list", definition.id);
                    return None;
                };
                Some(Arc::new(WorkflowHandler {
                    consumer_id: definition.id.clone(),
                    config,
                    ctx: self.ctx.clone(),
                }))
            }
            Some(ConsumerKind::Context) | None => None,
        }
    }
}
