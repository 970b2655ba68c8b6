/*!
 * Breadcrumb and subscription models shared by the runner components.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Well-known schema names the runner itself reacts to or emits.
pub mod schemas {
    pub const AGENT_DEF: &str = "agent.def.v1";
    pub const TOOL_DEF: &str = "tool.v1";
    pub const WORKFLOW_DEF: &str = "workflow.def.v1";
    pub const CONTEXT_CONFIG: &str = "context.config.v1";

    pub const AGENT_CONTEXT: &str = "agent.context.v1";
    pub const AGENT_RESPONSE: &str = "agent.response.v1";
    pub const TOOL_REQUEST: &str = "tool.request.v1";
    pub const TOOL_RESPONSE: &str = "tool.response.v1";
    pub const WORKFLOW_RESULT: &str = "workflow.result.v1";

    pub const USER_MESSAGE: &str = "user.message.v1";
    pub const BOOTSTRAP_MARKER: &str = "bootstrap.marker.v1";

    /// Definition schemas the subscription registry watches for.
    pub const CONSUMER_DEFS: [&str; 4] = [AGENT_DEF, TOOL_DEF, WORKFLOW_DEF, CONTEXT_CONFIG];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Team,
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Low,
    Pii,
    Secret,
}

/// One frame from the store's SSE stream. Thin: carries metadata only,
/// the full record is fetched on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreadcrumbEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub breadcrumb_id: Option<Uuid>,
    pub schema_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub context: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `breadcrumb.created` or `breadcrumb.updated`; treated as one signal.
    Upserted,
    Deleted,
    Ping,
    Unknown,
}

impl BreadcrumbEvent {
    pub fn kind(&self) -> EventKind {
        match self.event_type.as_str() {
            "breadcrumb.created" | "breadcrumb.updated" => EventKind::Upserted,
            "breadcrumb.deleted" => EventKind::Deleted,
            "ping" => EventKind::Ping,
            _ => EventKind::Unknown,
        }
    }

    pub fn tags_or_empty(&self) -> &[String] {
        self.tags.as_deref().unwrap_or(&[])
    }
}

/// Full breadcrumb record as returned by `GET /breadcrumbs/{id}`
/// (llm_hints already applied by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub id: Uuid,
    pub schema_name: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub context: JsonValue,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub ttl: Option<DateTime<Utc>>,
    pub visibility: Option<Visibility>,
    pub sensitivity: Option<Sensitivity>,
    /// Present on vector-search hits; used by dedup, otherwise ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Breadcrumb {
    /// Best-effort human text: `context.content`, `context.text`, a rolling
    /// context's `formatted_context`, else the serialised payload. Feeds
    /// vector queries and prompt assembly.
    pub fn content_or_text(&self) -> String {
        self.context
            .get("content")
            .or_else(|| self.context.get("text"))
            .or_else(|| self.context.get("formatted_context"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.context.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreadcrumbCreate {
    pub schema_name: String,
    pub title: String,
    pub tags: Vec<String>,
    pub context: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<Sensitivity>,
}

/// Lightweight record from the list endpoint. `context` is present only
/// when the search asked for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreadcrumbListItem {
    pub id: Uuid,
    pub schema_name: String,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub context: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionRole {
    /// Matching events invoke the consumer.
    Trigger,
    /// Matching events refresh a context source; no invocation.
    Context,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Contains,
    ContainsAny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMatch {
    /// Simple JSONPath: dot segments plus `[n]` indices, e.g. `$.user.roles[0]`.
    pub path: String,
    pub op: MatchOp,
    pub value: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Recent,
    Latest,
    Vector,
    EventData,
}

/// How a context subscription pulls its data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSpec {
    pub method: FetchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nn: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_match: Option<Vec<ContextMatch>>,
    pub role: SubscriptionRole,
    /// Bucket name in the assembled context map; defaults to `schema_name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Selector {
    /// The context-bundle key this subscription fills.
    pub fn bucket_key(&self) -> Option<&str> {
        self.key
            .as_deref()
            .or(self.schema_name.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Consumer definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerKind {
    Agent,
    Tool,
    Workflow,
    Context,
}

impl ConsumerKind {
    pub fn from_schema(schema_name: &str) -> Option<Self> {
        match schema_name {
            schemas::AGENT_DEF => Some(ConsumerKind::Agent),
            schemas::TOOL_DEF => Some(ConsumerKind::Tool),
            schemas::WORKFLOW_DEF => Some(ConsumerKind::Workflow),
            schemas::CONTEXT_CONFIG => Some(ConsumerKind::Context),
            _ => None,
        }
    }

    /// Schema of the response breadcrumb this consumer kind emits.
    pub fn response_schema(&self) -> &'static str {
        match self {
            ConsumerKind::Agent => schemas::AGENT_RESPONSE,
            ConsumerKind::Tool => schemas::TOOL_RESPONSE,
            ConsumerKind::Workflow => schemas::WORKFLOW_RESULT,
            ConsumerKind::Context => schemas::AGENT_CONTEXT,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Emission/deletion permissions checked before an executor writes
/// on behalf of a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default = "default_true")]
    pub emit: bool,
    #[serde(default)]
    pub delete: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities { emit: true, delete: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subscriptions {
    #[serde(default)]
    pub selectors: Vec<Selector>,
}

/// Agent handler configuration (`agent.def.v1` context).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub system_prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_loops: Option<usize>,
}

/// Tool handler configuration (`tool.v1` context). `tool` names the
/// locally registered function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Destructive tools run only for consumers whose capabilities grant
    /// delete.
    #[serde(default)]
    pub requires_delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum WorkflowStep {
    Tool {
        id: String,
        tool: String,
        #[serde(default)]
        input: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        retries: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    Llm {
        id: String,
        prompt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retries: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u64>,
    },
    Parallel {
        id: String,
        steps: Vec<WorkflowStep>,
    },
}

impl WorkflowStep {
    pub fn id(&self) -> &str {
        match self {
            WorkflowStep::Tool { id, .. } => id,
            WorkflowStep::Llm { id, .. } => id,
            WorkflowStep::Parallel { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub steps: Vec<WorkflowStep>,
}

// Context-builder configuration (`context.config.v1` context).

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    pub method: FetchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nn: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_tags: Option<Vec<String>>,
}

impl SourceSpec {
    pub fn bucket_key(&self) -> &str {
        self.key
            .as_deref()
            .or(self.schema_name.as_deref())
            .unwrap_or("source")
    }
}

fn default_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default = "default_context_schema")]
    pub schema_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_context_schema() -> String {
    schemas::AGENT_CONTEXT.to_string()
}

fn default_max_tokens() -> usize {
    4000
}

fn default_dedup_threshold() -> f32 {
    0.95
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormattingSpec {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_dedup_threshold")]
    pub deduplication_threshold: f32,
    #[serde(default)]
    pub include_metadata: bool,
    #[serde(default)]
    pub enable_summarization: bool,
}

impl Default for FormattingSpec {
    fn default() -> Self {
        FormattingSpec {
            max_tokens: default_max_tokens(),
            deduplication_threshold: default_dedup_threshold(),
            include_metadata: false,
            enable_summarization: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBuilderConfig {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub update_triggers: Vec<Selector>,
    pub output: OutputSpec,
    #[serde(default)]
    pub formatting: FormattingSpec,
}

/// A consumer definition decoded from its breadcrumb. The role-specific
/// handler config lives in exactly one of the optional fields, per `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerDefinition {
    /// Stable consumer id, e.g. `agent:chat-assistant`.
    pub id: String,
    #[serde(skip)]
    pub kind: Option<ConsumerKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub subscriptions: Subscriptions,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowConfig>,
}

impl ConsumerDefinition {
    /// Decode a definition from its breadcrumb, deriving `kind` from the
    /// breadcrumb's schema name.
    pub fn from_breadcrumb_context(
        schema_name: &str,
        context: &JsonValue,
    ) -> Result<Self, serde_json::Error> {
        let mut def: ConsumerDefinition = serde_json::from_value(context.clone())?;
        def.kind = ConsumerKind::from_schema(schema_name);
        Ok(def)
    }

    pub fn trigger_selectors(&self) -> impl Iterator<Item = &Selector> {
        self.subscriptions
            .selectors
            .iter()
            .filter(|s| s.role == SubscriptionRole::Trigger)
    }

    pub fn context_selectors(&self) -> impl Iterator<Item = &Selector> {
        self.subscriptions
            .selectors
            .iter()
            .filter(|s| s.role == SubscriptionRole::Context)
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Error,
}

/// Payload of every response breadcrumb an executor emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: String,
    pub output: JsonValue,
    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_maps_created_and_updated_to_upserted() {
        for t in ["breadcrumb.created", "breadcrumb.updated"] {
            let ev = BreadcrumbEvent {
                event_type: t.to_string(),
                breadcrumb_id: Some(Uuid::new_v4()),
                schema_name: None,
                tags: None,
                context: None,
            };
            assert_eq!(ev.kind(), EventKind::Upserted);
        }
    }

    #[test]
    fn selector_bucket_key_defaults_to_schema() {
        let sel: Selector = serde_json::from_value(json!({
            "schema_name": "user.message.v1",
            "role": "context",
            "fetch": {"method": "recent", "limit": 5}
        }))
        .unwrap();
        assert_eq!(sel.bucket_key(), Some("user.message.v1"));

        let named: Selector = serde_json::from_value(json!({
            "schema_name": "user.message.v1",
            "role": "context",
            "key": "history",
            "fetch": {"method": "recent"}
        }))
        .unwrap();
        assert_eq!(named.bucket_key(), Some("history"));
    }

    #[test]
    fn consumer_definition_decodes_agent() {
        let ctx = json!({
            "id": "agent:chat",
            "subscriptions": {"selectors": [
                {"schema_name": "agent.context.v1", "all_tags": ["consumer:agent:chat"], "role": "trigger"}
            ]},
            "agent": {"system_prompt": "You are helpful.", "model": "openrouter/auto"}
        });
        let def = ConsumerDefinition::from_breadcrumb_context(schemas::AGENT_DEF, &ctx).unwrap();
        assert_eq!(def.kind, Some(ConsumerKind::Agent));
        assert_eq!(def.trigger_selectors().count(), 1);
        assert!(def.capabilities.emit);
        assert!(!def.capabilities.delete);
    }

    #[test]
    fn workflow_steps_decode_tagged_variants() {
        let cfg: WorkflowConfig = serde_json::from_value(json!({
            "steps": [
                {"type": "tool", "id": "a", "tool": "echo", "input": {"x": 1}},
                {"type": "parallel", "id": "p", "steps": [
                    {"type": "tool", "id": "b", "tool": "get_time"},
                    {"type": "llm", "id": "c", "prompt": "Summarize ${a.output}"}
                ]}
            ]
        }))
        .unwrap();
        assert_eq!(cfg.steps.len(), 2);
        assert_eq!(cfg.steps[1].id(), "p");
    }

    #[test]
    fn formatting_defaults_apply() {
        let f: FormattingSpec = serde_json::from_value(json!({})).unwrap();
        assert_eq!(f.max_tokens, 4000);
        assert!((f.deduplication_threshold - 0.95).abs() < f32::EPSILON);
        assert!(!f.include_metadata);
    }
}
