/*!
 * Retrieval primitives shared by the context-builder service and the
 * executor's per-invocation context assembly.
 */

use crate::rcrt_client::{RcrtClient, SearchQuery};
use chrono::{DateTime, Utc};
use rcrt_runner_core::models::{FetchMethod, Selector, SourceSpec};
use rcrt_runner_core::{Breadcrumb, BreadcrumbListItem, RunnerError};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One retrieved record, normalised from the list / vector / full shapes.
#[derive(Debug, Clone)]
pub struct FetchedItem {
    pub id: Option<Uuid>,
    pub schema_name: String,
    pub title: Option<String>,
    pub context: JsonValue,
    pub created_at: DateTime<Utc>,
    pub embedding: Option<Vec<f32>>,
}

impl FetchedItem {
    pub fn from_breadcrumb(bc: &Breadcrumb) -> Self {
        FetchedItem {
            id: Some(bc.id),
            schema_name: bc.schema_name.clone(),
            title: bc.title.clone(),
            context: bc.context.clone(),
            created_at: bc.created_at,
            embedding: bc.embedding.clone(),
        }
    }

    fn from_list_item(item: BreadcrumbListItem) -> Self {
        FetchedItem {
            id: Some(item.id),
            schema_name: item.schema_name,
            title: item.title,
            context: item.context.unwrap_or(JsonValue::Null),
            created_at: item.created_at.unwrap_or(item.updated_at),
            embedding: item.embedding,
        }
    }
}

/// Normalised fetch parameters extracted from either a context selector or
/// a context-config source.
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    pub method: Option<FetchMethod>,
    pub schema_name: Option<String>,
    pub all_tags: Vec<String>,
    pub any_tags: Vec<String>,
    pub limit: usize,
    pub nn: usize,
}

impl FetchPlan {
    pub fn from_selector(selector: &Selector) -> Self {
        let fetch = selector.fetch.as_ref();
        FetchPlan {
            method: fetch.map(|f| f.method),
            schema_name: selector.schema_name.clone(),
            all_tags: selector.all_tags.clone().unwrap_or_default(),
            any_tags: selector.any_tags.clone().unwrap_or_default(),
            limit: fetch.and_then(|f| f.limit).unwrap_or(5),
            nn: fetch.and_then(|f| f.nn).unwrap_or(3),
        }
    }

    pub fn from_source(source: &SourceSpec) -> Self {
        FetchPlan {
            method: Some(source.method),
            schema_name: source.schema_name.clone(),
            all_tags: source.all_tags.clone().unwrap_or_default(),
            any_tags: source.any_tags.clone().unwrap_or_default(),
            limit: source.limit.unwrap_or(5),
            nn: source.nn.unwrap_or(3),
        }
    }

    /// Does this plan collapse to a single object in the context bundle?
    pub fn is_singular(&self) -> bool {
        matches!(self.method, Some(FetchMethod::Latest) | Some(FetchMethod::EventData))
            || self.limit == 1
    }
}

/// Execute a fetch plan. `trigger` feeds the `vector` query text and the
/// `event_data` passthrough; it is absent when a rebuild was fired by a
/// deletion, in which case those two methods yield nothing.
pub async fn fetch(
    client: &RcrtClient,
    plan: &FetchPlan,
    trigger: Option<&Breadcrumb>,
) -> Result<Vec<FetchedItem>, RunnerError> {
    let Some(method) = plan.method else {
        return Ok(vec![]);
    };

    match method {
        FetchMethod::Recent => {
            let mut items = search_items(client, plan, plan.limit).await?;
            items.truncate(plan.limit);
            Ok(items)
        }
        FetchMethod::Latest => {
            let mut items = search_items(client, plan, 1).await?;
            items.truncate(1);
            Ok(items)
        }
        FetchMethod::Vector => {
            let Some(trigger) = trigger else {
                return Ok(vec![]);
            };
            let q = trigger.content_or_text();
            let hits = client
                .vector_search(&q, plan.nn, plan.schema_name.as_deref())
                .await?;
            Ok(hits
                .iter()
                .filter(|bc| tag_filter(&bc.tags, plan))
                .map(FetchedItem::from_breadcrumb)
                .collect())
        }
        FetchMethod::EventData => Ok(trigger
            .map(|t| vec![FetchedItem::from_breadcrumb(t)])
            .unwrap_or_default()),
    }
}

/// Selector search sorted newest-first.
async fn search_items(
    client: &RcrtClient,
    plan: &FetchPlan,
    limit: usize,
) -> Result<Vec<FetchedItem>, RunnerError> {
    let query = SearchQuery {
        schema_name: plan.schema_name.clone(),
        tags: plan.all_tags.clone(),
        // Over-fetch a little so client-side any_tags filtering still fills
        // the requested window.
        limit: Some((limit * 2).max(limit)),
        include_context: true,
    };
    let mut items: Vec<FetchedItem> = client
        .search(&query)
        .await?
        .into_iter()
        .filter(|item| any_tag_filter(&item.tags, plan))
        .map(FetchedItem::from_list_item)
        .collect();
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(items)
}

fn tag_filter(tags: &[String], plan: &FetchPlan) -> bool {
    plan.all_tags.iter().all(|t| tags.contains(t)) && any_tag_filter(tags, plan)
}

fn any_tag_filter(tags: &[String], plan: &FetchPlan) -> bool {
    plan.any_tags.is_empty() || plan.any_tags.iter().any(|t| tags.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn selector_plan_defaults() {
        let sel: Selector = serde_json::from_value(json!({
            "schema_name": "user.message.v1",
            "role": "context",
            "fetch": {"method": "recent", "limit": 10}
        }))
        .unwrap();
        let plan = FetchPlan::from_selector(&sel);
        assert_eq!(plan.method, Some(FetchMethod::Recent));
        assert_eq!(plan.limit, 10);
        assert!(!plan.is_singular());
    }

    #[test]
    fn latest_and_limit_one_are_singular() {
        let latest: Selector = serde_json::from_value(json!({
            "schema_name": "x.v1", "role": "context", "fetch": {"method": "latest"}
        }))
        .unwrap();
        assert!(FetchPlan::from_selector(&latest).is_singular());

        let one: Selector = serde_json::from_value(json!({
            "schema_name": "x.v1", "role": "context", "fetch": {"method": "recent", "limit": 1}
        }))
        .unwrap();
        assert!(FetchPlan::from_selector(&one).is_singular());
    }

    #[test]
    fn source_plan_carries_tag_filters() {
        let src: SourceSpec = serde_json::from_value(json!({
            "schema_name": "user.message.v1",
            "method": "vector",
            "nn": 3,
            "all_tags": ["workspace:chat"]
        }))
        .unwrap();
        let plan = FetchPlan::from_source(&src);
        assert_eq!(plan.nn, 3);
        assert!(tag_filter(&["workspace:chat".into(), "z".into()], &plan));
        assert!(!tag_filter(&["z".into()], &plan));
    }
}
