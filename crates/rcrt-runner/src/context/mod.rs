/*!
 * Context-builder service.
 *
 * Turns each declarative `context.config.v1` into an always-fresh rolling
 * context breadcrumb its consumer subscribes to. Rebuilds for one consumer
 * are serialised through a bounded newest-wins queue; different consumers
 * rebuild in parallel.
 */

pub mod budget;
pub mod dedup;
pub mod fetch;
pub mod format;

use crate::rcrt_client::{RcrtClient, SearchQuery};
use chrono::{Duration as ChronoDuration, Utc};
use rcrt_runner_core::matcher::{self, EventView};
use rcrt_runner_core::models::ContextBuilderConfig;
use rcrt_runner_core::{Breadcrumb, BreadcrumbCreate, BreadcrumbEvent, RunnerError};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::fetch::{FetchPlan, FetchedItem};

/// A queued rebuild: the trigger breadcrumb, or `None` when the rebuild was
/// fired by a deletion (vector/event_data sources then yield nothing).
type RebuildTrigger = Option<Arc<Breadcrumb>>;

struct ConfigEntry {
    consumer_id: String,
    config: ContextBuilderConfig,
    queue: Mutex<VecDeque<RebuildTrigger>>,
    notify: Notify,
    removed: AtomicBool,
    /// Rolling context breadcrumb id, cached after the first write.
    output_id: Mutex<Option<Uuid>>,
}

pub struct ContextService {
    client: Arc<RcrtClient>,
    workspace: String,
    queue_cap: usize,
    entries: Mutex<HashMap<String, Arc<ConfigEntry>>>,
    shutdown: watch::Receiver<bool>,
}

impl ContextService {
    pub fn new(
        client: Arc<RcrtClient>,
        workspace: String,
        queue_cap: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(ContextService {
            client,
            workspace,
            queue_cap,
            entries: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Register (or replace) a config and start its rebuild worker.
    pub fn register(self: &Arc<Self>, consumer_id: &str, config: ContextBuilderConfig) {
        let entry = Arc::new(ConfigEntry {
            consumer_id: consumer_id.to_string(),
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            removed: AtomicBool::new(false),
            output_id: Mutex::new(None),
        });

        let previous = {
            let mut entries = self.entries.lock().expect("context entries lock");
            entries.insert(consumer_id.to_string(), entry.clone())
        };
        if let Some(old) = previous {
            old.removed.store(true, Ordering::SeqCst);
            old.notify.notify_one();
        }

        info!("🧩 Context config registered for {}", consumer_id);
        let service = self.clone();
        tokio::spawn(async move {
            service.worker(entry).await;
        });
    }

    /// Idempotent removal; the worker drains and exits.
    pub fn deregister(&self, consumer_id: &str) {
        let removed = {
            let mut entries = self.entries.lock().expect("context entries lock");
            entries.remove(consumer_id)
        };
        if let Some(entry) = removed {
            entry.removed.store(true, Ordering::SeqCst);
            entry.notify.notify_one();
            info!("Context config deregistered for {}", consumer_id);
        }
    }

    pub fn config_count(&self) -> usize {
        self.entries.lock().expect("context entries lock").len()
    }

    /// Upserted event with its full breadcrumb: enqueue a rebuild for every
    /// config whose update_triggers match.
    pub fn handle_event(&self, bc: &Arc<Breadcrumb>) {
        let view = EventView::from_breadcrumb(bc);
        for entry in self.matching_entries(view) {
            self.enqueue(&entry, Some(bc.clone()));
        }
    }

    /// Deleted events rebuild too (the vanished record may have been part
    /// of someone's context), using only metadata from the thin event.
    pub fn handle_deleted(&self, event: &BreadcrumbEvent) {
        let view = EventView::from_event(event);
        for entry in self.matching_entries(view) {
            self.enqueue(&entry, None);
        }
    }

    /// Thin-view probe used by the dispatcher to decide whether an event is
    /// worth the full fetch.
    pub fn has_interest(&self, view: EventView<'_>) -> bool {
        !self.matching_entries(view).is_empty()
    }

    fn matching_entries(&self, view: EventView<'_>) -> Vec<Arc<ConfigEntry>> {
        let entries = self.entries.lock().expect("context entries lock");
        entries
            .values()
            .filter(|e| {
                e.config
                    .update_triggers
                    .iter()
                    .any(|sel| matcher::matches(view, sel))
            })
            .cloned()
            .collect()
    }

    fn enqueue(&self, entry: &Arc<ConfigEntry>, trigger: RebuildTrigger) {
        {
            let mut queue = entry.queue.lock().expect("rebuild queue lock");
            if queue.len() >= self.queue_cap {
                queue.pop_front();
                warn!(
                    "Rebuild queue full for {}, dropping oldest pending rebuild",
                    entry.consumer_id
                );
            }
            queue.push_back(trigger);
        }
        entry.notify.notify_one();
    }

    async fn worker(self: Arc<Self>, entry: Arc<ConfigEntry>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            // Drain everything queued before parking again.
            loop {
                let next = {
                    let mut queue = entry.queue.lock().expect("rebuild queue lock");
                    queue.pop_front()
                };
                let Some(trigger) = next else { break };
                if let Err(e) = self.rebuild(&entry, trigger).await {
                    // The service never goes down over a failed rebuild.
                    error!("Context rebuild failed for {}: {}", entry.consumer_id, e);
                }
            }

            if entry.removed.load(Ordering::SeqCst) {
                debug!("Context worker for {} exiting", entry.consumer_id);
                return;
            }

            tokio::select! {
                _ = entry.notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn rebuild(
        &self,
        entry: &ConfigEntry,
        trigger: RebuildTrigger,
    ) -> Result<(), RunnerError> {
        let config = &entry.config;
        let trigger_ref = trigger.as_deref();

        // 1. Fetch each declared source, remembering which source produced
        //    which item so sections keep their declared order.
        let mut tagged: Vec<(usize, FetchedItem)> = Vec::new();
        for (idx, source) in config.sources.iter().enumerate() {
            let plan = FetchPlan::from_source(source);
            match fetch::fetch(&self.client, &plan, trigger_ref).await {
                Ok(items) => tagged.extend(items.into_iter().map(|i| (idx, i))),
                Err(e) => warn!(
                    "Source {} failed for {}: {}",
                    source.bucket_key(),
                    entry.consumer_id,
                    e
                ),
            }
        }

        // 2. Collapse near-duplicates across all sources, newest wins.
        let deduped = dedup::dedup_by(
            tagged,
            config.formatting.deduplication_threshold,
            |(_, item)| item,
        );

        // 3. Budget, dropping the least-recent tail.
        let (kept, token_total) =
            budget::trim_by(deduped, config.formatting.max_tokens, |(_, item)| item);

        // 4. Format, sections in declared source order.
        let mut by_source: Vec<Vec<FetchedItem>> = vec![Vec::new(); config.sources.len()];
        let kept_count = kept.len();
        for (idx, item) in kept {
            by_source[idx].push(item);
        }
        let sections: Vec<format::Section<'_>> = config
            .sources
            .iter()
            .zip(by_source.iter())
            .map(|(source, items)| format::Section {
                key: source.bucket_key(),
                items,
            })
            .collect();
        let formatted = format::format_sections(&sections, config.formatting.include_metadata);

        // 5. Write the rolling context breadcrumb.
        let payload = json!({
            "consumer_id": entry.consumer_id,
            "trigger_event_id": trigger_ref.map(|t| t.id),
            "assembled_at": Utc::now().to_rfc3339(),
            "token_estimate": token_total,
            "sources_assembled": config.sources.len(),
            "breadcrumb_count": kept_count,
            "formatted_context": formatted,
        });
        self.publish(entry, payload).await?;

        debug!(
            "Context rebuilt for {} ({} items, ~{} tokens)",
            entry.consumer_id, kept_count, token_total
        );
        Ok(())
    }

    async fn publish(
        &self,
        entry: &ConfigEntry,
        payload: serde_json::Value,
    ) -> Result<(), RunnerError> {
        let output = &entry.config.output;
        let consumer_tag = format!("consumer:{}", entry.consumer_id);
        let ttl = Utc::now() + ChronoDuration::seconds(output.ttl_seconds as i64);

        let cached = *entry.output_id.lock().expect("output id lock");
        let existing = match cached {
            Some(id) => match self.client.get(id).await {
                Ok(bc) => Some((bc.id, bc.version)),
                Err(RunnerError::NotFound(_)) => {
                    *entry.output_id.lock().expect("output id lock") = None;
                    None
                }
                Err(e) => return Err(e),
            },
            None => self
                .client
                .search(&SearchQuery {
                    schema_name: Some(output.schema_name.clone()),
                    tags: vec![consumer_tag.clone()],
                    limit: Some(1),
                    include_context: false,
                })
                .await?
                .first()
                .map(|item| (item.id, item.version)),
        };

        match existing {
            Some((id, version)) => {
                let patch = json!({"context": payload, "ttl": ttl});
                match self.client.update_with_refetch(id, version, &patch).await {
                    Ok(()) => {
                        *entry.output_id.lock().expect("output id lock") = Some(id);
                        Ok(())
                    }
                    Err(RunnerError::VersionMismatch { .. }) => {
                        // Reported, never fatal: the next trigger rebuilds.
                        warn!(
                            "Persistent version mismatch updating context for {}",
                            entry.consumer_id
                        );
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            None => {
                let mut tags = output.tags.clone();
                for tag in [consumer_tag, self.workspace.clone()] {
                    if !tags.contains(&tag) {
                        tags.push(tag);
                    }
                }
                let created = self
                    .client
                    .create(
                        &BreadcrumbCreate {
                            schema_name: output.schema_name.clone(),
                            title: format!("Context for {}", entry.consumer_id),
                            tags,
                            context: payload,
                            ttl: Some(ttl),
                            visibility: None,
                            sensitivity: None,
                        },
                        None,
                    )
                    .await?;
                *entry.output_id.lock().expect("output id lock") = Some(created.id);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcrt_runner_core::models::Selector;
    use serde_json::json;

    fn config(update_schema: &str) -> ContextBuilderConfig {
        serde_json::from_value(json!({
            "sources": [
                {"schema_name": "user.message.v1", "method": "recent", "limit": 5, "key": "history"}
            ],
            "update_triggers": [
                {"schema_name": update_schema, "role": "trigger"}
            ],
            "output": {"schema_name": "agent.context.v1", "tags": [], "ttl_seconds": 600}
        }))
        .unwrap()
    }

    #[test]
    fn update_trigger_matching_uses_selector_rules() {
        let cfg = config("user.message.v1");
        let sel: &Selector = &cfg.update_triggers[0];
        let tags: Vec<String> = vec![];
        let hit = EventView {
            schema_name: Some("user.message.v1"),
            tags: &tags,
            context: None,
        };
        let miss = EventView {
            schema_name: Some("tool.response.v1"),
            tags: &tags,
            context: None,
        };
        assert!(matcher::matches(hit, sel));
        assert!(!matcher::matches(miss, sel));
    }

    #[test]
    fn config_defaults_round_trip() {
        let cfg = config("user.message.v1");
        assert_eq!(cfg.formatting.max_tokens, 4000);
        assert_eq!(cfg.output.ttl_seconds, 600);
        assert_eq!(cfg.sources[0].bucket_key(), "history");
    }
}
