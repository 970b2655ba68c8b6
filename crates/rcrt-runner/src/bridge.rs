/*!
 * Event bridge.
 *
 * Lets handlers await a future breadcrumb matching structural criteria
 * without polling. A bounded recent-history ring covers the gap between a
 * handler posting a request and registering its wait: the response may
 * already have arrived.
 */

use rcrt_runner_core::matcher;
use rcrt_runner_core::models::ContextMatch;
use rcrt_runner_core::{Breadcrumb, RunnerError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

const HISTORY_CAP: usize = 100;
pub const DEFAULT_WAIT: Duration = Duration::from_secs(60);

/// Structural match criteria for a wait.
#[derive(Debug, Clone, Default)]
pub struct WaitCriteria {
    pub schema_name: Option<String>,
    /// Matches `context.request_id` (or `context.requestId`).
    pub request_id: Option<String>,
    /// All listed tags must be present.
    pub tags: Vec<String>,
    pub context_match: Option<Vec<ContextMatch>>,
}

impl WaitCriteria {
    pub fn schema(schema_name: &str) -> Self {
        WaitCriteria {
            schema_name: Some(schema_name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    fn matches(&self, bc: &Breadcrumb) -> bool {
        if let Some(schema) = &self.schema_name {
            if &bc.schema_name != schema {
                return false;
            }
        }
        if !self.tags.iter().all(|t| bc.tags.contains(t)) {
            return false;
        }
        if let Some(request_id) = &self.request_id {
            let got = bc
                .context
                .get("request_id")
                .or_else(|| bc.context.get("requestId"))
                .and_then(|v| v.as_str());
            if got != Some(request_id.as_str()) {
                return false;
            }
        }
        if let Some(predicates) = &self.context_match {
            if !matcher::predicates_all(&bc.context, predicates) {
                return false;
            }
        }
        true
    }
}

struct Waiter {
    id: u64,
    criteria: WaitCriteria,
    tx: oneshot::Sender<Arc<Breadcrumb>>,
}

struct Inner {
    waiters: Vec<Waiter>,
    history: VecDeque<Arc<Breadcrumb>>,
}

pub struct EventBridge {
    inner: Mutex<Inner>,
    next_waiter_id: AtomicU64,
}

impl EventBridge {
    pub fn new() -> Self {
        EventBridge {
            inner: Mutex::new(Inner {
                waiters: Vec::new(),
                history: VecDeque::with_capacity(HISTORY_CAP),
            }),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Inbound event: append to history (dropping the oldest past the cap)
    /// and resolve every matching waiter. One event may satisfy several.
    pub fn publish(&self, bc: Arc<Breadcrumb>) {
        let mut inner = self.inner.lock().expect("bridge lock");

        inner.history.push_back(bc.clone());
        while inner.history.len() > HISTORY_CAP {
            inner.history.pop_front();
        }

        let waiters = std::mem::take(&mut inner.waiters);
        let mut resolved = 0usize;
        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue; // caller went away
            }
            if waiter.criteria.matches(&bc) {
                let _ = waiter.tx.send(bc.clone());
                resolved += 1;
            } else {
                inner.waiters.push(waiter);
            }
        }
        if resolved > 0 {
            debug!("Bridge resolved {} waiter(s) with {}", resolved, bc.id);
        }
    }

    /// Await a breadcrumb matching `criteria`. The recent history is
    /// scanned first (newest first); otherwise the call parks until a
    /// matching event arrives or the deadline fires.
    pub async fn wait(
        &self,
        criteria: WaitCriteria,
        timeout: Option<Duration>,
    ) -> Result<Arc<Breadcrumb>, RunnerError> {
        let timeout = timeout.unwrap_or(DEFAULT_WAIT);

        let (waiter_id, rx) = {
            let mut inner = self.inner.lock().expect("bridge lock");
            if let Some(hit) = inner.history.iter().rev().find(|bc| criteria.matches(bc)) {
                return Ok(hit.clone());
            }
            let (tx, rx) = oneshot::channel();
            let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            inner.waiters.push(Waiter { id, criteria, tx });
            (id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(bc)) => Ok(bc),
            Ok(Err(_)) => {
                // Bridge shut down underneath us.
                Err(RunnerError::Fatal("event bridge closed".into()))
            }
            Err(_) => {
                self.remove_waiter(waiter_id);
                Err(RunnerError::Timeout(timeout))
            }
        }
    }

    /// Drop history entries for a deleted breadcrumb so late waiters do not
    /// resolve against a record that no longer exists.
    pub fn purge(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("bridge lock");
        inner.history.retain(|bc| bc.id != id);
    }

    pub fn has_waiters(&self) -> bool {
        !self.inner.lock().expect("bridge lock").waiters.is_empty()
    }

    /// Cancel all pending waits (graceful shutdown).
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("bridge lock");
        inner.waiters.clear();
    }

    fn remove_waiter(&self, waiter_id: u64) {
        let mut inner = self.inner.lock().expect("bridge lock");
        inner.waiters.retain(|w| w.id != waiter_id);
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn crumb(schema: &str, tags: &[&str], context: serde_json::Value) -> Arc<Breadcrumb> {
        Arc::new(Breadcrumb {
            id: Uuid::new_v4(),
            schema_name: schema.to_string(),
            title: None,
            tags: tags.iter().map(|s| s.to_string()).collect(),
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
    async fn wait_resolves_on_later_publish() {
        let bridge = Arc::new(EventBridge::new());
        let waiter = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .wait(
                        WaitCriteria::schema("tool.response.v1").with_request_id("r-1"),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            })
        };

        tokio::task::yield_now().await;
        bridge.publish(crumb(
            "tool.response.v1",
            &["tool:response"],
            json!({"request_id": "r-1", "output": {"x": 1}}),
        ));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.context["output"]["x"], json!(1));
    }

    #[tokio::test]
    async fn history_satisfies_late_waiter() {
        let bridge = EventBridge::new();
        bridge.publish(crumb(
            "tool.response.v1",
            &[],
            json!({"request_id": "r-2"}),
        ));

        // Response arrived before the wait was registered.
        let got = bridge
            .wait(
                WaitCriteria::schema("tool.response.v1").with_request_id("r-2"),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        assert_eq!(got.context["request_id"], json!("r-2"));
    }

    #[tokio::test]
    async fn newest_history_entry_wins() {
        let bridge = EventBridge::new();
        let old = crumb("agent.response.v1", &[], json!({"n": 1}));
        let new = crumb("agent.response.v1", &[], json!({"n": 2}));
        bridge.publish(old);
        bridge.publish(new.clone());

        let got = bridge
            .wait(
                WaitCriteria::schema("agent.response.v1"),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap();
        assert_eq!(got.id, new.id);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_and_cleans_up() {
        let bridge = Arc::new(EventBridge::new());
        let result = bridge
            .wait(
                WaitCriteria::schema("never.v1"),
                Some(Duration::from_secs(1)),
            )
            .await;
        assert!(matches!(result, Err(RunnerError::Timeout(_))));
        assert!(!bridge.has_waiters());
    }

    #[tokio::test]
    async fn one_event_resolves_multiple_waiters() {
        let bridge = Arc::new(EventBridge::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let bridge = bridge.clone();
            handles.push(tokio::spawn(async move {
                bridge
                    .wait(
                        WaitCriteria::schema("broadcast.v1"),
                        Some(Duration::from_secs(5)),
                    )
                    .await
            }));
        }
        tokio::task::yield_now().await;
        bridge.publish(crumb("broadcast.v1", &[], json!({})));

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn tag_and_predicate_criteria() {
        let bridge = EventBridge::new();
        bridge.publish(crumb(
            "tool.response.v1",
            &["workspace:tools"],
            json!({"status": "success"}),
        ));

        let miss = bridge
            .wait(
                WaitCriteria::schema("tool.response.v1").with_tags(vec!["workspace:chat".into()]),
                Some(Duration::from_millis(10)),
            )
            .await;
        assert!(miss.is_err());

        let criteria = WaitCriteria {
            schema_name: Some("tool.response.v1".into()),
            context_match: Some(vec![ContextMatch {
                path: "$.status".into(),
                op: rcrt_runner_core::MatchOp::Eq,
                value: json!("success"),
            }]),
            ..Default::default()
        };
        assert!(bridge.wait(criteria, Some(Duration::from_millis(10))).await.is_ok());
    }

    #[tokio::test]
    async fn purge_removes_history() {
        let bridge = EventBridge::new();
        let bc = crumb("x.v1", &[], json!({}));
        let id = bc.id;
        bridge.publish(bc);
        bridge.purge(id);

        let result = bridge
            .wait(WaitCriteria::schema("x.v1"), Some(Duration::from_millis(10)))
            .await;
        assert!(result.is_err());
    }
}
