/*!
 * SSE dispatcher.
 *
 * Single long-lived consumer of the store's event stream. Frames are
 * parsed tolerantly, upserted events are routed to the event bridge, the
 * matching executors (guarded by the processing-status table) and the
 * context-builder service, and consumer-definition upserts hot-bind the
 * registry. Reconnects with capped, jittered backoff; a 401 refreshes the
 * token first.
 */

use crate::backoff;
use crate::bridge::EventBridge;
use crate::context::ContextService;
use crate::executor::ExecutorRuntime;
use crate::rcrt_client::RcrtClient;
use crate::registry::Registry;
use crate::shutdown::Inflight;
use crate::status::ProcessingStatus;
use futures::{FutureExt, StreamExt};
use rcrt_runner_core::matcher::EventView;
use rcrt_runner_core::models::EventKind;
use rcrt_runner_core::{repair, BreadcrumbEvent, RunnerError};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    client: Arc<RcrtClient>,
    bridge: Arc<EventBridge>,
    registry: Arc<Registry>,
    status: Arc<ProcessingStatus>,
    context_service: Arc<ContextService>,
    runtime: Arc<ExecutorRuntime>,
    inflight: Arc<Inflight>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<RcrtClient>,
        bridge: Arc<EventBridge>,
        registry: Arc<Registry>,
        status: Arc<ProcessingStatus>,
        context_service: Arc<ContextService>,
        runtime: Arc<ExecutorRuntime>,
        inflight: Arc<Inflight>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Dispatcher {
            client,
            bridge,
            registry,
            status,
            context_service,
            runtime,
            inflight,
            shutdown,
        }
    }

    /// Connect-consume-reconnect until shutdown.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut attempt = 0u32;
        let mut last_event_id: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.client.connect_sse(last_event_id.as_deref()).await {
                Ok(response) => {
                    attempt = 0;
                    match self.consume(response, &mut shutdown, &mut last_event_id).await {
                        Ok(()) => {
                            if *shutdown.borrow() {
                                break;
                            }
                            warn!("SSE stream ended, reconnecting...");
                        }
                        Err(e) => warn!("SSE stream error: {}, reconnecting...", e),
                    }
                }
                Err(e) => {
                    if e.is_auth() {
                        debug!("SSE connect unauthorized, refreshing token");
                        if let Err(refresh_err) = self.client.refresh_token().await {
                            warn!("Token refresh failed: {}", refresh_err);
                        }
                    } else {
                        warn!("SSE connect failed: {}", e);
                    }
                    let delay = backoff::delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        info!("Dispatcher stopped");
    }

    /// Read `data:` frames off one connection until it drops or shutdown.
    /// `id:` fields are remembered so the next connect can resume.
    async fn consume(
        &self,
        response: reqwest::Response,
        shutdown: &mut watch::Receiver<bool>,
        last_event_id: &mut Option<String>,
    ) -> Result<(), RunnerError> {
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    let bytes = match chunk {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(RunnerError::Transient(format!("sse read: {e}"))),
                        Some(Ok(bytes)) => bytes,
                    };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(newline) = buffer.find('\n') {
                        let line: String = buffer.drain(..=newline).collect();
                        let line = line.trim();
                        if let Some(data) = line.strip_prefix("data:") {
                            self.handle_frame(data.trim_start()).await;
                        } else if let Some(id) = line.strip_prefix("id:") {
                            *last_event_id = Some(id.trim().to_string());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, data: &str) {
        let Some(value) = repair::parse_lenient(data) else {
            warn!("Dropping unparseable SSE frame: {}", truncate(data, 120));
            return;
        };
        let event: BreadcrumbEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed event frame: {}", e);
                return;
            }
        };
        self.route(event).await;
    }

    /// Route one parsed event. Public so in-process emitters (tests,
    /// embedded runners) can bypass the SSE transport.
    pub async fn route(&self, event: BreadcrumbEvent) {
        match event.kind() {
            EventKind::Ping => {}
            EventKind::Unknown => {
                debug!("Ignoring unknown event type '{}'", event.event_type);
            }
            EventKind::Deleted => {
                if let Some(id) = event.breadcrumb_id {
                    self.bridge.purge(id);
                    self.registry.remove_by_breadcrumb(id);
                }
                self.context_service.handle_deleted(&event);
            }
            EventKind::Upserted => self.route_upserted(event).await,
        }
    }

    async fn route_upserted(&self, event: BreadcrumbEvent) {
        let Some(id) = event.breadcrumb_id else {
            debug!("Upserted event without breadcrumb id, skipping");
            return;
        };

        let view = EventView::from_event(&event);
        let matched = self.registry.matching_executors(view);
        let is_definition = event
            .schema_name
            .as_deref()
            .map(Registry::is_definition_schema)
            .unwrap_or(false);
        let context_interest = self.context_service.has_interest(view);

        // Thin events are cheap; the full fetch is only paid when someone
        // downstream cares.
        if matched.is_empty() && !is_definition && !context_interest && !self.bridge.has_waiters()
        {
            return;
        }

        let full = match self.client.get(id).await {
            Ok(bc) => Arc::new(bc),
            Err(RunnerError::NotFound(_)) => {
                debug!("Breadcrumb {} gone before fetch, skipping", id);
                return;
            }
            Err(e) => {
                warn!("Fetch of {} failed: {}, skipping event", id, e);
                return;
            }
        };

        // Bridge first: a handler awaiting this response must see it even
        // while executors are still being scheduled.
        self.bridge.publish(full.clone());

        if is_definition {
            self.registry.install(&full.schema_name, full.id, &full.context);
        }

        self.context_service.handle_event(&full);

        let trigger_key = crate::status::claim_key(&full);
        for executor in matched {
            let consumer_id = executor.definition.id.clone();
            if !self.status.try_claim(&consumer_id, &trigger_key) {
                debug!(
                    "Trigger {} already claimed for {}, skipping",
                    trigger_key, consumer_id
                );
                continue;
            }

            let runtime = self.runtime.clone();
            let status = self.status.clone();
            let trigger = full.clone();
            let key = trigger_key.clone();
            let guard = self.inflight.guard();
            tokio::spawn(async move {
                let _guard = guard;
                let run = runtime.run_trigger(&executor, trigger);
                if std::panic::AssertUnwindSafe(run).catch_unwind().await.is_err() {
                    error!("Executor task for {} panicked; isolated", consumer_id);
                }
                status.complete(&consumer_id, &key);
            });
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 2), "he");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
