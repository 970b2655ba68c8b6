/*!
 * RCRT Runner
 *
 * Reactive dispatch fabric over the RCRT record store: one SSE reader
 * feeding the event bridge, the context-builder service and the executor
 * registry (agents, tools, workflows), all discovered from declarative
 * consumer definitions in the store.
 */

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod backoff;
mod bootstrap;
mod bridge;
mod config;
mod context;
mod dispatcher;
mod executor;
mod rcrt_client;
mod registry;
mod shutdown;
mod status;

use bridge::EventBridge;
use config::Config;
use context::ContextService;
use dispatcher::Dispatcher;
use executor::tool::ToolRegistry;
use executor::{ExecutionContext, ExecutorRuntime};
use rcrt_client::RcrtClient;
use registry::Registry;
use shutdown::{Inflight, Shutdown};
use status::ProcessingStatus;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rcrt_runner=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("🚀 RCRT Runner starting...");

    let config = Config::from_env()?;
    info!("✅ Configuration loaded");
    info!("   Store: {}", config.base_url);
    info!("   Workspace: {}", config.workspace);
    info!("   Mode: {:?}", config.deployment_mode);

    let client = Arc::new(RcrtClient::new(&config).await?);
    info!("✅ RCRT client connected");

    let lifecycle = Shutdown::new();
    let _refresher = client.spawn_token_refresher(lifecycle.subscribe());

    let bridge = Arc::new(EventBridge::new());
    let status = Arc::new(ProcessingStatus::new(config.processing_table_cap));
    let tools = Arc::new(ToolRegistry::with_builtins());
    info!("✅ Tool registry ready: {:?}", tools.names());

    let exec_ctx = ExecutionContext {
        client: client.clone(),
        bridge: bridge.clone(),
        workspace: config.workspace.clone(),
        agent_id: config.agent_id.clone(),
        wait_timeout: Duration::from_secs(config.wait_timeout_secs),
    };

    let context_service = ContextService::new(
        client.clone(),
        config.workspace.clone(),
        config.rebuild_queue_cap,
        lifecycle.subscribe(),
    );

    let registry = Registry::new(exec_ctx.clone(), tools, context_service.clone());

    bootstrap::run(&client, &config).await?;

    let bound = registry.load_all().await?;
    info!("✅ {} consumer(s) discovered", bound);
    info!("   {} context config(s) active", context_service.config_count());

    let runtime = Arc::new(ExecutorRuntime {
        ctx: exec_ctx,
        handler_timeout: Duration::from_secs(config.handler_timeout_secs),
    });
    let inflight = Inflight::new();

    let dispatcher = Arc::new(Dispatcher::new(
        client.clone(),
        bridge.clone(),
        registry,
        status,
        context_service,
        runtime,
        inflight.clone(),
        lifecycle.subscribe(),
    ));

    let dispatcher_task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    info!("💚 Runner is live, listening for events");
    shutdown::wait_for_signal().await;

    // Graceful drain: stop taking events, let in-flight handlers finish.
    lifecycle.trigger();
    let drain = Duration::from_secs(config.drain_timeout_secs);
    if inflight.drain(drain).await {
        info!("All in-flight handlers drained");
    } else {
        warn!(
            "Drain deadline hit with {} handler(s) still running",
            inflight.count()
        );
    }
    bridge.close();
    let _ = dispatcher_task.await;

    info!("👋 Runner stopped");
    Ok(())
}
