/*!
 * Process lifecycle: signal handling, in-flight tracking and graceful
 * drain.
 */

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::info;

/// Broadcast shutdown flag. Components hold a receiver and exit their
/// loops when it flips.
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Shutdown { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Block until SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("🛑 SIGINT received"),
            _ = sigterm.recv() => info!("🛑 SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("🛑 Ctrl-C received");
    }
}

/// Counter of live handler tasks, awaitable for drain.
pub struct Inflight {
    count: AtomicUsize,
    notify: Notify,
}

impl Inflight {
    pub fn new() -> Arc<Self> {
        Arc::new(Inflight {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        })
    }

    pub fn guard(self: &Arc<Self>) -> InflightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InflightGuard { inner: self.clone() }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait for all in-flight handlers to finish, up to the drain deadline.
    /// Returns true when fully drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let until = tokio::time::Instant::now() + deadline;
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return true;
            }
            let remaining = until.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.count() == 0;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.count() == 0;
            }
        }
    }
}

pub struct InflightGuard {
    inner: Arc<Inflight>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}
