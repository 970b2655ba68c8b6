/*!
 * Processing-status table.
 *
 * Guarantees at-most-one concurrent execution per (consumer, trigger) even
 * when the store redelivers "created" plus "updated" for the same record,
 * or a caller re-emits a request with an unchanged request id. Bounded by
 * a coarse LRU; executor idempotency via request ids covers the rare
 * eviction of a still-relevant entry.
 */

use lru::LruCache;
use rcrt_runner_core::Breadcrumb;
use std::num::NonZeroUsize;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Processing,
    Completed,
}

pub struct ProcessingStatus {
    entries: Mutex<LruCache<(String, String), ProcessingState>>,
}

/// The dedup key for a trigger: the caller-supplied request id when the
/// payload carries one (so a re-emitted request is one logical trigger),
/// else breadcrumb id plus version. Including the version lets an
/// updated-in-place record (the rolling context) trigger again, while the
/// created+updated pair of a single write still collapses.
pub fn claim_key(trigger: &Breadcrumb) -> String {
    trigger
        .context
        .get("request_id")
        .or_else(|| trigger.context.get("requestId"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("{}:{}", trigger.id, trigger.version))
}

impl ProcessingStatus {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("non-zero cap");
        ProcessingStatus {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Claim the trigger for this consumer. Returns `false` when a run is
    /// already processing or completed.
    pub fn try_claim(&self, consumer_id: &str, trigger_key: &str) -> bool {
        let mut entries = self.entries.lock().expect("status lock");
        let key = (consumer_id.to_string(), trigger_key.to_string());
        if entries.contains(&key) {
            return false;
        }
        entries.put(key, ProcessingState::Processing);
        true
    }

    /// Mark the run finished (success or failure both release the claim into
    /// the completed state, blocking redelivery).
    pub fn complete(&self, consumer_id: &str, trigger_key: &str) {
        let mut entries = self.entries.lock().expect("status lock");
        entries.put(
            (consumer_id.to_string(), trigger_key.to_string()),
            ProcessingState::Completed,
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("status lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
