/*!
 * Stable idempotency keys for bootstrap seeding.
 *
 * Derived from `(schema_name, sorted tags, title)` so re-running bootstrap
 * presents the same key for the same logical item and the store dedupes
 * the create.
 */

use sha2::{Digest, Sha256};

pub fn idempotency_key(schema_name: &str, tags: &[String], title: &str) -> String {
    let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update(schema_name.as_bytes());
    hasher.update([0u8]);
    for tag in &sorted {
        hasher.update(tag.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(title.as_bytes());
    hex::encode(hasher.finalize())
}
