/*!
 * Near-duplicate collapsing for assembled context.
 *
 * Items whose embedding cosine similarity exceeds the configured threshold
 * collapse to the newest of the pair. Records without embeddings fall back
 * to normalised text equality.
 */

use super::fetch::FetchedItem;
use serde_json::Value as JsonValue;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Lowercased, whitespace-collapsed rendering of a context payload, used
/// when no embedding is available.
pub fn normalized_text(context: &JsonValue) -> String {
    let raw = match context {
        JsonValue::String(s) => s.clone(),
        other => other
            .get("content")
            .or_else(|| other.get("text"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| other.to_string()),
    };
    raw.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_duplicate(a: &FetchedItem, b: &FetchedItem, threshold: f32) -> bool {
    match (&a.embedding, &b.embedding) {
        (Some(ea), Some(eb)) => cosine_similarity(ea, eb) > threshold,
        _ => {
            // Same record fetched through two sources is always a duplicate.
            if let (Some(ia), Some(ib)) = (a.id, b.id) {
                if ia == ib {
                    return true;
                }
            }
            normalized_text(&a.context) == normalized_text(&b.context)
        }
    }
}

/// Collapse near-duplicates, keeping the newest of each cluster.
pub fn dedup_items(items: Vec<FetchedItem>, threshold: f32) -> Vec<FetchedItem> {
    dedup_by(items, threshold, |item| item)
}

/// Generic variant for carriers that wrap a [`FetchedItem`] (e.g. items
/// tagged with their source section).
pub fn dedup_by<T>(items: Vec<T>, threshold: f32, item_of: impl Fn(&T) -> &FetchedItem) -> Vec<T> {
    let mut ordered = items;
    // Walk newest-first so the survivor of each cluster is the newest.
    ordered.sort_by(|a, b| item_of(b).created_at.cmp(&item_of(a).created_at));
    let mut kept: Vec<T> = Vec::with_capacity(ordered.len());
    for carrier in ordered {
        if !kept
            .iter()
            .any(|k| is_duplicate(item_of(k), item_of(&carrier), threshold))
        {
            kept.push(carrier);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn item(text: &str, age_secs: i64, embedding: Option<Vec<f32>>) -> FetchedItem {
        FetchedItem {
            id: Some(uuid::Uuid::new_v4()),
            schema_name: "user.message.v1".into(),
            title: None,
            context: json!({"content": text}),
            created_at: Utc::now() - Duration::seconds(age_secs),
            embedding,
        }
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, 0.25, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_do_not_panic() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn near_identical_embeddings_collapse_to_newest() {
        let old = item("hello", 100, Some(vec![1.0, 0.0, 0.01]));
        let new = item("hello again", 1, Some(vec![1.0, 0.0, 0.0]));
        let kept = dedup_items(vec![old, new.clone()], 0.95);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, new.id);
    }

    #[test]
    fn distinct_embeddings_survive() {
        let a = item("alpha", 10, Some(vec![1.0, 0.0]));
        let b = item("beta", 5, Some(vec![0.0, 1.0]));
        assert_eq!(dedup_items(vec![a, b], 0.95).len(), 2);
    }

    #[test]
    fn text_fallback_ignores_case_and_spacing() {
        let a = item("Hello   World", 10, None);
        let b = item("hello world", 1, None);
        let kept = dedup_items(vec![a, b], 0.95);
        assert_eq!(kept.len(), 1);
        assert_eq!(normalized_text(&kept[0].context), "hello world");
    }

    #[test]
    fn same_id_is_always_a_duplicate() {
        let mut a = item("one thing", 10, None);
        let mut b = item("another thing", 1, None);
        let shared = uuid::Uuid::new_v4();
        a.id = Some(shared);
        b.id = Some(shared);
        assert_eq!(dedup_items(vec![a, b], 0.95).len(), 1);
    }
}
