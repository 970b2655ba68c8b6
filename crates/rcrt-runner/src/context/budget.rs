/*!
 * Token budgeting for assembled context.
 *
 * Whitespace-word heuristic scaled by 1.3; good enough to keep the rolling
 * context under the model window. Swap `estimate_tokens` for a real
 * tokenizer if a specific model needs tighter bounds.
 */

use super::fetch::FetchedItem;

const WORDS_TO_TOKENS: f32 = 1.3;

pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    (words as f32 * WORDS_TO_TOKENS).ceil() as usize
}

pub fn estimate_item_tokens(item: &FetchedItem) -> usize {
    estimate_tokens(&item.context.to_string())
}

/// Keep items in order until the budget is exhausted. Callers pass items
/// highest-priority first (newest / most similar), so the trim drops the
/// least-recent and lowest-similarity tail.
pub fn trim_to_budget(items: Vec<FetchedItem>, max_tokens: usize) -> (Vec<FetchedItem>, usize) {
    trim_by(items, max_tokens, |item| item)
}

/// Generic variant for carriers that wrap a [`FetchedItem`].
pub fn trim_by<T>(
    items: Vec<T>,
    max_tokens: usize,
    item_of: impl Fn(&T) -> &FetchedItem,
) -> (Vec<T>, usize) {
    let mut kept = Vec::with_capacity(items.len());
    let mut total = 0usize;
    for carrier in items {
        let cost = estimate_item_tokens(item_of(&carrier));
        if kept.is_empty() && cost > max_tokens {
            // A single oversized item still goes in; an empty context is
            // worse than an over-budget one.
            total += cost;
            kept.push(carrier);
            continue;
        }
        if total + cost > max_tokens {
            continue;
        }
        total += cost;
        kept.push(carrier);
    }
    (kept, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn item(words: usize) -> FetchedItem {
        let text = vec!["word"; words].join(" ");
        FetchedItem {
            id: None,
            schema_name: "x.v1".into(),
            title: None,
            context: json!({"content": text}),
            created_at: Utc::now(),
            embedding: None,
        }
    }

    #[test]
    fn word_heuristic_scales_by_1_3() {
        assert_eq!(estimate_tokens("one two three four"), 6); // ceil(4 * 1.3)
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn trim_keeps_leading_items_under_budget() {
        let items = vec![item(100), item(100), item(100)];
        let per_item = estimate_item_tokens(&items[0]);
        let (kept, total) = trim_to_budget(items, per_item * 2);
        assert_eq!(kept.len(), 2);
        assert!(total <= per_item * 2);
    }

    #[test]
    fn single_oversized_item_is_still_kept() {
        let items = vec![item(10_000)];
        let (kept, _) = trim_to_budget(items, 10);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn later_small_item_can_fill_remaining_budget() {
        let items = vec![item(50), item(1000), item(20)];
        let budget = estimate_item_tokens(&item(80));
        let (kept, total) = trim_to_budget(items, budget);
        assert_eq!(kept.len(), 2);
        assert!(total <= budget);
    }
}
