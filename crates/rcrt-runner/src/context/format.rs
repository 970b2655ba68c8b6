/*!
 * Minimal-redundancy textual layout for assembled context.
 *
 * Short section headings keyed by source, one line per item
 * (`speaker: text`); ids and timestamps only when `include_metadata` is on.
 */

use super::fetch::FetchedItem;
use serde_json::Value as JsonValue;

pub struct Section<'a> {
    pub key: &'a str,
    pub items: &'a [FetchedItem],
}

pub fn format_sections(sections: &[Section<'_>], include_metadata: bool) -> String {
    let mut out = String::new();
    for section in sections {
        if section.items.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str("## ");
        out.push_str(section.key);
        out.push('\n');
        for item in section.items {
            out.push_str(&format_line(item, include_metadata));
            out.push('\n');
        }
    }
    out
}

fn format_line(item: &FetchedItem, include_metadata: bool) -> String {
    let speaker = speaker_of(item);
    let text = text_of(&item.context);
    let mut line = format!("{speaker}: {text}");
    if include_metadata {
        if let Some(id) = item.id {
            line.push_str(&format!(" [{} {}]", id, item.created_at.to_rfc3339()));
        } else {
            line.push_str(&format!(" [{}]", item.created_at.to_rfc3339()));
        }
    }
    line
}

fn speaker_of(item: &FetchedItem) -> String {
    item.context
        .get("role")
        .or_else(|| item.context.get("speaker"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| item.schema_name.clone())
}

fn text_of(context: &JsonValue) -> String {
    match context {
        JsonValue::String(s) => s.clone(),
        other => other
            .get("content")
            .or_else(|| other.get("text"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn item(schema: &str, context: JsonValue) -> FetchedItem {
        FetchedItem {
            id: Some(uuid::Uuid::new_v4()),
            schema_name: schema.into(),
            title: None,
            context,
            created_at: Utc::now(),
            embedding: None,
        }
    }

    #[test]
    fn sections_render_in_declared_order() {
        let history = [
            item("user.message.v1", json!({"role": "user", "content": "hi"})),
            item("agent.response.v1", json!({"role": "assistant", "content": "hello"})),
        ];
        let profile = [item("user.profile.v1", json!({"content": "likes rust"}))];
        let text = format_sections(
            &[
                Section { key: "history", items: &history },
                Section { key: "profile", items: &profile },
            ],
            false,
        );
        let history_pos = text.find("## history").unwrap();
        let profile_pos = text.find("## profile").unwrap();
        assert!(history_pos < profile_pos);
        assert!(text.contains("user: hi"));
        assert!(text.contains("assistant: hello"));
        // No ids or timestamps without include_metadata.
        assert!(!text.contains('['));
    }

    #[test]
    fn empty_sections_are_skipped() {
        let text = format_sections(&[Section { key: "nothing", items: &[] }], false);
        assert!(text.is_empty());
    }

    #[test]
    fn metadata_appends_id_and_timestamp() {
        let items = [item("user.message.v1", json!({"content": "x"}))];
        let text = format_sections(&[Section { key: "k", items: &items }], true);
        assert!(text.contains('['));
        assert!(text.contains("T")); // rfc3339 timestamp
    }

    #[test]
    fn speaker_falls_back_to_schema() {
        let items = [item("sensor.reading.v1", json!({"content": "42"}))];
        let text = format_sections(&[Section { key: "k", items: &items }], false);
        assert!(text.contains("sensor.reading.v1: 42"));
    }
}
