/*!
 * Lenient JSON parsing for SSE frames.
 *
 * Intermediaries occasionally truncate or mangle `data:` payloads. A strict
 * parse is attempted first; on failure a small repair pass handles the
 * common malformations (unterminated strings, duplicate commas, trailing
 * commas, unclosed containers). Anything worse is dropped by the caller.
 */

use serde_json::Value;

/// Parse `raw` as JSON, attempting a repair pass when the strict parse
/// fails. Returns `None` when the frame is beyond repair.
pub fn parse_lenient(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str(raw) {
        return Some(v);
    }
    let repaired = repair(raw);
    serde_json::from_str(&repaired).ok()
}

/// Best-effort structural repair. Tracks string/escape state so commas and
/// brackets inside string literals are left alone.
fn repair(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut last_significant: Option<char> = None;

    for c in raw.chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_significant = Some('"');
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' | '[' => {
                stack.push(if c == '{' { '}' } else { ']' });
                out.push(c);
                last_significant = Some(c);
            }
            '}' | ']' => {
                // Trailing comma before a close: drop the comma.
                if last_significant == Some(',') {
                    if let Some(pos) = out.rfind(',') {
                        out.remove(pos);
                    }
                }
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
                last_significant = Some(c);
            }
            ',' => {
                // Duplicate comma: keep one.
                if last_significant == Some(',') {
                    continue;
                }
                out.push(c);
                last_significant = Some(c);
            }
            _ => {
                out.push(c);
                if !c.is_whitespace() {
                    last_significant = Some(c);
                }
            }
        }
    }

    // Unterminated string from a truncated frame.
    if in_string {
        out.push('"');
    }
    // A truncated frame may also end on a dangling comma.
    if last_significant == Some(',') {
        if let Some(pos) = out.rfind(',') {
            out.remove(pos);
        }
    }
    // Close whatever containers are still open.
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_json_passes_through() {
        let v = parse_lenient(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(v, json!({"type": "ping"}));
    }

    #[test]
    fn trailing_comma_is_removed() {
        let v = parse_lenient(r#"{"a": 1, "b": [1, 2,],}"#).unwrap();
        assert_eq!(v, json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn duplicate_commas_collapse() {
        let v = parse_lenient(r#"{"a": 1,, "b": 2}"#).unwrap();
        assert_eq!(v, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn unterminated_string_is_closed() {
        let v = parse_lenient(r#"{"type":"breadcrumb.updated","schema_name":"user.mes"#).unwrap();
        assert_eq!(v["type"], json!("breadcrumb.updated"));
        assert_eq!(v["schema_name"], json!("user.mes"));
    }

    #[test]
    fn unclosed_containers_are_closed() {
        let v = parse_lenient(r#"{"tags": ["a", "b""#).unwrap();
        assert_eq!(v, json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn commas_inside_strings_survive() {
        let v = parse_lenient(r#"{"text": "a,, b,"}"#).unwrap();
        assert_eq!(v, json!({"text": "a,, b,"}));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_lenient("not json at all").is_none());
        assert!(parse_lenient("").is_none());
    }
}
