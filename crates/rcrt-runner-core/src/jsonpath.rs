/*!
 * Minimal JSONPath evaluator for selector predicates.
 *
 * Supports dot segments and `[n]` indices: `$.a.b[0].c`. The leading `$.`
 * is optional. Anything fancier is out of scope for selectors.
 */

use serde_json::Value;

/// Resolve `path` against `value`. Returns `None` when any segment is
/// missing or the path is malformed.
pub fn resolve<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path);
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            return None;
        }
        let (field, indices) = split_indices(segment)?;
        if !field.is_empty() {
            current = current.get(field)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Split `roles[0][2]` into (`roles`, `[0, 2]`).
fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(bracket) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let field = &segment[..bracket];
    let mut indices = Vec::new();
    let mut rest = &segment[bracket..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped.find(']')?;
        indices.push(stripped[..close].parse().ok()?);
        rest = &stripped[close + 1..];
    }
    if !rest.is_empty() {
        return None;
    }
    Some((field, indices))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_fields() {
        let v = json!({"a": {"b": {"c": 42}}});
        assert_eq!(resolve(&v, "$.a.b.c"), Some(&json!(42)));
        assert_eq!(resolve(&v, "a.b.c"), Some(&json!(42)));
    }

    #[test]
    fn resolves_array_indices() {
        let v = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(resolve(&v, "$.a.b[1].c"), Some(&json!(2)));
        assert_eq!(resolve(&v, "$.a.b[0]"), Some(&json!({"c": 1})));
    }

    #[test]
    fn missing_segments_return_none() {
        let v = json!({"a": 1});
        assert_eq!(resolve(&v, "$.b"), None);
        assert_eq!(resolve(&v, "$.a.b"), None);
        assert_eq!(resolve(&v, "$.a[0]"), None);
    }

    #[test]
    fn root_path_returns_whole_value() {
        let v = json!({"x": 1});
        assert_eq!(resolve(&v, "$"), Some(&v));
    }

    #[test]
    fn multi_index_segments() {
        let v = json!({"m": [[1, 2], [3, 4]]});
        assert_eq!(resolve(&v, "$.m[1][0]"), Some(&json!(3)));
    }

    #[test]
    fn malformed_brackets_are_rejected() {
        let v = json!({"a": [1]});
        assert_eq!(resolve(&v, "$.a[x]"), None);
        assert_eq!(resolve(&v, "$.a[0"), None);
    }
}
