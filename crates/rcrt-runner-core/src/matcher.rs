/*!
 * Selector matcher.
 *
 * Pure predicate deciding whether an event matches a declarative selector.
 * Empty selector fields are wildcards. SSE events are thin (no context), so
 * context predicates that cannot be evaluated pass at routing time and are
 * re-checked by the executor once the full breadcrumb is fetched.
 */

use crate::jsonpath;
use crate::models::{Breadcrumb, BreadcrumbEvent, ContextMatch, MatchOp, Selector};
use serde_json::Value;

/// Borrowed view over whatever carries event metadata: a thin SSE event or
/// a full breadcrumb.
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub schema_name: Option<&'a str>,
    pub tags: &'a [String],
    pub context: Option<&'a Value>,
}

impl<'a> EventView<'a> {
    pub fn from_event(event: &'a BreadcrumbEvent) -> Self {
        EventView {
            schema_name: event.schema_name.as_deref(),
            tags: event.tags_or_empty(),
            context: event.context.as_ref(),
        }
    }

    pub fn from_breadcrumb(bc: &'a Breadcrumb) -> Self {
        EventView {
            schema_name: Some(&bc.schema_name),
            tags: &bc.tags,
            context: Some(&bc.context),
        }
    }
}

/// Does the event match the selector? Context predicates on a thin event
/// pass here (deferred predicate rule).
pub fn matches(view: EventView<'_>, selector: &Selector) -> bool {
    if let Some(want) = &selector.schema_name {
        match view.schema_name {
            Some(got) if got == want => {}
            _ => return false,
        }
    }

    if let Some(any) = &selector.any_tags {
        if !any.iter().any(|t| view.tags.contains(t)) {
            return false;
        }
    }

    if let Some(all) = &selector.all_tags {
        if !all.iter().all(|t| view.tags.contains(t)) {
            return false;
        }
    }

    if let Some(predicates) = &selector.context_match {
        match view.context {
            Some(ctx) => {
                if !predicates.iter().all(|p| predicate_holds(ctx, p)) {
                    return false;
                }
            }
            // Thin event: route now, re-check after the full fetch.
            None => {}
        }
    }

    true
}

/// Strict predicate evaluation against a full context payload. Used by the
/// executor to re-check deferred predicates.
pub fn predicates_hold(context: &Value, selector: &Selector) -> bool {
    match &selector.context_match {
        Some(predicates) => predicates_all(context, predicates),
        None => true,
    }
}

/// Evaluate a bare predicate list (used by the event bridge's wait
/// criteria, which are not full selectors).
pub fn predicates_all(context: &Value, predicates: &[ContextMatch]) -> bool {
    predicates.iter().all(|p| predicate_holds(context, p))
}

/// First selector in declaration order that matches; ties on role/key are
/// resolved by this ordering.
pub fn first_match<'a>(selectors: &'a [Selector], view: EventView<'_>) -> Option<&'a Selector> {
    selectors.iter().find(|s| matches(view, s))
}

fn predicate_holds(context: &Value, predicate: &ContextMatch) -> bool {
    let actual = jsonpath::resolve(context, &predicate.path);
    match predicate.op {
        MatchOp::Eq => actual == Some(&predicate.value),
        MatchOp::Ne => actual != Some(&predicate.value),
        MatchOp::Gt => compare_numeric(actual, &predicate.value, |o| o == std::cmp::Ordering::Greater),
        MatchOp::Lt => compare_numeric(actual, &predicate.value, |o| o == std::cmp::Ordering::Less),
        MatchOp::Contains => contains(actual, &predicate.value),
        MatchOp::ContainsAny => contains_any(actual, &predicate.value),
    }
}

fn compare_numeric(
    actual: Option<&Value>,
    expected: &Value,
    check: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    match (actual.and_then(Value::as_f64), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).map(&check).unwrap_or(false),
        _ => match (actual.and_then(Value::as_str), expected.as_str()) {
            (Some(a), Some(b)) => check(a.cmp(b)),
            _ => false,
        },
    }
}

fn contains(actual: Option<&Value>, needle: &Value) -> bool {
    match actual {
        Some(Value::Array(items)) => items.contains(needle),
        Some(Value::String(s)) => needle.as_str().map(|n| s.contains(n)).unwrap_or(false),
        _ => false,
    }
}

fn contains_any(actual: Option<&Value>, needles: &Value) -> bool {
    let Some(needles) = needles.as_array() else {
        return contains(actual, needles);
    };
    match actual {
        Some(Value::Array(items)) => needles.iter().any(|n| items.contains(n)),
        Some(Value::String(s)) => needles
            .iter()
            .filter_map(Value::as_str)
            .any(|n| s.contains(n)),
        _ => false,
    }
}
