/*!
 * Shared types and pure logic for RCRT runner processes.
 *
 * Everything here is I/O-free: breadcrumb models, selectors, the selector
 * matcher, the minimal JSONPath evaluator, lenient JSON repair, the error
 * taxonomy and idempotency-key derivation.
 */

pub mod error;
pub mod idempotency;
pub mod jsonpath;
pub mod matcher;
pub mod models;
pub mod repair;

pub use error::RunnerError;
pub use models::{
    Breadcrumb, BreadcrumbCreate, BreadcrumbEvent, BreadcrumbListItem, Capabilities,
    ConsumerDefinition, ConsumerKind, ContextMatch, EventKind, FetchMethod, FetchSpec, MatchOp,
    Selector, SubscriptionRole,
};
