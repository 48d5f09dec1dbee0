//! SQL text helpers: placeholder rewriting, shape inference, dialect fragments.

pub mod params;
pub mod shape;

pub use params::{rewrite_named, Bound};
pub use shape::{Operation, WherePredicate};

use crate::adapter::Backend;

/// Row-limit fragment for the given dialect.
///
/// The legacy backend puts `TOP n` after `SELECT`; the others append `LIMIT n`.
pub fn limit(dialect: Backend, count: u64) -> String {
    match dialect {
        Backend::Legacy => format!("TOP {}", count),
        // Mock stands in for the primary, so callers building SQL against
        // it get the primary's syntax rather than the legacy `TOP`.
        Backend::Primary | Backend::Mock => format!("LIMIT {}", count),
    }
}

/// `COALESCE(a, b, ...)`, identical on every backend.
pub fn coalesce<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
    format!("COALESCE({})", args.join(", "))
}
