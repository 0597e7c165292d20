//! Warning filters and the captured-warnings log.

use super::heap::ObjId;

/// What the interpreter does with a warning matching a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarningAction {
    /// Record the warning in the log.
    #[default]
    Default,
    /// Drop the warning silently.
    Ignore,
    /// Raise the warning as an exception.
    Error,
}

/// A warning recorded by the `Default` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningMessage {
    pub category: String,
    pub message: String,
    pub filename: String,
    pub lineno: u32,
}

#[derive(Debug, Default)]
pub(super) struct WarningRegistry {
    /// Filters as (owned category reference, action). Newest first.
    pub filters: Vec<(ObjId, WarningAction)>,
    pub log: Vec<WarningMessage>,
}
