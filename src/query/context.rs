//! Per-evaluation state shared by every cursor of one query run.

use std::cell::Cell;

use serde::Serialize;

use crate::query::operator::JoinStrategy;

/// Counters describing what one evaluation actually did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// `let` expressions evaluated.
    pub let_evaluations: u64,
    /// `let` bindings that appended an empty placeholder without evaluating.
    pub skipped_lets: u64,
    /// Join cursors opened with the hash strategy.
    pub hash_joins: u64,
    /// Join cursors opened with the sort-merge strategy.
    pub sort_merge_joins: u64,
    /// Join cursors opened with the nested-loop strategy.
    pub nested_loop_joins: u64,
    /// Rows produced by pipeline tails.
    pub rows: u64,
}

/// Evaluation context handed to expressions and cursors.
///
/// Execution is single-threaded; counters use [`Cell`] and the context is
/// never shared across threads.
#[derive(Debug, Default)]
pub struct QueryContext {
    let_evaluations: Cell<u64>,
    skipped_lets: Cell<u64>,
    hash_joins: Cell<u64>,
    sort_merge_joins: Cell<u64>,
    nested_loop_joins: Cell<u64>,
    rows: Cell<u64>,
}

fn bump(counter: &Cell<u64>) {
    counter.set(counter.get().saturating_add(1));
}

impl QueryContext {
    /// Fresh context with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_let_evaluation(&self) {
        bump(&self.let_evaluations);
    }

    pub(crate) fn record_skipped_let(&self) {
        bump(&self.skipped_lets);
    }

    pub(crate) fn record_join(&self, strategy: JoinStrategy) {
        match strategy {
            JoinStrategy::Hash => bump(&self.hash_joins),
            JoinStrategy::SortMerge => bump(&self.sort_merge_joins),
            JoinStrategy::NestedLoop => bump(&self.nested_loop_joins),
        }
    }

    pub(crate) fn record_row(&self) {
        bump(&self.rows);
    }

    /// Current counter values.
    pub fn stats(&self) -> ExecutionStats {
        ExecutionStats {
            let_evaluations: self.let_evaluations.get(),
            skipped_lets: self.skipped_lets.get(),
            hash_joins: self.hash_joins.get(),
            sort_merge_joins: self.sort_merge_joins.get(),
            nested_loop_joins: self.nested_loop_joins.get(),
            rows: self.rows.get(),
        }
    }
}
