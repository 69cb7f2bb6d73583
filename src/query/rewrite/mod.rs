//! Algebraic rewrite passes over the plan tree.
//!
//! Passes run in a fixed order, each to its own fixpoint:
//!
//! 1. [`StepMerge`] always runs.
//! 2. With [`OptimizerConfig::unnest`] set, [`Unnest`], [`LetLift`],
//!    [`GroupEmission`] and [`JoinSortElimination`] follow in that order.
//!
//! Every pass is total: a failed precondition leaves the tree unchanged.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::query::ast::{NodeId, NodeKind, Plan, Var};
use crate::query::pipeline;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::walker::{walk, WalkReport};
use crate::types::Result;

mod group_emission;
mod join_sort;
mod let_lift;
mod step_merge;
mod unnest;

pub use group_emission::GroupEmission;
pub use join_sort::JoinSortElimination;
pub use let_lift::LetLift;
pub use step_merge::StepMerge;
pub use unnest::Unnest;

/// Optimizer knobs, loadable from the `[optimizer]` table of a config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Run the unnesting pipeline (unnest, lift, group emission, sort elimination).
    pub unnest: bool,
    /// Annotate stages with the bindings consumed downstream.
    pub projection: bool,
    /// Traversal bound per pass; hitting it is reported as an internal error.
    pub max_traversals: usize,
    /// Functions whose single argument's order is unobservable.
    pub order_insensitive_functions: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            unnest: false,
            projection: true,
            max_traversals: 64,
            order_insensitive_functions: vec!["count".into(), "distinct".into()],
        }
    }
}

impl OptimizerConfig {
    /// Enables or disables the unnesting pipeline.
    pub fn with_unnest(mut self, enable: bool) -> Self {
        self.unnest = enable;
        self
    }

    /// Enables or disables projection.
    pub fn with_projection(mut self, enable: bool) -> Self {
        self.projection = enable;
        self
    }

    /// Sets the per-pass traversal bound.
    pub fn with_max_traversals(mut self, max: usize) -> Self {
        self.max_traversals = max;
        self
    }

    /// Whether `name` (with or without the `fn:` prefix) is order-insensitive.
    pub fn is_order_insensitive(&self, name: &str) -> bool {
        let name = strip_fn_prefix(name);
        self.order_insensitive_functions
            .iter()
            .any(|f| strip_fn_prefix(f) == name)
    }
}

pub(crate) fn strip_fn_prefix(name: &str) -> &str {
    name.strip_prefix("fn:").unwrap_or(name)
}

/// Per-pass reports of one optimizer run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RewriteReport {
    /// Reports in execution order.
    pub passes: Vec<WalkReport>,
}

impl RewriteReport {
    /// Whether any pass changed the tree.
    pub fn changed(&self) -> bool {
        self.passes.iter().any(|p| p.changed)
    }
}

/// Runs the rewrite passes enabled by `config` over `plan`.
pub fn optimize(plan: &mut Plan, config: &OptimizerConfig) -> Result<RewriteReport> {
    let start = profile_timer();
    let mut report = RewriteReport::default();
    report
        .passes
        .push(walk(&mut StepMerge, plan, config.max_traversals)?);
    if config.unnest {
        report
            .passes
            .push(walk(&mut Unnest, plan, config.max_traversals)?);
        report
            .passes
            .push(walk(&mut LetLift, plan, config.max_traversals)?);
        report
            .passes
            .push(walk(&mut GroupEmission, plan, config.max_traversals)?);
        let mut sort = JoinSortElimination::new(config);
        report
            .passes
            .push(walk(&mut sort, plan, config.max_traversals)?);
    }
    record_profile_timer(QueryProfileKind::Rewrite, start);
    debug!(
        passes = report.passes.len(),
        changed = report.changed(),
        "rewrite.pipeline.done"
    );
    Ok(report)
}

/// Kinds that evaluate every operand exactly once per evaluation, so a nested
/// pipeline below them can be moved into a binding of the enclosing stage.
pub(crate) fn is_transparent(kind: NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::FunctionCall
            | NodeKind::ArithmeticExpr
            | NodeKind::ComparisonExpr
            | NodeKind::SequenceExpr
    )
}

/// Expression slot of a stage that is evaluated once per input row.
pub(crate) fn row_slot(plan: &Plan, stage: NodeId) -> Option<NodeId> {
    match plan.kind(stage) {
        NodeKind::End | NodeKind::Selection => plan.child(stage, 1),
        NodeKind::LetBind | NodeKind::ForBind => plan.last_child(stage),
        _ => None,
    }
}

/// Nested pipelines reachable from `expr` through transparent kinds only,
/// `expr` itself included.
pub(crate) fn transparent_pipes(plan: &Plan, expr: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![expr];
    while let Some(node) = stack.pop() {
        match plan.kind(node) {
            NodeKind::PipeExpr => out.push(node),
            kind if is_transparent(kind) => {
                stack.extend(plan.children(node).iter().rev().copied());
            }
            _ => {}
        }
    }
    out
}

/// Variables referenced inside `scope` but outside `excluded`.
pub(crate) fn refs_outside(plan: &Plan, scope: NodeId, excluded: NodeId) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    let mut stack = vec![scope];
    while let Some(node) = stack.pop() {
        if node == excluded {
            continue;
        }
        if plan.kind(node) == NodeKind::VariableRef {
            if let Some(v) = plan.var(node) {
                out.insert(v.clone());
            }
        }
        if let Some(v) = plan.var_property(node, crate::query::ast::props::CHECK) {
            out.insert(v.clone());
        }
        stack.extend(plan.children(node).iter().copied());
    }
    out
}

/// Moves the detached `stage` in between `consumer_of` and its current input.
///
/// `consumer_of` must be a stage or `End`; the new stage takes over child 0.
pub(crate) fn insert_below(plan: &mut Plan, consumer_of: NodeId, stage: NodeId) -> Result<()> {
    let upstream = plan.remove_child(consumer_of, 0)?;
    plan.insert_child(stage, 0, upstream)?;
    plan.insert_child(consumer_of, 0, stage)
}

/// Cuts `stage` out of its pipeline, reconnecting its input to its consumer.
pub(crate) fn splice_out(plan: &mut Plan, stage: NodeId) -> Result<()> {
    let upstream = plan.remove_child(stage, 0)?;
    plan.replace(stage, upstream)
}

/// Stages downstream of `stage` in the same pipeline, nearest first.
pub(crate) fn downstream_stages(plan: &Plan, stage: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut node = stage;
    while let Ok(pipeline::Downstream::Stage(next)) = pipeline::downstream(plan, node) {
        out.push(next);
        node = next;
    }
    out
}
