//! Drops the right-input reordering of left joins whose match order is unobservable.

use std::collections::BTreeSet;

use tracing::debug;

use crate::query::ast::{props, NodeId, NodeKind, Plan, PropValue, Var};
use crate::query::pipeline;
use crate::query::rewrite::{downstream_stages, OptimizerConfig};
use crate::query::walker::{Visit, WalkContext, Walker};
use crate::types::Result;

/// Sets `skipSort` on left joins whose right-input order cannot be observed.
///
/// The inner run variable is the binding just above the right input's
/// `Start`. Its dependents are every binding of the right input plus every
/// binding computed from them between the join and the first `GroupBy`. When
/// no group collects a dependent, or the collected sequences are only read
/// as the sole argument of an order-insensitive function, the sort is
/// skipped. Anything else keeps it.
#[derive(Debug)]
pub struct JoinSortElimination {
    config: OptimizerConfig,
}

impl JoinSortElimination {
    /// Pass using `config`'s order-insensitive function list.
    pub fn new(config: &OptimizerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn is_critical(&self, plan: &Plan, reference: NodeId) -> bool {
        let Some(parent) = plan.parent(reference) else {
            return true;
        };
        let sole_argument = plan.kind(parent) == NodeKind::FunctionCall && plan.child_count(parent) == 1;
        !(sole_argument
            && plan
                .name(parent)
                .map(|name| self.config.is_order_insensitive(name))
                .unwrap_or(false))
    }

    /// Whether any consumer of `group`'s output, up to the return expression,
    /// reads one of `seqs` in an order-sensitive way.
    fn critically_read(&self, plan: &Plan, group: NodeId, seqs: &[Var]) -> bool {
        let mut node = group;
        while let Some(parent) = plan.parent(node) {
            let kind = plan.kind(parent);
            if !kind.is_stage() && kind != NodeKind::End {
                break;
            }
            for &child in plan.children(parent) {
                if child == node {
                    continue;
                }
                let critical = plan.subtree(child).into_iter().any(|id| {
                    plan.kind(id) == NodeKind::VariableRef
                        && plan.var(id).map(|v| seqs.contains(v)).unwrap_or(false)
                        && self.is_critical(plan, id)
                });
                if critical {
                    return true;
                }
            }
            if kind == NodeKind::End {
                break;
            }
            node = parent;
        }
        false
    }

    /// `Some(true)` when the sort can go, `Some(false)` when it must stay.
    fn decide(&self, plan: &Plan, join: NodeId) -> Option<bool> {
        let right = plan.last_child(join)?;
        let right_chain = pipeline::chain(plan, right);
        let above_start = *right_chain.get(right_chain.len().checked_sub(2)?)?;
        let run = pipeline::binding_var(plan, above_start)?;

        let mut dependents: BTreeSet<Var> = right_chain
            .iter()
            .flat_map(|stage| pipeline::bound_vars(plan, *stage))
            .collect();
        dependents.insert(run);

        for stage in downstream_stages(plan, join) {
            match plan.kind(stage) {
                NodeKind::GroupBy => {
                    if pipeline::group_keys(plan, stage)
                        .iter()
                        .any(|k| dependents.contains(k))
                    {
                        return Some(false);
                    }
                    let seqs: Vec<Var> = pipeline::group_aggregates(plan, stage)
                        .into_iter()
                        .filter(|(_, source)| dependents.contains(source))
                        .map(|(target, _)| target)
                        .collect();
                    if seqs.is_empty() {
                        return Some(true);
                    }
                    return Some(!self.critically_read(plan, stage, &seqs));
                }
                NodeKind::ForBind | NodeKind::LetBind => {
                    let derived = plan.property(stage, props::CHECK).is_some()
                        || pipeline::stage_references(plan, stage)
                            .iter()
                            .any(|v| dependents.contains(v));
                    if derived {
                        dependents.extend(pipeline::bound_vars(plan, stage));
                    }
                }
                _ => {}
            }
        }
        Some(true)
    }
}

impl Walker for JoinSortElimination {
    fn name(&self) -> &'static str {
        "join-sort-elimination"
    }

    fn visit(&mut self, plan: &mut Plan, node: NodeId, _cx: &mut WalkContext) -> Result<Visit> {
        if plan.kind(node) != NodeKind::Join
            || !plan.flag(node, props::LEFT_JOIN)
            || plan.property(node, props::SKIP_SORT).is_some()
        {
            return Ok(Visit::Descend(node));
        }
        if self.decide(plan, node) == Some(true) {
            // Annotation only; the structure is unchanged so no restart.
            plan.set_property(node, props::SKIP_SORT, PropValue::Bool(true));
            debug!(join = node.0, "rewrite.join_sort.skip");
        }
        Ok(Visit::Descend(node))
    }
}
