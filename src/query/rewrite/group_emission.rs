//! Rebuilds the per-outer-row grouping that unnesting flattened.

use std::collections::BTreeSet;

use tracing::debug;

use crate::query::ast::{props, NodeId, NodeKind, NodeValue, Plan, Var};
use crate::query::pipeline;
use crate::query::walker::{Visit, WalkContext, Walker};
use crate::types::{Result, SylvaError};

/// Inserts a `GroupBy` after each left join carrying a pending `regroup`.
///
/// The group keys are the bindings visible in the join's left input (row
/// number included), so every outer row forms its own group; the inner source
/// is collected into the let variable the join replaced.
#[derive(Debug, Default)]
pub struct GroupEmission;

/// Left-input bindings, duplicates reduced to their latest occurrence.
fn group_keys(plan: &Plan, join: NodeId) -> Vec<Var> {
    let visible = plan
        .child(join, 0)
        .map(|left| pipeline::visible_vars(plan, left))
        .unwrap_or_default();
    let mut seen = BTreeSet::new();
    let mut keys: Vec<Var> = visible
        .into_iter()
        .rev()
        .filter(|v| seen.insert(v.clone()))
        .collect();
    keys.reverse();
    keys
}

/// Whether a join upstream of `join`'s left input still awaits its group.
///
/// Keys are read from the left input, so inner groups must exist first.
fn has_pending_upstream(plan: &Plan, join: NodeId) -> bool {
    plan.child(join, 0)
        .map(|left| {
            plan.subtree(left).into_iter().any(|n| {
                plan.kind(n) == NodeKind::Join && plan.property(n, props::REGROUP).is_some()
            })
        })
        .unwrap_or(false)
}

/// Last stage of the join's `check`-guarded tail.
fn insertion_point(plan: &Plan, join: NodeId) -> NodeId {
    let mut node = join;
    while let Ok(pipeline::Downstream::Stage(next)) = pipeline::downstream(plan, node) {
        if plan.kind(next) != NodeKind::LetBind || plan.property(next, props::CHECK).is_none() {
            break;
        }
        node = next;
    }
    node
}

impl GroupEmission {
    fn emit(&self, plan: &mut Plan, join: NodeId, target: Var, source: Var) -> Result<()> {
        let keys = group_keys(plan, join);
        let after = insertion_point(plan, join);
        let consumer = plan
            .parent(after)
            .ok_or(SylvaError::Malformed("join without consumer"))?;
        let idx = plan
            .index_in_parent(after)
            .ok_or(SylvaError::Malformed("parent link without child link"))?;
        plan.remove_child(consumer, idx)?;

        let group = plan.add_with(NodeKind::GroupBy, NodeValue::None, [after])?;
        for key in &keys {
            let reference = plan.add(NodeKind::VariableRef, NodeValue::Var(key.clone()));
            let spec = plan.add_with(NodeKind::GroupSpec, NodeValue::None, [reference])?;
            plan.append_child(group, spec)?;
        }
        let decl = plan.add(NodeKind::Variable, NodeValue::Var(target.clone()));
        let reference = plan.add(NodeKind::VariableRef, NodeValue::Var(source));
        let aggregate = plan.add_with(NodeKind::AggregateSpec, NodeValue::None, [decl, reference])?;
        plan.append_child(group, aggregate)?;
        plan.insert_child(consumer, idx, group)?;
        plan.remove_property(join, props::REGROUP);
        debug!(var = %target, keys = keys.len(), "rewrite.group.emit");
        Ok(())
    }
}

impl Walker for GroupEmission {
    fn name(&self) -> &'static str {
        "group-emission"
    }

    fn visit(&mut self, plan: &mut Plan, node: NodeId, cx: &mut WalkContext) -> Result<Visit> {
        if plan.kind(node) != NodeKind::Join || !plan.flag(node, props::LEFT_JOIN) {
            return Ok(Visit::Descend(node));
        }
        let pending = plan.vars_property(node, props::REGROUP).map(<[Var]>::to_vec);
        let Some([target, source]) = pending.and_then(|v| <[Var; 2]>::try_from(v).ok()) else {
            return Ok(Visit::Descend(node));
        };
        if has_pending_upstream(plan, node) {
            return Ok(Visit::Descend(node));
        }
        self.emit(plan, node, target, source)?;
        cx.snapshot();
        Ok(Visit::Skip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{arith, call, cmp, eq, int, seq, var, Flwor};
    use crate::query::rewrite::Unnest;
    use crate::query::value::{ArithOp, CmpOp, Comparison};
    use crate::query::walker::walk;

    fn emitted(ret: crate::query::ast::NodeSpec) -> Plan {
        let inner = Flwor::new()
            .for_("y", var("t"))
            .where_(eq(var("y"), var("x")))
            .return_(ret)
            .expect("inner builds");
        let spec = Flwor::new()
            .for_("x", var("s"))
            .let_("v", inner)
            .return_(call("count", [var("v")]))
            .expect("outer builds");
        let mut plan = Plan::from_spec(&spec).expect("valid plan");
        walk(&mut Unnest, &mut plan, 32).expect("unnest converges");
        walk(&mut GroupEmission, &mut plan, 32).expect("emission converges");
        pipeline::validate(&plan).expect("still well formed");
        plan
    }

    fn find(plan: &Plan, kind: NodeKind) -> NodeId {
        plan.subtree(plan.root())
            .into_iter()
            .find(|n| plan.kind(*n) == kind)
            .expect("node present")
    }

    #[test]
    fn group_follows_join_keyed_on_outer_row() {
        let plan = emitted(var("y"));
        let group = find(&plan, NodeKind::GroupBy);
        let join = plan.child(group, 0).expect("input");
        assert_eq!(plan.kind(join), NodeKind::Join);
        assert!(plan.property(join, props::REGROUP).is_none());
        let keys = pipeline::group_keys(&plan, group);
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0], Var::from("x"));
        assert_eq!(
            pipeline::group_aggregates(&plan, group),
            vec![(Var::from("v"), Var::from("y"))]
        );
    }

    #[test]
    fn inner_join_is_grouped_before_outer_join() {
        let inner = |run: &str, op| {
            Flwor::new()
                .for_(run, var("t"))
                .where_(cmp(Comparison::General(op), var(run), var("x")))
                .return_(var(run))
                .expect("inner builds")
        };
        let spec = Flwor::new()
            .for_("x", var("s"))
            .let_("v", inner("y", CmpOp::Eq))
            .let_("w", inner("q", CmpOp::Lt))
            .return_(seq([call("count", [var("v")]), var("w")]))
            .expect("outer builds");
        let mut plan = Plan::from_spec(&spec).expect("valid plan");
        walk(&mut Unnest, &mut plan, 32).expect("unnest converges");
        walk(&mut GroupEmission, &mut plan, 32).expect("emission converges");
        pipeline::validate(&plan).expect("still well formed");

        let groups: Vec<NodeId> = plan
            .subtree(plan.root())
            .into_iter()
            .filter(|n| plan.kind(*n) == NodeKind::GroupBy)
            .collect();
        assert_eq!(groups.len(), 2);
        let outer = groups[0];
        let keys = pipeline::group_keys(&plan, outer);
        assert!(keys.contains(&Var::from("v")), "{keys:?}");
        assert!(!keys.contains(&Var::from("y")), "{keys:?}");
        assert_eq!(
            pipeline::group_aggregates(&plan, outer),
            vec![(Var::from("w"), Var::from("q"))]
        );
    }

    #[test]
    fn group_goes_after_guarded_result_binding() {
        let plan = emitted(arith(ArithOp::Add, var("y"), int(1)));
        let group = find(&plan, NodeKind::GroupBy);
        let bind = plan.child(group, 0).expect("input");
        assert_eq!(plan.kind(bind), NodeKind::LetBind);
        assert!(plan.property(bind, props::CHECK).is_some());
        let (_, source) = pipeline::group_aggregates(&plan, group)
            .pop()
            .expect("aggregate");
        assert_eq!(Some(source), pipeline::binding_var(&plan, bind));
    }
}
