//! Hoists loop-invariant `let` bindings upstream of `for` loops.

use std::collections::BTreeSet;

use tracing::debug;

use crate::query::ast::{props, NodeId, NodeKind, Plan, Var};
use crate::query::pipeline;
use crate::query::rewrite::{insert_below, is_transparent, refs_outside, row_slot, splice_out};
use crate::query::walker::{Visit, WalkContext, Walker};
use crate::types::Result;

/// Moves a `LetBind` upstream past the `ForBind` stages it does not depend on.
///
/// The binding hops `ForBind` and `LetBind` stages that neither bind its free
/// variables nor bind or read its name. It moves only when at least one
/// `ForBind` is hopped. A `let` heading a nested pipeline that sits in a
/// once-per-row slot of an outer stage first moves into the outer pipeline.
#[derive(Debug, Default)]
pub struct LetLift;

fn can_hop(plan: &Plan, stage: NodeId, name: &Var, free: &BTreeSet<Var>) -> bool {
    if !matches!(plan.kind(stage), NodeKind::ForBind | NodeKind::LetBind)
        || plan.property(stage, props::CHECK).is_some()
    {
        return false;
    }
    let binds_conflict = pipeline::bound_vars(plan, stage)
        .iter()
        .any(|b| b == name || free.contains(b));
    !binds_conflict && !pipeline::stage_references(plan, stage).contains(name)
}

fn lift_target(plan: &Plan, bind: NodeId, name: &Var, free: &BTreeSet<Var>) -> Option<NodeId> {
    let mut target = None;
    let mut hopped_for = false;
    let mut cur = pipeline::input(plan, bind);
    while let Some(stage) = cur {
        if !can_hop(plan, stage, name, free) {
            break;
        }
        hopped_for |= plan.kind(stage) == NodeKind::ForBind;
        if hopped_for {
            target = Some(stage);
        }
        cur = pipeline::input(plan, stage);
    }
    target
}

/// Outer stage whose once-per-row slot holds `pipe`, reached through transparent kinds.
fn slot_owner(plan: &Plan, pipe: NodeId) -> Option<NodeId> {
    let mut node = pipe;
    loop {
        let parent = plan.parent(node)?;
        if matches!(
            plan.kind(parent),
            NodeKind::End | NodeKind::Selection | NodeKind::LetBind | NodeKind::ForBind
        ) && row_slot(plan, parent) == Some(node)
        {
            return Some(parent);
        }
        if !is_transparent(plan.kind(parent)) {
            return None;
        }
        node = parent;
    }
}

impl LetLift {
    fn lift_local(&self, plan: &mut Plan, bind: NodeId, name: &Var, free: &BTreeSet<Var>) -> Result<bool> {
        let Some(target) = lift_target(plan, bind, name, free) else {
            return Ok(false);
        };
        splice_out(plan, bind)?;
        insert_below(plan, target, bind)?;
        debug!(var = %name, "rewrite.lift.local");
        Ok(true)
    }

    fn lift_out_of_pipe(
        &self,
        plan: &mut Plan,
        bind: NodeId,
        name: &Var,
        free: &BTreeSet<Var>,
    ) -> Result<bool> {
        let heads_pipe = pipeline::input(plan, bind)
            .map(|i| plan.kind(i) == NodeKind::Start)
            .unwrap_or(false);
        if !heads_pipe {
            return Ok(false);
        }
        let Some(pipe) = pipeline::enclosing_end(plan, bind).and_then(|end| plan.parent(end)) else {
            return Ok(false);
        };
        let Some(owner) = slot_owner(plan, pipe) else {
            return Ok(false);
        };
        if plan.property(owner, props::CHECK).is_some() {
            return Ok(false);
        }
        let hoppable = plan
            .child(owner, 0)
            .map(|upstream| {
                plan.kind(upstream) == NodeKind::ForBind && can_hop(plan, upstream, name, free)
            })
            .unwrap_or(false);
        if !hoppable {
            return Ok(false);
        }
        let outer_end = if plan.kind(owner) == NodeKind::End {
            Some(owner)
        } else {
            pipeline::enclosing_end(plan, owner)
        };
        let Some(outer_end) = outer_end else {
            return Ok(false);
        };
        if refs_outside(plan, outer_end, pipe).contains(name) {
            return Ok(false);
        }
        splice_out(plan, bind)?;
        insert_below(plan, owner, bind)?;
        debug!(var = %name, "rewrite.lift.outer");
        Ok(true)
    }
}

impl Walker for LetLift {
    fn name(&self) -> &'static str {
        "let-lift"
    }

    fn visit(&mut self, plan: &mut Plan, node: NodeId, cx: &mut WalkContext) -> Result<Visit> {
        if plan.kind(node) != NodeKind::LetBind || plan.property(node, props::CHECK).is_some() {
            return Ok(Visit::Descend(node));
        }
        let (Some(name), Some(expr)) = (pipeline::binding_var(plan, node), plan.child(node, 2)) else {
            return Ok(Visit::Descend(node));
        };
        let free = pipeline::referenced_vars(plan, expr);
        if self.lift_local(plan, node, &name, &free)?
            || self.lift_out_of_pipe(plan, node, &name, &free)?
        {
            cx.snapshot();
            return Ok(Visit::Skip);
        }
        Ok(Visit::Descend(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::NodeSpec;
    use crate::query::builder::{arith, call, int, seq, var, Flwor};
    use crate::query::value::ArithOp;
    use crate::query::walker::walk;

    fn lifted(spec: &NodeSpec) -> NodeSpec {
        let mut plan = Plan::from_spec(spec).expect("valid plan");
        walk(&mut LetLift, &mut plan, 32).expect("converges");
        pipeline::validate(&plan).expect("still well formed");
        plan.to_spec(plan.root())
    }

    #[test]
    fn invariant_let_moves_above_inner_for() {
        let spec = Flwor::new()
            .for_("a", seq([int(1), int(2)]))
            .for_("b", seq([int(3), int(4)]))
            .let_("c", arith(ArithOp::Mul, var("a"), int(2)))
            .return_(seq([var("b"), var("c")]))
            .expect("builds");
        let expected = Flwor::new()
            .for_("a", seq([int(1), int(2)]))
            .let_("c", arith(ArithOp::Mul, var("a"), int(2)))
            .for_("b", seq([int(3), int(4)]))
            .return_(seq([var("b"), var("c")]))
            .expect("builds");
        assert_eq!(lifted(&spec), expected);
    }

    #[test]
    fn dependent_or_shadowing_lets_stay() {
        let dependent = Flwor::new()
            .for_("a", int(1))
            .let_("c", var("a"))
            .return_(var("c"))
            .expect("builds");
        let shadowing = Flwor::new()
            .for_("b", var("c"))
            .let_("c", int(2))
            .return_(var("c"))
            .expect("builds");
        let only_lets = Flwor::new()
            .let_("b", int(1))
            .let_("c", int(2))
            .return_(seq([var("b"), var("c")]))
            .expect("builds");
        for spec in [dependent, shadowing, only_lets] {
            assert_eq!(lifted(&spec), spec);
        }
    }

    #[test]
    fn head_let_of_nested_pipeline_leaves_it() {
        let inner = Flwor::new()
            .let_("k", int(10))
            .for_("b", var("t"))
            .return_(seq([var("b"), var("k")]))
            .expect("inner builds");
        let spec = Flwor::new()
            .for_("x", var("s"))
            .return_(call("count", [inner]))
            .expect("outer builds");
        let inner_after = Flwor::new()
            .for_("b", var("t"))
            .return_(seq([var("b"), var("k")]))
            .expect("inner builds");
        let expected = Flwor::new()
            .let_("k", int(10))
            .for_("x", var("s"))
            .return_(call("count", [inner_after]))
            .expect("outer builds");
        assert_eq!(lifted(&spec), expected);
    }

    #[test]
    fn head_let_stays_when_name_is_used_outside() {
        let inner = Flwor::new()
            .let_("k", int(10))
            .for_("b", var("t"))
            .return_(var("k"))
            .expect("inner builds");
        let spec = Flwor::new()
            .for_("x", var("s"))
            .return_(seq([var("k"), call("count", [inner])]))
            .expect("outer builds");
        assert_eq!(lifted(&spec), spec);
    }
}
