//! Replaces correlated nested pipelines with joins.
//!
//! `let $v := (for $y in T ... where outer = inner ... return R)` becomes a
//! left join of the outer rows (numbered by a `Count` stage) with the inner
//! chain, keyed on the correlating comparison. The per-row grouping the
//! nested pipeline provided is left pending in the `regroup` property for
//! group emission. `for $z in (...)` without a position variable becomes an
//! inner join followed by a `ForBind` of `$z` over `R`.
//!
//! A nested pipeline buried in an expression slot (through calls,
//! arithmetic, comparisons or sequence constructors) is first extracted into
//! a fresh `LetBind` in front of its stage.

use std::collections::BTreeSet;

use tracing::debug;

use crate::query::ast::{props, NodeId, NodeKind, NodeValue, Plan, PropValue, Var};
use crate::query::pipeline;
use crate::query::rewrite::{insert_below, refs_outside, row_slot, splice_out, transparent_pipes};
use crate::query::value::{CmpOp, Comparison};
use crate::query::walker::{Visit, WalkContext, Walker};
use crate::types::{Result, SylvaError};

/// Join-introducing rewrite for correlated nested pipelines.
#[derive(Debug, Default)]
pub struct Unnest;

/// A nested pipeline that can be turned into a join.
struct Candidate {
    end: NodeId,
    selection: NodeId,
    /// Operand of the correlating comparison that reads only outer bindings.
    outer_side: usize,
    op: CmpOp,
    run: Var,
    inner_bound: BTreeSet<Var>,
}

/// Which side of a general comparison reads the outer row.
fn correlated_predicate(
    plan: &Plan,
    selection: NodeId,
    outer: &BTreeSet<Var>,
) -> Option<(usize, CmpOp)> {
    let pred = plan.child(selection, 1)?;
    if plan.kind(pred) != NodeKind::ComparisonExpr {
        return None;
    }
    let NodeValue::Cmp(Comparison::General(op)) = plan.value(pred) else {
        return None;
    };
    let left = pipeline::referenced_vars(plan, plan.child(pred, 0)?);
    let right = pipeline::referenced_vars(plan, plan.child(pred, 1)?);
    let only_outer = |refs: &BTreeSet<Var>| !refs.is_empty() && refs.iter().all(|v| outer.contains(v));
    let no_outer = |refs: &BTreeSet<Var>| refs.iter().all(|v| !outer.contains(v));
    if only_outer(&left) && no_outer(&right) {
        Some((0, *op))
    } else if only_outer(&right) && no_outer(&left) {
        Some((1, *op))
    } else {
        None
    }
}

fn analyze(plan: &Plan, pipe: NodeId, outer: &BTreeSet<Var>) -> Option<Candidate> {
    if plan.kind(pipe) != NodeKind::PipeExpr {
        return None;
    }
    let end = pipeline::end_of(plan, pipe)?;
    plan.child(end, 1)?;
    let mut stages = pipeline::chain(plan, plan.child(end, 0)?);
    stages.reverse();
    if stages.len() < 3
        || plan.kind(stages[0]) != NodeKind::Start
        || plan.kind(stages[1]) != NodeKind::ForBind
    {
        return None;
    }

    let mut inner_bound = BTreeSet::new();
    let mut selection: Option<(NodeId, usize, CmpOp, BTreeSet<Var>)> = None;
    for &stage in &stages[1..] {
        let kind = plan.kind(stage);
        if !matches!(kind, NodeKind::ForBind | NodeKind::LetBind | NodeKind::Selection)
            || plan.property(stage, props::CHECK).is_some()
        {
            return None;
        }
        if selection.is_none() && kind == NodeKind::Selection {
            if let Some((side, op)) = correlated_predicate(plan, stage, outer) {
                selection = Some((stage, side, op, inner_bound.clone()));
                continue;
            }
        }
        if pipeline::stage_references(plan, stage)
            .iter()
            .any(|v| outer.contains(v))
        {
            return None;
        }
        for var in pipeline::bound_vars(plan, stage) {
            if !inner_bound.insert(var) {
                return None;
            }
        }
    }
    let (selection, outer_side, op, bound_before) = selection?;
    if inner_bound.iter().any(|v| outer.contains(v)) {
        return None;
    }
    // The inner key moves below every inner stage; it must not pick up later bindings.
    let inner_key = plan.child(plan.child(selection, 1)?, 1 - outer_side)?;
    if pipeline::referenced_vars(plan, inner_key)
        .iter()
        .any(|v| inner_bound.contains(v) && !bound_before.contains(v))
    {
        return None;
    }
    Some(Candidate {
        end,
        selection,
        outer_side,
        op,
        run: pipeline::binding_var(plan, stages[1])?,
        inner_bound,
    })
}

/// Detaches `(join keys, inner chain without the selection, return expression)`.
fn detach_inner(plan: &mut Plan, cand: &Candidate) -> Result<(NodeId, NodeId, NodeId)> {
    let pred = plan
        .child(cand.selection, 1)
        .ok_or(SylvaError::Malformed("selection without predicate"))?;
    let outer_key = plan.remove_child(pred, cand.outer_side)?;
    let inner_key = plan.remove_child(pred, 0)?;
    let op = if cand.outer_side == 0 {
        cand.op
    } else {
        cand.op.mirror()
    };
    let keys = plan.add_with(
        NodeKind::JoinExpr,
        NodeValue::Cmp(Comparison::General(op)),
        [outer_key, inner_key],
    )?;
    splice_out(plan, cand.selection)?;
    let ret = plan.remove_child(cand.end, 1)?;
    let right = plan.remove_child(cand.end, 0)?;
    Ok((keys, right, ret))
}

impl Unnest {
    /// Hoists a correlated, unnestable pipeline out of an expression slot.
    fn extract(&mut self, plan: &mut Plan, stage: NodeId) -> Result<bool> {
        if plan.property(stage, props::CHECK).is_some() {
            return Ok(false);
        }
        let (Some(slot), Some(upstream)) = (row_slot(plan, stage), plan.child(stage, 0)) else {
            return Ok(false);
        };
        let outer: BTreeSet<Var> = pipeline::visible_vars(plan, upstream).into_iter().collect();
        let bind_form = match plan.kind(stage) {
            NodeKind::LetBind => true,
            NodeKind::ForBind => pipeline::position_var(plan, stage).is_none(),
            _ => false,
        };
        for pipe in transparent_pipes(plan, slot) {
            if pipe == slot && bind_form {
                continue;
            }
            if analyze(plan, pipe, &outer).is_none() {
                continue;
            }
            let fresh = plan.fresh_var("n");
            let reference = plan.add(NodeKind::VariableRef, NodeValue::Var(fresh.clone()));
            plan.replace(pipe, reference)?;
            let decl = plan.add(NodeKind::Variable, NodeValue::Var(fresh.clone()));
            let bind = plan.add_with(NodeKind::LetBind, NodeValue::None, [decl, pipe])?;
            insert_below(plan, stage, bind)?;
            debug!(var = %fresh, "rewrite.unnest.extract");
            return Ok(true);
        }
        Ok(false)
    }

    fn candidate(&self, plan: &Plan, stage: NodeId, pipe: NodeId) -> Option<Candidate> {
        let upstream = plan.child(stage, 0)?;
        let outer: BTreeSet<Var> = pipeline::visible_vars(plan, upstream).into_iter().collect();
        let cand = analyze(plan, pipe, &outer)?;
        let end = pipeline::enclosing_end(plan, stage)?;
        let elsewhere = refs_outside(plan, end, pipe);
        if cand.inner_bound.iter().any(|v| elsewhere.contains(v)) {
            return None;
        }
        Some(cand)
    }

    fn unnest_let(&mut self, plan: &mut Plan, stage: NodeId) -> Result<bool> {
        if plan.property(stage, props::CHECK).is_some() {
            return Ok(false);
        }
        let Some(pipe) = plan.child(stage, 2) else {
            return Ok(false);
        };
        let Some(cand) = self.candidate(plan, stage, pipe) else {
            return Ok(false);
        };
        let target = pipeline::binding_var(plan, stage)
            .ok_or(SylvaError::Malformed("let without variable"))?;

        let upstream = plan.remove_child(stage, 0)?;
        let pos = plan.fresh_var("pos");
        let pos_decl = plan.add(NodeKind::Variable, NodeValue::Var(pos));
        let count = plan.add_with(NodeKind::Count, NodeValue::None, [upstream, pos_decl])?;
        let (keys, right, ret) = detach_inner(plan, &cand)?;
        let join = plan.add_with(NodeKind::Join, NodeValue::None, [count, keys, right])?;
        plan.set_property(join, props::LEFT_JOIN, PropValue::Bool(true));

        let returned = (plan.kind(ret) == NodeKind::VariableRef)
            .then(|| plan.var(ret).cloned())
            .flatten()
            .filter(|v| cand.inner_bound.contains(v));
        let (top, source) = match returned {
            Some(var) => (join, var),
            None => {
                let result = plan.fresh_var("r");
                let decl = plan.add(NodeKind::Variable, NodeValue::Var(result.clone()));
                let bind = plan.add_with(NodeKind::LetBind, NodeValue::None, [join, decl, ret])?;
                plan.set_property(bind, props::CHECK, PropValue::Var(cand.run.clone()));
                (bind, result)
            }
        };
        plan.set_property(join, props::REGROUP, PropValue::Vars(vec![target.clone(), source]));
        plan.replace(stage, top)?;
        debug!(var = %target, run = %cand.run, "rewrite.unnest.let");
        Ok(true)
    }

    fn unnest_for(&mut self, plan: &mut Plan, stage: NodeId) -> Result<bool> {
        if plan.property(stage, props::CHECK).is_some()
            || pipeline::position_var(plan, stage).is_some()
        {
            return Ok(false);
        }
        let Some(pipe) = plan.last_child(stage) else {
            return Ok(false);
        };
        let Some(cand) = self.candidate(plan, stage, pipe) else {
            return Ok(false);
        };
        let target = pipeline::binding_var(plan, stage)
            .ok_or(SylvaError::Malformed("for without variable"))?;
        if cand.inner_bound.contains(&target) {
            return Ok(false);
        }

        let upstream = plan.remove_child(stage, 0)?;
        let (keys, right, ret) = detach_inner(plan, &cand)?;
        let join = plan.add_with(NodeKind::Join, NodeValue::None, [upstream, keys, right])?;
        let decl = plan.add(NodeKind::Variable, NodeValue::Var(target.clone()));
        let rebind = plan.add_with(NodeKind::ForBind, NodeValue::None, [join, decl, ret])?;
        plan.replace(stage, rebind)?;
        debug!(var = %target, run = %cand.run, "rewrite.unnest.for");
        Ok(true)
    }
}

impl Walker for Unnest {
    fn name(&self) -> &'static str {
        "unnest"
    }

    fn visit(&mut self, plan: &mut Plan, node: NodeId, cx: &mut WalkContext) -> Result<Visit> {
        let kind = plan.kind(node);
        if !matches!(
            kind,
            NodeKind::End | NodeKind::Selection | NodeKind::LetBind | NodeKind::ForBind
        ) {
            return Ok(Visit::Descend(node));
        }
        let changed = self.extract(plan, node)?
            || match kind {
                NodeKind::LetBind => self.unnest_let(plan, node)?,
                NodeKind::ForBind => self.unnest_for(plan, node)?,
                _ => false,
            };
        if changed {
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
    use crate::query::builder::{arith, call, eq, int, seq, var, Flwor};
    use crate::query::value::ArithOp;
    use crate::query::walker::walk;

    fn run(spec: &NodeSpec) -> Plan {
        let mut plan = Plan::from_spec(spec).expect("valid plan");
        walk(&mut Unnest, &mut plan, 32).expect("converges");
        pipeline::validate(&plan).expect("still well formed");
        plan
    }

    fn kinds(plan: &Plan) -> Vec<NodeKind> {
        plan.subtree(plan.root()).into_iter().map(|n| plan.kind(n)).collect()
    }

    fn correlated_inner(ret: NodeSpec) -> NodeSpec {
        Flwor::new()
            .for_("y", var("t"))
            .where_(eq(var("y"), var("x")))
            .return_(ret)
            .expect("inner builds")
    }

    #[test]
    fn let_over_correlated_pipeline_becomes_left_join() {
        let spec = Flwor::new()
            .for_("x", var("s"))
            .let_("v", correlated_inner(var("y")))
            .return_(call("count", [var("v")]))
            .expect("outer builds");
        let plan = run(&spec);
        let join = plan
            .subtree(plan.root())
            .into_iter()
            .find(|n| plan.kind(*n) == NodeKind::Join)
            .expect("join introduced");
        assert!(plan.flag(join, props::LEFT_JOIN));
        assert_eq!(
            plan.vars_property(join, props::REGROUP),
            Some(&[Var::from("v"), Var::from("y")][..])
        );
        let left = plan.child(join, 0).expect("left");
        assert_eq!(plan.kind(left), NodeKind::Count);
        let keys = plan.child(join, 1).expect("keys");
        let outer_key = plan.child(keys, 0).expect("outer key");
        assert_eq!(plan.var(outer_key), Some(&Var::from("x")));
        assert!(!kinds(&plan).contains(&NodeKind::Selection));
        assert!(!kinds(&plan).contains(&NodeKind::LetBind));
    }

    #[test]
    fn computed_return_is_bound_under_check() {
        let ret = arith(ArithOp::Mul, var("y"), int(2));
        let spec = Flwor::new()
            .for_("x", var("s"))
            .let_("v", correlated_inner(ret))
            .return_(var("v"))
            .expect("outer builds");
        let plan = run(&spec);
        let bind = plan
            .subtree(plan.root())
            .into_iter()
            .find(|n| plan.kind(*n) == NodeKind::LetBind)
            .expect("result binding");
        assert_eq!(plan.var_property(bind, props::CHECK), Some(&Var::from("y")));
        let join = plan.child(bind, 0).expect("join below");
        assert_eq!(plan.kind(join), NodeKind::Join);
        let regroup = plan.vars_property(join, props::REGROUP).expect("regroup");
        assert_eq!(regroup[0], Var::from("v"));
        assert_eq!(Some(&regroup[1]), pipeline::binding_var(&plan, bind).as_ref());
    }

    #[test]
    fn nested_pipeline_in_return_is_extracted_then_unnested() {
        let spec = Flwor::new()
            .for_("x", var("s"))
            .return_(call("count", [correlated_inner(var("y"))]))
            .expect("outer builds");
        let plan = run(&spec);
        assert!(kinds(&plan).contains(&NodeKind::Join));
        let end = pipeline::end_of(&plan, plan.root()).expect("end");
        let ret = plan.child(end, 1).expect("return");
        assert_eq!(plan.kind(ret), NodeKind::FunctionCall);
        let arg = plan.child(ret, 0).expect("argument");
        assert_eq!(plan.kind(arg), NodeKind::VariableRef);
    }

    #[test]
    fn mirrored_predicate_keeps_outer_key_left() {
        let inner = Flwor::new()
            .for_("y", var("t"))
            .where_(crate::query::builder::cmp(
                Comparison::General(CmpOp::Lt),
                var("y"),
                var("x"),
            ))
            .return_(var("y"))
            .expect("inner builds");
        let spec = Flwor::new()
            .for_("x", var("s"))
            .let_("v", inner)
            .return_(var("v"))
            .expect("outer builds");
        let plan = run(&spec);
        let keys = plan
            .subtree(plan.root())
            .into_iter()
            .find(|n| plan.kind(*n) == NodeKind::JoinExpr)
            .expect("join keys");
        assert_eq!(
            plan.value(keys),
            &NodeValue::Cmp(Comparison::General(CmpOp::Gt))
        );
        assert_eq!(plan.var(plan.child(keys, 0).expect("outer")), Some(&Var::from("x")));
    }

    #[test]
    fn for_over_correlated_pipeline_becomes_inner_join() {
        let spec = Flwor::new()
            .for_("x", var("s"))
            .for_("z", correlated_inner(var("y")))
            .return_(var("z"))
            .expect("outer builds");
        let plan = run(&spec);
        let end = pipeline::end_of(&plan, plan.root()).expect("end");
        let tail = plan.child(end, 0).expect("tail");
        assert_eq!(plan.kind(tail), NodeKind::ForBind);
        let join = plan.child(tail, 0).expect("join");
        assert_eq!(plan.kind(join), NodeKind::Join);
        assert!(!plan.flag(join, props::LEFT_JOIN));
        assert!(!kinds(&plan).contains(&NodeKind::Count));
    }

    #[test]
    fn uncorrelated_or_doubly_correlated_pipelines_stay_nested() {
        let uncorrelated = Flwor::new()
            .for_("x", var("s"))
            .let_(
                "v",
                Flwor::new()
                    .for_("y", var("t"))
                    .where_(eq(var("y"), int(1)))
                    .return_(var("y"))
                    .expect("inner builds"),
            )
            .return_(var("v"))
            .expect("outer builds");
        let doubly = Flwor::new()
            .for_("x", var("s"))
            .let_(
                "v",
                Flwor::new()
                    .for_("y", var("t"))
                    .where_(eq(var("y"), var("x")))
                    .let_("w", seq([var("x")]))
                    .return_(var("w"))
                    .expect("inner builds"),
            )
            .return_(var("v"))
            .expect("outer builds");
        for spec in [uncorrelated, doubly] {
            let plan = run(&spec);
            assert_eq!(plan.to_spec(plan.root()), spec);
        }
    }

    #[test]
    fn inner_name_used_downstream_blocks_rewrite() {
        let spec = Flwor::new()
            .for_("x", var("s"))
            .let_("v", correlated_inner(var("y")))
            .return_(seq([var("v"), var("y")]))
            .expect("outer builds");
        let plan = run(&spec);
        assert_eq!(plan.to_spec(plan.root()), spec);
    }
}
