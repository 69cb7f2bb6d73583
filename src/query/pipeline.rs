//! Shape helpers for the input-first pipeline layout: navigation between
//! stages, binding analysis and structural validation.

use std::collections::BTreeSet;

use crate::query::ast::{props, NodeId, NodeKind, NodeValue, Plan, Var};
use crate::types::{Result, SylvaError};

/// What consumes a stage's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Downstream {
    /// The pipeline's `End`.
    End(NodeId),
    /// The stage is the tail of one input of this join.
    JoinInput(NodeId),
    /// Another stage reads this one as its input.
    Stage(NodeId),
}

/// Upstream stage feeding `stage`; `None` for `Start`.
pub fn input(plan: &Plan, stage: NodeId) -> Option<NodeId> {
    match plan.kind(stage) {
        NodeKind::Start => None,
        _ => plan.child(stage, 0),
    }
}

/// Consumer of a stage's output.
pub fn downstream(plan: &Plan, stage: NodeId) -> Result<Downstream> {
    let parent = plan
        .parent(stage)
        .ok_or(SylvaError::Malformed("pipeline stage without consumer"))?;
    match plan.kind(parent) {
        NodeKind::End => Ok(Downstream::End(parent)),
        NodeKind::Join => {
            if plan.child(parent, 0) == Some(stage) || plan.last_child(parent) == Some(stage) {
                Ok(Downstream::JoinInput(parent))
            } else {
                Err(SylvaError::Malformed("stage attached to a join key slot"))
            }
        }
        kind if kind.is_stage() && plan.child(parent, 0) == Some(stage) => {
            Ok(Downstream::Stage(parent))
        }
        _ => Err(SylvaError::Malformed("stage attached outside a pipeline")),
    }
}

/// First stage of the chain ending at `tail`: follow inputs until `Start` or a `Join`.
pub fn entry(plan: &Plan, tail: NodeId) -> NodeId {
    let mut node = tail;
    while !matches!(plan.kind(node), NodeKind::Start | NodeKind::Join) {
        match input(plan, node) {
            Some(next) => node = next,
            None => break,
        }
    }
    node
}

/// Stages from `tail` down to `Start` along child 0 (join inputs: left side).
pub fn chain(plan: &Plan, tail: NodeId) -> Vec<NodeId> {
    let mut out = vec![tail];
    let mut node = tail;
    while let Some(next) = input(plan, node) {
        out.push(next);
        node = next;
    }
    out
}

/// `End` of a `PipeExpr`.
pub fn end_of(plan: &Plan, pipe: NodeId) -> Option<NodeId> {
    plan.child(pipe, 0)
        .filter(|end| plan.kind(*end) == NodeKind::End)
}

/// The `End` reached by walking downstream from `stage`.
pub fn enclosing_end(plan: &Plan, stage: NodeId) -> Option<NodeId> {
    let mut node = stage;
    loop {
        let parent = plan.parent(node)?;
        match plan.kind(parent) {
            NodeKind::End => return Some(parent),
            kind if kind.is_stage() => node = parent,
            _ => return None,
        }
    }
}

/// Variable declared by child `idx` of a stage.
fn declared(plan: &Plan, stage: NodeId, idx: usize) -> Option<Var> {
    plan.child(stage, idx).and_then(|c| plan.var(c).cloned())
}

/// Position variable of a `ForBind`, if declared.
pub fn position_var(plan: &Plan, stage: NodeId) -> Option<Var> {
    if plan.kind(stage) != NodeKind::ForBind {
        return None;
    }
    plan.child(stage, 2)
        .filter(|c| plan.kind(*c) == NodeKind::PosVariable)
        .and_then(|c| plan.var(c).cloned())
}

/// Main variable bound by a `ForBind`, `LetBind` or `Count`.
pub fn binding_var(plan: &Plan, stage: NodeId) -> Option<Var> {
    match plan.kind(stage) {
        NodeKind::ForBind | NodeKind::LetBind | NodeKind::Count => declared(plan, stage, 1),
        _ => None,
    }
}

/// Grouping keys of a `GroupBy`.
pub fn group_keys(plan: &Plan, stage: NodeId) -> Vec<Var> {
    plan.children(stage)
        .iter()
        .skip(1)
        .filter(|c| plan.kind(**c) == NodeKind::GroupSpec)
        .filter_map(|c| plan.child(*c, 0).and_then(|r| plan.var(r).cloned()))
        .collect()
}

/// `(target, source)` pairs of a `GroupBy`.
pub fn group_aggregates(plan: &Plan, stage: NodeId) -> Vec<(Var, Var)> {
    plan.children(stage)
        .iter()
        .skip(1)
        .filter(|c| plan.kind(**c) == NodeKind::AggregateSpec)
        .filter_map(|c| {
            let target = declared(plan, *c, 0)?;
            let source = plan.child(*c, 1).and_then(|r| plan.var(r).cloned())?;
            Some((target, source))
        })
        .collect()
}

/// Variables a stage itself binds, in binding order.
pub fn bound_vars(plan: &Plan, stage: NodeId) -> Vec<Var> {
    match plan.kind(stage) {
        NodeKind::ForBind => binding_var(plan, stage)
            .into_iter()
            .chain(position_var(plan, stage))
            .collect(),
        NodeKind::LetBind | NodeKind::Count => binding_var(plan, stage).into_iter().collect(),
        NodeKind::GroupBy => group_keys(plan, stage)
            .into_iter()
            .chain(group_aggregates(plan, stage).into_iter().map(|(t, _)| t))
            .collect(),
        _ => Vec::new(),
    }
}

/// Pipeline-local bindings visible after `stage`, in row order.
pub fn visible_vars(plan: &Plan, stage: NodeId) -> Vec<Var> {
    match plan.kind(stage) {
        NodeKind::Start => Vec::new(),
        NodeKind::GroupBy => bound_vars(plan, stage),
        NodeKind::Join => {
            let mut vars = plan
                .child(stage, 0)
                .map(|left| visible_vars(plan, left))
                .unwrap_or_default();
            if let Some(right) = plan.last_child(stage) {
                vars.extend(visible_vars(plan, right));
            }
            vars
        }
        _ => {
            let mut vars = input(plan, stage)
                .map(|upstream| visible_vars(plan, upstream))
                .unwrap_or_default();
            vars.extend(bound_vars(plan, stage));
            vars
        }
    }
}

/// Expression children of a stage (or of `End`), evaluated against its input row.
pub fn stage_expressions(plan: &Plan, stage: NodeId) -> Vec<NodeId> {
    match plan.kind(stage) {
        NodeKind::ForBind | NodeKind::LetBind => plan.last_child(stage).into_iter().collect(),
        NodeKind::Selection | NodeKind::End => plan.child(stage, 1).into_iter().collect(),
        NodeKind::OrderBy => plan
            .children(stage)
            .iter()
            .skip(1)
            .filter_map(|spec| plan.child(*spec, 0))
            .collect(),
        NodeKind::Join => plan
            .child(stage, 1)
            .map(|keys| plan.children(keys).to_vec())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Every variable referenced in a subtree, `check` annotations included.
///
/// Nested rebindings are not subtracted, so the set over-approximates the
/// free variables.
pub fn referenced_vars(plan: &Plan, node: NodeId) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    for id in plan.subtree(node) {
        if plan.kind(id) == NodeKind::VariableRef {
            if let Some(v) = plan.var(id) {
                out.insert(v.clone());
            }
        }
        if let Some(v) = plan.var_property(id, props::CHECK) {
            out.insert(v.clone());
        }
    }
    out
}

/// Variables referenced by a stage's own expressions and annotations.
pub fn stage_references(plan: &Plan, stage: NodeId) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    for expr in stage_expressions(plan, stage) {
        out.extend(referenced_vars(plan, expr));
    }
    if plan.kind(stage) == NodeKind::GroupBy {
        out.extend(group_keys(plan, stage));
        out.extend(group_aggregates(plan, stage).into_iter().map(|(_, s)| s));
    }
    if let Some(v) = plan.var_property(stage, props::CHECK) {
        out.insert(v.clone());
    }
    out
}

/// Checks the structural invariants of every reachable node.
pub fn validate(plan: &Plan) -> Result<()> {
    for id in plan.subtree(plan.root()) {
        validate_node(plan, id)?;
    }
    Ok(())
}

fn malformed(plan: &Plan, id: NodeId, what: &str) -> SylvaError {
    SylvaError::MalformedOwned(format!("{:?} #{}: {what}", plan.kind(id), id.0))
}

fn expect_kind(plan: &Plan, parent: NodeId, idx: usize, kind: NodeKind) -> Result<NodeId> {
    match plan.child(parent, idx) {
        Some(child) if plan.kind(child) == kind => Ok(child),
        _ => Err(malformed(plan, parent, &format!("child {idx} must be {kind:?}"))),
    }
}

fn expect_stage(plan: &Plan, parent: NodeId, idx: usize) -> Result<()> {
    match plan.child(parent, idx) {
        Some(child) if plan.kind(child).is_stage() => Ok(()),
        _ => Err(malformed(plan, parent, &format!("child {idx} must be a pipeline stage"))),
    }
}

fn expect_count(plan: &Plan, id: NodeId, allowed: &[usize]) -> Result<()> {
    if allowed.contains(&plan.child_count(id)) {
        Ok(())
    } else {
        Err(malformed(
            plan,
            id,
            &format!("unexpected child count {}", plan.child_count(id)),
        ))
    }
}

fn validate_node(plan: &Plan, id: NodeId) -> Result<()> {
    match plan.kind(id) {
        NodeKind::PipeExpr => {
            expect_count(plan, id, &[1])?;
            expect_kind(plan, id, 0, NodeKind::End)?;
        }
        NodeKind::End => {
            expect_count(plan, id, &[1, 2])?;
            expect_stage(plan, id, 0)?;
            let parent_kind = plan.parent(id).map(|p| plan.kind(p));
            if parent_kind != Some(NodeKind::PipeExpr) {
                return Err(malformed(plan, id, "End must sit directly under PipeExpr"));
            }
        }
        NodeKind::Start => expect_count(plan, id, &[0])?,
        NodeKind::ForBind => {
            expect_count(plan, id, &[3, 4])?;
            expect_stage(plan, id, 0)?;
            expect_kind(plan, id, 1, NodeKind::Variable)?;
            if plan.child_count(id) == 4 {
                expect_kind(plan, id, 2, NodeKind::PosVariable)?;
            }
        }
        NodeKind::LetBind => {
            expect_count(plan, id, &[3])?;
            expect_stage(plan, id, 0)?;
            expect_kind(plan, id, 1, NodeKind::Variable)?;
        }
        NodeKind::Selection => {
            expect_count(plan, id, &[2])?;
            expect_stage(plan, id, 0)?;
        }
        NodeKind::OrderBy => {
            if plan.child_count(id) < 2 {
                return Err(malformed(plan, id, "needs at least one order spec"));
            }
            expect_stage(plan, id, 0)?;
            for idx in 1..plan.child_count(id) {
                expect_kind(plan, id, idx, NodeKind::OrderSpec)?;
            }
        }
        NodeKind::OrderSpec => {
            expect_count(plan, id, &[1])?;
            if !matches!(plan.value(id), NodeValue::Order(_)) {
                return Err(malformed(plan, id, "missing sort order"));
            }
        }
        NodeKind::GroupBy => {
            expect_stage(plan, id, 0)?;
            let mut seen_aggregate = false;
            for idx in 1..plan.child_count(id) {
                match plan.child(id, idx).map(|c| plan.kind(c)) {
                    Some(NodeKind::GroupSpec) if !seen_aggregate => {}
                    Some(NodeKind::AggregateSpec) => seen_aggregate = true,
                    _ => {
                        return Err(malformed(
                            plan,
                            id,
                            "expects GroupSpec children followed by AggregateSpec children",
                        ))
                    }
                }
            }
            if plan.child_count(id) < 2 {
                return Err(malformed(plan, id, "needs at least one grouping key"));
            }
        }
        NodeKind::GroupSpec => {
            expect_count(plan, id, &[1])?;
            expect_kind(plan, id, 0, NodeKind::VariableRef)?;
        }
        NodeKind::AggregateSpec => {
            expect_count(plan, id, &[2])?;
            expect_kind(plan, id, 0, NodeKind::Variable)?;
            expect_kind(plan, id, 1, NodeKind::VariableRef)?;
        }
        NodeKind::Count => {
            expect_count(plan, id, &[2])?;
            expect_stage(plan, id, 0)?;
            expect_kind(plan, id, 1, NodeKind::Variable)?;
        }
        NodeKind::Join => {
            expect_count(plan, id, &[3])?;
            expect_stage(plan, id, 0)?;
            expect_kind(plan, id, 1, NodeKind::JoinExpr)?;
            expect_stage(plan, id, 2)?;
        }
        NodeKind::JoinExpr => {
            expect_count(plan, id, &[2])?;
            if !matches!(plan.value(id), NodeValue::Cmp(_)) {
                return Err(malformed(plan, id, "missing comparison operator"));
            }
        }
        NodeKind::Variable | NodeKind::PosVariable | NodeKind::VariableRef => {
            if plan.var(id).is_none() {
                return Err(malformed(plan, id, "missing variable name"));
            }
        }
        NodeKind::ComparisonExpr => {
            expect_count(plan, id, &[2])?;
            if !matches!(plan.value(id), NodeValue::Cmp(_)) {
                return Err(malformed(plan, id, "missing comparison operator"));
            }
        }
        NodeKind::ArithmeticExpr => {
            expect_count(plan, id, &[2])?;
            if !matches!(plan.value(id), NodeValue::Arith(_)) {
                return Err(malformed(plan, id, "missing arithmetic operator"));
            }
        }
        NodeKind::FunctionCall => {
            if plan.name(id).is_none() {
                return Err(malformed(plan, id, "missing function name"));
            }
        }
        NodeKind::StepExpr => {
            if plan.child_count(id) < 2 {
                return Err(malformed(plan, id, "needs an axis and a node test"));
            }
            expect_kind(plan, id, 0, NodeKind::AxisSpec)?;
        }
        NodeKind::AxisSpec => {
            if !matches!(plan.value(id), NodeValue::Axis(_)) {
                return Err(malformed(plan, id, "missing axis"));
            }
        }
        _ => {}
    }
    if plan.kind(id).is_stage() {
        if let Some(parent) = plan.parent(id) {
            downstream(plan, id).map_err(|_| malformed(plan, parent, "stage in an expression slot"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builder::{int, var, Flwor};

    #[test]
    fn visible_vars_follow_row_layout() {
        let spec = Flwor::new()
            .for_at("x", "i", int(1))
            .let_("y", var("x"))
            .return_(var("y"))
            .expect("flwor builds");
        let plan = Plan::from_spec(&spec).expect("valid plan");
        let end = end_of(&plan, plan.root()).expect("end");
        let tail = plan.child(end, 0).expect("tail");
        let names: Vec<String> = visible_vars(&plan, tail)
            .into_iter()
            .map(|v| v.0)
            .collect();
        assert_eq!(names, ["x", "i", "y"]);
        assert_eq!(plan.kind(entry(&plan, tail)), NodeKind::Start);
        assert_eq!(chain(&plan, tail).len(), 3);
    }

    #[test]
    fn stage_in_expression_slot_is_rejected() {
        let mut plan = Plan::new(NodeKind::SequenceExpr, NodeValue::None);
        let root = plan.root();
        let start = plan.add(NodeKind::Start, NodeValue::None);
        plan.append_child(root, start).expect("append");
        assert!(validate(&plan).is_err());
    }
}
