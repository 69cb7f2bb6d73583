//! Canonicalizes `descendant-or-self::node()/child::X` into `descendant::X`.

use crate::query::ast::{Axis, NodeId, NodeKind, NodeValue, Plan};
use crate::query::walker::{Visit, WalkContext, Walker};
use crate::types::Result;

/// Merges adjacent predicate-free `descendant-or-self::node()` and `child::X` steps.
#[derive(Debug, Default)]
pub struct StepMerge;

fn is_axis(plan: &Plan, step: NodeId, axis: Axis) -> bool {
    plan.child(step, 0)
        .map(|spec| {
            plan.kind(spec) == NodeKind::AxisSpec && *plan.value(spec) == NodeValue::Axis(axis)
        })
        .unwrap_or(false)
}

/// `descendant-or-self::node()` without predicates.
fn is_dos_any(plan: &Plan, step: NodeId) -> bool {
    plan.kind(step) == NodeKind::StepExpr
        && plan.child_count(step) == 2
        && is_axis(plan, step, Axis::DescendantOrSelf)
        && plan
            .child(step, 1)
            .map(|test| plan.kind(test) == NodeKind::KindTestAnyKind)
            .unwrap_or(false)
}

/// `child::X` without predicates.
fn is_plain_child(plan: &Plan, step: NodeId) -> bool {
    plan.kind(step) == NodeKind::StepExpr
        && plan.child_count(step) == 2
        && is_axis(plan, step, Axis::Child)
}

impl Walker for StepMerge {
    fn name(&self) -> &'static str {
        "step-merge"
    }

    fn visit(&mut self, plan: &mut Plan, node: NodeId, cx: &mut WalkContext) -> Result<Visit> {
        if plan.kind(node) != NodeKind::PathExpr {
            return Ok(Visit::Descend(node));
        }
        let steps = plan.children(node).to_vec();
        for (idx, pair) in steps.windows(2).enumerate() {
            let (current, next) = (pair[0], pair[1]);
            if !is_dos_any(plan, current) || !is_plain_child(plan, next) {
                continue;
            }
            let Some(test) = plan.child(next, 1) else {
                continue;
            };
            let test = plan.copy_subtree(test);
            let axis = plan.add(NodeKind::AxisSpec, NodeValue::Axis(Axis::Descendant));
            let merged = plan.add_with(NodeKind::StepExpr, NodeValue::None, [axis, test])?;
            plan.remove_child(node, idx + 1)?;
            plan.replace_child(node, idx, merged)?;
            cx.snapshot();
            break;
        }
        Ok(Visit::Descend(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::NodeSpec;
    use crate::query::builder::{any_kind, boolean, name_test, path, step, step_with, var};
    use crate::query::walker::walk;

    fn merged(spec: &NodeSpec) -> NodeSpec {
        let mut plan = Plan::from_spec(spec).expect("valid plan");
        walk(&mut StepMerge, &mut plan, 16).expect("converges");
        plan.to_spec(plan.root())
    }

    #[test]
    fn dos_node_then_child_becomes_descendant() {
        let spec = path(
            var("d"),
            [
                step(Axis::DescendantOrSelf, any_kind()),
                step(Axis::Child, name_test("b")),
            ],
        );
        let expected = path(var("d"), [step(Axis::Descendant, name_test("b"))]);
        assert_eq!(merged(&spec), expected);
    }

    #[test]
    fn predicate_on_child_step_blocks_merge() {
        let spec = path(
            var("d"),
            [
                step(Axis::DescendantOrSelf, any_kind()),
                step_with(Axis::Child, name_test("b"), [boolean(true)]),
            ],
        );
        assert_eq!(merged(&spec), spec);
    }

    #[test]
    fn chained_pairs_all_merge() {
        let spec = path(
            var("d"),
            [
                step(Axis::DescendantOrSelf, any_kind()),
                step(Axis::Child, name_test("a")),
                step(Axis::DescendantOrSelf, any_kind()),
                step(Axis::Child, name_test("b")),
            ],
        );
        let expected = path(
            var("d"),
            [
                step(Axis::Descendant, name_test("a")),
                step(Axis::Descendant, name_test("b")),
            ],
        );
        let once = merged(&spec);
        assert_eq!(once, expected);
        assert_eq!(merged(&once), once);
    }
}
