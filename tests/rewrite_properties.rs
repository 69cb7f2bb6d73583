#![allow(missing_docs)]

use proptest::prelude::*;
use sylva::query::ast::{Axis, NodeKind, NodeSpec, NodeValue};
use sylva::query::builder::{any_kind, boolean, name_test, path, step_with, var, Flwor};
use sylva::query::{optimize, OptimizerConfig, Plan};

fn arb_step() -> impl Strategy<Value = NodeSpec> {
    let axis = prop::sample::select(vec![
        Axis::Child,
        Axis::Descendant,
        Axis::DescendantOrSelf,
        Axis::Attribute,
    ]);
    let test = prop_oneof![
        Just(any_kind()),
        prop::sample::select(vec!["a", "b", "c"]).prop_map(name_test),
    ];
    (axis, test, any::<bool>()).prop_map(|(axis, test, filtered)| {
        let predicates = if filtered { vec![boolean(true)] } else { Vec::new() };
        step_with(axis, test, predicates)
    })
}

fn arb_path() -> impl Strategy<Value = NodeSpec> {
    prop::collection::vec(arb_step(), 1..8).prop_map(|steps| path(var("d"), steps))
}

/// A path alone, or a FLWOR iterating one path and returning another.
fn arb_plan() -> impl Strategy<Value = NodeSpec> {
    prop_oneof![
        arb_path(),
        (arb_path(), arb_path()).prop_map(|(source, ret)| {
            Flwor::new()
                .for_("d", source)
                .return_(ret)
                .expect("flwor builds")
        }),
    ]
}

fn step_merged(spec: &NodeSpec) -> NodeSpec {
    let mut plan = Plan::from_spec(spec).expect("valid plan");
    optimize(&mut plan, &OptimizerConfig::default()).expect("optimizes");
    plan.to_spec(plan.root())
}

fn is_step(spec: &NodeSpec, axis: Axis, any: bool) -> bool {
    spec.kind == NodeKind::StepExpr
        && spec.children.len() == 2
        && spec.children[0].value == NodeValue::Axis(axis)
        && (!any || spec.children[1].kind == NodeKind::KindTestAnyKind)
}

fn has_mergeable_pair(spec: &NodeSpec) -> bool {
    let here = spec.kind == NodeKind::PathExpr
        && spec
            .children
            .windows(2)
            .any(|pair| is_step(&pair[0], Axis::DescendantOrSelf, true) && is_step(&pair[1], Axis::Child, false));
    here || spec.children.iter().any(has_mergeable_pair)
}

fn step_count(spec: &NodeSpec) -> usize {
    let own = usize::from(spec.kind == NodeKind::StepExpr);
    own + spec.children.iter().map(step_count).sum::<usize>()
}

proptest! {
    #[test]
    fn step_merge_is_idempotent(spec in arb_plan()) {
        let once = step_merged(&spec);
        let twice = step_merged(&once);
        prop_assert_eq!(&twice, &once);
    }

    #[test]
    fn step_merge_leaves_no_mergeable_pair(spec in arb_plan()) {
        let merged = step_merged(&spec);
        prop_assert!(!has_mergeable_pair(&merged));
        prop_assert!(step_count(&merged) <= step_count(&spec));
    }
}

#[test]
fn predicated_steps_are_left_alone() {
    let spec = path(
        var("d"),
        [
            step_with(Axis::DescendantOrSelf, any_kind(), [boolean(true)]),
            step_with(Axis::Child, name_test("b"), Vec::new()),
        ],
    );
    assert_eq!(step_merged(&spec), spec);
}
