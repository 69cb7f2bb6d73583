//! Fluent construction of plan documents.
//!
//! Parsing query text is not this crate's job; callers (and tests) assemble
//! plan trees with these helpers and install them with
//! [`Plan::from_spec`](crate::query::ast::Plan::from_spec).

use crate::query::ast::{Axis, NodeKind, NodeSpec, NodeValue, PropValue, SortOrder, Var};
use crate::query::ast::props;
use crate::query::value::{ArithOp, CmpOp, Comparison};
use crate::types::{Result, SylvaError};

/// Reference to a variable.
pub fn var(name: &str) -> NodeSpec {
    NodeSpec::new(NodeKind::VariableRef).with_value(NodeValue::Var(Var::from(name)))
}

/// Integer literal.
pub fn int(value: i64) -> NodeSpec {
    NodeSpec::new(NodeKind::Literal).with_value(NodeValue::Int(value))
}

/// Double literal.
pub fn dbl(value: f64) -> NodeSpec {
    NodeSpec::new(NodeKind::Literal).with_value(NodeValue::Dbl(value))
}

/// String literal.
pub fn string(value: &str) -> NodeSpec {
    NodeSpec::new(NodeKind::Literal).with_value(NodeValue::Str(value.to_owned()))
}

/// Boolean literal.
pub fn boolean(value: bool) -> NodeSpec {
    NodeSpec::new(NodeKind::Literal).with_value(NodeValue::Bool(value))
}

/// `()`
pub fn empty() -> NodeSpec {
    NodeSpec::new(NodeKind::EmptySequence)
}

/// `(a, b, ...)`
pub fn seq(items: impl IntoIterator<Item = NodeSpec>) -> NodeSpec {
    NodeSpec::new(NodeKind::SequenceExpr).with_children(items)
}

/// `lo to hi`
pub fn range(lo: NodeSpec, hi: NodeSpec) -> NodeSpec {
    NodeSpec::new(NodeKind::RangeExpr).with_children([lo, hi])
}

/// Binary arithmetic.
pub fn arith(op: ArithOp, left: NodeSpec, right: NodeSpec) -> NodeSpec {
    NodeSpec::new(NodeKind::ArithmeticExpr)
        .with_value(NodeValue::Arith(op))
        .with_children([left, right])
}

/// Comparison of either flavour.
pub fn cmp(op: Comparison, left: NodeSpec, right: NodeSpec) -> NodeSpec {
    NodeSpec::new(NodeKind::ComparisonExpr)
        .with_value(NodeValue::Cmp(op))
        .with_children([left, right])
}

/// General equality `left = right`.
pub fn eq(left: NodeSpec, right: NodeSpec) -> NodeSpec {
    cmp(Comparison::General(CmpOp::Eq), left, right)
}

/// `left and right`
pub fn and(left: NodeSpec, right: NodeSpec) -> NodeSpec {
    NodeSpec::new(NodeKind::AndExpr).with_children([left, right])
}

/// `left or right`
pub fn or(left: NodeSpec, right: NodeSpec) -> NodeSpec {
    NodeSpec::new(NodeKind::OrExpr).with_children([left, right])
}

/// `if (cond) then a else b`
pub fn if_(cond: NodeSpec, then: NodeSpec, otherwise: NodeSpec) -> NodeSpec {
    NodeSpec::new(NodeKind::IfExpr).with_children([cond, then, otherwise])
}

/// Function call by name.
pub fn call(name: &str, args: impl IntoIterator<Item = NodeSpec>) -> NodeSpec {
    NodeSpec::new(NodeKind::FunctionCall)
        .with_value(NodeValue::Name(name.to_owned()))
        .with_children(args)
}

/// Path expression `base/step/step...`.
pub fn path(base: NodeSpec, steps: impl IntoIterator<Item = NodeSpec>) -> NodeSpec {
    NodeSpec::new(NodeKind::PathExpr)
        .with_children(std::iter::once(base))
        .with_children(steps)
}

/// Predicate-free step.
pub fn step(axis: Axis, test: NodeSpec) -> NodeSpec {
    step_with(axis, test, Vec::new())
}

/// Step with predicates.
pub fn step_with(
    axis: Axis,
    test: NodeSpec,
    predicates: impl IntoIterator<Item = NodeSpec>,
) -> NodeSpec {
    NodeSpec::new(NodeKind::StepExpr)
        .with_children([
            NodeSpec::new(NodeKind::AxisSpec).with_value(NodeValue::Axis(axis)),
            test,
        ])
        .with_children(predicates)
}

/// Name test.
pub fn name_test(name: &str) -> NodeSpec {
    NodeSpec::new(NodeKind::NameTest).with_value(NodeValue::Name(name.to_owned()))
}

/// `node()` kind test.
pub fn any_kind() -> NodeSpec {
    NodeSpec::new(NodeKind::KindTestAnyKind)
}

fn declaration(kind: NodeKind, name: &str) -> NodeSpec {
    NodeSpec::new(kind).with_value(NodeValue::Var(Var::from(name)))
}

/// Fluent builder for FLWOR pipelines.
///
/// Clauses are added in source order; the builder stacks each one on top of
/// the previous stage so the result follows the input-first layout.
pub struct Flwor {
    tail: NodeSpec,
    clauses: usize,
    error: Option<SylvaError>,
}

impl Default for Flwor {
    fn default() -> Self {
        Self::new()
    }
}

impl Flwor {
    /// Empty pipeline (just `Start`).
    pub fn new() -> Self {
        Self {
            tail: NodeSpec::new(NodeKind::Start),
            clauses: 0,
            error: None,
        }
    }

    fn push(mut self, kind: NodeKind, rest: Vec<NodeSpec>) -> Self {
        if self.error.is_some() {
            return self;
        }
        let input = std::mem::replace(&mut self.tail, NodeSpec::new(NodeKind::Start));
        self.tail = NodeSpec::new(kind)
            .with_children(std::iter::once(input))
            .with_children(rest);
        self.clauses += 1;
        self
    }

    fn fail(mut self, message: &'static str) -> Self {
        if self.error.is_none() {
            self.error = Some(SylvaError::Malformed(message));
        }
        self
    }

    /// `for $name in source`
    pub fn for_(self, name: &str, source: NodeSpec) -> Self {
        if name.is_empty() {
            return self.fail("for clause requires a variable name");
        }
        self.push(
            NodeKind::ForBind,
            vec![declaration(NodeKind::Variable, name), source],
        )
    }

    /// `for $name at $pos in source`
    pub fn for_at(self, name: &str, pos: &str, source: NodeSpec) -> Self {
        if name.is_empty() || pos.is_empty() {
            return self.fail("for clause requires variable names");
        }
        self.push(
            NodeKind::ForBind,
            vec![
                declaration(NodeKind::Variable, name),
                declaration(NodeKind::PosVariable, pos),
                source,
            ],
        )
    }

    /// `let $name := expr`
    pub fn let_(self, name: &str, expr: NodeSpec) -> Self {
        if name.is_empty() {
            return self.fail("let clause requires a variable name");
        }
        self.push(
            NodeKind::LetBind,
            vec![declaration(NodeKind::Variable, name), expr],
        )
    }

    /// `where predicate`
    pub fn where_(self, predicate: NodeSpec) -> Self {
        self.push(NodeKind::Selection, vec![predicate])
    }

    /// `order by key [ascending|descending], ...`
    pub fn order_by(self, specs: impl IntoIterator<Item = (NodeSpec, SortOrder)>) -> Self {
        let specs: Vec<NodeSpec> = specs
            .into_iter()
            .map(|(expr, order)| {
                NodeSpec::new(NodeKind::OrderSpec)
                    .with_value(NodeValue::Order(order))
                    .with_children([expr])
            })
            .collect();
        if specs.is_empty() {
            return self.fail("order by requires at least one key");
        }
        self.push(NodeKind::OrderBy, specs)
    }

    /// `group by $k, ...` collecting `source` bindings into `target` sequences.
    pub fn group_by(self, keys: &[&str], aggregates: &[(&str, &str)]) -> Self {
        if keys.is_empty() {
            return self.fail("group by requires at least one key");
        }
        let mut children: Vec<NodeSpec> = keys
            .iter()
            .map(|k| NodeSpec::new(NodeKind::GroupSpec).with_children([var(k)]))
            .collect();
        children.extend(aggregates.iter().map(|(target, source)| {
            NodeSpec::new(NodeKind::AggregateSpec)
                .with_children([declaration(NodeKind::Variable, target), var(source)])
        }));
        self.push(NodeKind::GroupBy, children)
    }

    /// `count $name`
    pub fn count(self, name: &str) -> Self {
        if name.is_empty() {
            return self.fail("count clause requires a variable name");
        }
        self.push(NodeKind::Count, vec![declaration(NodeKind::Variable, name)])
    }

    /// Joins this pipeline (left) with `right` on `left_key op right_key`.
    pub fn join(
        mut self,
        right: Flwor,
        op: Comparison,
        left_key: NodeSpec,
        right_key: NodeSpec,
        left_join: bool,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        if let Some(err) = right.error {
            self.error = Some(err);
            return self;
        }
        let keys = NodeSpec::new(NodeKind::JoinExpr)
            .with_value(NodeValue::Cmp(op))
            .with_children([left_key, right_key]);
        let mut joined = self.push(NodeKind::Join, vec![keys, right.tail]);
        if left_join {
            joined.tail = joined
                .tail
                .with_property(props::LEFT_JOIN, PropValue::Bool(true));
        }
        joined
    }

    /// Closes the pipeline with `return ret`.
    pub fn return_(self, ret: NodeSpec) -> Result<NodeSpec> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.clauses == 0 {
            return Err(SylvaError::Malformed("flwor requires at least one clause"));
        }
        let end = NodeSpec::new(NodeKind::End).with_children([self.tail, ret]);
        Ok(NodeSpec::new(NodeKind::PipeExpr).with_children([end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::Plan;

    #[test]
    fn clauses_stack_input_first() {
        let spec = Flwor::new()
            .for_("x", seq([int(1), int(2)]))
            .where_(eq(var("x"), int(2)))
            .return_(var("x"))
            .expect("flwor builds");
        let end = &spec.children[0];
        let selection = &end.children[0];
        assert_eq!(selection.kind, NodeKind::Selection);
        assert_eq!(selection.children[0].kind, NodeKind::ForBind);
        assert_eq!(selection.children[0].children[0].kind, NodeKind::Start);
        Plan::from_spec(&spec).expect("valid plan");
    }

    #[test]
    fn deferred_errors_surface_at_return() {
        let err = Flwor::new()
            .for_("x", int(1))
            .order_by(Vec::<(NodeSpec, SortOrder)>::new())
            .let_("y", int(2))
            .return_(var("y"))
            .expect_err("empty order by");
        assert!(matches!(err, SylvaError::Malformed(msg) if msg.contains("order by")));
        assert!(Flwor::new().return_(int(1)).is_err());
    }
}
