//! Compiled expressions evaluated against a row.

use std::fmt;
use std::sync::Arc;

use crate::query::ast::Var;
use crate::query::context::QueryContext;
use crate::query::errors::EvalError;
use crate::query::operator::{for_each_row, Operator};
use crate::query::registry::FunctionDef;
use crate::query::tuple::Tuple;
use crate::query::value::{ArithOp, Comparison, Item, Sequence};
use crate::types::{Result, SylvaError};

/// An expression bound to the row layout it was compiled against.
pub trait Expr: fmt::Debug + fmt::Display + Send + Sync {
    /// Evaluates the expression for one row.
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence>;

    /// Evaluates to at most one item; longer sequences are an error.
    fn evaluate_to_item(&self, ctx: &QueryContext, row: &Tuple) -> Result<Option<Item>> {
        let seq = self.evaluate(ctx, row)?;
        Ok(seq.singleton_item("singleton operand")?.cloned())
    }
}

/// Constant sequence.
#[derive(Debug)]
pub struct Literal(pub Sequence);

impl Expr for Literal {
    fn evaluate(&self, _ctx: &QueryContext, _row: &Tuple) -> Result<Sequence> {
        Ok(self.0.clone())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.items() {
            [Item::Str(s)] => write!(f, "\"{s}\""),
            [item] => write!(f, "{item}"),
            _ => write!(f, "{}", self.0),
        }
    }
}

/// Reads one slot of the row.
#[derive(Debug)]
pub struct VarRef {
    var: Var,
    slot: usize,
}

impl VarRef {
    /// Reference to `var` stored at `slot`.
    pub fn new(var: Var, slot: usize) -> Self {
        Self { var, slot }
    }
}

impl Expr for VarRef {
    fn evaluate(&self, _ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        row.get(self.slot).cloned().ok_or_else(|| {
            SylvaError::MalformedOwned(format!(
                "{} expected at slot {} of a {}-slot row",
                self.var,
                self.slot,
                row.len()
            ))
        })
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.var)
    }
}

/// Concatenation of its operands.
#[derive(Debug)]
pub struct SequenceExpr(pub Vec<Arc<dyn Expr>>);

impl Expr for SequenceExpr {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let mut items = Vec::new();
        for part in &self.0 {
            items.extend(part.evaluate(ctx, row)?.iter().cloned());
        }
        Ok(Sequence::from_items(items))
    }
}

impl fmt::Display for SequenceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, part) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

/// `lo to hi`
#[derive(Debug)]
pub struct RangeExpr {
    /// Lower bound.
    pub lo: Arc<dyn Expr>,
    /// Upper bound.
    pub hi: Arc<dyn Expr>,
}

fn integer_bound(item: Option<Item>) -> Result<Option<i64>> {
    match item {
        None => Ok(None),
        Some(Item::Int(v)) => Ok(Some(v)),
        Some(other) => Err(EvalError::type_mismatch("range", other.type_name()).into()),
    }
}

impl Expr for RangeExpr {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let lo = integer_bound(self.lo.evaluate_to_item(ctx, row)?)?;
        let hi = integer_bound(self.hi.evaluate_to_item(ctx, row)?)?;
        match (lo, hi) {
            (Some(lo), Some(hi)) if lo <= hi => Ok((lo..=hi).map(Item::Int).collect()),
            _ => Ok(Sequence::empty()),
        }
    }
}

impl fmt::Display for RangeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.lo, self.hi)
    }
}

/// Binary arithmetic; an empty operand yields the empty sequence.
#[derive(Debug)]
pub struct Arithmetic {
    /// Operator.
    pub op: ArithOp,
    /// Left operand.
    pub left: Arc<dyn Expr>,
    /// Right operand.
    pub right: Arc<dyn Expr>,
}

impl Expr for Arithmetic {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let left = self.left.evaluate_to_item(ctx, row)?;
        let right = self.right.evaluate_to_item(ctx, row)?;
        match (left, right) {
            (Some(a), Some(b)) => Ok(Sequence::singleton(self.op.apply(&a, &b)?)),
            _ => Ok(Sequence::empty()),
        }
    }
}

impl fmt::Display for Arithmetic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.left, self.op.symbol(), self.right)
    }
}

/// General or value comparison.
#[derive(Debug)]
pub struct Compare {
    /// Comparison flavour and operator.
    pub cmp: Comparison,
    /// Left operand.
    pub left: Arc<dyn Expr>,
    /// Right operand.
    pub right: Arc<dyn Expr>,
}

/// Applies a comparison to two evaluated operands; `None` is the empty result
/// of a value comparison with an empty operand.
pub(crate) fn compare(cmp: Comparison, left: &Sequence, right: &Sequence) -> Result<Option<bool>> {
    match cmp {
        Comparison::General(op) => Ok(Some(left.general_compare(op, right))),
        Comparison::Value(op) => Ok(left.value_compare(op, right)?),
    }
}

impl Expr for Compare {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let left = self.left.evaluate(ctx, row)?;
        let right = self.right.evaluate(ctx, row)?;
        Ok(compare(self.cmp, &left, &right)?
            .map(|b| Sequence::singleton(Item::Bool(b)))
            .unwrap_or_default())
    }
}

impl fmt::Display for Compare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.cmp.symbol(), self.right)
    }
}

/// Short-circuiting `and` / `or`.
#[derive(Debug)]
pub struct Logical {
    /// `true` for `and`, `false` for `or`.
    pub conjunction: bool,
    /// Left operand.
    pub left: Arc<dyn Expr>,
    /// Right operand.
    pub right: Arc<dyn Expr>,
}

impl Expr for Logical {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let left = self.left.evaluate(ctx, row)?.effective_boolean()?;
        let value = if left != self.conjunction {
            left
        } else {
            self.right.evaluate(ctx, row)?.effective_boolean()?
        };
        Ok(Sequence::singleton(Item::Bool(value)))
    }
}

impl fmt::Display for Logical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = if self.conjunction { "and" } else { "or" };
        write!(f, "({} {word} {})", self.left, self.right)
    }
}

/// `if (cond) then a else b`
#[derive(Debug)]
pub struct Conditional {
    /// Condition.
    pub cond: Arc<dyn Expr>,
    /// Branch taken when the condition holds.
    pub then: Arc<dyn Expr>,
    /// Branch taken otherwise.
    pub otherwise: Arc<dyn Expr>,
}

impl Expr for Conditional {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        if self.cond.evaluate(ctx, row)?.effective_boolean()? {
            self.then.evaluate(ctx, row)
        } else {
            self.otherwise.evaluate(ctx, row)
        }
    }
}

impl fmt::Display for Conditional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if ({}) then {} else {}", self.cond, self.then, self.otherwise)
    }
}

/// Call of a function resolved at compile time.
#[derive(Debug)]
pub struct Call {
    /// Resolved function.
    pub function: FunctionDef,
    /// Argument expressions.
    pub args: Vec<Arc<dyn Expr>>,
}

impl Expr for Call {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let args = self
            .args
            .iter()
            .map(|arg| arg.evaluate(ctx, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.function.call(&args)?)
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.function.name())?;
        for (idx, arg) in self.args.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// Nested pipeline: the concatenated return values of every row its tail
/// produces, started from the current row.
#[derive(Debug)]
pub struct Pipeline {
    /// Tail operator of the pipeline.
    pub tail: Arc<dyn Operator>,
    /// Return expression, compiled against the tail's layout.
    pub ret: Arc<dyn Expr>,
}

impl Expr for Pipeline {
    fn evaluate(&self, ctx: &QueryContext, row: &Tuple) -> Result<Sequence> {
        let mut cursor = self.tail.create(ctx, row.clone());
        let mut items = Vec::new();
        for_each_row(cursor.as_mut(), |tuple| {
            ctx.record_row();
            items.extend(self.ret.evaluate(ctx, &tuple)?.iter().cloned());
            Ok(())
        })?;
        Ok(Sequence::from_items(items))
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chain = Vec::new();
        let mut node = Some(self.tail.explain());
        while let Some(current) = node {
            chain.push(current.op.clone());
            node = current.inputs.into_iter().next();
        }
        chain.reverse();
        write!(f, "flwor[{}] return {}", chain.join(" > "), self.ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(v: i64) -> Arc<dyn Expr> {
        Arc::new(Literal(Sequence::singleton(Item::Int(v))))
    }

    #[test]
    fn arithmetic_propagates_empty_and_errors() {
        let ctx = QueryContext::new();
        let row = Tuple::empty();
        let add = Arithmetic {
            op: ArithOp::Add,
            left: lit(2),
            right: Arc::new(Literal(Sequence::empty())),
        };
        assert_eq!(add.evaluate(&ctx, &row).expect("evaluates"), Sequence::empty());
        let div = Arithmetic {
            op: ArithOp::IDiv,
            left: lit(2),
            right: lit(0),
        };
        let err = div.evaluate(&ctx, &row).expect_err("division by zero");
        assert!(matches!(err, SylvaError::Eval(EvalError::DivisionByZero)));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let ctx = QueryContext::new();
        let row = Tuple::empty();
        let failing: Arc<dyn Expr> = Arc::new(Arithmetic {
            op: ArithOp::Div,
            left: lit(1),
            right: lit(0),
        });
        let or = Logical {
            conjunction: false,
            left: lit(1),
            right: failing.clone(),
        };
        assert_eq!(
            or.evaluate(&ctx, &row).expect("short circuit"),
            Sequence::singleton(Item::Bool(true))
        );
        let and = Logical {
            conjunction: true,
            left: lit(0),
            right: failing,
        };
        assert_eq!(
            and.evaluate(&ctx, &row).expect("short circuit"),
            Sequence::singleton(Item::Bool(false))
        );
    }

    #[test]
    fn variable_references_read_their_slot() {
        let ctx = QueryContext::new();
        let row = Tuple::from_values([Sequence::empty(), Sequence::singleton(Item::Int(4))]);
        let reference = VarRef::new(Var::from("x"), 1);
        assert_eq!(reference.to_string(), "$x");
        assert_eq!(
            reference.evaluate(&ctx, &row).expect("bound"),
            Sequence::singleton(Item::Int(4))
        );
        assert!(VarRef::new(Var::from("y"), 5).evaluate(&ctx, &row).is_err());
    }

    #[test]
    fn ranges_are_inclusive() {
        let ctx = QueryContext::new();
        let range = RangeExpr { lo: lit(2), hi: lit(4) };
        assert_eq!(
            range.evaluate(&ctx, &Tuple::empty()).expect("evaluates").len(),
            3
        );
        let backwards = RangeExpr { lo: lit(4), hi: lit(2) };
        assert!(backwards.evaluate(&ctx, &Tuple::empty()).expect("evaluates").is_empty());
    }
}
