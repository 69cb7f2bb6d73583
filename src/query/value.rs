//! Atomic items, sequences and the comparison/arithmetic rules shared by the
//! expression evaluator and the join operators.
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::query::errors::EvalError;

/// Atomic item flowing through sequences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Item {
    /// Boolean item.
    Bool(bool),
    /// Signed 64-bit integer item.
    Int(i64),
    /// 64-bit floating point item.
    Dbl(f64),
    /// UTF-8 string item.
    Str(String),
}

/// Comparison operator shared by general and value comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl CmpOp {
    /// Operator that holds for `b op' a` whenever `a op b` holds.
    pub fn mirror(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    /// Whether an ordering of `left` relative to `right` satisfies the operator.
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Comparison flavour: existential over sequences, or strictly between singletons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    /// `=`, `!=`, `<`, ... : true if any pair of items satisfies the operator.
    General(CmpOp),
    /// `eq`, `ne`, `lt`, ... : singleton operands, type errors on mismatch.
    Value(CmpOp),
}

impl Comparison {
    /// Underlying operator.
    pub fn op(self) -> CmpOp {
        match self {
            Comparison::General(op) | Comparison::Value(op) => op,
        }
    }

    /// Same comparison with swapped operands.
    pub fn mirror(self) -> Self {
        match self {
            Comparison::General(op) => Comparison::General(op.mirror()),
            Comparison::Value(op) => Comparison::Value(op.mirror()),
        }
    }

    /// Surface syntax of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::General(op) => match op {
                CmpOp::Eq => "=",
                CmpOp::Ne => "!=",
                CmpOp::Lt => "<",
                CmpOp::Le => "<=",
                CmpOp::Gt => ">",
                CmpOp::Ge => ">=",
            },
            Comparison::Value(op) => match op {
                CmpOp::Eq => "eq",
                CmpOp::Ne => "ne",
                CmpOp::Lt => "lt",
                CmpOp::Le => "le",
                CmpOp::Gt => "gt",
                CmpOp::Ge => "ge",
            },
        }
    }
}

/// Binary arithmetic operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `div`
    Div,
    /// `idiv`
    IDiv,
    /// `mod`
    Mod,
}

impl ArithOp {
    /// Surface syntax of the operator.
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "div",
            ArithOp::IDiv => "idiv",
            ArithOp::Mod => "mod",
        }
    }

    /// Applies the operator to two atomic operands.
    pub fn apply(self, left: &Item, right: &Item) -> Result<Item, EvalError> {
        match (left, right) {
            (Item::Int(a), Item::Int(b)) => int_arith(self, *a, *b),
            (Item::Int(_) | Item::Dbl(_), Item::Int(_) | Item::Dbl(_)) => {
                let (a, b) = (left.as_f64().unwrap_or(f64::NAN), right.as_f64().unwrap_or(f64::NAN));
                dbl_arith(self, a, b)
            }
            _ => Err(EvalError::type_mismatch(
                "arithmetic",
                format!("{} {} {}", left.type_name(), self.symbol(), right.type_name()),
            )),
        }
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<Item, EvalError> {
    let overflow = || EvalError::Overflow {
        context: op.symbol(),
    };
    match op {
        ArithOp::Add => a.checked_add(b).map(Item::Int).ok_or_else(overflow),
        ArithOp::Sub => a.checked_sub(b).map(Item::Int).ok_or_else(overflow),
        ArithOp::Mul => a.checked_mul(b).map(Item::Int).ok_or_else(overflow),
        ArithOp::Div => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            match a.checked_rem(b) {
                Some(0) => a.checked_div(b).map(Item::Int).ok_or_else(overflow),
                Some(_) => Ok(Item::Dbl(a as f64 / b as f64)),
                None => Err(overflow()),
            }
        }
        ArithOp::IDiv => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            a.checked_div(b).map(Item::Int).ok_or_else(overflow)
        }
        ArithOp::Mod => {
            if b == 0 {
                return Err(EvalError::DivisionByZero);
            }
            a.checked_rem(b).map(Item::Int).ok_or_else(overflow)
        }
    }
}

fn dbl_arith(op: ArithOp, a: f64, b: f64) -> Result<Item, EvalError> {
    match op {
        ArithOp::Add => Ok(Item::Dbl(a + b)),
        ArithOp::Sub => Ok(Item::Dbl(a - b)),
        ArithOp::Mul => Ok(Item::Dbl(a * b)),
        ArithOp::Div => Ok(Item::Dbl(a / b)),
        ArithOp::Mod => Ok(Item::Dbl(a % b)),
        ArithOp::IDiv => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            let q = (a / b).trunc();
            if !q.is_finite() || q < i64::MIN as f64 || q > i64::MAX as f64 {
                return Err(EvalError::Overflow { context: "idiv" });
            }
            Ok(Item::Int(q as i64))
        }
    }
}

/// Hashable image of an item; numerically equal items share a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum HashKey {
    Bool(bool),
    Int(i64),
    Dbl(u64),
    Str(String),
}

impl Item {
    /// Name of the item's type for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Item::Bool(_) => "xs:boolean",
            Item::Int(_) => "xs:integer",
            Item::Dbl(_) => "xs:double",
            Item::Str(_) => "xs:string",
        }
    }

    /// Numeric value as a double, if the item is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Item::Int(v) => Some(*v as f64),
            Item::Dbl(v) => Some(*v),
            _ => None,
        }
    }

    fn class(&self) -> u8 {
        match self {
            Item::Bool(_) => 0,
            Item::Int(_) | Item::Dbl(_) => 1,
            Item::Str(_) => 2,
        }
    }

    /// Whether the two items belong to a mutually comparable type family.
    pub fn comparable(&self, other: &Item) -> bool {
        self.class() == other.class()
    }

    /// Orders two comparable items; NaN sorts below every other number.
    pub fn atomic_cmp(&self, other: &Item) -> Result<Ordering, EvalError> {
        if !self.comparable(other) {
            return Err(EvalError::type_mismatch(
                "comparison",
                format!("{} vs {}", self.type_name(), other.type_name()),
            ));
        }
        Ok(self.sort_cmp(other))
    }

    /// Equality of two comparable items; NaN equals nothing.
    pub fn atomic_eq(&self, other: &Item) -> Result<bool, EvalError> {
        Ok(self.compare(CmpOp::Eq, other)?.unwrap_or(false))
    }

    /// Evaluates `self op other`. `Ok(None)` means unordered (NaN operand).
    pub fn compare(&self, op: CmpOp, other: &Item) -> Result<Option<bool>, EvalError> {
        if !self.comparable(other) {
            return Err(EvalError::type_mismatch(
                "comparison",
                format!("{} vs {}", self.type_name(), other.type_name()),
            ));
        }
        let ordering = match (self, other) {
            (Item::Int(a), Item::Int(b)) => Some(a.cmp(b)),
            (Item::Bool(a), Item::Bool(b)) => Some(a.cmp(b)),
            (Item::Str(a), Item::Str(b)) => Some(a.cmp(b)),
            _ => numeric_cmp(self, other),
        };
        Ok(match ordering {
            Some(ordering) => Some(op.holds(ordering)),
            None if op == CmpOp::Ne => Some(true),
            None => None,
        })
    }

    /// Total order used for sorting: booleans, then numbers, then strings.
    pub fn sort_cmp(&self, other: &Item) -> Ordering {
        match (self, other) {
            (Item::Int(a), Item::Int(b)) => a.cmp(b),
            (Item::Bool(a), Item::Bool(b)) => a.cmp(b),
            (Item::Str(a), Item::Str(b)) => a.cmp(b),
            (Item::Int(_) | Item::Dbl(_), Item::Int(_) | Item::Dbl(_)) => {
                match (self.is_nan(), other.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => numeric_cmp(self, other).unwrap_or(Ordering::Equal),
                }
            }
            _ => self.class().cmp(&other.class()),
        }
    }

    pub(crate) fn is_nan(&self) -> bool {
        matches!(self, Item::Dbl(v) if v.is_nan())
    }

    /// Key for hash-based equality; `None` for NaN, which equals nothing.
    pub(crate) fn hash_key(&self) -> Option<HashKey> {
        match self {
            Item::Bool(v) => Some(HashKey::Bool(*v)),
            Item::Int(v) => Some(HashKey::Int(*v)),
            Item::Str(v) => Some(HashKey::Str(v.clone())),
            Item::Dbl(v) if v.is_nan() => None,
            Item::Dbl(v) => {
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 {
                    Some(HashKey::Int(*v as i64))
                } else {
                    Some(HashKey::Dbl(v.to_bits()))
                }
            }
        }
    }
}

/// Exact order of two numbers; `None` when either is NaN or not numeric.
fn numeric_cmp(a: &Item, b: &Item) -> Option<Ordering> {
    match (a, b) {
        (Item::Int(a), Item::Int(b)) => Some(a.cmp(b)),
        (Item::Dbl(a), Item::Dbl(b)) => a.partial_cmp(b),
        (Item::Int(i), Item::Dbl(d)) => int_dbl_cmp(*i, *d),
        (Item::Dbl(d), Item::Int(i)) => int_dbl_cmp(*i, *d).map(Ordering::reverse),
        _ => None,
    }
}

/// Compares without rounding the integer to a double, so integers above
/// 2^53 stay distinct from their nearest double.
fn int_dbl_cmp(i: i64, d: f64) -> Option<Ordering> {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if d.is_nan() {
        return None;
    }
    if d >= TWO_POW_63 {
        return Some(Ordering::Less);
    }
    if d < -TWO_POW_63 {
        return Some(Ordering::Greater);
    }
    match i.cmp(&(d.trunc() as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&d.fract()),
        ordering => Some(ordering),
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Item::Bool(v) => write!(f, "{v}"),
            Item::Int(v) => write!(f, "{v}"),
            Item::Dbl(v) if v.is_nan() => write!(f, "NaN"),
            Item::Dbl(v) => write!(f, "{v}"),
            Item::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for Item {
    fn from(value: i64) -> Self {
        Item::Int(value)
    }
}

impl From<f64> for Item {
    fn from(value: f64) -> Self {
        Item::Dbl(value)
    }
}

impl From<bool> for Item {
    fn from(value: bool) -> Self {
        Item::Bool(value)
    }
}

impl From<&str> for Item {
    fn from(value: &str) -> Self {
        Item::Str(value.to_owned())
    }
}

impl From<String> for Item {
    fn from(value: String) -> Self {
        Item::Str(value)
    }
}

/// Immutable, cheaply clonable sequence of items.
#[derive(Clone, PartialEq)]
pub struct Sequence {
    items: Arc<[Item]>,
}

impl Sequence {
    /// The empty sequence.
    pub fn empty() -> Self {
        Self {
            items: Arc::from(Vec::new()),
        }
    }

    /// Sequence holding exactly one item.
    pub fn singleton(item: Item) -> Self {
        Self {
            items: Arc::from(vec![item]),
        }
    }

    /// Sequence over the supplied items.
    pub fn from_items(items: Vec<Item>) -> Self {
        Self {
            items: Arc::from(items),
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items in order.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Iterates the items in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    /// The single item of a singleton, `None` when empty.
    pub fn singleton_item(&self, context: &'static str) -> Result<Option<&Item>, EvalError> {
        match self.items.len() {
            0 => Ok(None),
            1 => Ok(self.items.first()),
            len => Err(EvalError::NotSingleton { context, len }),
        }
    }

    /// Effective boolean value.
    pub fn effective_boolean(&self) -> Result<bool, EvalError> {
        match self.items() {
            [] => Ok(false),
            [Item::Bool(v)] => Ok(*v),
            [Item::Int(v)] => Ok(*v != 0),
            [Item::Dbl(v)] => Ok(*v != 0.0 && !v.is_nan()),
            [Item::Str(v)] => Ok(!v.is_empty()),
            items => Err(EvalError::InvalidBooleanValue {
                detail: format!("a sequence of {} atomic items", items.len()),
            }),
        }
    }

    /// Existential comparison: true if any comparable pair satisfies `op`.
    ///
    /// Pairs of incomparable types never match.
    pub fn general_compare(&self, op: CmpOp, other: &Sequence) -> bool {
        self.iter().any(|a| {
            other
                .iter()
                .any(|b| matches!(a.compare(op, b), Ok(Some(true))))
        })
    }

    /// Comparison between singletons; empty operands yield `None`.
    pub fn value_compare(&self, op: CmpOp, other: &Sequence) -> Result<Option<bool>, EvalError> {
        let left = self.singleton_item("value comparison")?;
        let right = other.singleton_item("value comparison")?;
        match (left, right) {
            (Some(a), Some(b)) => Ok(Some(a.compare(op, b)?.unwrap_or(false))),
            _ => Ok(None),
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<Item> for Sequence {
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        Self::from_items(iter.into_iter().collect())
    }
}

impl From<Item> for Sequence {
    fn from(item: Item) -> Self {
        Sequence::singleton(item)
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, item) in self.items.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            match item {
                Item::Str(s) => write!(f, "\"{s}\"")?,
                other => write!(f, "{other}")?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Sequence {
        values.iter().copied().map(Item::Int).collect()
    }

    #[test]
    fn general_comparison_is_existential() {
        assert!(ints(&[1, 2, 3]).general_compare(CmpOp::Eq, &ints(&[3, 4])));
        assert!(!ints(&[1, 2]).general_compare(CmpOp::Eq, &ints(&[3, 4])));
        assert!(!Sequence::empty().general_compare(CmpOp::Ne, &ints(&[1])));
    }

    #[test]
    fn incomparable_general_pairs_do_not_match() {
        let strings: Sequence = vec![Item::from("1")].into_iter().collect();
        assert!(!strings.general_compare(CmpOp::Eq, &ints(&[1])));
    }

    #[test]
    fn value_comparison_rejects_type_mismatch() {
        let strings = Sequence::singleton(Item::from("a"));
        let err = strings
            .value_compare(CmpOp::Eq, &ints(&[1]))
            .expect_err("string eq integer");
        assert_eq!(err.code(), "XPTY0004");
        assert_eq!(
            Sequence::empty().value_compare(CmpOp::Eq, &ints(&[1])),
            Ok(None)
        );
    }

    #[test]
    fn numeric_promotion_and_hash_keys_agree() {
        assert_eq!(Item::Int(2).atomic_eq(&Item::Dbl(2.0)), Ok(true));
        assert_eq!(Item::Int(2).hash_key(), Item::Dbl(2.0).hash_key());
        assert_eq!(Item::Dbl(f64::NAN).hash_key(), None);
        assert_eq!(Item::Dbl(f64::NAN).atomic_eq(&Item::Dbl(f64::NAN)), Ok(false));
    }

    #[test]
    fn arithmetic_follows_integer_and_double_rules() {
        assert_eq!(ArithOp::Add.apply(&Item::Int(2), &Item::Int(3)), Ok(Item::Int(5)));
        assert_eq!(ArithOp::Div.apply(&Item::Int(7), &Item::Int(2)), Ok(Item::Dbl(3.5)));
        assert_eq!(ArithOp::IDiv.apply(&Item::Int(7), &Item::Int(2)), Ok(Item::Int(3)));
        assert_eq!(
            ArithOp::Mod.apply(&Item::Int(1), &Item::Int(0)),
            Err(EvalError::DivisionByZero)
        );
        assert!(matches!(
            ArithOp::Add.apply(&Item::Int(i64::MAX), &Item::Int(1)),
            Err(EvalError::Overflow { .. })
        ));
    }

    #[test]
    fn effective_boolean_value_rules() {
        assert_eq!(Sequence::empty().effective_boolean(), Ok(false));
        assert_eq!(Sequence::singleton(Item::from("")).effective_boolean(), Ok(false));
        assert_eq!(Sequence::singleton(Item::Int(3)).effective_boolean(), Ok(true));
        assert!(ints(&[1, 2]).effective_boolean().is_err());
    }

    #[test]
    fn sort_order_places_nan_first() {
        let mut items = vec![Item::Dbl(1.5), Item::Dbl(f64::NAN), Item::Int(1)];
        items.sort_by(|a, b| a.sort_cmp(b));
        assert!(items[0].is_nan());
        assert_eq!(items[1], Item::Int(1));
    }

    #[test]
    fn large_integers_compare_exactly_against_doubles() {
        let big = Item::Int((1 << 53) + 1);
        let near = Item::Dbl(9_007_199_254_740_992.0);
        assert_eq!(big.compare(CmpOp::Eq, &near), Ok(Some(false)));
        assert_eq!(big.compare(CmpOp::Gt, &near), Ok(Some(true)));
        assert_ne!(big.hash_key(), near.hash_key());
        assert_eq!(near.sort_cmp(&big), Ordering::Less);

        let exact = Item::Int(1 << 53);
        assert_eq!(exact.compare(CmpOp::Eq, &near), Ok(Some(true)));
        assert_eq!(exact.hash_key(), near.hash_key());
        assert_eq!(Item::Int(2).compare(CmpOp::Lt, &Item::Dbl(2.5)), Ok(Some(true)));
        assert_eq!(Item::Int(-3).compare(CmpOp::Gt, &Item::Dbl(-3.5)), Ok(Some(true)));
        assert_eq!(Item::Int(i64::MAX).compare(CmpOp::Lt, &Item::Dbl(f64::INFINITY)), Ok(Some(true)));
    }
}
