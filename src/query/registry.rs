//! Function resolution for the compiler.
//!
//! The registry is an immutable value handed to the compiler by reference;
//! calls are resolved to their implementation once, at compile time, so
//! evaluation never consults it.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::query::errors::EvalError;
use crate::query::rewrite::strip_fn_prefix;
use crate::query::value::{HashKey, Item, Sequence};

/// Native implementation of a function.
pub type FunctionImpl =
    Arc<dyn Fn(&[Sequence]) -> std::result::Result<Sequence, EvalError> + Send + Sync>;

/// A named function accepting `min_arity..=max_arity` arguments.
#[derive(Clone)]
pub struct FunctionDef {
    name: String,
    min_arity: usize,
    max_arity: usize,
    imp: FunctionImpl,
}

impl FunctionDef {
    /// Function name without the `fn:` prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the function accepts `arity` arguments.
    pub fn accepts(&self, arity: usize) -> bool {
        (self.min_arity..=self.max_arity).contains(&arity)
    }

    /// Applies the function to evaluated arguments.
    pub fn call(&self, args: &[Sequence]) -> std::result::Result<Sequence, EvalError> {
        (self.imp)(args)
    }
}

impl fmt::Debug for FunctionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}..{}", self.name, self.min_arity, self.max_arity)
    }
}

/// Name-to-implementation table consulted by the compiler.
#[derive(Clone, Debug, Default)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, Vec<FunctionDef>>,
}

impl FunctionRegistry {
    /// Registry without any function.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the builtin function library.
    pub fn builtins() -> Self {
        Self::empty()
            .with_native("count", 1, 1, fn_count)
            .with_native("sum", 1, 2, fn_sum)
            .with_native("min", 1, 1, |args| fn_extreme(args, "min", std::cmp::Ordering::Less))
            .with_native("max", 1, 1, |args| fn_extreme(args, "max", std::cmp::Ordering::Greater))
            .with_native("empty", 1, 1, |args| Ok(boolean(first(args).is_empty())))
            .with_native("exists", 1, 1, |args| Ok(boolean(!first(args).is_empty())))
            .with_native("not", 1, 1, |args| Ok(boolean(!first(args).effective_boolean()?)))
            .with_native("boolean", 1, 1, |args| Ok(boolean(first(args).effective_boolean()?)))
            .with_native("distinct-values", 1, 1, fn_distinct)
            .with_native("distinct", 1, 1, fn_distinct)
            .with_native("reverse", 1, 1, |args| {
                Ok(first(args).iter().rev().cloned().collect())
            })
            .with_native("string-join", 1, 2, fn_string_join)
            .with_native("substring", 2, 3, fn_substring)
    }

    fn with_native(
        self,
        name: &str,
        min_arity: usize,
        max_arity: usize,
        imp: impl Fn(&[Sequence]) -> std::result::Result<Sequence, EvalError> + Send + Sync + 'static,
    ) -> Self {
        self.with_function(name, min_arity..=max_arity, imp)
    }

    /// Registers `name` for the given arity range; a later registration
    /// overlapping an earlier one takes precedence.
    pub fn with_function(
        mut self,
        name: impl AsRef<str>,
        arity: std::ops::RangeInclusive<usize>,
        imp: impl Fn(&[Sequence]) -> std::result::Result<Sequence, EvalError> + Send + Sync + 'static,
    ) -> Self {
        let name = strip_fn_prefix(name.as_ref()).to_owned();
        let def = FunctionDef {
            name: name.clone(),
            min_arity: *arity.start(),
            max_arity: *arity.end(),
            imp: Arc::new(imp),
        };
        self.functions.entry(name).or_default().push(def);
        self
    }

    /// Resolves `name` (with or without the `fn:` prefix) at `arity`.
    pub fn resolve(&self, name: &str, arity: usize) -> std::result::Result<FunctionDef, EvalError> {
        self.functions
            .get(strip_fn_prefix(name))
            .and_then(|defs| defs.iter().rev().find(|def| def.accepts(arity)))
            .cloned()
            .ok_or_else(|| EvalError::UnknownFunction {
                name: name.to_owned(),
                arity,
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn first(args: &[Sequence]) -> Sequence {
    args.first().cloned().unwrap_or_default()
}

fn boolean(value: bool) -> Sequence {
    Sequence::singleton(Item::Bool(value))
}

fn fn_count(args: &[Sequence]) -> std::result::Result<Sequence, EvalError> {
    let len = i64::try_from(first(args).len()).map_err(|_| EvalError::Overflow { context: "count" })?;
    Ok(Sequence::singleton(Item::Int(len)))
}

fn fn_sum(args: &[Sequence]) -> std::result::Result<Sequence, EvalError> {
    let values = first(args);
    let mut items = values.iter();
    let Some(head) = items.next() else {
        return Ok(args.get(1).cloned().unwrap_or_else(|| Sequence::singleton(Item::Int(0))));
    };
    if head.as_f64().is_none() {
        return Err(EvalError::type_mismatch("sum", head.type_name()));
    }
    let mut total = head.clone();
    for item in items {
        if item.as_f64().is_none() {
            return Err(EvalError::type_mismatch("sum", item.type_name()));
        }
        total = crate::query::value::ArithOp::Add.apply(&total, item)?;
    }
    Ok(Sequence::singleton(total))
}

fn fn_extreme(
    args: &[Sequence],
    function: &'static str,
    wanted: std::cmp::Ordering,
) -> std::result::Result<Sequence, EvalError> {
    let values = first(args);
    let mut best: Option<&Item> = None;
    for item in values.iter() {
        if item.is_nan() {
            return Ok(Sequence::singleton(item.clone()));
        }
        best = match best {
            None => Some(item),
            Some(current) => {
                let ordering = item
                    .atomic_cmp(current)
                    .map_err(|err| EvalError::invalid_argument(function, err.to_string()))?;
                Some(if ordering == wanted { item } else { current })
            }
        };
    }
    Ok(best.cloned().map(Sequence::singleton).unwrap_or_default())
}

fn fn_distinct(args: &[Sequence]) -> std::result::Result<Sequence, EvalError> {
    let mut seen: HashSet<HashKey> = HashSet::new();
    let mut seen_nan = false;
    let mut out = Vec::new();
    for item in first(args).iter() {
        let fresh = match item.hash_key() {
            Some(key) => seen.insert(key),
            None => !std::mem::replace(&mut seen_nan, true),
        };
        if fresh {
            out.push(item.clone());
        }
    }
    Ok(Sequence::from_items(out))
}

fn fn_string_join(args: &[Sequence]) -> std::result::Result<Sequence, EvalError> {
    let separator = match args.get(1) {
        Some(sep) => sep
            .singleton_item("string-join")?
            .map(ToString::to_string)
            .unwrap_or_default(),
        None => String::new(),
    };
    let joined = first(args)
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(&separator);
    Ok(Sequence::singleton(Item::Str(joined)))
}

/// Rounds half towards positive infinity.
fn round(value: f64) -> f64 {
    if value.is_finite() {
        (value + 0.5).floor()
    } else {
        value
    }
}

fn numeric_argument(args: &[Sequence], idx: usize) -> std::result::Result<Option<f64>, EvalError> {
    let Some(arg) = args.get(idx) else {
        return Ok(None);
    };
    match arg.singleton_item("substring")? {
        Some(item) => item
            .as_f64()
            .map(|v| Some(round(v)))
            .ok_or_else(|| EvalError::invalid_argument("substring", format!("{} position", item.type_name()))),
        None => Err(EvalError::invalid_argument("substring", "empty position")),
    }
}

fn fn_substring(args: &[Sequence]) -> std::result::Result<Sequence, EvalError> {
    let text = match first(args).singleton_item("substring")? {
        Some(Item::Str(s)) => s.clone(),
        Some(other) => return Err(EvalError::type_mismatch("substring", other.type_name())),
        None => return Ok(Sequence::singleton(Item::Str(String::new()))),
    };
    let chars: Vec<char> = text.chars().collect();
    let char_len = chars.len() as f64;
    let start = numeric_argument(args, 1)?.unwrap_or(f64::NAN);
    let length = numeric_argument(args, 2)?.unwrap_or(char_len);
    let empty = Sequence::singleton(Item::Str(String::new()));
    if start.is_nan()
        || length.is_nan()
        || (start == f64::NEG_INFINITY && length == f64::INFINITY)
    {
        return Ok(empty);
    }
    let from = start.max(1.0) - 1.0;
    let to = (start + length - 1.0).min(char_len);
    if to <= from {
        return Ok(empty);
    }
    let (from, to) = (from as usize, to as usize);
    Ok(Sequence::singleton(Item::Str(chars[from..to].iter().collect())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(registry: &FunctionRegistry, name: &str, args: &[Sequence]) -> Sequence {
        registry
            .resolve(name, args.len())
            .expect("resolves")
            .call(args)
            .expect("evaluates")
    }

    fn ints(values: &[i64]) -> Sequence {
        values.iter().copied().map(Item::Int).collect()
    }

    fn text(s: &str) -> Sequence {
        Sequence::singleton(Item::from(s))
    }

    #[test]
    fn resolution_ignores_prefix_and_checks_arity() {
        let registry = FunctionRegistry::builtins();
        assert!(registry.resolve("fn:count", 1).is_ok());
        let err = registry.resolve("count", 2).expect_err("wrong arity");
        assert_eq!(err.code(), "XPST0017");
        assert!(registry.resolve("nope", 0).is_err());
    }

    #[test]
    fn later_registrations_take_precedence() {
        let registry = FunctionRegistry::builtins()
            .with_function("count", 1..=1, |_| Ok(Sequence::singleton(Item::Int(-1))));
        assert_eq!(call(&registry, "count", &[ints(&[1, 2])]), ints(&[-1]));
    }

    #[test]
    fn aggregates() {
        let registry = FunctionRegistry::builtins();
        assert_eq!(call(&registry, "count", &[ints(&[4, 5, 6])]), ints(&[3]));
        assert_eq!(call(&registry, "sum", &[ints(&[1, 2, 3])]), ints(&[6]));
        assert_eq!(call(&registry, "sum", &[Sequence::empty()]), ints(&[0]));
        assert_eq!(call(&registry, "max", &[ints(&[3, 9, 2])]), ints(&[9]));
        assert_eq!(call(&registry, "min", &[Sequence::empty()]), Sequence::empty());
        assert_eq!(
            call(&registry, "distinct-values", &[ints(&[1, 2, 1, 3, 2])]),
            ints(&[1, 2, 3])
        );
        assert_eq!(call(&registry, "reverse", &[ints(&[1, 2])]), ints(&[2, 1]));
    }

    #[test]
    fn sum_rejects_strings() {
        let registry = FunctionRegistry::builtins();
        let err = registry
            .resolve("sum", 1)
            .expect("resolves")
            .call(&[text("a")])
            .expect_err("strings do not sum");
        assert_eq!(err.code(), "XPTY0004");
    }

    #[test]
    fn substring_rounds_and_clamps() {
        let registry = FunctionRegistry::builtins();
        let s = text("motor car");
        assert_eq!(call(&registry, "substring", &[s.clone(), ints(&[6])]), text(" car"));
        assert_eq!(
            call(&registry, "substring", &[s.clone(), ints(&[0]), ints(&[3])]),
            text("mo")
        );
        let half = Sequence::singleton(Item::Dbl(1.5));
        assert_eq!(
            call(&registry, "substring", &[text("12345"), half, Sequence::singleton(Item::Dbl(2.6))]),
            text("234")
        );
        let nan = Sequence::singleton(Item::Dbl(f64::NAN));
        assert_eq!(call(&registry, "substring", &[s, nan]), text(""));
        assert_eq!(
            call(&registry, "substring", &[Sequence::empty(), ints(&[1])]),
            text("")
        );
    }

    #[test]
    fn string_join_uses_separator() {
        let registry = FunctionRegistry::builtins();
        assert_eq!(
            call(&registry, "string-join", &[ints(&[1, 2, 3]), text("-")]),
            text("1-2-3")
        );
    }
}
