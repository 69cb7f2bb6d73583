//! Rows flowing between operators and the compile-time layout describing them.

use std::fmt;
use std::sync::Arc;

use crate::query::ast::Var;
use crate::query::value::Sequence;

struct Slot {
    value: Sequence,
    prev: Option<Arc<Slot>>,
}

/// Immutable positional row.
///
/// Appending shares the existing prefix, so extending a row inside a loop
/// never copies the bindings made upstream.
#[derive(Clone, Default)]
pub struct Tuple {
    last: Option<Arc<Slot>>,
    len: usize,
}

impl Tuple {
    /// Row without bindings.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Row holding `values` in order.
    pub fn from_values(values: impl IntoIterator<Item = Sequence>) -> Self {
        Self::empty().extend(values)
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the row has no slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// New row with `value` appended.
    pub fn append(&self, value: Sequence) -> Tuple {
        Tuple {
            last: Some(Arc::new(Slot {
                value,
                prev: self.last.clone(),
            })),
            len: self.len + 1,
        }
    }

    /// New row with every value appended in order.
    pub fn extend(&self, values: impl IntoIterator<Item = Sequence>) -> Tuple {
        values
            .into_iter()
            .fold(self.clone(), |row, value| row.append(value))
    }

    fn slot(&self, idx: usize) -> Option<&Slot> {
        if idx >= self.len {
            return None;
        }
        let mut node = self.last.as_deref();
        for _ in 0..(self.len - 1 - idx) {
            node = node?.prev.as_deref();
        }
        node
    }

    /// Value at `idx`.
    pub fn get(&self, idx: usize) -> Option<&Sequence> {
        self.slot(idx).map(|slot| &slot.value)
    }

    /// The first `len` slots; shares storage with `self`.
    pub fn prefix(&self, len: usize) -> Tuple {
        if len >= self.len {
            return self.clone();
        }
        let mut node = self.last.clone();
        for _ in 0..(self.len - len) {
            node = node.and_then(|slot| slot.prev.clone());
        }
        Tuple { last: node, len }
    }

    /// Values in slot order.
    pub fn values(&self) -> Vec<Sequence> {
        let mut out = Vec::with_capacity(self.len);
        let mut node = self.last.as_deref();
        while let Some(slot) = node {
            out.push(slot.value.clone());
            node = slot.prev.as_deref();
        }
        out.reverse();
        out
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.values() == other.values()
    }
}

impl fmt::Debug for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.values()).finish()
    }
}

/// Variable names of a row's slots.
///
/// The first `ctx_len` slots are the row handed to the pipeline by its
/// enclosing scope; a pipeline's operators only ever rearrange the slots
/// after them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    vars: Vec<Var>,
    ctx_len: usize,
}

impl Layout {
    /// Layout made only of context slots.
    pub fn context(vars: Vec<Var>) -> Self {
        let ctx_len = vars.len();
        Self { vars, ctx_len }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the layout has no slots.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Number of context slots.
    pub fn ctx_len(&self) -> usize {
        self.ctx_len
    }

    /// Slot names in order.
    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    /// Slot of the latest binding of `var`.
    pub fn slot(&self, var: &Var) -> Option<usize> {
        self.vars.iter().rposition(|v| v == var)
    }

    /// Layout with `var` appended.
    pub fn push(&mut self, var: Var) {
        self.vars.push(var);
    }

    /// Pipeline-local slots (everything after the context).
    pub fn locals(&self) -> &[Var] {
        &self.vars[self.ctx_len.min(self.vars.len())..]
    }

    /// Context slots followed by the given local slots, in order.
    pub fn select(&self, keep: &[usize]) -> Layout {
        let mut vars = self.vars[..self.ctx_len].to_vec();
        vars.extend(keep.iter().filter_map(|idx| self.vars.get(*idx).cloned()));
        Layout {
            vars,
            ctx_len: self.ctx_len,
        }
    }

    /// Layout of this pipeline's context followed by `locals`.
    pub fn with_locals(&self, locals: impl IntoIterator<Item = Var>) -> Layout {
        let mut vars = self.vars[..self.ctx_len].to_vec();
        vars.extend(locals);
        Layout {
            vars,
            ctx_len: self.ctx_len,
        }
    }
}
