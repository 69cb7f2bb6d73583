//! Pull-based operators.
//!
//! An [`Operator`] is an immutable template shared behind an `Arc`; calling
//! [`Operator::create`] yields a [`Cursor`] holding all mutable state of one
//! run. Cursors follow the open → next* → close protocol, enforced by the
//! [`Lifecycle`] wrapper every `create` returns: `next` before `open` or after
//! `close` is a [`SylvaError::Cursor`] error, and `close` may be called at any
//! point, any number of times.
//!
//! Input cursors are created lazily in `open`, so a cursor that is never
//! opened owns nothing that needs closing.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::debug;

use crate::query::ast::{SortOrder, Var};
use crate::query::compiler::{ExplainNode, ExplainProp};
use crate::query::context::QueryContext;
use crate::query::expr::{compare, Expr};
use crate::query::tuple::Tuple;
use crate::query::value::{CmpOp, Comparison, HashKey, Item, Sequence};
use crate::types::{Result, SylvaError};

/// Stateful iteration over the rows of one operator run.
pub trait Cursor {
    /// Prepares the cursor; buffering operators consume their input here.
    fn open(&mut self) -> Result<()>;
    /// Next row, `None` once exhausted.
    fn next(&mut self) -> Result<Option<Tuple>>;
    /// Releases the cursor and every input cursor it created.
    fn close(&mut self) -> Result<()>;
}

/// Immutable operator template.
pub trait Operator: fmt::Debug + Send + Sync {
    /// Operator name used in explain output.
    fn name(&self) -> &'static str;

    /// Raw cursor over the rows produced for the context row `row`.
    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a>;

    /// Explain subtree rooted at this operator.
    fn explain(&self) -> ExplainNode;

    /// Protocol-checked cursor over the rows produced for `row`.
    fn create<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(Lifecycle::new(self.name(), self.cursor(ctx, row)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Created,
    Open,
    Closed,
}

/// Enforces the cursor protocol around another cursor.
pub struct Lifecycle<'a> {
    op: &'static str,
    inner: Box<dyn Cursor + 'a>,
    state: State,
}

impl<'a> Lifecycle<'a> {
    /// Wraps `inner`, produced by operator `op`.
    pub fn new(op: &'static str, inner: Box<dyn Cursor + 'a>) -> Self {
        Self {
            op,
            inner,
            state: State::Created,
        }
    }
}

impl Cursor for Lifecycle<'_> {
    fn open(&mut self) -> Result<()> {
        match self.state {
            // Marked open first so a failed open is still closed through `inner`.
            State::Created => {
                self.state = State::Open;
                self.inner.open()
            }
            State::Open => Err(SylvaError::Cursor("open called twice")),
            State::Closed => Err(SylvaError::Cursor("open after close")),
        }
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        match self.state {
            State::Open => self.inner.next(),
            State::Created => Err(SylvaError::Cursor("next before open")),
            State::Closed => Err(SylvaError::Cursor("next after close")),
        }
    }

    fn close(&mut self) -> Result<()> {
        let previous = std::mem::replace(&mut self.state, State::Closed);
        if previous == State::Open {
            debug!(op = self.op, "execute.cursor.close");
            return self.inner.close();
        }
        Ok(())
    }
}

/// Opens `cursor`, feeds every row to `each`, and closes it on every path.
///
/// The first error wins; a close failure only surfaces when everything else
/// succeeded.
pub fn for_each_row(
    cursor: &mut dyn Cursor,
    mut each: impl FnMut(Tuple) -> Result<()>,
) -> Result<()> {
    let mut pull = || -> Result<()> {
        cursor.open()?;
        while let Some(row) = cursor.next()? {
            each(row)?;
        }
        Ok(())
    };
    let pulled = pull();
    let closed = cursor.close();
    pulled.and(closed)
}

/// Input cursor of a single-input operator, created on `open`.
struct Upstream<'a> {
    op: &'a dyn Operator,
    ctx: &'a QueryContext,
    row: Tuple,
    cursor: Option<Box<dyn Cursor + 'a>>,
}

impl<'a> Upstream<'a> {
    fn new(op: &'a Arc<dyn Operator>, ctx: &'a QueryContext, row: Tuple) -> Self {
        Self {
            op: op.as_ref(),
            ctx,
            row,
            cursor: None,
        }
    }

    fn open(&mut self) -> Result<()> {
        let cursor = self
            .cursor
            .insert(self.op.create(self.ctx, self.row.clone()));
        cursor.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.next(),
            None => Err(SylvaError::Cursor("input read before open")),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(mut cursor) => cursor.close(),
            None => Ok(()),
        }
    }

    /// Opens, reads to exhaustion and closes the input.
    fn drain(&mut self) -> Result<Vec<Tuple>> {
        self.open()?;
        let mut rows = Vec::new();
        while let Some(row) = self.next()? {
            rows.push(row);
        }
        self.close()?;
        Ok(rows)
    }
}

fn slot<'r>(row: &'r Tuple, idx: usize) -> Result<&'r Sequence> {
    row.get(idx)
        .ok_or(SylvaError::Malformed("row shorter than its layout"))
}

/// Emits the context row once.
#[derive(Debug, Default)]
pub struct StartOp;

struct StartCursor {
    row: Option<Tuple>,
}

impl Cursor for StartCursor {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        Ok(self.row.take())
    }

    fn close(&mut self) -> Result<()> {
        self.row = None;
        Ok(())
    }
}

impl Operator for StartOp {
    fn name(&self) -> &'static str {
        "Start"
    }

    fn cursor<'a>(&'a self, _ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(StartCursor { row: Some(row) })
    }

    fn explain(&self) -> ExplainNode {
        ExplainNode::new(self.name())
    }
}

/// `for $var [at $pos] in source`; one output row per source item.
///
/// With a `check` slot whose binding is empty, the source is not evaluated
/// and a single row with empty bindings is emitted instead.
#[derive(Debug)]
pub struct ForBindOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) var: Var,
    pub(crate) pos: Option<Var>,
    pub(crate) source: Arc<dyn Expr>,
    pub(crate) check: Option<(Var, usize)>,
}

struct ForBindCursor<'a> {
    op: &'a ForBindOp,
    ctx: &'a QueryContext,
    input: Upstream<'a>,
    current: Option<(Tuple, Sequence, usize)>,
}

impl Cursor for ForBindCursor<'_> {
    fn open(&mut self) -> Result<()> {
        self.input.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some((row, items, idx)) = self.current.as_mut() {
                if let Some(item) = items.items().get(*idx) {
                    *idx += 1;
                    let mut out = row.append(Sequence::singleton(item.clone()));
                    if self.op.pos.is_some() {
                        out = out.append(Sequence::singleton(Item::Int(*idx as i64)));
                    }
                    return Ok(Some(out));
                }
                self.current = None;
            }
            let Some(row) = self.input.next()? else {
                return Ok(None);
            };
            if let Some((_, check)) = &self.op.check {
                if slot(&row, *check)?.is_empty() {
                    let mut out = row.append(Sequence::empty());
                    if self.op.pos.is_some() {
                        out = out.append(Sequence::empty());
                    }
                    return Ok(Some(out));
                }
            }
            let items = self.op.source.evaluate(self.ctx, &row)?;
            self.current = Some((row, items, 0));
        }
    }

    fn close(&mut self) -> Result<()> {
        self.current = None;
        self.input.close()
    }
}

impl Operator for ForBindOp {
    fn name(&self) -> &'static str {
        "ForBind"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(ForBindCursor {
            op: self,
            ctx,
            input: Upstream::new(&self.input, ctx, row),
            current: None,
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        node.props.push(ExplainProp::plain("var", self.var.to_string()));
        if let Some(pos) = &self.pos {
            node.props.push(ExplainProp::plain("at", pos.to_string()));
        }
        node.props.push(ExplainProp::literal("in", self.source.to_string()));
        if let Some((check, _)) = &self.check {
            node.props.push(ExplainProp::plain("check", check.to_string()));
        }
        node.inputs.push(self.input.explain());
        node
    }
}

/// `let $var := expr`.
///
/// A binding nobody reads downstream is compiled without its expression and
/// appends an empty placeholder, keeping the row layout intact.
#[derive(Debug)]
pub struct LetBindOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) var: Var,
    pub(crate) expr: Option<Arc<dyn Expr>>,
    pub(crate) check: Option<(Var, usize)>,
}

struct LetBindCursor<'a> {
    op: &'a LetBindOp,
    ctx: &'a QueryContext,
    input: Upstream<'a>,
}

impl Cursor for LetBindCursor<'_> {
    fn open(&mut self) -> Result<()> {
        self.input.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        let Some(row) = self.input.next()? else {
            return Ok(None);
        };
        let Some(expr) = &self.op.expr else {
            self.ctx.record_skipped_let();
            return Ok(Some(row.append(Sequence::empty())));
        };
        if let Some((_, check)) = &self.op.check {
            if slot(&row, *check)?.is_empty() {
                return Ok(Some(row.append(Sequence::empty())));
            }
        }
        self.ctx.record_let_evaluation();
        let value = expr.evaluate(self.ctx, &row)?;
        Ok(Some(row.append(value)))
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

impl Operator for LetBindOp {
    fn name(&self) -> &'static str {
        "LetBind"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(LetBindCursor {
            op: self,
            ctx,
            input: Upstream::new(&self.input, ctx, row),
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        node.props.push(ExplainProp::plain("var", self.var.to_string()));
        match &self.expr {
            Some(expr) => node.props.push(ExplainProp::literal("expr", expr.to_string())),
            None => node.props.push(ExplainProp::plain("disabled", "true")),
        }
        if let Some((check, _)) = &self.check {
            node.props.push(ExplainProp::plain("check", check.to_string()));
        }
        node.inputs.push(self.input.explain());
        node
    }
}

/// `where predicate`
#[derive(Debug)]
pub struct SelectOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) predicate: Arc<dyn Expr>,
}

struct SelectCursor<'a> {
    op: &'a SelectOp,
    ctx: &'a QueryContext,
    input: Upstream<'a>,
}

impl Cursor for SelectCursor<'_> {
    fn open(&mut self) -> Result<()> {
        self.input.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        while let Some(row) = self.input.next()? {
            if self
                .op
                .predicate
                .evaluate(self.ctx, &row)?
                .effective_boolean()?
            {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

impl Operator for SelectOp {
    fn name(&self) -> &'static str {
        "Select"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(SelectCursor {
            op: self,
            ctx,
            input: Upstream::new(&self.input, ctx, row),
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        node.props
            .push(ExplainProp::literal("predicate", self.predicate.to_string()));
        node.inputs.push(self.input.explain());
        node
    }
}

/// Stable sort of the buffered input; empty keys sort first.
#[derive(Debug)]
pub struct OrderByOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) keys: Vec<(Arc<dyn Expr>, SortOrder)>,
}

struct BufferedCursor<'a> {
    input: Upstream<'a>,
    produce: Box<dyn Fn(Vec<Tuple>) -> Result<Vec<Tuple>> + 'a>,
    rows: VecDeque<Tuple>,
}

impl Cursor for BufferedCursor<'_> {
    fn open(&mut self) -> Result<()> {
        let rows = self.input.drain()?;
        self.rows = (self.produce)(rows)?.into();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.rows.clear();
        self.input.close()
    }
}

fn compare_keys(a: &[Option<Item>], b: &[Option<Item>], orders: &[SortOrder]) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    for ((left, right), order) in a.iter().zip(b).zip(orders) {
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.sort_cmp(y),
        };
        let ordering = match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

impl OrderByOp {
    fn sort(&self, ctx: &QueryContext, rows: Vec<Tuple>) -> Result<Vec<Tuple>> {
        let mut keyed = rows
            .into_iter()
            .map(|row| {
                let keys = self
                    .keys
                    .iter()
                    .map(|(expr, _)| expr.evaluate_to_item(ctx, &row))
                    .collect::<Result<Vec<_>>>()?;
                Ok((keys, row))
            })
            .collect::<Result<Vec<_>>>()?;
        let orders: Vec<SortOrder> = self.keys.iter().map(|(_, order)| *order).collect();
        keyed.sort_by(|(a, _), (b, _)| compare_keys(a, b, &orders));
        Ok(keyed.into_iter().map(|(_, row)| row).collect())
    }
}

impl Operator for OrderByOp {
    fn name(&self) -> &'static str {
        "OrderBy"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(BufferedCursor {
            input: Upstream::new(&self.input, ctx, row),
            produce: Box::new(move |rows| self.sort(ctx, rows)),
            rows: VecDeque::new(),
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        for (expr, order) in &self.keys {
            let dir = match order {
                SortOrder::Ascending => "asc",
                SortOrder::Descending => "desc",
            };
            node.props
                .push(ExplainProp::literal("key", format!("{expr} {dir}")));
        }
        node.inputs.push(self.input.explain());
        node
    }
}

/// Groups buffered rows on key slots, concatenating aggregate slots.
///
/// Output rows are the context row followed by the keys and the aggregates,
/// one per group in first-seen order.
#[derive(Debug)]
pub struct GroupByOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) keys: Vec<(Var, usize)>,
    pub(crate) aggregates: Vec<(Var, usize)>,
}

/// Grouping identity of a key sequence; NaN groups with NaN.
fn group_identity(seq: &Sequence) -> Vec<Option<HashKey>> {
    seq.iter().map(Item::hash_key).collect()
}

impl GroupByOp {
    fn group(&self, ctx_row: &Tuple, rows: Vec<Tuple>) -> Result<Vec<Tuple>> {
        let mut index: FxHashMap<Vec<Vec<Option<HashKey>>>, usize> = FxHashMap::default();
        let mut groups: Vec<(Vec<Sequence>, Vec<Vec<Item>>)> = Vec::new();
        for row in rows {
            let keys = self
                .keys
                .iter()
                .map(|(_, idx)| slot(&row, *idx).cloned())
                .collect::<Result<Vec<_>>>()?;
            let identity: Vec<_> = keys.iter().map(group_identity).collect();
            let group = *index.entry(identity).or_insert_with(|| {
                groups.push((keys, vec![Vec::new(); self.aggregates.len()]));
                groups.len() - 1
            });
            for (target, (_, idx)) in groups[group].1.iter_mut().zip(&self.aggregates) {
                target.extend(slot(&row, *idx)?.iter().cloned());
            }
        }
        Ok(groups
            .into_iter()
            .map(|(keys, aggregates)| {
                ctx_row
                    .extend(keys)
                    .extend(aggregates.into_iter().map(Sequence::from_items))
            })
            .collect())
    }
}

impl Operator for GroupByOp {
    fn name(&self) -> &'static str {
        "GroupBy"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        let ctx_row = row.clone();
        Box::new(BufferedCursor {
            input: Upstream::new(&self.input, ctx, row),
            produce: Box::new(move |rows| self.group(&ctx_row, rows)),
            rows: VecDeque::new(),
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        for (key, _) in &self.keys {
            node.props.push(ExplainProp::plain("key", key.to_string()));
        }
        for (target, _) in &self.aggregates {
            node.props.push(ExplainProp::plain("collect", target.to_string()));
        }
        node.inputs.push(self.input.explain());
        node
    }
}

/// `count $var`: appends the 1-based row number.
#[derive(Debug)]
pub struct CountOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) var: Var,
}

struct CountCursor<'a> {
    input: Upstream<'a>,
    seen: i64,
}

impl Cursor for CountCursor<'_> {
    fn open(&mut self) -> Result<()> {
        self.seen = 0;
        self.input.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        let Some(row) = self.input.next()? else {
            return Ok(None);
        };
        self.seen += 1;
        Ok(Some(row.append(Sequence::singleton(Item::Int(self.seen)))))
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

impl Operator for CountOp {
    fn name(&self) -> &'static str {
        "Count"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(CountCursor {
            input: Upstream::new(&self.input, ctx, row),
            seen: 0,
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        node.props.push(ExplainProp::plain("var", self.var.to_string()));
        node.inputs.push(self.input.explain());
        node
    }
}

/// Drops every pipeline-local slot except `keep`.
#[derive(Debug)]
pub struct ProjectOp {
    pub(crate) input: Arc<dyn Operator>,
    pub(crate) ctx_len: usize,
    pub(crate) keep: Vec<(Var, usize)>,
}

struct ProjectCursor<'a> {
    op: &'a ProjectOp,
    input: Upstream<'a>,
}

impl Cursor for ProjectCursor<'_> {
    fn open(&mut self) -> Result<()> {
        self.input.open()
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        let Some(row) = self.input.next()? else {
            return Ok(None);
        };
        let kept = self
            .op
            .keep
            .iter()
            .map(|(_, idx)| slot(&row, *idx).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(row.prefix(self.op.ctx_len).extend(kept)))
    }

    fn close(&mut self) -> Result<()> {
        self.input.close()
    }
}

impl Operator for ProjectOp {
    fn name(&self) -> &'static str {
        "Project"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(ProjectCursor {
            op: self,
            input: Upstream::new(&self.input, ctx, row),
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        let kept: Vec<String> = self.keep.iter().map(|(var, _)| var.to_string()).collect();
        node.props
            .push(ExplainProp::plain("keep", format!("[{}]", kept.join(", "))));
        node.inputs.push(self.input.explain());
        node
    }
}

/// How a join finds the right rows matching a left key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinStrategy {
    /// Hash table over the right keys; general `=`.
    Hash,
    /// Sorted right keys with binary search; general `<`, `<=`, `>`, `>=`.
    SortMerge,
    /// Compare against every right row; anything else.
    NestedLoop,
}

impl JoinStrategy {
    /// Strategy used for `cmp`.
    pub fn for_comparison(cmp: Comparison) -> Self {
        match cmp {
            Comparison::General(CmpOp::Eq) => JoinStrategy::Hash,
            Comparison::General(CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge) => {
                JoinStrategy::SortMerge
            }
            _ => JoinStrategy::NestedLoop,
        }
    }

    fn name(self) -> &'static str {
        match self {
            JoinStrategy::Hash => "hash",
            JoinStrategy::SortMerge => "sort-merge",
            JoinStrategy::NestedLoop => "nested-loop",
        }
    }
}

/// Joins left rows with the buffered right input on `left_key cmp right_key`.
///
/// Output rows are the left row followed by the right row's local slots.
/// Matches come in right-input order unless `skip_sort` is set. A left join
/// pads left rows without a match with empty bindings.
#[derive(Debug)]
pub struct JoinOp {
    pub(crate) left: Arc<dyn Operator>,
    pub(crate) right: Arc<dyn Operator>,
    pub(crate) left_key: Arc<dyn Expr>,
    pub(crate) right_key: Arc<dyn Expr>,
    pub(crate) cmp: Comparison,
    pub(crate) left_join: bool,
    pub(crate) skip_sort: bool,
    pub(crate) ctx_len: usize,
    pub(crate) right_width: usize,
}

impl JoinOp {
    /// Strategy picked from the join comparison.
    pub fn strategy(&self) -> JoinStrategy {
        JoinStrategy::for_comparison(self.cmp)
    }
}

enum Probe {
    Hash(FxHashMap<HashKey, SmallVec<[usize; 4]>>),
    Sorted(Vec<(Item, usize)>),
    Scan(Vec<Sequence>),
}

impl Probe {
    fn build(strategy: JoinStrategy, keys: Vec<Sequence>) -> Self {
        match strategy {
            JoinStrategy::Hash => {
                let mut table: FxHashMap<HashKey, SmallVec<[usize; 4]>> = FxHashMap::default();
                for (idx, key) in keys.iter().enumerate() {
                    for item in key.iter() {
                        if let Some(hash) = item.hash_key() {
                            table.entry(hash).or_default().push(idx);
                        }
                    }
                }
                Probe::Hash(table)
            }
            JoinStrategy::SortMerge => {
                let mut entries: Vec<(Item, usize)> = keys
                    .iter()
                    .enumerate()
                    .flat_map(|(idx, key)| {
                        key.iter()
                            .filter(|item| !item.is_nan())
                            .map(move |item| (item.clone(), idx))
                    })
                    .collect();
                entries.sort_by(|(a, _), (b, _)| a.sort_cmp(b));
                Probe::Sorted(entries)
            }
            JoinStrategy::NestedLoop => Probe::Scan(keys),
        }
    }

    /// Right rows matching `key`, possibly repeated and in any order.
    fn matches(&self, cmp: Comparison, key: &Sequence) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        match self {
            Probe::Hash(table) => {
                for item in key.iter() {
                    if let Some(bucket) = item.hash_key().and_then(|hash| table.get(&hash)) {
                        out.extend(bucket.iter().copied());
                    }
                }
            }
            Probe::Sorted(entries) => {
                for item in key.iter().filter(|item| !item.is_nan()) {
                    out.extend(sorted_range(entries, cmp.op(), item).iter().map(|(_, idx)| *idx));
                }
            }
            Probe::Scan(keys) => {
                for (idx, right) in keys.iter().enumerate() {
                    if compare(cmp, key, right)? == Some(true) {
                        out.push(idx);
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Entries `b` with `a op b`, for entries sorted by [`Item::sort_cmp`].
fn sorted_range<'e>(entries: &'e [(Item, usize)], op: CmpOp, a: &Item) -> &'e [(Item, usize)] {
    use std::cmp::Ordering;
    let lo = entries.partition_point(|(b, _)| !b.comparable(a) && b.sort_cmp(a) == Ordering::Less);
    let hi = entries.partition_point(|(b, _)| b.comparable(a) || b.sort_cmp(a) == Ordering::Less);
    let class = &entries[lo..hi];
    let below = class.partition_point(|(b, _)| b.sort_cmp(a) == Ordering::Less);
    let not_above = class.partition_point(|(b, _)| b.sort_cmp(a) != Ordering::Greater);
    match op {
        CmpOp::Lt => &class[not_above..],
        CmpOp::Le => &class[below..],
        CmpOp::Gt => &class[..below],
        CmpOp::Ge => &class[..not_above],
        CmpOp::Eq => &class[below..not_above],
        CmpOp::Ne => class,
    }
}

struct JoinCursor<'a> {
    op: &'a JoinOp,
    ctx: &'a QueryContext,
    left: Upstream<'a>,
    right: Upstream<'a>,
    right_rows: Vec<Vec<Sequence>>,
    probe: Option<Probe>,
    pending: VecDeque<Tuple>,
}

impl JoinCursor<'_> {
    fn ordered(&self, mut matches: Vec<usize>) -> Vec<usize> {
        if self.op.skip_sort {
            let mut seen = FxHashSet::default();
            matches.retain(|idx| seen.insert(*idx));
        } else {
            matches.sort_unstable();
            matches.dedup();
        }
        matches
    }
}

impl Cursor for JoinCursor<'_> {
    fn open(&mut self) -> Result<()> {
        self.left.open()?;
        let rows = self.right.drain()?;
        let keys = rows
            .iter()
            .map(|row| self.op.right_key.evaluate(self.ctx, row))
            .collect::<Result<Vec<_>>>()?;
        self.right_rows = rows
            .iter()
            .map(|row| row.values().split_off(self.op.ctx_len.min(row.len())))
            .collect();
        let strategy = self.op.strategy();
        self.ctx.record_join(strategy);
        debug!(
            strategy = strategy.name(),
            right_rows = self.right_rows.len(),
            "execute.join.open"
        );
        self.probe = Some(Probe::build(strategy, keys));
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Tuple>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                return Ok(Some(row));
            }
            let Some(left) = self.left.next()? else {
                return Ok(None);
            };
            let probe = self
                .probe
                .as_ref()
                .ok_or(SylvaError::Cursor("join read before open"))?;
            let key = self.op.left_key.evaluate(self.ctx, &left)?;
            let matches = self.ordered(probe.matches(self.op.cmp, &key)?);
            if matches.is_empty() && self.op.left_join {
                let padding = std::iter::repeat_with(Sequence::empty).take(self.op.right_width);
                return Ok(Some(left.extend(padding)));
            }
            for idx in matches {
                if let Some(right) = self.right_rows.get(idx) {
                    self.pending.push_back(left.extend(right.iter().cloned()));
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.probe = None;
        let left = self.left.close();
        let right = self.right.close();
        left.and(right)
    }
}

impl Operator for JoinOp {
    fn name(&self) -> &'static str {
        "Join"
    }

    fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
        Box::new(JoinCursor {
            op: self,
            ctx,
            left: Upstream::new(&self.left, ctx, row.clone()),
            right: Upstream::new(&self.right, ctx, row),
            right_rows: Vec::new(),
            probe: None,
            pending: VecDeque::new(),
        })
    }

    fn explain(&self) -> ExplainNode {
        let mut node = ExplainNode::new(self.name());
        node.props
            .push(ExplainProp::plain("strategy", self.strategy().name()));
        node.props.push(ExplainProp::literal(
            "on",
            format!("{} {} {}", self.left_key, self.cmp.symbol(), self.right_key),
        ));
        if self.left_join {
            node.props.push(ExplainProp::plain("left_join", "true"));
        }
        if self.skip_sort {
            node.props.push(ExplainProp::plain("skip_sort", "true"));
        }
        node.inputs.push(self.left.explain());
        node.inputs.push(self.right.explain());
        node
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::query::expr::{Literal, VarRef};

    fn ints(values: &[i64]) -> Sequence {
        values.iter().copied().map(Item::Int).collect()
    }

    fn for_over(values: &[i64]) -> Arc<dyn Operator> {
        Arc::new(ForBindOp {
            input: Arc::new(StartOp),
            var: Var::from("x"),
            pos: None,
            source: Arc::new(Literal(ints(values))),
            check: None,
        })
    }

    fn collect(op: &dyn Operator) -> Vec<Vec<Sequence>> {
        let ctx = QueryContext::new();
        let mut cursor = op.create(&ctx, Tuple::empty());
        let mut rows = Vec::new();
        for_each_row(cursor.as_mut(), |row| {
            rows.push(row.values());
            Ok(())
        })
        .expect("drains");
        rows
    }

    #[test]
    fn cursor_protocol_is_enforced() {
        let ctx = QueryContext::new();
        let op = for_over(&[1, 2]);
        let mut cursor = op.create(&ctx, Tuple::empty());
        assert!(matches!(cursor.next(), Err(SylvaError::Cursor("next before open"))));
        cursor.open().expect("opens");
        assert!(cursor.next().expect("row").is_some());
        cursor.close().expect("closes");
        cursor.close().expect("closing twice is fine");
        assert!(matches!(cursor.next(), Err(SylvaError::Cursor("next after close"))));
        assert!(cursor.open().is_err());

        let mut unopened = op.create(&ctx, Tuple::empty());
        unopened.close().expect("close without open");
    }

    #[test]
    fn for_bind_numbers_positions_and_pads_checked_rows() {
        let op = ForBindOp {
            input: Arc::new(StartOp),
            var: Var::from("x"),
            pos: Some(Var::from("i")),
            source: Arc::new(Literal(ints(&[7, 8]))),
            check: None,
        };
        assert_eq!(
            collect(&op),
            vec![vec![ints(&[7]), ints(&[1])], vec![ints(&[8]), ints(&[2])]]
        );

        let checked = ForBindOp {
            input: Arc::new(LetBindOp {
                input: Arc::new(StartOp),
                var: Var::from("c"),
                expr: Some(Arc::new(Literal(Sequence::empty()))),
                check: None,
            }),
            var: Var::from("x"),
            pos: None,
            source: Arc::new(Literal(ints(&[1, 2, 3]))),
            check: Some((Var::from("c"), 0)),
        };
        assert_eq!(collect(&checked), vec![vec![Sequence::empty(), Sequence::empty()]]);
    }

    #[test]
    fn group_by_keeps_first_seen_order() {
        let op = GroupByOp {
            input: Arc::new(ForBindOp {
                input: for_over(&[3, 1, 3, 2, 1]),
                var: Var::from("y"),
                pos: None,
                source: Arc::new(VarRef::new(Var::from("x"), 0)),
                check: None,
            }),
            keys: vec![(Var::from("x"), 0)],
            aggregates: vec![(Var::from("ys"), 1)],
        };
        assert_eq!(
            collect(&op),
            vec![
                vec![ints(&[3]), ints(&[3, 3])],
                vec![ints(&[1]), ints(&[1, 1])],
                vec![ints(&[2]), ints(&[2])],
            ]
        );
    }

    fn join(cmp: Comparison, left_join: bool, skip_sort: bool) -> JoinOp {
        JoinOp {
            left: for_over(&[1, 2, 5]),
            right: for_over(&[4, 2, 3, 2]),
            left_key: Arc::new(VarRef::new(Var::from("x"), 0)),
            right_key: Arc::new(VarRef::new(Var::from("x"), 0)),
            cmp,
            left_join,
            skip_sort,
            ctx_len: 0,
            right_width: 1,
        }
    }

    #[test]
    fn join_strategies_return_matches_in_right_order() {
        let hash = collect(&join(Comparison::General(CmpOp::Eq), false, false));
        assert_eq!(hash, vec![vec![ints(&[2]), ints(&[2])], vec![ints(&[2]), ints(&[2])]]);

        let sorted = collect(&join(Comparison::General(CmpOp::Lt), false, false));
        let scanned = collect(&join(Comparison::Value(CmpOp::Lt), false, false));
        assert_eq!(sorted, scanned);
        assert_eq!(sorted[0], vec![ints(&[1]), ints(&[4])]);
        assert_eq!(sorted[1], vec![ints(&[1]), ints(&[2])]);
    }

    #[test]
    fn left_join_pads_unmatched_rows() {
        let rows = collect(&join(Comparison::General(CmpOp::Eq), true, true));
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec![ints(&[1]), Sequence::empty()]);
        assert_eq!(rows[3], vec![ints(&[5]), Sequence::empty()]);
    }

    #[derive(Debug, Default)]
    struct Counts {
        opens: AtomicUsize,
        closes: AtomicUsize,
    }

    impl Counts {
        fn snapshot(&self) -> (usize, usize) {
            (self.opens.load(Ordering::SeqCst), self.closes.load(Ordering::SeqCst))
        }
    }

    /// Passes rows through, counting raw opens and closes.
    #[derive(Debug)]
    struct Counted {
        inner: Arc<dyn Operator>,
        counts: Arc<Counts>,
    }

    struct CountedCursor<'a> {
        inner: Box<dyn Cursor + 'a>,
        counts: &'a Counts,
    }

    impl Cursor for CountedCursor<'_> {
        fn open(&mut self) -> Result<()> {
            self.counts.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open()
        }

        fn next(&mut self) -> Result<Option<Tuple>> {
            self.inner.next()
        }

        fn close(&mut self) -> Result<()> {
            self.counts.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close()
        }
    }

    impl Operator for Counted {
        fn name(&self) -> &'static str {
            "Counted"
        }

        fn cursor<'a>(&'a self, ctx: &'a QueryContext, row: Tuple) -> Box<dyn Cursor + 'a> {
            Box::new(CountedCursor {
                inner: self.inner.create(ctx, row),
                counts: &self.counts,
            })
        }

        fn explain(&self) -> ExplainNode {
            self.inner.explain()
        }
    }

    #[derive(Debug)]
    struct Failing;

    impl Expr for Failing {
        fn evaluate(&self, _ctx: &QueryContext, _row: &Tuple) -> Result<Sequence> {
            Err(SylvaError::Unsupported("failing key"))
        }
    }

    impl fmt::Display for Failing {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("fail()")
        }
    }

    fn counted(values: &[i64], counts: &Arc<Counts>) -> Arc<dyn Operator> {
        Arc::new(Counted {
            inner: for_over(values),
            counts: Arc::clone(counts),
        })
    }

    #[test]
    fn every_opened_input_is_closed() {
        let ctx = QueryContext::new();

        let counts = Arc::new(Counts::default());
        let select = SelectOp {
            input: counted(&[1, 2, 3], &counts),
            predicate: Arc::new(Literal(std::iter::once(Item::Bool(true)).collect())),
        };
        let mut cursor = select.create(&ctx, Tuple::empty());
        cursor.open().expect("opens");
        assert!(cursor.next().expect("row").is_some());
        cursor.close().expect("closes mid-stream");
        assert_eq!(counts.snapshot(), (1, 1));

        let counts = Arc::new(Counts::default());
        let order = OrderByOp {
            input: counted(&[2, 1], &counts),
            keys: vec![(Arc::new(Failing), SortOrder::Ascending)],
        };
        let mut cursor = order.create(&ctx, Tuple::empty());
        assert!(for_each_row(cursor.as_mut(), |_| Ok(())).is_err());
        assert_eq!(counts.snapshot(), (1, 1));

        let counts = Arc::new(Counts::default());
        let join = JoinOp {
            left: counted(&[1, 2], &counts),
            right: counted(&[2, 3], &counts),
            left_key: Arc::new(Failing),
            right_key: Arc::new(VarRef::new(Var::from("x"), 0)),
            cmp: Comparison::General(CmpOp::Eq),
            left_join: true,
            skip_sort: true,
            ctx_len: 0,
            right_width: 1,
        };
        let mut cursor = join.create(&ctx, Tuple::empty());
        assert!(for_each_row(cursor.as_mut(), |_| Ok(())).is_err());
        assert_eq!(counts.snapshot(), (2, 2));
    }

    #[test]
    fn sorted_ranges_stay_within_a_type_family() {
        let mut entries = vec![
            (Item::from("a"), 0),
            (Item::Int(1), 1),
            (Item::Int(3), 2),
            (Item::Bool(true), 3),
        ];
        entries.sort_by(|(a, _), (b, _)| a.sort_cmp(b));
        let above: Vec<usize> = sorted_range(&entries, CmpOp::Lt, &Item::Int(1))
            .iter()
            .map(|(_, idx)| *idx)
            .collect();
        assert_eq!(above, vec![2]);
        assert!(sorted_range(&entries, CmpOp::Gt, &Item::Int(1)).is_empty());
    }
}
