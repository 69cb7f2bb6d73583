//! Lowering of rewritten, projected plans into operator trees.
//!
//! Every expression is compiled against the [`Layout`] of the row it will be
//! evaluated on, so variable references become slot reads. Stage `project`
//! annotations drive two decisions: a `let` whose variable is not projected
//! is compiled without its expression, and buffering stages and join inputs
//! are preceded by a [`ProjectOp`] dropping slots nobody reads.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use xxhash_rust::xxh64::Xxh64;

use crate::query::ast::{props, NodeId, NodeKind, NodeSpec, NodeValue, Plan, Var};
use crate::query::context::QueryContext;
use crate::query::errors::EvalError;
use crate::query::expr::{
    Arithmetic, Call, Compare, Conditional, Expr, Literal, Logical, Pipeline, RangeExpr,
    SequenceExpr, VarRef,
};
use crate::query::operator::{
    CountOp, ForBindOp, GroupByOp, JoinOp, LetBindOp, Operator, OrderByOp, ProjectOp, SelectOp,
    StartOp,
};
use crate::query::pipeline;
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::projection;
use crate::query::registry::FunctionRegistry;
use crate::query::rewrite::{optimize, OptimizerConfig, RewriteReport};
use crate::query::tuple::{Layout, Tuple};
use crate::query::value::{Item, Sequence};
use crate::types::{Result, SylvaError};

/// Human-readable explain tree.
#[derive(Clone, Debug, Serialize)]
pub struct PlanExplain {
    /// Root node of the explain tree
    pub root: ExplainNode,
    /// Deterministic hash for the plan.
    pub plan_hash: u64,
}

/// Explain node representing an operator with optional metadata.
#[derive(Clone, Debug, Serialize)]
pub struct ExplainNode {
    /// Operator name
    pub op: String,
    /// Additional properties describing the operator
    pub props: Vec<ExplainProp>,
    /// Input operators
    pub inputs: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Creates a new explain node with the given operator name.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            props: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

/// Single property associated with an [`ExplainNode`].
#[derive(Clone, Debug, Serialize)]
pub struct ExplainProp {
    /// Property key.
    pub key: String,
    /// Property value serialized for display.
    pub value: String,
    /// Whether this property contains literal data that may be redacted.
    pub redactable: bool,
}

impl ExplainProp {
    pub(crate) fn plain(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: false,
        }
    }

    pub(crate) fn literal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            redactable: true,
        }
    }

    fn shown(&self, redact: bool) -> &str {
        if redact && self.redactable {
            "<redacted>"
        } else {
            &self.value
        }
    }
}

impl PlanExplain {
    /// Indented text rendering, one operator per line.
    pub fn render_text(&self, redact: bool) -> String {
        let mut out = format!("plan_hash={:016x}\n", self.plan_hash);
        render_node(&self.root, 0, redact, &mut out);
        out
    }

    /// JSON rendering: `{"plan_hash": "...", "plan": {op, props, inputs}}`.
    pub fn to_json(&self, redact: bool) -> Value {
        let mut root = Map::new();
        root.insert(
            "plan_hash".into(),
            Value::String(format!("{:016x}", self.plan_hash)),
        );
        root.insert("plan".into(), node_to_json(&self.root, redact));
        Value::Object(root)
    }
}

fn render_node(node: &ExplainNode, depth: usize, redact: bool, out: &mut String) {
    out.push_str(&"  ".repeat(depth));
    out.push_str(&node.op);
    for prop in &node.props {
        out.push_str(&format!(" {}={}", prop.key, prop.shown(redact)));
    }
    out.push('\n');
    for input in &node.inputs {
        render_node(input, depth + 1, redact, out);
    }
}

fn node_to_json(node: &ExplainNode, redact: bool) -> Value {
    let mut map = Map::new();
    map.insert("op".into(), Value::String(node.op.clone()));
    if !node.props.is_empty() {
        let mut props = Map::new();
        for prop in &node.props {
            let mut key = prop.key.clone();
            let mut n = 1;
            while props.contains_key(&key) {
                n += 1;
                key = format!("{}#{n}", prop.key);
            }
            props.insert(key, Value::String(prop.shown(redact).to_owned()));
        }
        map.insert("props".into(), Value::Object(props));
    }
    let inputs = node
        .inputs
        .iter()
        .map(|input| node_to_json(input, redact))
        .collect::<Vec<_>>();
    map.insert("inputs".into(), Value::Array(inputs));
    Value::Object(map)
}

fn compute_plan_hash(plan: &Plan, explain: &ExplainNode) -> u64 {
    let logical = {
        let mut hasher = Xxh64::new(0);
        hasher.write(plan.render().as_bytes());
        hasher.finish()
    };
    let physical = {
        let mut hasher = Xxh64::new(0);
        hash_explain_node(explain, &mut hasher);
        hasher.finish()
    };
    let mut hasher = Xxh64::new(0);
    hasher.write_u64(logical);
    hasher.write_u64(physical);
    hasher.finish()
}

fn hash_explain_node(node: &ExplainNode, hasher: &mut Xxh64) {
    hasher.write(node.op.as_bytes());
    for prop in &node.props {
        hasher.write(prop.key.as_bytes());
        hasher.write(prop.value.as_bytes());
    }
    hasher.write_u64(node.inputs.len() as u64);
    for child in &node.inputs {
        hash_explain_node(child, hasher);
    }
}

/// Values of a query's external variables.
pub type ExternalBindings = BTreeMap<Var, Sequence>;

/// An executable query.
#[derive(Debug)]
pub struct CompiledQuery {
    root: Arc<dyn Expr>,
    externals: Vec<Var>,
    explain: PlanExplain,
}

impl CompiledQuery {
    /// External variables, in context-row order.
    pub fn externals(&self) -> &[Var] {
        &self.externals
    }

    /// Explain tree of the operator plan.
    pub fn explain(&self) -> &PlanExplain {
        &self.explain
    }

    /// Evaluates the query with the given external bindings.
    pub fn evaluate(&self, ctx: &QueryContext, bindings: &ExternalBindings) -> Result<Sequence> {
        let start = profile_timer();
        let row = self
            .externals
            .iter()
            .map(|var| {
                bindings.get(var).cloned().ok_or_else(|| {
                    SylvaError::from(EvalError::UndefinedVariable {
                        name: var.name().to_owned(),
                    })
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let result = self.root.evaluate(ctx, &Tuple::from_values(row));
        record_profile_timer(QueryProfileKind::Execute, start);
        result
    }
}

fn child(plan: &Plan, node: NodeId, idx: usize) -> Result<NodeId> {
    plan.child(node, idx).ok_or_else(|| {
        SylvaError::MalformedOwned(format!("{:?} #{} lacks child {idx}", plan.kind(node), node.0))
    })
}

fn slot_of(layout: &Layout, var: &Var) -> Result<usize> {
    layout.slot(var).ok_or_else(|| {
        EvalError::UndefinedVariable {
            name: var.name().to_owned(),
        }
        .into()
    })
}

fn unsupported(kind: NodeKind) -> SylvaError {
    SylvaError::Unsupported(match kind {
        NodeKind::ContextItemExpr => "context item expressions",
        NodeKind::PathExpr | NodeKind::StepExpr => "path expressions",
        NodeKind::FilterExpr => "filter expressions",
        NodeKind::QuantifiedExpr => "quantified expressions",
        NodeKind::TypeSwitch => "typeswitch expressions",
        NodeKind::TransformExpr => "transform expressions",
        NodeKind::TryCatchExpr => "try/catch expressions",
        NodeKind::DocumentConstructor | NodeKind::ElementConstructor => "node constructors",
        _ => "plan node outside an expression slot",
    })
}

/// Lowers plans to operator trees, resolving calls against a registry.
pub struct Compiler<'r> {
    registry: &'r FunctionRegistry,
}

impl<'r> Compiler<'r> {
    /// Compiler resolving calls in `registry`.
    pub fn new(registry: &'r FunctionRegistry) -> Self {
        Self { registry }
    }

    /// Compiles the plan rooted at `plan.root()`; `externals` are the
    /// variables supplied at evaluation time.
    pub fn compile(&self, plan: &Plan, externals: &[Var]) -> Result<CompiledQuery> {
        let start = profile_timer();
        let layout = Layout::context(externals.to_vec());
        let root = plan.root();
        let (expr, explain) = if plan.kind(root) == NodeKind::PipeExpr {
            let (tail, ret) = self.compile_pipe_parts(plan, root, &layout)?;
            let mut node = ExplainNode::new("Return");
            node.props.push(ExplainProp::literal("expr", ret.to_string()));
            node.inputs.push(tail.explain());
            let expr: Arc<dyn Expr> = Arc::new(Pipeline { tail, ret });
            (expr, node)
        } else {
            let expr = self.compile_expr(plan, root, &layout)?;
            let mut node = ExplainNode::new("Expr");
            node.props.push(ExplainProp::literal("expr", expr.to_string()));
            (expr, node)
        };
        let plan_hash = compute_plan_hash(plan, &explain);
        record_profile_timer(QueryProfileKind::Compile, start);
        debug!(plan_hash = %format!("{plan_hash:016x}"), "compile.done");
        Ok(CompiledQuery {
            root: expr,
            externals: externals.to_vec(),
            explain: PlanExplain {
                root: explain,
                plan_hash,
            },
        })
    }

    fn compile_pipe_parts(
        &self,
        plan: &Plan,
        pipe: NodeId,
        outer: &Layout,
    ) -> Result<(Arc<dyn Operator>, Arc<dyn Expr>)> {
        let end = pipeline::end_of(plan, pipe)
            .ok_or(SylvaError::Malformed("pipe expression without end"))?;
        let ctx = Layout::context(outer.vars().to_vec());
        let (tail, layout) = self.compile_stage(plan, child(plan, end, 0)?, &ctx)?;
        let ret = plan
            .child(end, 1)
            .ok_or(SylvaError::Malformed("pipeline without return expression"))?;
        let ret = self.compile_expr(plan, ret, &layout)?;
        Ok((tail, ret))
    }

    fn compile_children(
        &self,
        plan: &Plan,
        node: NodeId,
        layout: &Layout,
    ) -> Result<Vec<Arc<dyn Expr>>> {
        plan.children(node)
            .iter()
            .map(|c| self.compile_expr(plan, *c, layout))
            .collect()
    }

    fn compile_expr(&self, plan: &Plan, node: NodeId, layout: &Layout) -> Result<Arc<dyn Expr>> {
        let operand = |idx: usize| self.compile_expr(plan, child(plan, node, idx)?, layout);
        let expr: Arc<dyn Expr> = match plan.kind(node) {
            NodeKind::Literal => {
                let item: Item = plan
                    .value(node)
                    .as_item()
                    .ok_or(SylvaError::Malformed("literal without value"))?;
                Arc::new(Literal(Sequence::singleton(item)))
            }
            NodeKind::EmptySequence => Arc::new(Literal(Sequence::empty())),
            NodeKind::SequenceExpr => Arc::new(SequenceExpr(self.compile_children(plan, node, layout)?)),
            NodeKind::RangeExpr => Arc::new(RangeExpr {
                lo: operand(0)?,
                hi: operand(1)?,
            }),
            NodeKind::ArithmeticExpr => {
                let NodeValue::Arith(op) = plan.value(node) else {
                    return Err(SylvaError::Malformed("arithmetic without operator"));
                };
                Arc::new(Arithmetic {
                    op: *op,
                    left: operand(0)?,
                    right: operand(1)?,
                })
            }
            NodeKind::ComparisonExpr => {
                let NodeValue::Cmp(cmp) = plan.value(node) else {
                    return Err(SylvaError::Malformed("comparison without operator"));
                };
                Arc::new(Compare {
                    cmp: *cmp,
                    left: operand(0)?,
                    right: operand(1)?,
                })
            }
            kind @ (NodeKind::AndExpr | NodeKind::OrExpr) => Arc::new(Logical {
                conjunction: kind == NodeKind::AndExpr,
                left: operand(0)?,
                right: operand(1)?,
            }),
            NodeKind::IfExpr => Arc::new(Conditional {
                cond: operand(0)?,
                then: operand(1)?,
                otherwise: operand(2)?,
            }),
            NodeKind::FunctionCall => {
                let name = plan
                    .name(node)
                    .ok_or(SylvaError::Malformed("call without function name"))?;
                let args = self.compile_children(plan, node, layout)?;
                let function = self.registry.resolve(name, args.len())?;
                Arc::new(Call { function, args })
            }
            NodeKind::VariableRef => {
                let var = plan
                    .var(node)
                    .ok_or(SylvaError::Malformed("reference without variable"))?;
                Arc::new(VarRef::new(var.clone(), slot_of(layout, var)?))
            }
            NodeKind::PipeExpr => {
                let (tail, ret) = self.compile_pipe_parts(plan, node, layout)?;
                Arc::new(Pipeline { tail, ret })
            }
            other => return Err(unsupported(other)),
        };
        Ok(expr)
    }

    fn check_slot(&self, plan: &Plan, stage: NodeId, layout: &Layout) -> Result<Option<(Var, usize)>> {
        match plan.var_property(stage, props::CHECK) {
            Some(var) => Ok(Some((var.clone(), slot_of(layout, var)?))),
            None => Ok(None),
        }
    }

    /// Puts a [`ProjectOp`] on top of `op` when `stage`'s projection drops slots.
    fn trim(
        &self,
        plan: &Plan,
        stage: NodeId,
        op: Arc<dyn Operator>,
        layout: Layout,
    ) -> (Arc<dyn Operator>, Layout) {
        let Some(project) = plan.vars_property(stage, props::PROJECT) else {
            return (op, layout);
        };
        let ctx_len = layout.ctx_len();
        let keep: Vec<(Var, usize)> = layout
            .locals()
            .iter()
            .enumerate()
            .map(|(offset, var)| (var.clone(), ctx_len + offset))
            .filter(|(var, idx)| project.contains(var) && layout.slot(var) == Some(*idx))
            .collect();
        if keep.len() == layout.locals().len() {
            return (op, layout);
        }
        let slots: Vec<usize> = keep.iter().map(|(_, idx)| *idx).collect();
        let trimmed = layout.select(&slots);
        debug!(
            stage = stage.0,
            dropped = layout.locals().len() - keep.len(),
            "compile.project"
        );
        (
            Arc::new(ProjectOp {
                input: op,
                ctx_len,
                keep,
            }),
            trimmed,
        )
    }

    fn compile_input(
        &self,
        plan: &Plan,
        stage: NodeId,
        ctx: &Layout,
    ) -> Result<(Arc<dyn Operator>, Layout)> {
        self.compile_stage(plan, child(plan, stage, 0)?, ctx)
    }

    fn compile_stage(
        &self,
        plan: &Plan,
        stage: NodeId,
        ctx: &Layout,
    ) -> Result<(Arc<dyn Operator>, Layout)> {
        match plan.kind(stage) {
            NodeKind::Start => Ok((Arc::new(StartOp), ctx.clone())),
            NodeKind::ForBind => {
                let (input, mut layout) = self.compile_input(plan, stage, ctx)?;
                let source_node = plan
                    .last_child(stage)
                    .ok_or(SylvaError::Malformed("for without source"))?;
                let source = self.compile_expr(plan, source_node, &layout)?;
                let check = self.check_slot(plan, stage, &layout)?;
                let var = pipeline::binding_var(plan, stage)
                    .ok_or(SylvaError::Malformed("for without variable"))?;
                let pos = pipeline::position_var(plan, stage);
                layout.push(var.clone());
                if let Some(pos) = &pos {
                    layout.push(pos.clone());
                }
                let op = ForBindOp {
                    input,
                    var,
                    pos,
                    source,
                    check,
                };
                Ok((Arc::new(op), layout))
            }
            NodeKind::LetBind => {
                let (input, mut layout) = self.compile_input(plan, stage, ctx)?;
                let var = pipeline::binding_var(plan, stage)
                    .ok_or(SylvaError::Malformed("let without variable"))?;
                let live = plan
                    .vars_property(stage, props::PROJECT)
                    .map(|project| project.contains(&var))
                    .unwrap_or(true);
                let (expr, check) = if live {
                    let expr = self.compile_expr(plan, child(plan, stage, 2)?, &layout)?;
                    (Some(expr), self.check_slot(plan, stage, &layout)?)
                } else {
                    debug!(var = %var, "compile.let.disabled");
                    (None, None)
                };
                layout.push(var.clone());
                let op = LetBindOp {
                    input,
                    var,
                    expr,
                    check,
                };
                Ok((Arc::new(op), layout))
            }
            NodeKind::Selection => {
                let (input, layout) = self.compile_input(plan, stage, ctx)?;
                let predicate = self.compile_expr(plan, child(plan, stage, 1)?, &layout)?;
                Ok((Arc::new(SelectOp { input, predicate }), layout))
            }
            NodeKind::OrderBy => {
                let upstream = child(plan, stage, 0)?;
                let (input, layout) = self.compile_stage(plan, upstream, ctx)?;
                let (input, layout) = self.trim(plan, upstream, input, layout);
                let keys = plan
                    .children(stage)
                    .iter()
                    .skip(1)
                    .map(|spec| {
                        let order = match plan.value(*spec) {
                            NodeValue::Order(order) => *order,
                            _ => return Err(SylvaError::Malformed("order spec without direction")),
                        };
                        Ok((self.compile_expr(plan, child(plan, *spec, 0)?, &layout)?, order))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((Arc::new(OrderByOp { input, keys }), layout))
            }
            NodeKind::GroupBy => {
                let (input, layout) = self.compile_input(plan, stage, ctx)?;
                let keys = pipeline::group_keys(plan, stage)
                    .into_iter()
                    .map(|key| Ok((key.clone(), slot_of(&layout, &key)?)))
                    .collect::<Result<Vec<_>>>()?;
                let aggregates = pipeline::group_aggregates(plan, stage)
                    .into_iter()
                    .map(|(target, source)| Ok((target, slot_of(&layout, &source)?)))
                    .collect::<Result<Vec<_>>>()?;
                let out = layout.with_locals(
                    keys.iter()
                        .map(|(k, _)| k.clone())
                        .chain(aggregates.iter().map(|(t, _)| t.clone())),
                );
                let op = GroupByOp {
                    input,
                    keys,
                    aggregates,
                };
                Ok((Arc::new(op), out))
            }
            NodeKind::Count => {
                let (input, mut layout) = self.compile_input(plan, stage, ctx)?;
                let var = pipeline::binding_var(plan, stage)
                    .ok_or(SylvaError::Malformed("count without variable"))?;
                layout.push(var.clone());
                Ok((Arc::new(CountOp { input, var }), layout))
            }
            NodeKind::Join => self.compile_join(plan, stage, ctx),
            other => Err(SylvaError::MalformedOwned(format!(
                "{other:?} #{} is not a pipeline stage",
                stage.0
            ))),
        }
    }

    fn compile_join(
        &self,
        plan: &Plan,
        join: NodeId,
        ctx: &Layout,
    ) -> Result<(Arc<dyn Operator>, Layout)> {
        let (left_tail, keys, right_tail) = (child(plan, join, 0)?, child(plan, join, 1)?, child(plan, join, 2)?);
        let NodeValue::Cmp(cmp) = plan.value(keys) else {
            return Err(SylvaError::Malformed("join without comparison"));
        };
        let (left, left_layout) = self.compile_stage(plan, left_tail, ctx)?;
        let (left, left_layout) = self.trim(plan, left_tail, left, left_layout);
        let (right, right_layout) = self.compile_stage(plan, right_tail, ctx)?;
        let (right, right_layout) = self.trim(plan, right_tail, right, right_layout);
        let left_key = self.compile_expr(plan, child(plan, keys, 0)?, &left_layout)?;
        let right_key = self.compile_expr(plan, child(plan, keys, 1)?, &right_layout)?;

        let mut layout = left_layout;
        for var in right_layout.locals() {
            layout.push(var.clone());
        }
        let op = JoinOp {
            left,
            right,
            left_key,
            right_key,
            cmp: *cmp,
            left_join: plan.flag(join, props::LEFT_JOIN),
            skip_sort: plan.flag(join, props::SKIP_SORT),
            ctx_len: ctx.ctx_len(),
            right_width: right_layout.locals().len(),
        };
        debug!(strategy = ?op.strategy(), join = join.0, "compile.join");
        Ok((Arc::new(op), layout))
    }
}

/// Serializable query: a plan document plus its external bindings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryDocument {
    /// Values of external variables, by bare name.
    #[serde(default)]
    pub bindings: BTreeMap<String, Vec<Item>>,
    /// Plan tree.
    pub plan: NodeSpec,
}

impl QueryDocument {
    /// External variables in name order.
    pub fn externals(&self) -> Vec<Var> {
        self.bindings.keys().map(|name| Var::new(name.as_str())).collect()
    }

    /// Bindings keyed by variable.
    pub fn external_bindings(&self) -> ExternalBindings {
        self.bindings
            .iter()
            .map(|(name, items)| (Var::new(name.as_str()), Sequence::from_items(items.clone())))
            .collect()
    }
}

/// A plan after rewriting, projection and compilation.
#[derive(Debug)]
pub struct PreparedQuery {
    /// The rewritten (and annotated) plan.
    pub plan: Plan,
    /// Per-pass rewrite reports.
    pub rewrites: RewriteReport,
    /// Stages annotated by projection (0 when projection is off).
    pub projected: usize,
    /// Executable form.
    pub compiled: CompiledQuery,
}

/// Runs the optimizer, projection (when enabled) and the compiler.
pub fn prepare(
    mut plan: Plan,
    config: &OptimizerConfig,
    registry: &FunctionRegistry,
    externals: &[Var],
) -> Result<PreparedQuery> {
    let rewrites = optimize(&mut plan, config)?;
    pipeline::validate(&plan)?;
    let projected = if config.projection {
        projection::project(&mut plan)?
    } else {
        0
    };
    let compiled = Compiler::new(registry).compile(&plan, externals)?;
    Ok(PreparedQuery {
        plan,
        rewrites,
        projected,
        compiled,
    })
}
