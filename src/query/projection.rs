//! Backward liveness over pipelines: annotates every stage with the bindings
//! of its output that something downstream reads.
//!
//! Scopes nest in pipeline order. Each stage binds its variables in the scope
//! opened for its continuation; the continuation is walked inside it, and on
//! close the used locals plus the references that escaped the scope become
//! the stage's `project` property. A `LetBind` whose variable is not in its
//! own `project` will never be evaluated, so its expression is resolved only
//! when the binding is live.
//!
//! Joins are walked twice. A speculative pass collects, for the output, the
//! two keys and the two inputs, what each would need; speculative scopes
//! accept any unresolved name as a candidate without consulting enclosing
//! scopes, and no annotation is written while one is open. The committed pass
//! then walks both inputs with fixed candidate sets and the output.
//!
//! Expression layouts assumed beyond the pipeline stages:
//!
//! | kind            | children                                      |
//! |-----------------|-----------------------------------------------|
//! | QuantifiedExpr  | `[Variable, expr]+, satisfies`                |
//! | TypeSwitch      | `[operand, TypeSwitchCase+]`                  |
//! | TypeSwitchCase  | `[Variable?, SequenceType?, return]`          |
//! | TransformExpr   | `[CopyBinding+, modify, return]`              |
//! | CopyBinding     | `[Variable, expr]`                            |
//! | TryCatchExpr    | `[try, CatchClause*]`                         |
//! | CatchClause     | `[Variable*, expr]`                           |
//! | FilterExpr      | `[base, predicate*]`                          |

use tracing::{debug, trace};

use crate::query::ast::{props, NodeId, NodeKind, Plan, PropValue, Var};
use crate::query::pipeline::{self, Downstream};
use crate::query::profile::{profile_timer, record_profile_timer, QueryProfileKind};
use crate::query::walker::{Visit, WalkContext, Walker};
use crate::types::{Result, SylvaError};

/// Name bound to the context item inside predicates.
pub const CONTEXT_ITEM: &str = "fs:dot";
/// Name bound to the context position inside filter predicates.
pub const CONTEXT_POSITION: &str = "fs:position";
/// Name bound to the context size inside filter predicates.
pub const CONTEXT_SIZE: &str = "fs:last";

/// Whether a scope consults its parents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeMode {
    /// Unresolved names are recorded and looked up in the enclosing scope.
    Committed,
    /// Unresolved names are recorded as candidates; lookup stops here.
    Speculative,
}

#[derive(Debug)]
struct Scope {
    mode: ScopeMode,
    locals: Vec<(Var, bool)>,
    externals: Vec<Var>,
}

/// What a closed scope handed back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClosedScope {
    /// Locals that were read, in binding order.
    pub used: Vec<Var>,
    /// Names resolved outside the scope, in first-use order.
    pub externals: Vec<Var>,
}

impl ClosedScope {
    /// Used locals followed by externals, without duplicates.
    pub fn demand(&self) -> Vec<Var> {
        let mut out: Vec<Var> = Vec::with_capacity(self.used.len() + self.externals.len());
        for var in self.used.iter().chain(&self.externals) {
            if !out.contains(var) {
                out.push(var.clone());
            }
        }
        out
    }
}

/// Stack of binding scopes.
#[derive(Debug, Default)]
pub struct BindingTable {
    scopes: Vec<Scope>,
    speculative: usize,
}

impl BindingTable {
    /// Empty table; names resolved with no scope open are ignored.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a scope.
    pub fn open(&mut self, mode: ScopeMode) {
        if mode == ScopeMode::Speculative {
            self.speculative += 1;
        }
        self.scopes.push(Scope {
            mode,
            locals: Vec::new(),
            externals: Vec::new(),
        });
    }

    /// Binds `var` in the innermost scope.
    pub fn bind(&mut self, var: Var) -> Result<()> {
        let scope = self
            .scopes
            .last_mut()
            .ok_or(SylvaError::Malformed("binding outside any scope"))?;
        scope.locals.push((var, false));
        Ok(())
    }

    /// Marks `var` as read, recording it as external in every scope crossed.
    pub fn resolve(&mut self, var: &Var) {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(local) = scope.locals.iter_mut().rev().find(|(v, _)| v == var) {
                local.1 = true;
                return;
            }
            if scope.externals.contains(var) {
                return;
            }
            scope.externals.push(var.clone());
            if scope.mode == ScopeMode::Speculative {
                return;
            }
        }
    }

    /// Closes the innermost scope.
    pub fn close(&mut self) -> Result<ClosedScope> {
        let scope = self
            .scopes
            .pop()
            .ok_or(SylvaError::Malformed("closing a scope that was never opened"))?;
        if scope.mode == ScopeMode::Speculative {
            self.speculative -= 1;
        }
        let mut used = Vec::new();
        for (var, read) in scope.locals {
            if read {
                used.push(var);
            } else {
                trace!(var = %var, "projection.unused_binding");
            }
        }
        Ok(ClosedScope {
            used,
            externals: scope.externals,
        })
    }

    /// Whether annotations may be written (no speculative scope open).
    pub fn committed(&self) -> bool {
        self.speculative == 0
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

/// Projection analysis as a walker: each top-level pipeline is analysed by
/// its own nested traversal.
#[derive(Debug, Default)]
pub struct Projection {
    table: BindingTable,
    annotated: usize,
}

impl Projection {
    /// Fresh analysis.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stages annotated so far.
    pub fn annotated(&self) -> usize {
        self.annotated
    }

    fn annotate(&mut self, plan: &mut Plan, stage: NodeId, vars: Vec<Var>) {
        if self.table.committed() {
            plan.set_property(stage, props::PROJECT, PropValue::Vars(vars));
            self.annotated += 1;
        }
    }

    fn speculate(
        &mut self,
        plan: &mut Plan,
        walk: impl FnOnce(&mut Self, &mut Plan) -> Result<()>,
    ) -> Result<Vec<Var>> {
        self.table.open(ScopeMode::Speculative);
        let walked = walk(self, plan);
        let closed = self.table.close()?;
        walked?;
        Ok(closed.externals)
    }

    fn walk_pipe(&mut self, plan: &mut Plan, pipe: NodeId) -> Result<()> {
        let end = pipeline::end_of(plan, pipe)
            .ok_or(SylvaError::Malformed("pipe expression without end"))?;
        let tail = plan
            .child(end, 0)
            .ok_or(SylvaError::Malformed("end without input"))?;
        self.table.open(ScopeMode::Committed);
        let walked = self.walk_input(plan, tail, &[]);
        self.table.close()?;
        walked
    }

    /// Walks the chain ending at `tail`, whose consumer reads `candidates`.
    fn walk_input(&mut self, plan: &mut Plan, tail: NodeId, candidates: &[Var]) -> Result<()> {
        let entry = pipeline::entry(plan, tail);
        self.walk_stage(plan, entry, candidates)
    }

    fn walk_downstream(&mut self, plan: &mut Plan, stage: NodeId, candidates: &[Var]) -> Result<()> {
        match pipeline::downstream(plan, stage)? {
            Downstream::End(end) => match plan.child(end, 1) {
                Some(ret) => self.walk_expr(plan, ret),
                None => {
                    candidates.iter().for_each(|v| self.table.resolve(v));
                    Ok(())
                }
            },
            Downstream::JoinInput(_) => {
                candidates.iter().for_each(|v| self.table.resolve(v));
                Ok(())
            }
            Downstream::Stage(next) => self.walk_stage(plan, next, candidates),
        }
    }

    fn walk_stage(&mut self, plan: &mut Plan, stage: NodeId, candidates: &[Var]) -> Result<()> {
        let kind = plan.kind(stage);
        match kind {
            NodeKind::Join => return self.walk_join(plan, stage, candidates),
            NodeKind::ForBind => {
                if let Some(source) = plan.last_child(stage) {
                    self.walk_expr(plan, source)?;
                }
                self.resolve_check(plan, stage);
            }
            NodeKind::Selection => {
                if let Some(pred) = plan.child(stage, 1) {
                    self.walk_expr(plan, pred)?;
                }
            }
            NodeKind::OrderBy => {
                for expr in pipeline::stage_expressions(plan, stage) {
                    self.walk_expr(plan, expr)?;
                }
            }
            NodeKind::GroupBy => {
                for key in pipeline::group_keys(plan, stage) {
                    self.table.resolve(&key);
                }
                for (_, source) in pipeline::group_aggregates(plan, stage) {
                    self.table.resolve(&source);
                }
            }
            NodeKind::Start | NodeKind::LetBind | NodeKind::Count => {}
            other => {
                return Err(SylvaError::MalformedOwned(format!(
                    "{other:?} #{} is not a pipeline stage",
                    stage.0
                )))
            }
        }

        self.table.open(ScopeMode::Committed);
        for var in pipeline::bound_vars(plan, stage) {
            self.table.bind(var)?;
        }
        self.walk_downstream(plan, stage, candidates)?;
        let closed = self.table.close()?;
        let demand = closed.demand();

        if kind == NodeKind::LetBind {
            let live = pipeline::binding_var(plan, stage)
                .map(|v| demand.contains(&v))
                .unwrap_or(false);
            if live {
                if let Some(expr) = plan.child(stage, 2) {
                    self.walk_expr(plan, expr)?;
                }
                self.resolve_check(plan, stage);
            }
        }
        self.annotate(plan, stage, demand);
        Ok(())
    }

    fn resolve_check(&mut self, plan: &Plan, stage: NodeId) {
        if let Some(check) = plan.var_property(stage, props::CHECK) {
            let check = check.clone();
            self.table.resolve(&check);
        }
    }

    fn walk_join(&mut self, plan: &mut Plan, join: NodeId, candidates: &[Var]) -> Result<()> {
        let (Some(left), Some(keys), Some(right)) =
            (plan.child(join, 0), plan.child(join, 1), plan.child(join, 2))
        else {
            return Err(SylvaError::Malformed("join needs left input, keys and right input"));
        };
        let (Some(left_key), Some(right_key)) = (plan.child(keys, 0), plan.child(keys, 1)) else {
            return Err(SylvaError::Malformed("join keys need two operands"));
        };

        let out_need = self.speculate(plan, |p, plan| p.walk_downstream(plan, join, candidates))?;
        let left_a = self.speculate(plan, |p, plan| p.walk_expr(plan, left_key))?;
        let right_a = self.speculate(plan, |p, plan| p.walk_expr(plan, right_key))?;
        let left_want = union(&out_need, &left_a);
        let right_want = union(&out_need, &right_a);
        let left_b = self.speculate(plan, |p, plan| p.walk_input(plan, left, &left_want))?;
        let right_b = self.speculate(plan, |p, plan| p.walk_input(plan, right, &right_want))?;

        // Output names the right input produces go right (its bindings come
        // later in the joined row); the left input takes the rest.
        let mut right_proj = right_a.clone();
        for var in &out_need {
            if !right_b.contains(var) && !right_proj.contains(var) {
                right_proj.push(var.clone());
            }
        }
        let mut left_proj = left_a.clone();
        for var in &out_need {
            if !right_proj.contains(var) && !left_proj.contains(var) {
                left_proj.push(var.clone());
            }
        }
        debug!(
            join = join.0,
            left = left_proj.len(),
            right = right_proj.len(),
            "projection.join.merge"
        );

        self.walk_input(plan, left, &left_proj)?;
        self.walk_input(plan, right, &right_proj)?;

        self.table.open(ScopeMode::Committed);
        for var in left_proj.iter().filter(|v| !left_b.contains(v)) {
            self.table.bind(var.clone())?;
        }
        for var in right_proj.iter().filter(|v| !right_b.contains(v)) {
            self.table.bind(var.clone())?;
        }
        self.walk_expr(plan, left_key)?;
        self.walk_expr(plan, right_key)?;
        self.table.open(ScopeMode::Committed);
        self.walk_downstream(plan, join, candidates)?;
        let closed = self.table.close()?;
        self.annotate(plan, join, closed.externals);
        self.table.close()?;
        Ok(())
    }

    fn walk_children(&mut self, plan: &mut Plan, node: NodeId, from: usize) -> Result<()> {
        let children = plan.children(node).to_vec();
        for child in children.into_iter().skip(from) {
            self.walk_expr(plan, child)?;
        }
        Ok(())
    }

    /// Walks `body` in a scope binding `vars`.
    fn walk_scoped(&mut self, plan: &mut Plan, vars: Vec<Var>, body: &[NodeId]) -> Result<()> {
        self.table.open(ScopeMode::Committed);
        for var in vars {
            self.table.bind(var)?;
        }
        for node in body {
            self.walk_expr(plan, *node)?;
        }
        self.table.close()?;
        Ok(())
    }

    fn declared(plan: &Plan, nodes: &[NodeId]) -> Vec<Var> {
        nodes
            .iter()
            .filter(|n| plan.kind(**n) == NodeKind::Variable)
            .filter_map(|n| plan.var(*n).cloned())
            .collect()
    }

    fn walk_expr(&mut self, plan: &mut Plan, node: NodeId) -> Result<()> {
        let children = plan.children(node).to_vec();
        match plan.kind(node) {
            NodeKind::VariableRef => {
                if let Some(var) = plan.var(node).cloned() {
                    self.table.resolve(&var);
                }
            }
            NodeKind::ContextItemExpr => self.table.resolve(&Var::from(CONTEXT_ITEM)),
            NodeKind::PipeExpr => self.walk_pipe(plan, node)?,
            NodeKind::PathExpr => {
                if let Some(base) = children.first() {
                    self.walk_expr(plan, *base)?;
                }
                for step in children.iter().skip(1) {
                    let predicates: Vec<NodeId> = plan.children(*step).iter().skip(2).copied().collect();
                    self.walk_scoped(plan, vec![Var::from(CONTEXT_ITEM)], &predicates)?;
                }
            }
            NodeKind::FilterExpr => {
                if let Some(base) = children.first() {
                    self.walk_expr(plan, *base)?;
                }
                let focus = [CONTEXT_ITEM, CONTEXT_POSITION, CONTEXT_SIZE]
                    .into_iter()
                    .map(Var::from)
                    .collect();
                self.walk_scoped(plan, focus, &children[children.len().min(1)..])?;
            }
            NodeKind::QuantifiedExpr => {
                let Some((satisfies, bindings)) = children.split_last() else {
                    return Ok(());
                };
                let mut opened = 0;
                for pair in bindings.chunks(2) {
                    if let [decl, source] = pair {
                        self.walk_expr(plan, *source)?;
                        self.table.open(ScopeMode::Committed);
                        opened += 1;
                        if let Some(var) = plan.var(*decl).cloned() {
                            self.table.bind(var)?;
                        }
                    }
                }
                self.walk_expr(plan, *satisfies)?;
                for _ in 0..opened {
                    self.table.close()?;
                }
            }
            NodeKind::TypeSwitch => {
                if let Some(operand) = children.first() {
                    self.walk_expr(plan, *operand)?;
                }
                for case in children.iter().skip(1) {
                    let parts = plan.children(*case).to_vec();
                    let body: Vec<NodeId> = parts.last().copied().into_iter().collect();
                    self.walk_scoped(plan, Self::declared(plan, &parts), &body)?;
                }
            }
            NodeKind::TransformExpr => {
                let copies: Vec<NodeId> = children
                    .iter()
                    .copied()
                    .filter(|c| plan.kind(*c) == NodeKind::CopyBinding)
                    .collect();
                self.table.open(ScopeMode::Committed);
                for copy in &copies {
                    if let Some(source) = plan.child(*copy, 1) {
                        self.walk_expr(plan, source)?;
                    }
                    if let Some(var) = plan.child(*copy, 0).and_then(|d| plan.var(d).cloned()) {
                        self.table.bind(var)?;
                    }
                }
                for body in children.iter().skip(copies.len()) {
                    self.walk_expr(plan, *body)?;
                }
                self.table.close()?;
            }
            NodeKind::TryCatchExpr => {
                if let Some(body) = children.first() {
                    self.walk_expr(plan, *body)?;
                }
                for clause in children.iter().skip(1) {
                    let parts = plan.children(*clause).to_vec();
                    let body: Vec<NodeId> = parts.last().copied().into_iter().collect();
                    self.walk_scoped(plan, Self::declared(plan, &parts), &body)?;
                }
            }
            NodeKind::DocumentConstructor | NodeKind::ElementConstructor => {
                self.walk_children(plan, node, 0)?;
            }
            _ => self.walk_children(plan, node, 0)?,
        }
        Ok(())
    }
}

fn union(a: &[Var], b: &[Var]) -> Vec<Var> {
    let mut out = a.to_vec();
    for var in b {
        if !out.contains(var) {
            out.push(var.clone());
        }
    }
    out
}

impl Walker for Projection {
    fn name(&self) -> &'static str {
        "projection"
    }

    fn visit(&mut self, plan: &mut Plan, node: NodeId, _cx: &mut WalkContext) -> Result<Visit> {
        if plan.kind(node) != NodeKind::PipeExpr {
            return Ok(Visit::Descend(node));
        }
        self.walk_pipe(plan, node)?;
        Ok(Visit::Skip)
    }
}

/// Annotates every pipeline stage of `plan` with its `project` set.
pub fn project(plan: &mut Plan) -> Result<usize> {
    let start = profile_timer();
    let mut analysis = Projection::new();
    crate::query::walker::walk(&mut analysis, plan, 1)?;
    record_profile_timer(QueryProfileKind::Projection, start);
    debug!(stages = analysis.annotated(), "projection.done");
    Ok(analysis.annotated())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ast::{NodeSpec, NodeValue};
    use crate::query::builder::{arith, eq, int, seq, var, Flwor};
    use crate::query::value::{ArithOp, CmpOp, Comparison};

    fn projected(spec: &NodeSpec) -> Plan {
        let mut plan = Plan::from_spec(spec).expect("valid plan");
        project(&mut plan).expect("projection runs");
        plan
    }

    fn stage_binding(plan: &Plan, name: &str) -> NodeId {
        plan.subtree(plan.root())
            .into_iter()
            .find(|n| plan.kind(*n).is_stage() && pipeline::binding_var(plan, *n) == Some(Var::from(name)))
            .expect("stage present")
    }

    fn names(plan: &Plan, stage: NodeId) -> Vec<String> {
        plan.vars_property(stage, props::PROJECT)
            .expect("annotated")
            .iter()
            .map(|v| v.0.clone())
            .collect()
    }

    #[test]
    fn unused_let_is_excluded_from_its_own_projection() {
        let spec = Flwor::new()
            .for_("a", seq([int(1), int(2), int(3)]))
            .let_("b", var("a"))
            .let_("c", arith(ArithOp::Mul, var("a"), int(2)))
            .return_(var("b"))
            .expect("builds");
        let plan = projected(&spec);
        assert_eq!(names(&plan, stage_binding(&plan, "c")), ["b"]);
        assert_eq!(names(&plan, stage_binding(&plan, "b")), ["b"]);
        assert_eq!(names(&plan, stage_binding(&plan, "a")), ["a"]);
    }

    #[test]
    fn dead_let_chains_release_their_inputs() {
        let spec = Flwor::new()
            .for_("a", seq([int(1), int(2)]))
            .let_("b", var("a"))
            .let_("c", var("b"))
            .return_(int(0))
            .expect("builds");
        let plan = projected(&spec);
        assert!(names(&plan, stage_binding(&plan, "c")).is_empty());
        assert!(names(&plan, stage_binding(&plan, "b")).is_empty());
        assert!(names(&plan, stage_binding(&plan, "a")).is_empty());
    }

    #[test]
    fn join_inputs_keep_only_keys_and_output_bindings() {
        let right = Flwor::new()
            .for_("y", seq([int(1), int(2)]))
            .let_("w", arith(ArithOp::Add, var("y"), int(10)))
            .let_("unused_right", int(0));
        let spec = Flwor::new()
            .for_("x", seq([int(1), int(2)]))
            .let_("unused_left", int(0))
            .join(
                right,
                Comparison::General(CmpOp::Eq),
                var("x"),
                var("y"),
                false,
            )
            .return_(seq([var("x"), var("w")]))
            .expect("builds");
        let plan = projected(&spec);
        let mut left = names(&plan, stage_binding(&plan, "unused_left"));
        left.sort();
        assert_eq!(left, ["x"]);
        let mut right = names(&plan, stage_binding(&plan, "unused_right"));
        right.sort();
        assert_eq!(right, ["w", "y"]);
        let join = plan
            .subtree(plan.root())
            .into_iter()
            .find(|n| plan.kind(*n) == NodeKind::Join)
            .expect("join");
        let mut out = names(&plan, join);
        out.sort();
        assert_eq!(out, ["w", "x"]);
    }

    #[test]
    fn outer_names_used_by_a_join_key_reach_the_enclosing_pipeline() {
        let inner = Flwor::new()
            .for_("x", seq([int(1), int(2)]))
            .join(
                Flwor::new().for_("y", seq([int(2), int(3)])),
                Comparison::General(CmpOp::Eq),
                arith(ArithOp::Add, var("x"), var("g")),
                var("y"),
                false,
            )
            .return_(var("y"))
            .expect("inner builds");
        let spec = Flwor::new()
            .for_("g", seq([int(0), int(1)]))
            .let_("h", int(5))
            .return_(inner)
            .expect("outer builds");
        let plan = projected(&spec);
        assert_eq!(names(&plan, stage_binding(&plan, "h")), ["g"]);
    }

    #[test]
    fn predicate_scopes_bind_the_context_item() {
        let step = NodeSpec::new(NodeKind::StepExpr).with_children([
            NodeSpec::new(NodeKind::AxisSpec).with_value(NodeValue::Axis(crate::query::ast::Axis::Child)),
            crate::query::builder::name_test("b"),
            eq(NodeSpec::new(NodeKind::ContextItemExpr), var("k")),
        ]);
        let path = NodeSpec::new(NodeKind::PathExpr).with_children([var("d"), step]);
        let spec = Flwor::new()
            .for_("d", seq([int(1)]))
            .let_("k", int(1))
            .let_("p", path)
            .return_(var("p"))
            .expect("builds");
        let plan = projected(&spec);
        let mut needed = names(&plan, stage_binding(&plan, "k"));
        needed.sort();
        assert_eq!(needed, ["d", "k"]);
    }

    #[test]
    fn speculative_scopes_stop_lookup_and_block_writes() {
        let mut table = BindingTable::new();
        table.open(ScopeMode::Committed);
        table.bind(Var::from("a")).expect("bind");
        table.open(ScopeMode::Speculative);
        assert!(!table.committed());
        table.resolve(&Var::from("a"));
        let closed = table.close().expect("close");
        assert_eq!(closed.externals, [Var::from("a")]);
        assert!(table.committed());
        let outer = table.close().expect("close");
        assert!(outer.used.is_empty());
        assert!(table.close().is_err());
    }
}
