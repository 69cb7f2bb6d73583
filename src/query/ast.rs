//! Arena-backed plan tree shared by every rewrite pass, the projection
//! analysis and the compiler.
//!
//! Nodes are addressed by stable [`NodeId`] indices and link to their parent
//! and children by index. Rewrites detach and re-attach subtrees in place;
//! detached nodes stay in the arena but are no longer reachable from the root.
//!
//! Pipelines are stored input-first: child 0 of every stage is the stage that
//! feeds it, so walking towards the root walks downstream. `Start` is the leaf
//! of every pipeline (and of each join input), `End` its root:
//!
//! | kind      | children                                                   |
//! |-----------|------------------------------------------------------------|
//! | PipeExpr  | `[End]`                                                    |
//! | End       | `[input, return?]`                                         |
//! | ForBind   | `[input, Variable, PosVariable?, source]`                  |
//! | LetBind   | `[input, Variable, expr]`                                  |
//! | Selection | `[input, predicate]`                                       |
//! | OrderBy   | `[input, OrderSpec+]`, each OrderSpec `[expr]`             |
//! | GroupBy   | `[input, GroupSpec*, AggregateSpec*]`                      |
//! | Count     | `[input, Variable]`                                        |
//! | Join      | `[left, JoinExpr [left-key, right-key], right]`            |

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::value::{ArithOp, Comparison, Item};
use crate::types::{Result, SylvaError};

/// Name of a variable binding. Shadowing is legal; the latest binding wins.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Var(pub String);

impl Var {
    /// Creates a variable name.
    pub fn new(name: impl Into<String>) -> Self {
        Var(name.into())
    }

    /// Bare name without the `$` sigil.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

impl From<&str> for Var {
    fn from(value: &str) -> Self {
        Var(value.to_owned())
    }
}

/// Stable index of a node inside a [`Plan`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Closed set of plan node kinds.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    // pipelines
    PipeExpr,
    Start,
    End,
    ForBind,
    LetBind,
    Selection,
    OrderBy,
    OrderSpec,
    GroupBy,
    GroupSpec,
    AggregateSpec,
    Count,
    Join,
    JoinExpr,
    Variable,
    PosVariable,
    // expressions
    Literal,
    EmptySequence,
    SequenceExpr,
    RangeExpr,
    ArithmeticExpr,
    ComparisonExpr,
    AndExpr,
    OrExpr,
    IfExpr,
    FunctionCall,
    VariableRef,
    ContextItemExpr,
    PathExpr,
    StepExpr,
    AxisSpec,
    NameTest,
    KindTestAnyKind,
    FilterExpr,
    QuantifiedExpr,
    TypeSwitch,
    TypeSwitchCase,
    SequenceType,
    TransformExpr,
    CopyBinding,
    TryCatchExpr,
    CatchClause,
    DocumentConstructor,
    ElementConstructor,
}

impl NodeKind {
    /// Whether the kind is a pipeline stage (has an input at child 0, or is `Start`).
    pub fn is_stage(self) -> bool {
        matches!(
            self,
            NodeKind::Start
                | NodeKind::ForBind
                | NodeKind::LetBind
                | NodeKind::Selection
                | NodeKind::OrderBy
                | NodeKind::GroupBy
                | NodeKind::Count
                | NodeKind::Join
        )
    }
}

/// Navigation axis of a path step.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Attribute,
    SelfAxis,
    Parent,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
}

impl Axis {
    /// Surface name of the axis.
    pub fn name(self) -> &'static str {
        match self {
            Axis::Child => "child",
            Axis::Descendant => "descendant",
            Axis::DescendantOrSelf => "descendant-or-self",
            Axis::Attribute => "attribute",
            Axis::SelfAxis => "self",
            Axis::Parent => "parent",
            Axis::Ancestor => "ancestor",
            Axis::AncestorOrSelf => "ancestor-or-self",
            Axis::FollowingSibling => "following-sibling",
            Axis::PrecedingSibling => "preceding-sibling",
            Axis::Following => "following",
            Axis::Preceding => "preceding",
        }
    }
}

/// Direction of an order-by key.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Quantifier of a quantified expression.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Quantifier {
    Some,
    Every,
}

/// Optional literal payload of a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum NodeValue {
    /// No payload.
    #[default]
    None,
    /// Variable name (declarations and references).
    Var(Var),
    /// Function or node-test name.
    Name(String),
    /// Integer literal.
    Int(i64),
    /// Double literal.
    Dbl(f64),
    /// String literal.
    Str(String),
    /// Boolean literal.
    Bool(bool),
    /// Path axis.
    Axis(Axis),
    /// Comparison operator.
    Cmp(Comparison),
    /// Arithmetic operator.
    Arith(ArithOp),
    /// Sort direction.
    Order(SortOrder),
    /// Quantifier.
    Quantifier(Quantifier),
}

impl NodeValue {
    /// Whether the payload is absent.
    pub fn is_none(&self) -> bool {
        matches!(self, NodeValue::None)
    }

    /// Literal payload as an item.
    pub fn as_item(&self) -> Option<Item> {
        match self {
            NodeValue::Int(v) => Some(Item::Int(*v)),
            NodeValue::Dbl(v) => Some(Item::Dbl(*v)),
            NodeValue::Str(v) => Some(Item::Str(v.clone())),
            NodeValue::Bool(v) => Some(Item::Bool(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeValue::None => Ok(()),
            NodeValue::Var(v) => write!(f, "{v}"),
            NodeValue::Name(n) => write!(f, "{n}"),
            NodeValue::Int(v) => write!(f, "{v}"),
            NodeValue::Dbl(v) => write!(f, "{v:?}"),
            NodeValue::Str(v) => write!(f, "\"{v}\""),
            NodeValue::Bool(v) => write!(f, "{v}"),
            NodeValue::Axis(a) => write!(f, "{}", a.name()),
            NodeValue::Cmp(c) => write!(f, "{}", c.symbol()),
            NodeValue::Arith(a) => write!(f, "{}", a.symbol()),
            NodeValue::Order(SortOrder::Ascending) => write!(f, "ascending"),
            NodeValue::Order(SortOrder::Descending) => write!(f, "descending"),
            NodeValue::Quantifier(Quantifier::Some) => write!(f, "some"),
            NodeValue::Quantifier(Quantifier::Every) => write!(f, "every"),
        }
    }
}

/// Property annotation value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    /// Flag.
    Bool(bool),
    /// Single variable.
    Var(Var),
    /// Ordered variable set.
    Vars(Vec<Var>),
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Var(v) => write!(f, "{v}"),
            PropValue::Vars(vars) => {
                write!(f, "[")?;
                for (idx, var) in vars.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{var}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Property keys understood by the passes and the compiler.
pub mod props {
    /// Join keeps unmatched outer rows (set on joins produced from `let`).
    pub const LEFT_JOIN: &str = "leftJoin";
    /// Order of right-input matches is unobservable downstream.
    pub const SKIP_SORT: &str = "skipSort";
    /// Bindings of a stage's output consumed downstream.
    pub const PROJECT: &str = "project";
    /// Variable whose emptiness short-circuits the stage.
    pub const CHECK: &str = "check";
    /// Pending regrouping `[target, source]` left on a join for group emission.
    pub const REGROUP: &str = "regroup";
}

#[derive(Clone, Debug)]
struct PlanNode {
    kind: NodeKind,
    value: NodeValue,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    properties: BTreeMap<String, PropValue>,
}

/// Plan tree arena.
#[derive(Clone, Debug)]
pub struct Plan {
    nodes: Vec<PlanNode>,
    root: NodeId,
    fresh: u32,
}

impl Plan {
    /// Creates a plan consisting of a single root node.
    pub fn new(kind: NodeKind, value: NodeValue) -> Self {
        let mut plan = Plan {
            nodes: Vec::new(),
            root: NodeId(0),
            fresh: 0,
        };
        plan.root = plan.add(kind, value);
        plan
    }

    /// Root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Adds a detached node.
    pub fn add(&mut self, kind: NodeKind, value: NodeValue) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(PlanNode {
            kind,
            value,
            parent: None,
            children: Vec::new(),
            properties: BTreeMap::new(),
        });
        id
    }

    /// Adds a detached node and attaches the supplied (detached) children.
    pub fn add_with(
        &mut self,
        kind: NodeKind,
        value: NodeValue,
        children: impl IntoIterator<Item = NodeId>,
    ) -> Result<NodeId> {
        let id = self.add(kind, value);
        for child in children {
            self.append_child(id, child)?;
        }
        Ok(id)
    }

    /// Kind of a node.
    pub fn kind(&self, id: NodeId) -> NodeKind {
        self.nodes[id.index()].kind
    }

    /// Payload of a node.
    pub fn value(&self, id: NodeId) -> &NodeValue {
        &self.nodes[id.index()].value
    }

    /// Replaces the payload of a node.
    pub fn set_value(&mut self, id: NodeId, value: NodeValue) {
        self.nodes[id.index()].value = value;
    }

    /// Variable payload, if any.
    pub fn var(&self, id: NodeId) -> Option<&Var> {
        match self.value(id) {
            NodeValue::Var(v) => Some(v),
            _ => None,
        }
    }

    /// Function or node-test name payload, if any.
    pub fn name(&self, id: NodeId) -> Option<&str> {
        match self.value(id) {
            NodeValue::Name(n) => Some(n),
            _ => None,
        }
    }

    /// Children in order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    /// Child at `idx`.
    pub fn child(&self, id: NodeId, idx: usize) -> Option<NodeId> {
        self.children(id).get(idx).copied()
    }

    /// Last child.
    pub fn last_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).last().copied()
    }

    /// Number of children.
    pub fn child_count(&self, id: NodeId) -> usize {
        self.children(id).len()
    }

    /// Parent link.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent
    }

    /// Position of a node among its parent's children.
    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    fn ensure_detached(&self, id: NodeId) -> Result<()> {
        if self.parent(id).is_some() || id == self.root {
            return Err(SylvaError::MalformedOwned(format!(
                "node {:?} #{} is already attached",
                self.kind(id),
                id.0
            )));
        }
        Ok(())
    }

    /// Appends a detached node as the last child.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.ensure_detached(child)?;
        self.nodes[parent.index()].children.push(child);
        self.nodes[child.index()].parent = Some(parent);
        Ok(())
    }

    /// Inserts a detached node at `idx`.
    pub fn insert_child(&mut self, parent: NodeId, idx: usize, child: NodeId) -> Result<()> {
        self.ensure_detached(child)?;
        if idx > self.child_count(parent) {
            return Err(SylvaError::Malformed("child index out of range"));
        }
        self.nodes[parent.index()].children.insert(idx, child);
        self.nodes[child.index()].parent = Some(parent);
        Ok(())
    }

    /// Detaches and returns the child at `idx`.
    pub fn remove_child(&mut self, parent: NodeId, idx: usize) -> Result<NodeId> {
        if idx >= self.child_count(parent) {
            return Err(SylvaError::Malformed("child index out of range"));
        }
        let child = self.nodes[parent.index()].children.remove(idx);
        self.nodes[child.index()].parent = None;
        Ok(child)
    }

    /// Swaps the child at `idx` for a detached node; returns the detached old child.
    pub fn replace_child(&mut self, parent: NodeId, idx: usize, new: NodeId) -> Result<NodeId> {
        self.ensure_detached(new)?;
        let old = *self
            .nodes[parent.index()]
            .children
            .get(idx)
            .ok_or(SylvaError::Malformed("child index out of range"))?;
        self.nodes[parent.index()].children[idx] = new;
        self.nodes[new.index()].parent = Some(parent);
        self.nodes[old.index()].parent = None;
        Ok(old)
    }

    /// Puts a detached node where `old` sits (in its parent, or as root).
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> Result<()> {
        if old == self.root {
            self.ensure_detached(new)?;
            self.root = new;
            return Ok(());
        }
        let parent = self
            .parent(old)
            .ok_or(SylvaError::Malformed("replacing a detached node"))?;
        let idx = self
            .index_in_parent(old)
            .ok_or(SylvaError::Malformed("parent link without child link"))?;
        self.replace_child(parent, idx, new)?;
        Ok(())
    }

    /// Deep copy of a subtree, returned detached.
    pub fn copy_subtree(&mut self, id: NodeId) -> NodeId {
        let copy = self.add(self.kind(id), self.value(id).clone());
        self.nodes[copy.index()].properties = self.nodes[id.index()].properties.clone();
        let children = self.children(id).to_vec();
        for child in children {
            let child_copy = self.copy_subtree(child);
            self.nodes[child_copy.index()].parent = Some(copy);
            self.nodes[copy.index()].children.push(child_copy);
        }
        copy
    }

    /// Property lookup.
    pub fn property(&self, id: NodeId, key: &str) -> Option<&PropValue> {
        self.nodes[id.index()].properties.get(key)
    }

    /// Boolean property; absent means false.
    pub fn flag(&self, id: NodeId, key: &str) -> bool {
        matches!(self.property(id, key), Some(PropValue::Bool(true)))
    }

    /// Single-variable property.
    pub fn var_property(&self, id: NodeId, key: &str) -> Option<&Var> {
        match self.property(id, key) {
            Some(PropValue::Var(v)) => Some(v),
            _ => None,
        }
    }

    /// Variable-set property.
    pub fn vars_property(&self, id: NodeId, key: &str) -> Option<&[Var]> {
        match self.property(id, key) {
            Some(PropValue::Vars(v)) => Some(v),
            _ => None,
        }
    }

    /// Sets a property, replacing any previous value.
    pub fn set_property(&mut self, id: NodeId, key: &str, value: PropValue) {
        self.nodes[id.index()]
            .properties
            .insert(key.to_owned(), value);
    }

    /// Removes a property.
    pub fn remove_property(&mut self, id: NodeId, key: &str) -> Option<PropValue> {
        self.nodes[id.index()].properties.remove(key)
    }

    /// All properties of a node.
    pub fn properties(&self, id: NodeId) -> &BTreeMap<String, PropValue> {
        &self.nodes[id.index()].properties
    }

    /// Pre-order list of the nodes in a subtree.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    /// Nodes reachable from the root.
    pub fn reachable_count(&self) -> usize {
        self.subtree(self.root).len()
    }

    /// Generates a variable name unused anywhere in the arena.
    ///
    /// Generated names contain `#`, which user variable names never do.
    pub fn fresh_var(&mut self, hint: &str) -> Var {
        loop {
            self.fresh += 1;
            let candidate = Var(format!("#{hint}{}", self.fresh));
            let taken = self
                .nodes
                .iter()
                .any(|node| matches!(&node.value, NodeValue::Var(v) if *v == candidate));
            if !taken {
                return candidate;
            }
        }
    }

    /// Builds a plan from its document form and validates its shape.
    pub fn from_spec(spec: &NodeSpec) -> Result<Plan> {
        let mut plan = Plan {
            nodes: Vec::new(),
            root: NodeId(0),
            fresh: 0,
        };
        plan.root = plan.install(spec)?;
        crate::query::pipeline::validate(&plan)?;
        Ok(plan)
    }

    /// Installs a document subtree as a detached subtree of this arena.
    pub fn install(&mut self, spec: &NodeSpec) -> Result<NodeId> {
        let id = self.add(spec.kind, spec.value.clone());
        self.nodes[id.index()].properties = spec.properties.clone();
        for child in &spec.children {
            let child_id = self.install(child)?;
            self.append_child(id, child_id)?;
        }
        Ok(id)
    }

    /// Document form of a subtree.
    pub fn to_spec(&self, id: NodeId) -> NodeSpec {
        NodeSpec {
            kind: self.kind(id),
            value: self.value(id).clone(),
            children: self
                .children(id)
                .iter()
                .map(|child| self.to_spec(*child))
                .collect(),
            properties: self.properties(id).clone(),
        }
    }

    /// Indented text rendering of the reachable tree, properties included.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_node(self.root, 0, &mut out);
        out
    }

    fn render_node(&self, id: NodeId, depth: usize, out: &mut String) {
        use std::fmt::Write;
        let _ = write!(out, "{}{:?}", "  ".repeat(depth), self.kind(id));
        if !self.value(id).is_none() {
            let _ = write!(out, " {}", self.value(id));
        }
        let props = self.properties(id);
        if !props.is_empty() {
            let rendered: Vec<String> = props.iter().map(|(k, v)| format!("{k}={v}")).collect();
            let _ = write!(out, " {{{}}}", rendered.join(", "));
        }
        out.push('\n');
        for child in self.children(id) {
            self.render_node(*child, depth + 1, out);
        }
    }
}

/// Serializable document form of a plan subtree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Node kind.
    pub kind: NodeKind,
    /// Literal payload.
    #[serde(default, skip_serializing_if = "NodeValue::is_none")]
    pub value: NodeValue,
    /// Children in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
    /// Property annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, PropValue>,
}

impl NodeSpec {
    /// Leaf without payload.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            value: NodeValue::None,
            children: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Sets the payload.
    pub fn with_value(mut self, value: NodeValue) -> Self {
        self.value = value;
        self
    }

    /// Appends children.
    pub fn with_children(mut self, children: impl IntoIterator<Item = NodeSpec>) -> Self {
        self.children.extend(children);
        self
    }

    /// Sets a property.
    pub fn with_property(mut self, key: &str, value: PropValue) -> Self {
        self.properties.insert(key.to_owned(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(plan: &mut Plan, kind: NodeKind) -> NodeId {
        plan.add(kind, NodeValue::None)
    }

    #[test]
    fn replace_child_moves_parent_links() {
        let mut plan = Plan::new(NodeKind::SequenceExpr, NodeValue::None);
        let root = plan.root();
        let a = leaf(&mut plan, NodeKind::EmptySequence);
        let b = leaf(&mut plan, NodeKind::ContextItemExpr);
        plan.append_child(root, a).expect("append");
        let old = plan.replace_child(root, 0, b).expect("replace");
        assert_eq!(old, a);
        assert_eq!(plan.parent(a), None);
        assert_eq!(plan.parent(b), Some(root));
        assert_eq!(plan.children(root), &[b]);
    }

    #[test]
    fn attaching_an_attached_node_is_malformed() {
        let mut plan = Plan::new(NodeKind::SequenceExpr, NodeValue::None);
        let root = plan.root();
        let a = leaf(&mut plan, NodeKind::EmptySequence);
        plan.append_child(root, a).expect("append");
        let err = plan.append_child(root, a).expect_err("double attach");
        assert!(matches!(err, SylvaError::MalformedOwned(_)));
    }

    #[test]
    fn copy_subtree_is_deep_and_detached() {
        let mut plan = Plan::new(NodeKind::SequenceExpr, NodeValue::None);
        let root = plan.root();
        let lit = plan.add(NodeKind::Literal, NodeValue::Int(7));
        plan.append_child(root, lit).expect("append");
        plan.set_property(lit, props::CHECK, PropValue::Var(Var::from("x")));
        let copy = plan.copy_subtree(root);
        assert_eq!(plan.parent(copy), None);
        let copied_lit = plan.child(copy, 0).expect("child copied");
        assert_ne!(copied_lit, lit);
        assert_eq!(plan.value(copied_lit), &NodeValue::Int(7));
        assert_eq!(plan.var_property(copied_lit, props::CHECK), Some(&Var::from("x")));
        assert_eq!(plan.to_spec(copy), plan.to_spec(root));
    }

    #[test]
    fn fresh_vars_avoid_existing_names() {
        let mut plan = Plan::new(NodeKind::VariableRef, NodeValue::Var(Var::from("#t1")));
        let fresh = plan.fresh_var("t");
        assert_eq!(fresh, Var::from("#t2"));
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = NodeSpec::new(NodeKind::FunctionCall)
            .with_value(NodeValue::Name("count".into()))
            .with_children([NodeSpec::new(NodeKind::VariableRef)
                .with_value(NodeValue::Var(Var::from("x")))]);
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: NodeSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, spec);
    }

    #[test]
    fn render_lists_properties() {
        let mut plan = Plan::new(NodeKind::Literal, NodeValue::Int(1));
        let root = plan.root();
        plan.set_property(root, props::SKIP_SORT, PropValue::Bool(true));
        assert_eq!(plan.render(), "Literal 1 {skipSort=true}\n");
    }
}
