//! Fixpoint tree walker driving every rewrite pass.
//!
//! A [`Walker`] visits nodes in pre-order. A visit that changes the tree
//! structure records it through [`WalkContext::snapshot`]; the driver then
//! abandons the current traversal and starts again from the root, repeating
//! until one full traversal completes without a structural change.

use serde::Serialize;
use tracing::debug;

use crate::query::ast::{NodeId, Plan};
use crate::types::{Result, SylvaError};

/// Outcome of visiting one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Continue into the children of this node (possibly a replacement of the visited one).
    Descend(NodeId),
    /// Do not descend below the visited node.
    Skip,
}

/// Per-traversal state handed to [`Walker::visit`].
#[derive(Debug, Default)]
pub struct WalkContext {
    changed: bool,
}

impl WalkContext {
    /// Records a structural change; the driver restarts from the root.
    pub fn snapshot(&mut self) {
        self.changed = true;
    }

    /// Whether a change was recorded in the current traversal.
    pub fn changed(&self) -> bool {
        self.changed
    }
}

/// A rewrite or analysis expressed as a node visitor.
pub trait Walker {
    /// Pass name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Called before every traversal, including restarts.
    fn prepare(&mut self, _plan: &Plan) -> Result<()> {
        Ok(())
    }

    /// Visits one node.
    fn visit(&mut self, plan: &mut Plan, node: NodeId, cx: &mut WalkContext) -> Result<Visit>;
}

/// Report of one pass run to fixpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    /// Pass name.
    pub pass: &'static str,
    /// Traversals performed, including the final unchanged one.
    pub traversals: usize,
    /// Whether any traversal changed the tree.
    pub changed: bool,
}

/// Runs `walker` over `plan` until a traversal makes no structural change.
pub fn walk<W: Walker + ?Sized>(
    walker: &mut W,
    plan: &mut Plan,
    max_traversals: usize,
) -> Result<WalkReport> {
    let mut traversals = 0;
    let mut changed = false;
    loop {
        if traversals >= max_traversals {
            return Err(SylvaError::NoFixpoint {
                pass: walker.name(),
                traversals,
            });
        }
        traversals += 1;
        walker.prepare(plan)?;
        let mut cx = WalkContext::default();
        let root = plan.root();
        traverse(walker, plan, root, &mut cx)?;
        if !cx.changed {
            break;
        }
        changed = true;
    }
    debug!(pass = walker.name(), traversals, changed, "rewrite.walk.fixpoint");
    Ok(WalkReport {
        pass: walker.name(),
        traversals,
        changed,
    })
}

/// Walks one subtree with `walker`; stops early once a change is recorded.
pub fn traverse<W: Walker + ?Sized>(
    walker: &mut W,
    plan: &mut Plan,
    node: NodeId,
    cx: &mut WalkContext,
) -> Result<()> {
    let next = walker.visit(plan, node, cx)?;
    if cx.changed {
        return Ok(());
    }
    let Visit::Descend(node) = next else {
        return Ok(());
    };
    let mut idx = 0;
    while let Some(child) = plan.child(node, idx) {
        traverse(walker, plan, child, cx)?;
        if cx.changed {
            return Ok(());
        }
        idx += 1;
    }
    Ok(())
}
