#![forbid(unsafe_code)]

//! FLWOR plan optimization and execution.
//!
//! Plans flow through the modules in order: [`ast`] holds the tree,
//! [`rewrite`] runs the fixpoint passes, [`projection`] annotates liveness,
//! and [`compiler`] lowers the result into [`operator`] cursors.

/// Plan arena: node kinds, payloads, properties and tree surgery.
pub mod ast;

/// Fluent constructors for plan specs.
pub mod builder;

/// Evaluation errors with standard error codes.
pub mod errors;

/// Pipeline navigation helpers shared by passes and the compiler.
pub mod pipeline;

/// Fixpoint tree walker the rewrite passes run on.
pub mod walker;

/// Rewrite passes and the optimizer driver.
///
/// Step merging, unnesting, let lifting, group emission and join sort
/// elimination.
pub mod rewrite;

/// Liveness analysis annotating each stage with the bindings read downstream.
pub mod projection;

/// Atomic items, sequences and comparison semantics.
pub mod value;

/// Persistent rows and compile-time slot layouts.
pub mod tuple;

/// Per-evaluation counters.
pub mod context;

/// Function registry and builtins.
pub mod registry;

/// Compiled scalar expressions.
pub mod expr;

/// Pull-based operators and the cursor protocol.
pub mod operator;

/// Plan lowering, explain output and the prepare entry point.
pub mod compiler;

/// Performance profiling for query operations.
///
/// Collects timing statistics for rewriting, projection, compilation and
/// execution when `SYLVA_PROFILE` is set.
pub mod profile;

pub use ast::{NodeSpec, Plan, Var};
pub use builder::Flwor;
pub use compiler::{
    prepare, CompiledQuery, Compiler, ExternalBindings, PlanExplain, PreparedQuery, QueryDocument,
};
pub use context::{ExecutionStats, QueryContext};
pub use registry::FunctionRegistry;
pub use rewrite::{optimize, OptimizerConfig, RewriteReport};
pub use value::{Item, Sequence};
