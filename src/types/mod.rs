//! Crate-wide error type and result alias.
#![forbid(unsafe_code)]

use crate::query::errors::EvalError;

/// Errors surfaced by planning, rewriting, compilation and execution.
#[derive(thiserror::Error, Debug)]
pub enum SylvaError {
    /// The plan tree violates a structural invariant (a pass or builder defect).
    #[error("malformed plan: {0}")]
    Malformed(&'static str),
    /// Malformed plan with a message computed at runtime.
    #[error("malformed plan: {0}")]
    MalformedOwned(String),
    /// A legal construct whose evaluation is not implemented here.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// Evaluation failure raised by an expression or function.
    #[error("[{}] {}", .0.code(), .0)]
    Eval(#[from] EvalError),
    /// A cursor was driven outside its open/next/close protocol.
    #[error("cursor protocol violation: {0}")]
    Cursor(&'static str),
    /// A rewrite pass kept changing the tree past the traversal bound.
    #[error("pass '{pass}' did not converge after {traversals} traversals")]
    NoFixpoint {
        /// Name of the offending pass.
        pass: &'static str,
        /// Traversals performed before giving up.
        traversals: usize,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SylvaError>;
