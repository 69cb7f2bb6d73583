//! Sylva: rewriting, liveness analysis and pull-based execution for FLWOR
//! tree queries.
//!
//! A parsed query arrives as a [`query::ast::Plan`]. The rewrite passes in
//! [`query::rewrite`] canonicalize and unnest it, [`query::projection`]
//! annotates every pipeline stage with the bindings consumed downstream, and
//! [`query::compiler`] lowers the result into the operator tree of
//! [`query::operator`].

#![warn(missing_docs)]

pub mod query;
pub mod types;
