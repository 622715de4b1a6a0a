//! Dependency graph construction.
//!
//! This module assembles a directed acyclic graph from declared resources,
//! inferring edges from attribute cross-references, and produces a
//! deterministic topological order or the offending cycle.

mod builder;
mod dag;
mod sort;

pub use builder::GraphBuilder;
pub use dag::DependencyGraph;
pub use sort::{order_by_depth, DepthOrder};
