//! Resource model for desired-state declarations.
//!
//! This module defines the typed representation of a desired-state node:
//! its identity, its loosely-typed attributes, and its dependency edges.

mod types;
mod value;

pub use types::{Resource, ResourceRef};
pub use value::Value;
