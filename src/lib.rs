// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative, dependency-ordered reconciliation engine.
//!
//! ## Overview
//!
//! Converge takes a set of desired resources, orders them by their
//! dependencies, computes the operations that move the target system from
//! its last observed state to the desired one, and applies them through a
//! pluggable provider:
//!
//! - Declare resources in a YAML document, with dependencies written either
//!   explicitly or as `${kind.name.attribute}` references
//! - Plan minimal change-sets: creates, updates, drift repairs and deletes
//! - Apply independent branches concurrently, dependents strictly after
//!   their dependencies
//! - Re-run continuously to self-heal drift
//!
//! ## Architecture
//!
//! 1. **Desired state**: a [`source::DesiredStateSource`], usually `converge.yaml`
//! 2. **Graph**: [`graph::GraphBuilder`] validates identities and orders resources
//! 3. **Plan**: [`planner::Planner`] diffs the graph against [`state::ObservedState`]
//! 4. **Execute**: [`planner::ChangeSetExecutor`] drives a [`provider::Provider`]
//! 5. **Loop**: [`reconciler::Reconciler`] repeats the cycle on a timer or signal
//!
//! ## Modules
//!
//! - [`resource`]: Resource model and references
//! - [`graph`]: Dependency graph construction
//! - [`planner`]: Diff computation, change-sets and execution
//! - [`provider`]: Provider capability and built-in providers
//! - [`state`]: Observed state and storage backends
//! - [`config`]: Document parsing, validation and hashing
//! - [`source`]: Desired-state sources
//! - [`reconciler`]: Reconciliation loop
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!
//! resources:
//!   - kind: database
//!     name: main
//!     attributes:
//!       engine: postgres
//!   - kind: app
//!     name: web
//!     attributes:
//!       db_url: "${database.main.endpoint}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod source;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DesiredStateDocument, EngineSettings};
pub use error::{ConvergeError, Result};
pub use graph::{DependencyGraph, GraphBuilder};
pub use planner::{ChangeSet, ChangeSetExecutor, DiffEngine, ExecutionReport, Operation, Planner};
pub use provider::{EchoProvider, HttpProvider, Provider};
pub use reconciler::{DriftReport, ReconcileHandle, ReconciliationRun, Reconciler, RunStatus};
pub use resource::{Resource, ResourceRef, Value};
pub use source::{DesiredStateSource, FileSource, StaticSource};
pub use state::{LocalStateStore, MemoryStateStore, ObservedState, StateStore};
