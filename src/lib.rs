// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

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
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests unwrap freely.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # ECS Provision
//!
//! Declarative provisioning of ECS Fargate workloads and their supporting
//! AWS resources.
//!
//! ## Overview
//!
//! A desired-state document names resources (repositories, roles, security
//! groups, clusters, log groups, parameters, task definitions, services and
//! autoscaling schedules) and wires them together with `${name.attribute}`
//! references. ecsprov then:
//!
//! - Builds a dependency graph from those references and rejects cycles
//! - Diffs every resource against the last applied state
//! - Applies the resulting plan concurrently, in dependency order
//! - Records provider identifiers so the next run only touches what changed
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `ecsprov.yaml`
//! 2. **Applied State**: Persisted by a [`state::StateStore`] (local or S3)
//! 3. **Reconciler**: Plans the difference and drives the executor against a
//!    [`provider::CloudProvider`]
//!
//! ## Modules
//!
//! - [`config`]: Document parsing, validation and hashing
//! - [`graph`]: Reference resolution and the resource graph
//! - [`planner`]: Diff computation, plans and the concurrent executor
//! - [`provider`]: Cloud provider boundary and the simulated provider
//! - [`state`]: State storage backends (local, S3) and the apply ledger
//! - [`reconciler`]: Plan, apply, destroy and drift detection
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: airflow
//!   environment: dev
//!
//! resources:
//!   cluster:
//!     kind: ecs_cluster
//!     attributes:
//!       name: airflow-dev
//!   scheduler_service:
//!     kind: ecs_service
//!     attributes:
//!       name: airflow-scheduler
//!       cluster: ${cluster.arn}
//!       task_definition: ${scheduler_task.arn}
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
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DesiredDocument};
pub use error::{ProvisionError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceKind, ResourceNode};
pub use planner::{DiffEngine, ExecutionReport, PlanExecutor, ProvisionPlan};
pub use provider::{CloudProvider, SimulatedProvider};
pub use reconciler::{ApplyResult, DriftReport, Reconciler};
pub use state::{AppliedState, LocalStateStore, S3StateStore, StateStore};
