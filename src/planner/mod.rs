//! Planning module for provisioning operations.
//!
//! This module handles the comparison between desired and applied states,
//! generating provisioning plans and executing them against a provider.

mod diff;
mod plan;
mod executor;

pub use diff::{DiffDetail, DiffEngine, DiffResult, ResourceDiff};
pub use plan::{ActionType, PlannedAction, ProvisionPlan};
pub use executor::{
    CancelHandle, CancelSignal, ExecutionReport, NodeOutcome, NodeStatus, PlanExecutor,
    RetryPolicy, cancel_pair,
};
