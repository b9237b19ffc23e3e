//! Process exit statuses of the commands.

use crate::planner::ProvisionPlan;
use crate::reconciler::{ApplyResult, DriftReport};

/// Nothing to change, or every action succeeded.
pub const EXIT_SUCCESS: u8 = 0;

/// An action failed, the plan was declined or drift was found.
pub const EXIT_FAILURE: u8 = 1;

/// `plan` found pending changes.
pub const EXIT_CHANGES_PENDING: u8 = 2;

/// Exit status of `plan`.
#[must_use]
pub fn plan_status(plan: &ProvisionPlan) -> u8 {
    if plan.has_changes() { EXIT_CHANGES_PENDING } else { EXIT_SUCCESS }
}

/// Exit status of `apply` and `destroy`.
#[must_use]
pub fn apply_status(result: &ApplyResult) -> u8 {
    outcome(result.success())
}

/// Exit status of `drift`.
#[must_use]
pub fn drift_status(report: &DriftReport) -> u8 {
    outcome(report.is_converged())
}

const fn outcome(success: bool) -> u8 {
    if success { EXIT_SUCCESS } else { EXIT_FAILURE }
}
