//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ConfigHasher;
use crate::graph::ResourceGraph;
use crate::planner::{ActionType, ExecutionReport, NodeStatus, ProvisionPlan};
use crate::reconciler::{ApplyResult, DriftReport, DriftStatus};
use crate::state::AppliedState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphNodeRow {
    #[tabled(rename = "Rank")]
    rank: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Execution outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a provisioning plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ProvisionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &ProvisionPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nProvisioning Plan");
        let _ = writeln!(
            output,
            "   Document hash: {}\n",
            ConfigHasher::short_hash(&plan.document_hash)
        );

        let rows: Vec<PlanActionRow> = plan
            .changes()
            .into_iter()
            .map(|a| PlanActionRow {
                rank: a.rank,
                action: Self::format_action_type(a.action),
                resource: a.logical_id.clone(),
                kind: a.kind.to_string(),
                reason: Self::truncate(&a.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.changes() {
                if action.details.is_empty() {
                    continue;
                }
                let _ = writeln!(output, "\n  {} {}", action.action.symbol(), action.logical_id.bold());
                for detail in &action.details {
                    let marker = if detail.forces_replacement {
                        " (forces replacement)".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(
                        output,
                        "      {}: {} -> {}{marker}",
                        detail.field,
                        detail.old_value.as_deref().unwrap_or("(none)"),
                        detail.new_value.as_deref().unwrap_or("(none)"),
                    );
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete.\n",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::UpdateInPlace).to_string().yellow(),
            plan.count(ActionType::Replace).to_string().yellow(),
            plan.count(ActionType::Delete).to_string().red()
        );
        output
    }

    /// Formats a resource graph with ranks and edges.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let rows: Vec<GraphNodeRow> = graph
            .topological_order()
            .iter()
            .map(|&idx| {
                let node = graph.node(idx);
                let names = |edges: &[usize]| {
                    edges
                        .iter()
                        .map(|&e| graph.node(e).id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                GraphNodeRow {
                    rank: graph.rank(idx),
                    resource: node.id.clone(),
                    kind: node.kind.to_string(),
                    dependencies: names(graph.dependencies(idx)),
                    after: names(graph.ordering(idx)),
                }
            })
            .collect();

        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "rank": r.rank,
                            "id": r.resource,
                            "kind": r.kind,
                            "dependencies": split_names(&r.dependencies),
                            "after": split_names(&r.after),
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&nodes).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!(
                    "\nResource graph: {} nodes, {} ranks\n\n",
                    graph.len(),
                    graph.batches().len()
                );
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_apply(&self, result: &ApplyResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Text => {
                if !result.confirmed {
                    return format!("{} Apply cancelled.\n", "✗".red());
                }
                result.report.as_ref().map_or_else(
                    || format!("{} No changes to apply.\n", "✓".green()),
                    Self::format_report_text,
                )
            }
        }
    }

    fn format_report_text(report: &ExecutionReport) -> String {
        let rows: Vec<OutcomeRow> = report
            .outcomes
            .iter()
            .filter(|o| o.action != ActionType::NoOp)
            .map(|o| OutcomeRow {
                resource: o.logical_id.clone(),
                action: Self::format_action_type(o.action),
                status: Self::format_status(&o.status),
                attempts: o.attempts,
                provider_id: Self::truncate(o.provider_id.as_deref().unwrap_or("-"), 60),
            })
            .collect();

        let mut output = format!("\n{}\n", Table::new(rows));
        let headline = if report.all_successful() {
            format!("{} {report}", "✓".green())
        } else {
            format!("{} {report}", "✗".red())
        };
        let _ = writeln!(output, "\n{headline}");

        for outcome in &report.outcomes {
            if let NodeStatus::Failed { error, .. } = &outcome.status {
                let _ = writeln!(output, "   - {}: {error}", outcome.logical_id);
            }
        }
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = String::new();
                let drifted = report.drifted();
                if !drifted.is_empty() {
                    let _ = write!(output, "{} Drift detected:\n\n", "⚠".yellow());
                    for entry in &drifted {
                        let detail = match &entry.status {
                            DriftStatus::Missing => "missing".red().to_string(),
                            DriftStatus::Changed { fields } => {
                                format!("changed: {}", fields.join(", ")).yellow().to_string()
                            }
                            DriftStatus::InSync => continue,
                        };
                        let _ = writeln!(output, "   - {} ({detail})", entry.logical_id);
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        drifted.len(),
                        report.entries.len()
                    );
                }
                if !report.pending.is_empty() {
                    let _ = writeln!(output, "\nDocument changes not yet applied:");
                    for id in &report.pending {
                        let _ = writeln!(output, "   * {id}");
                    }
                }
                output
            }
        }
    }

    /// Formats applied state.
    #[must_use]
    pub fn format_state(&self, state: &AppliedState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(
                    output,
                    "   Document hash: {}",
                    ConfigHasher::short_hash(&state.document_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.resources.len());
                for resource in state.resources.values() {
                    let _ = writeln!(
                        output,
                        "     {} ({}) {}",
                        resource.logical_id,
                        resource.kind,
                        resource.provider_id.dimmed()
                    );
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats an action type with color.
    fn format_action_type(action: ActionType) -> String {
        let label = format!("{}{action}", action.symbol().trim());
        match action {
            ActionType::Create => label.green().to_string(),
            ActionType::UpdateInPlace | ActionType::Replace => label.yellow().to_string(),
            ActionType::Delete => label.red().to_string(),
            ActionType::NoOp => label.dimmed().to_string(),
        }
    }

    /// Formats an outcome status with color.
    fn format_status(status: &NodeStatus) -> String {
        match status {
            NodeStatus::Succeeded => "succeeded".green().to_string(),
            NodeStatus::Failed { retryable, .. } => {
                if *retryable {
                    "failed (retryable)".red().to_string()
                } else {
                    "failed".red().to_string()
                }
            }
            NodeStatus::BlockedByFailure { failed } => {
                format!("blocked by {failed}").yellow().to_string()
            }
            NodeStatus::Cancelled => "cancelled".dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

fn split_names(joined: &str) -> Vec<&str> {
    joined.split(", ").filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::scenario_graph;
    use crate::planner::DiffEngine;

    fn plan() -> ProvisionPlan {
        let graph = scenario_graph();
        let diff = DiffEngine::new().compute_diff(&graph, None);
        ProvisionPlan::from_diff(&graph, &diff, None, "0123456789abcdef").unwrap()
    }

    #[test]
    fn test_truncate() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("a-very-long-name", 8), "a-ver...");
    }

    #[test]
    fn test_plan_text_lists_changes() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), false);
        assert!(text.contains("service"));
        assert!(text.contains("Plan: 4 to create, 0 to update, 0 to replace, 0 to delete."));
    }

    #[test]
    fn test_plan_json_is_parseable() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["actions"].as_array().unwrap().len(), 4);
        assert_eq!(value["document_hash"], "0123456789abcdef");
    }

    #[test]
    fn test_graph_json_has_edges() {
        let json = OutputFormatter::new(OutputFormat::Json).format_graph(&scenario_graph());
        let nodes: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        let service = nodes.iter().find(|n| n["id"] == "service").unwrap();
        assert_eq!(service["rank"], 2);
        assert_eq!(service["dependencies"].as_array().unwrap().len(), 2);
    }
}
