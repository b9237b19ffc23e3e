//! Provisioning plan types and construction.
//!
//! A plan holds one action per desired resource plus one `Delete` per
//! applied resource that left the document. Actions reference each other
//! by index: `dependencies` are data edges (a failure blocks the dependent),
//! `ordering` are sibling constraints (the successor only waits).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::error::{ProvisionError, Result};
use crate::graph::{self, Attributes, ResourceGraph, ResourceKind};
use crate::state::AppliedState;

use super::diff::{DiffDetail, DiffResult};

/// A complete provisioning plan.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the document this plan is based on.
    pub document_hash: String,
    /// Planned actions; deletes first, then desired resources.
    pub actions: Vec<PlannedAction>,
    /// Execution order over both edge kinds.
    #[serde(skip)]
    order: Vec<usize>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Logical identifier of the resource.
    pub logical_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// What will happen to the resource.
    pub action: ActionType,
    /// Actions whose success this action needs.
    pub dependencies: Vec<usize>,
    /// Actions that must reach a terminal outcome before this one starts.
    pub ordering: Vec<usize>,
    /// Longest data-dependency path from a root action.
    pub rank: usize,
    /// Provider identifier of the existing object, if any.
    pub provider_id: Option<String>,
    /// Symbolic attributes to apply (last applied ones for deletes).
    pub attributes: Attributes,
    /// Hash of `attributes`.
    pub attributes_hash: String,
    /// Logical identifiers this resource reads values from.
    pub references: BTreeSet<String>,
    /// Changed attributes.
    pub details: Vec<DiffDetail>,
    /// Reason for this action.
    pub reason: String,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new provider object.
    Create,
    /// Update mutable attributes of the existing object.
    UpdateInPlace,
    /// Delete the existing object and create a new one.
    Replace,
    /// Delete the object.
    Delete,
    /// Nothing to do.
    NoOp,
}

impl ProvisionPlan {
    /// Creates a plan from a diff of `graph` against `state`.
    ///
    /// # Errors
    ///
    /// Returns an error if dependencies recorded in state combine with the
    /// graph edges into a cycle.
    pub fn from_diff(
        graph: &ResourceGraph,
        diff: &DiffResult,
        state: Option<&AppliedState>,
        document_hash: &str,
    ) -> Result<Self> {
        let deletes: Vec<_> = diff.deletions().collect();
        let mut actions = Vec::with_capacity(deletes.len() + graph.len());

        for resource_diff in &deletes {
            let previous = state.and_then(|s| s.get(&resource_diff.logical_id));
            actions.push(PlannedAction {
                logical_id: resource_diff.logical_id.clone(),
                kind: resource_diff.kind,
                action: ActionType::Delete,
                dependencies: Vec::new(),
                ordering: Vec::new(),
                rank: 0,
                provider_id: previous.map(|p| p.provider_id.clone()),
                attributes: previous.map(|p| p.attributes.clone()).unwrap_or_default(),
                attributes_hash: resource_diff.old_hash.clone().unwrap_or_default(),
                references: previous.map(|p| p.dependencies.clone()).unwrap_or_default(),
                details: resource_diff.details.clone(),
                reason: resource_diff.reason.clone(),
            });
        }

        let offset = actions.len();
        for (idx, node) in graph.nodes().iter().enumerate() {
            let resource_diff = diff.get(&node.id).ok_or_else(|| {
                ProvisionError::internal(format!("No diff computed for '{}'", node.id))
            })?;
            let previous = state.and_then(|s| s.get(&node.id));
            actions.push(PlannedAction {
                logical_id: node.id.clone(),
                kind: node.kind,
                action: resource_diff.action,
                dependencies: graph.dependencies(idx).iter().map(|d| d + offset).collect(),
                ordering: graph.ordering(idx).iter().map(|d| d + offset).collect(),
                rank: 0,
                provider_id: previous.map(|p| p.provider_id.clone()),
                attributes: node.attributes.clone(),
                attributes_hash: resource_diff.new_hash.clone().unwrap_or_default(),
                references: node.dependencies.clone(),
                details: resource_diff.details.clone(),
                reason: resource_diff.reason.clone(),
            });
        }

        let recorded: Vec<BTreeSet<String>> = actions
            .iter()
            .map(|a| {
                state
                    .and_then(|s| s.get(&a.logical_id))
                    .map(|p| p.dependencies.clone())
                    .unwrap_or_default()
            })
            .collect();
        link_deletions(&mut actions, offset, &recorded);
        Self::finish(actions, document_hash)
    }

    /// Creates a plan deleting every applied resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the dependencies recorded in state form a cycle.
    pub fn destroy(state: &AppliedState) -> Result<Self> {
        let mut actions: Vec<PlannedAction> = state
            .resources
            .values()
            .map(|resource| PlannedAction {
                logical_id: resource.logical_id.clone(),
                kind: resource.kind,
                action: ActionType::Delete,
                dependencies: Vec::new(),
                ordering: Vec::new(),
                rank: 0,
                provider_id: Some(resource.provider_id.clone()),
                attributes: resource.attributes.clone(),
                attributes_hash: resource.attributes_hash.clone(),
                references: resource.dependencies.clone(),
                details: Vec::new(),
                reason: String::from("destroy requested"),
            })
            .collect();

        let recorded: Vec<BTreeSet<String>> = actions.iter().map(|a| a.references.clone()).collect();
        let count = actions.len();
        link_deletions(&mut actions, count, &recorded);
        Self::finish(actions, &state.document_hash)
    }

    /// Computes execution order and ranks.
    fn finish(mut actions: Vec<PlannedAction>, document_hash: &str) -> Result<Self> {
        let order = {
            let ids: Vec<&str> = actions.iter().map(|a| a.logical_id.as_str()).collect();
            let dependencies: Vec<Vec<usize>> = actions.iter().map(|a| a.dependencies.clone()).collect();
            let ordering: Vec<Vec<usize>> = actions.iter().map(|a| a.ordering.clone()).collect();
            graph::topological_sort(&ids, &dependencies, &ordering)?
        };

        for &idx in &order {
            let from_data = actions[idx]
                .dependencies
                .iter()
                .map(|&d| actions[d].rank + 1)
                .max()
                .unwrap_or(0);
            let from_ordering = actions[idx]
                .ordering
                .iter()
                .map(|&d| actions[d].rank)
                .max()
                .unwrap_or(0);
            actions[idx].rank = from_data.max(from_ordering);
        }

        Ok(Self {
            created_at: Utc::now(),
            document_hash: document_hash.to_string(),
            actions,
            order,
        })
    }

    /// Execution order: every action after its dependencies and ordering
    /// predecessors, ties broken by logical identifier.
    #[must_use]
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Actions grouped by rank, each batch in execution order.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<usize>> {
        let depth = self.actions.iter().map(|a| a.rank + 1).max().unwrap_or(0);
        let mut batches = vec![Vec::new(); depth];
        for &idx in &self.order {
            batches[self.actions[idx].rank].push(idx);
        }
        batches
    }

    /// Returns true if no action changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(|a| a.action == ActionType::NoOp)
    }

    /// Returns true if any action changes something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.is_empty()
    }

    /// Returns the number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of the given type.
    #[must_use]
    pub fn count(&self, action: ActionType) -> usize {
        self.actions.iter().filter(|a| a.action == action).count()
    }

    /// Returns the actions that change something.
    #[must_use]
    pub fn changes(&self) -> Vec<&PlannedAction> {
        self.order
            .iter()
            .map(|&i| &self.actions[i])
            .filter(|a| a.action != ActionType::NoOp)
            .collect()
    }

    /// Looks up the action of a logical identifier.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&PlannedAction> {
        self.actions.iter().find(|a| a.logical_id == logical_id)
    }

    /// One-line summary, e.g. `2 to create, 1 to replace, 0 to delete`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.count(ActionType::Create),
            self.count(ActionType::UpdateInPlace),
            self.count(ActionType::Replace),
            self.count(ActionType::Delete),
            self.count(ActionType::NoOp),
        )
    }
}

/// Adds the edges that keep deletions safe.
///
/// `actions[..deletes]` are deletes; `recorded[i]` lists what action `i`
/// depended on when last applied. A resource is deleted only after
/// everything that depended on it is deleted or changed, and a changing
/// resource waits for deletes of orphans that depended on it.
fn link_deletions(actions: &mut [PlannedAction], deletes: usize, recorded: &[BTreeSet<String>]) {
    let index: HashMap<&str, usize> = actions
        .iter()
        .enumerate()
        .map(|(i, a)| (a.logical_id.as_str(), i))
        .collect();

    let mut extra: Vec<(usize, usize)> = Vec::new();
    for (i, previous) in recorded.iter().enumerate() {
        for referenced in previous {
            let Some(&target) = index.get(referenced.as_str()) else {
                continue;
            };
            if i < deletes && (target < deletes || actions[target].action != ActionType::NoOp) {
                extra.push((target, i));
            } else if i >= deletes && target < deletes {
                extra.push((target, i));
            }
        }
    }

    for (action, predecessor) in extra {
        if !actions[action].dependencies.contains(&predecessor) {
            actions[action].dependencies.push(predecessor);
        }
    }
}

impl PlannedAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ActionType::Create => format!("Create {} '{}'", self.kind, self.logical_id),
            ActionType::UpdateInPlace => format!("Update {} '{}' in place", self.kind, self.logical_id),
            ActionType::Replace => format!("Replace {} '{}'", self.kind, self.logical_id),
            ActionType::Delete => format!("Delete {} '{}'", self.kind, self.logical_id),
            ActionType::NoOp => format!("No change for '{}'", self.logical_id),
        }
    }
}

impl ActionType {
    /// Symbol shown in front of the action in plan output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::UpdateInPlace => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::UpdateInPlace => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.logical_id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ProvisionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Provisioning Plan ({}):", self.summary())?;
        for (rank, batch) in self.batches().iter().enumerate() {
            for &idx in batch {
                let action = &self.actions[idx];
                if action.action != ActionType::NoOp {
                    writeln!(f, "  [{rank}] {} {action}", action.action.symbol())?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHasher;
    use crate::graph::tests::scenario_graph;
    use crate::planner::DiffEngine;
    use crate::state::ResourceState;

    fn applied(graph: &ResourceGraph) -> AppliedState {
        let hasher = ConfigHasher::new();
        let mut state = AppliedState::new("airflow", "dev");
        for node in graph.nodes() {
            let mut resource = ResourceState::new(
                &node.id,
                node.kind,
                &format!("arn:{}", node.id),
                node.attributes.clone(),
                &hasher.hash_attributes(&node.attributes),
            );
            resource.dependencies = node.dependencies.clone();
            state.set(resource);
        }
        state
    }

    fn position(plan: &ProvisionPlan, id: &str) -> usize {
        let idx = plan.actions.iter().position(|a| a.logical_id == id).unwrap();
        plan.order().iter().position(|&i| i == idx).unwrap()
    }

    #[test]
    fn test_scenario_ranks() {
        let graph = scenario_graph();
        let diff = DiffEngine::new().compute_diff(&graph, None);
        let plan = ProvisionPlan::from_diff(&graph, &diff, None, "hash").unwrap();

        let rank = |id: &str| plan.get(id).unwrap().rank;
        assert_eq!(rank("ecr_repo"), 0);
        assert_eq!(rank("security_group"), 0);
        assert_eq!(rank("task_def"), 1);
        assert_eq!(rank("service"), 2);

        assert_eq!(plan.count(ActionType::Create), 4);
        assert_eq!(plan.batches().len(), 3);
        assert!(position(&plan, "task_def") < position(&plan, "service"));
    }

    #[test]
    fn test_applied_graph_is_empty_plan() {
        let graph = scenario_graph();
        let state = applied(&graph);
        let diff = DiffEngine::new().compute_diff(&graph, Some(&state));
        let plan = ProvisionPlan::from_diff(&graph, &diff, Some(&state), "hash").unwrap();

        assert!(plan.is_empty());
        assert!(plan.changes().is_empty());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_orphans_delete_dependents_first() {
        let graph = scenario_graph();
        let mut state = applied(&graph);

        let mut logs = ResourceState::new(
            "old_logs",
            ResourceKind::CloudwatchLogGroup,
            "arn:old_logs",
            Attributes::new(),
            "h1",
        );
        logs.dependencies.insert(String::from("old_role"));
        state.set(logs);
        state.set(ResourceState::new("old_role", ResourceKind::IamRole, "arn:old_role", Attributes::new(), "h2"));

        let diff = DiffEngine::new().compute_diff(&graph, Some(&state));
        let plan = ProvisionPlan::from_diff(&graph, &diff, Some(&state), "hash").unwrap();

        assert_eq!(plan.count(ActionType::Delete), 2);
        assert!(position(&plan, "old_logs") < position(&plan, "old_role"));
        assert_eq!(plan.get("old_role").unwrap().rank, 1);
    }

    #[test]
    fn test_changed_resource_waits_for_orphan_delete() {
        let graph = scenario_graph();
        let mut state = applied(&graph);
        state.set(ResourceState::new("old_sg", ResourceKind::SecurityGroup, "arn:old_sg", Attributes::new(), "h"));
        if let Some(service) = state.resources.get_mut("service") {
            service.dependencies.insert(String::from("old_sg"));
            service.attributes_hash = String::from("stale");
        }

        let diff = DiffEngine::new().compute_diff(&graph, Some(&state));
        let plan = ProvisionPlan::from_diff(&graph, &diff, Some(&state), "hash").unwrap();

        assert_eq!(plan.get("service").unwrap().action, ActionType::UpdateInPlace);
        assert!(position(&plan, "service") < position(&plan, "old_sg"));
    }

    #[test]
    fn test_destroy_reverses_dependencies() {
        let state = applied(&scenario_graph());
        let plan = ProvisionPlan::destroy(&state).unwrap();

        assert_eq!(plan.count(ActionType::Delete), 4);
        assert!(position(&plan, "service") < position(&plan, "task_def"));
        assert!(position(&plan, "service") < position(&plan, "security_group"));
        assert!(position(&plan, "task_def") < position(&plan, "ecr_repo"));
    }

    #[test]
    fn test_display_lists_changes_by_rank() {
        let graph = scenario_graph();
        let diff = DiffEngine::new().compute_diff(&graph, None);
        let plan = ProvisionPlan::from_diff(&graph, &diff, None, "hash").unwrap();

        let text = plan.to_string();
        assert!(text.starts_with("Provisioning Plan (4 to create"));
        assert!(text.contains("[2] + create service"));
    }
}
