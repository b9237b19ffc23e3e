//! Diff engine for comparing desired resources against applied state.
//!
//! Each node is compared with what the last apply recorded for it. Equal
//! attribute hashes mean nothing to do; otherwise the changed attributes
//! decide between an in-place update and a replacement. Replacements then
//! ripple to dependents whose referenced values will change.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::{Attributes, Reference, ResourceGraph, ResourceKind, ResourceNode, reference};
use crate::state::{AppliedState, ResourceState};

use super::plan::ActionType;

/// Engine for computing diffs between desired and applied states.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Attribute hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDiff {
    /// Logical identifier.
    pub logical_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Action needed to converge.
    pub action: ActionType,
    /// Changed attributes.
    pub details: Vec<DiffDetail>,
    /// Previous attribute hash (if applicable).
    pub old_hash: Option<String>,
    /// New attribute hash (if applicable).
    pub new_hash: Option<String>,
    /// Why this action was chosen.
    pub reason: String,
}

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffDetail {
    /// Attribute that differs.
    pub field: String,
    /// Old value.
    pub old_value: Option<String>,
    /// New value.
    pub new_value: Option<String>,
    /// Whether this change forces replacement.
    pub forces_replacement: bool,
}

/// Complete diff result.
#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    /// Diffs of graph nodes in topological order, then deletions.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update in place.
    pub updates: usize,
    /// Number of resources to replace.
    pub replaces: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Decides the action for a single node given its previous state.
    #[must_use]
    pub fn diff_node(&self, node: &ResourceNode, previous: Option<&ResourceState>) -> ResourceDiff {
        let new_hash = self.hasher.hash_attributes(&node.attributes);

        let Some(previous) = previous else {
            debug!("{} needs to be created", node.id);
            return ResourceDiff {
                logical_id: node.id.clone(),
                kind: node.kind,
                action: ActionType::Create,
                details: Vec::new(),
                old_hash: None,
                new_hash: Some(new_hash),
                reason: String::from("not yet applied"),
            };
        };

        let mut diff = ResourceDiff {
            logical_id: node.id.clone(),
            kind: node.kind,
            action: ActionType::NoOp,
            details: Vec::new(),
            old_hash: Some(previous.attributes_hash.clone()),
            new_hash: Some(new_hash.clone()),
            reason: String::new(),
        };

        if previous.kind != node.kind {
            diff.action = ActionType::Replace;
            diff.details.push(DiffDetail {
                field: String::from("kind"),
                old_value: Some(previous.kind.to_string()),
                new_value: Some(node.kind.to_string()),
                forces_replacement: true,
            });
            diff.reason = format!("kind changed from {} to {}", previous.kind, node.kind);
            return diff;
        }

        if previous.attributes_hash == new_hash {
            debug!("{} is up to date", node.id);
            return diff;
        }

        diff.details = Self::compare_attributes(node, previous);
        if diff.details.is_empty() {
            // Hash drift without a visible change (e.g. older hash format).
            diff.action = ActionType::UpdateInPlace;
            diff.reason = String::from("attribute hash changed");
        } else if diff.details.iter().any(|d| d.forces_replacement) {
            diff.action = ActionType::Replace;
            diff.reason = format!("{} forces replacement", forced_fields(&diff.details));
        } else {
            diff.action = ActionType::UpdateInPlace;
            diff.reason = format!("{} changed", changed_fields(&diff.details));
        }

        debug!("{} needs {} ({})", node.id, diff.action, diff.reason);
        diff
    }

    /// Computes diffs for every node of `graph` and every orphaned entry
    /// of `state`.
    #[must_use]
    pub fn compute_diff(&self, graph: &ResourceGraph, state: Option<&AppliedState>) -> DiffResult {
        let mut diffs: Vec<ResourceDiff> = Vec::with_capacity(graph.len());
        let mut position: HashMap<&str, usize> = HashMap::new();

        for &idx in graph.topological_order() {
            let node = graph.node(idx);
            let previous = state.and_then(|s| s.get(&node.id));
            let mut diff = self.diff_node(node, previous);

            if let (Some(previous), Some(state)) = (previous, state) {
                Self::stale_references(node, previous, state, &mut diff);
                Self::propagate(graph, node, &mut diff, &diffs, &position);
            }

            position.insert(node.id.as_str(), diffs.len());
            diffs.push(diff);
        }

        if let Some(state) = state {
            for (id, resource) in &state.resources {
                if graph.contains(id) {
                    continue;
                }
                debug!("{id} was removed from the document");
                diffs.push(ResourceDiff {
                    logical_id: id.clone(),
                    kind: resource.kind,
                    action: ActionType::Delete,
                    details: Vec::new(),
                    old_hash: Some(resource.attributes_hash.clone()),
                    new_hash: None,
                    reason: String::from("removed from document"),
                });
            }
        }

        let count = |action: ActionType| diffs.iter().filter(|d| d.action == action).count();
        DiffResult {
            creates: count(ActionType::Create),
            updates: count(ActionType::UpdateInPlace),
            replaces: count(ActionType::Replace),
            deletes: count(ActionType::Delete),
            unchanged: count(ActionType::NoOp),
            diffs,
        }
    }

    /// Flags attributes whose references read a different value from
    /// applied state than when the resource was last applied, as left
    /// behind by a run where a dependency changed but this resource failed.
    fn stale_references(
        node: &ResourceNode,
        previous: &ResourceState,
        state: &AppliedState,
        diff: &mut ResourceDiff,
    ) {
        if matches!(diff.action, ActionType::Replace | ActionType::Create) {
            return;
        }

        for (field, references) in reference::references_by_attribute(&node.attributes) {
            if diff.details.iter().any(|d| d.field == field) {
                continue;
            }
            let stale = references.iter().find_map(|r| {
                let recorded = previous.resolved.get(&r.to_string())?;
                let current = state.get(&r.target)?.lookup(r.attribute.as_deref())?;
                (current != *recorded).then(|| (recorded.to_string(), current.to_string()))
            });
            let Some((old_value, new_value)) = stale else {
                continue;
            };

            debug!("{}.{field} was applied with {old_value}, now reads {new_value}", node.id);
            diff.details.push(DiffDetail {
                forces_replacement: node.kind.forces_replacement(&field),
                field,
                old_value: Some(old_value),
                new_value: Some(new_value),
            });
        }

        settle(diff);
    }

    /// Upgrades `diff` when a referenced resource changes the value read
    /// through the reference.
    fn propagate(
        graph: &ResourceGraph,
        node: &ResourceNode,
        diff: &mut ResourceDiff,
        earlier: &[ResourceDiff],
        position: &HashMap<&str, usize>,
    ) {
        if matches!(diff.action, ActionType::Replace | ActionType::Create) {
            return;
        }

        for (field, references) in reference::references_by_attribute(&node.attributes) {
            if diff.details.iter().any(|d| d.field == field) {
                continue;
            }
            let Some(changed) = references.iter().find(|r| {
                position.get(r.target.as_str()).is_some_and(|&p| {
                    graph
                        .get(&r.target)
                        .is_some_and(|target| value_changes(r, &earlier[p], &target.attributes))
                })
            }) else {
                continue;
            };

            let forces_replacement = node.kind.forces_replacement(&field);
            debug!(
                "{}.{field} reads ${{{changed}}} which changes (forces replacement: {forces_replacement})",
                node.id
            );
            diff.details.push(DiffDetail {
                field: field.clone(),
                old_value: Some(format!("${{{changed}}}")),
                new_value: Some(String::from("(known after apply)")),
                forces_replacement,
            });
        }

        settle(diff);
    }

    /// Compares attributes key by key.
    fn compare_attributes(node: &ResourceNode, previous: &ResourceState) -> Vec<DiffDetail> {
        let keys: BTreeSet<&String> = node.attributes.keys().chain(previous.attributes.keys()).collect();

        keys.into_iter()
            .filter_map(|key| {
                let old = previous.attributes.get(key);
                let new = node.attributes.get(key);
                (old != new).then(|| DiffDetail {
                    field: key.clone(),
                    old_value: old.map(ToString::to_string),
                    new_value: new.map(ToString::to_string),
                    forces_replacement: node.kind.forces_replacement(key),
                })
            })
            .collect()
    }
}

/// Returns true if the value read through `reference` differs once the
/// target's action has run.
///
/// `desired` holds the target's document attributes: values read from them
/// only change when the attribute itself changes, while identifiers and
/// provider outputs are reassigned by every create.
fn value_changes(reference: &Reference, target: &ResourceDiff, desired: &Attributes) -> bool {
    let edited = |attr: &str| target.details.iter().any(|d| d.field == attr);
    match (target.action, reference.attribute.as_deref()) {
        (ActionType::Create | ActionType::Replace, None | Some("id" | "arn")) => true,
        (ActionType::Create | ActionType::Replace, Some(attr)) => {
            !desired.contains_key(attr) || edited(attr)
        }
        (ActionType::UpdateInPlace, Some(attr)) => edited(attr),
        _ => false,
    }
}

/// Derives the action and reason from the collected details. A diff
/// without details keeps its action.
fn settle(diff: &mut ResourceDiff) {
    if diff.details.iter().any(|d| d.forces_replacement) {
        diff.action = ActionType::Replace;
        diff.reason = format!("{} forces replacement", forced_fields(&diff.details));
    } else if !diff.details.is_empty() {
        diff.action = ActionType::UpdateInPlace;
        diff.reason = format!("{} changed", changed_fields(&diff.details));
    }
}

fn forced_fields(details: &[DiffDetail]) -> String {
    details
        .iter()
        .filter(|d| d.forces_replacement)
        .map(|d| d.field.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn changed_fields(details: &[DiffDetail]) -> String {
    details.iter().map(|d| d.field.as_str()).collect::<Vec<_>>().join(", ")
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Looks up the diff of a logical identifier.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.logical_id == logical_id)
    }

    /// Diffs of resources removed from the document.
    pub fn deletions(&self) -> impl Iterator<Item = &ResourceDiff> {
        self.diffs.iter().filter(|d| d.action == ActionType::Delete)
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.action != ActionType::NoOp)
            .collect()
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.logical_id, self.action)?;
        if !self.details.is_empty() {
            write!(f, " ({})", changed_fields(&self.details))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use serde_json::json;

    const DOCUMENT: &str = r#"
project: { name: airflow }
resources:
  ecr_repo:
    kind: ecr_repository
    attributes: { name: airflow }
  security_group:
    kind: security_group
    attributes: { name: airflow-sg, vpc_id: vpc-123 }
  task_def:
    kind: ecs_task_definition
    attributes:
      family: airflow-scheduler
      cpu: 1024
      memory: 2048
      network_mode: awsvpc
      container_definitions:
        - name: scheduler
          image: "${ecr_repo.repository_url}:2.9"
  service:
    kind: ecs_service
    attributes:
      name: scheduler
      cluster: airflow
      task_definition: "${task_def.arn}"
      desired_count: 1
      security_groups: ["${security_group.id}"]
"#;

    fn graph(yaml: &str) -> ResourceGraph {
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        GraphBuilder::new().build(&document).unwrap()
    }

    /// State as if `graph` had just been applied.
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

    fn action_of(result: &DiffResult, id: &str) -> ActionType {
        result.get(id).unwrap().action
    }

    #[test]
    fn test_first_apply_creates_everything() {
        let g = graph(DOCUMENT);
        let result = DiffEngine::new().compute_diff(&g, None);

        assert_eq!(result.creates, 4);
        assert!(result.has_changes());
    }

    #[test]
    fn test_identical_document_is_noop() {
        let g = graph(DOCUMENT);
        let state = applied(&g);
        let result = DiffEngine::new().compute_diff(&g, Some(&state));

        assert_eq!(result.unchanged, 4);
        assert!(!result.has_changes());
    }

    #[test]
    fn test_network_mode_change_replaces_and_updates_service() {
        let state = applied(&graph(DOCUMENT));
        let g = graph(&DOCUMENT.replace("network_mode: awsvpc", "network_mode: bridge"));
        let result = DiffEngine::new().compute_diff(&g, Some(&state));

        let task = result.get("task_def").unwrap();
        assert_eq!(task.action, ActionType::Replace);
        assert_eq!(task.details[0].field, "network_mode");
        assert!(task.details[0].forces_replacement);

        assert_eq!(action_of(&result, "service"), ActionType::UpdateInPlace);
        assert_eq!(action_of(&result, "ecr_repo"), ActionType::NoOp);
        assert_eq!(action_of(&result, "security_group"), ActionType::NoOp);
    }

    #[test]
    fn test_mutable_change_updates_in_place() {
        let state = applied(&graph(DOCUMENT));
        let g = graph(&DOCUMENT.replace("desired_count: 1", "desired_count: 0"));
        let result = DiffEngine::new().compute_diff(&g, Some(&state));

        assert_eq!(action_of(&result, "service"), ActionType::UpdateInPlace);
        assert_eq!(result.total_changes(), 1);
    }

    #[test]
    fn test_replaced_repository_replaces_task_definition() {
        let state = applied(&graph(DOCUMENT));
        let g = graph(&DOCUMENT.replace("attributes: { name: airflow }", "attributes: { name: airflow-v2 }"));
        let result = DiffEngine::new().compute_diff(&g, Some(&state));

        assert_eq!(action_of(&result, "ecr_repo"), ActionType::Replace);
        // container_definitions reads repository_url and is force-new.
        assert_eq!(action_of(&result, "task_def"), ActionType::Replace);
        assert_eq!(action_of(&result, "service"), ActionType::UpdateInPlace);
    }

    #[test]
    fn test_reference_applied_with_outdated_value_is_updated() {
        let g = graph(DOCUMENT);
        let mut state = applied(&g);
        let service = state.resources.get_mut("service").unwrap();
        service.resolved.insert(String::from("task_def.arn"), json!("arn:task_def:1"));
        service.resolved.insert(String::from("security_group.id"), json!("arn:security_group"));

        let result = DiffEngine::new().compute_diff(&g, Some(&state));

        let service = result.get("service").unwrap();
        assert_eq!(service.action, ActionType::UpdateInPlace);
        assert_eq!(service.details.len(), 1);
        assert_eq!(service.details[0].field, "task_definition");
        assert_eq!(service.details[0].old_value.as_deref(), Some("\"arn:task_def:1\""));
        assert_eq!(service.details[0].new_value.as_deref(), Some("\"arn:task_def\""));
        assert_eq!(result.total_changes(), 1);
    }

    #[test]
    fn test_outdated_force_new_reference_replaces() {
        let g = graph(DOCUMENT);
        let mut state = applied(&g);
        state
            .resources
            .get_mut("task_def")
            .unwrap()
            .resolved
            .insert(String::from("ecr_repo.repository_url"), json!("old.example/airflow"));
        state
            .resources
            .get_mut("ecr_repo")
            .unwrap()
            .outputs
            .insert(String::from("repository_url"), json!("new.example/airflow"));

        let result = DiffEngine::new().compute_diff(&g, Some(&state));

        assert_eq!(action_of(&result, "task_def"), ActionType::Replace);
        assert_eq!(action_of(&result, "service"), ActionType::UpdateInPlace);
    }

    #[test]
    fn test_kind_change_replaces() {
        let g = graph(DOCUMENT);
        let mut state = applied(&g);
        state.resources.get_mut("ecr_repo").unwrap().kind = ResourceKind::EcsCluster;

        let result = DiffEngine::new().compute_diff(&g, Some(&state));
        assert_eq!(action_of(&result, "ecr_repo"), ActionType::Replace);
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let mut state = applied(&graph(DOCUMENT));
        state.set(ResourceState::new(
            "old_logs",
            ResourceKind::CloudwatchLogGroup,
            "arn:old_logs",
            Attributes::from([(String::from("name"), json!("/ecs/old"))]),
            "h",
        ));

        let result = DiffEngine::new().compute_diff(&graph(DOCUMENT), Some(&state));
        assert_eq!(result.deletes, 1);
        assert_eq!(result.deletions().next().unwrap().logical_id, "old_logs");
    }

    #[test]
    fn test_diff_is_deterministic() {
        let state = applied(&graph(DOCUMENT));
        let g = graph(&DOCUMENT.replace("cpu: 1024", "cpu: 2048"));
        let engine = DiffEngine::new();

        let a = engine.compute_diff(&g, Some(&state));
        let b = engine.compute_diff(&g, Some(&state));
        let actions = |r: &DiffResult| r.diffs.iter().map(|d| (d.logical_id.clone(), d.action)).collect::<Vec<_>>();
        assert_eq!(actions(&a), actions(&b));
    }
}
