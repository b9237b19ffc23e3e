//! Builds a [`ResourceGraph`] from a desired-state document.

use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use tracing::debug;

use crate::config::DesiredDocument;
use crate::error::{GraphError, ProvisionError, Result};

use super::dag::ResourceGraph;
use super::node::{Attributes, ResourceNode};
use super::reference::{self, VARIABLE_NAMESPACE};

/// Builder turning a document into a validated graph.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the resource graph for `document`.
    ///
    /// Document variables are substituted and every remaining `${...}`
    /// reference becomes a data dependency.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnresolvedReference`] if a reference or an
    /// `after` entry names something absent from the document, and
    /// [`GraphError::CycleDetected`] if the edges form a cycle.
    pub fn build(&self, document: &DesiredDocument) -> Result<ResourceGraph> {
        let mut nodes = Vec::with_capacity(document.resources.len());

        for (id, spec) in &document.resources {
            let mut attributes = Attributes::new();
            for (key, value) in &spec.attributes {
                let substituted = reference::substitute_variables(value, &document.variables)
                    .map_err(|r| GraphError::unresolved(id, r.to_string()))?;
                attributes.insert(key.clone(), substituted);
            }

            let mut node = ResourceNode::new(id, spec.kind, attributes);
            for value in node.attributes.values() {
                for reference in reference::scan(value) {
                    if reference.target == VARIABLE_NAMESPACE {
                        continue;
                    }
                    if !document.resources.contains_key(&reference.target) {
                        return Err(GraphError::unresolved(id, reference.to_string()).into());
                    }
                    node.dependencies.insert(reference.target);
                }
            }

            for predecessor in &spec.after {
                if !document.resources.contains_key(predecessor) {
                    return Err(GraphError::unresolved(id, predecessor).into());
                }
                node.after.insert(predecessor.clone());
            }

            debug!(
                "Node {id} ({}) depends on {:?}, after {:?}",
                node.kind, node.dependencies, node.after
            );
            nodes.push(node);
        }

        Self::assemble(nodes)
    }

    /// Assembles and validates a graph from nodes with declared edges.
    ///
    /// # Errors
    ///
    /// Returns an error if an edge points at an unknown node or the edges
    /// form a cycle.
    pub fn assemble(nodes: Vec<ResourceNode>) -> Result<ResourceGraph> {
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let resolve = |node: &ResourceNode, ids: &BTreeSet<String>| -> Result<Vec<usize>> {
            ids.iter()
                .map(|id| {
                    index
                        .get(id)
                        .copied()
                        .ok_or_else(|| ProvisionError::from(GraphError::unresolved(&node.id, id)))
                })
                .collect()
        };

        let mut dependencies = Vec::with_capacity(nodes.len());
        let mut ordering = Vec::with_capacity(nodes.len());
        let mut dependents = vec![Vec::new(); nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            let deps = resolve(node, &node.dependencies)?;
            for &d in &deps {
                dependents[d].push(i);
            }
            dependencies.push(deps);
            ordering.push(resolve(node, &node.after)?);
        }

        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let order = topological_sort(&ids, &dependencies, &ordering)?;

        let mut ranks = vec![0usize; nodes.len()];
        for &idx in &order {
            let from_data = dependencies[idx].iter().map(|&d| ranks[d] + 1).max().unwrap_or(0);
            let from_ordering = ordering[idx].iter().map(|&d| ranks[d]).max().unwrap_or(0);
            ranks[idx] = from_data.max(from_ordering);
        }

        Ok(ResourceGraph {
            nodes,
            index,
            dependencies,
            ordering,
            dependents,
            order,
            ranks,
        })
    }
}

/// Kahn's algorithm over both edge kinds; ties broken by identifier.
///
/// `dependencies[i]` and `ordering[i]` list the predecessors of `i`.
///
/// # Errors
///
/// Returns [`GraphError::CycleDetected`] naming one cycle if the edges are
/// not acyclic.
pub(crate) fn topological_sort(
    ids: &[&str],
    dependencies: &[Vec<usize>],
    ordering: &[Vec<usize>],
) -> std::result::Result<Vec<usize>, GraphError> {
    let mut in_degree = vec![0usize; ids.len()];
    let mut successors = vec![Vec::new(); ids.len()];
    for idx in 0..ids.len() {
        for &pred in dependencies[idx].iter().chain(&ordering[idx]) {
            in_degree[idx] += 1;
            successors[pred].push(idx);
        }
    }

    let mut ready: BinaryHeap<Reverse<(&str, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse((ids[i], i)))
        .collect();

    let mut order = Vec::with_capacity(ids.len());
    while let Some(Reverse((_, idx))) = ready.pop() {
        order.push(idx);
        for &succ in &successors[idx] {
            in_degree[succ] -= 1;
            if in_degree[succ] == 0 {
                ready.push(Reverse((ids[succ], succ)));
            }
        }
    }

    if order.len() == ids.len() {
        Ok(order)
    } else {
        Err(GraphError::CycleDetected {
            cycle: find_cycle(ids, dependencies, ordering, &in_degree),
        })
    }
}

/// Walks predecessors among unsorted nodes until one repeats.
fn find_cycle(
    ids: &[&str],
    dependencies: &[Vec<usize>],
    ordering: &[Vec<usize>],
    in_degree: &[usize],
) -> String {
    let Some(start) = (0..ids.len())
        .filter(|&i| in_degree[i] > 0)
        .min_by_key(|&i| ids[i])
    else {
        return String::from("unknown");
    };

    let mut path = vec![start];
    let mut current = start;
    loop {
        let next = dependencies[current]
            .iter()
            .chain(&ordering[current])
            .copied()
            .filter(|&p| in_degree[p] > 0)
            .min_by_key(|&p| ids[p]);
        let Some(next) = next else {
            break;
        };
        if let Some(pos) = path.iter().position(|&p| p == next) {
            let mut cycle: Vec<&str> = path[pos..].iter().map(|&i| ids[i]).collect();
            cycle.reverse();
            cycle.insert(0, ids[next]);
            return cycle.join(" -> ");
        }
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| ids[i]).collect::<Vec<_>>().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::ResourceKind;

    fn build(yaml: &str) -> Result<ResourceGraph> {
        let document = ConfigParser::new().parse_yaml(yaml, None)?;
        GraphBuilder::new().build(&document)
    }

    #[test]
    fn test_edges_derived_from_references() {
        let graph = build(
            r#"
project: { name: airflow }
variables: { family: airflow-scheduler }
resources:
  repo:
    kind: ecr_repository
    attributes: { name: airflow }
  task:
    kind: ecs_task_definition
    attributes:
      family: "${var.family}"
      cpu: 1024
      memory: 2048
      container_definitions:
        - image: "${repo.repository_url}:latest"
"#,
        )
        .unwrap();

        let task = graph.get("task").unwrap();
        assert_eq!(task.kind, ResourceKind::EcsTaskDefinition);
        assert!(task.dependencies.contains("repo"));
        assert_eq!(task.attributes["family"], "airflow-scheduler");
    }

    #[test]
    fn test_mutual_reference_is_cycle() {
        let err = build(
            r#"
project: { name: airflow }
resources:
  a:
    kind: ecs_cluster
    attributes: { name: "${b.name}" }
  b:
    kind: ecs_cluster
    attributes: { name: "${a.name}" }
"#,
        )
        .unwrap_err();

        match err {
            ProvisionError::Graph(GraphError::CycleDetected { cycle }) => {
                assert!(cycle == "a -> b -> a" || cycle == "b -> a -> b", "{cycle}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let err = build(
            r#"
project: { name: airflow }
resources:
  a:
    kind: ecs_cluster
    attributes: { name: "${a.id}" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Graph(GraphError::CycleDetected { .. })));
    }

    #[test]
    fn test_ordering_cycle_is_detected() {
        let err = build(
            r#"
project: { name: airflow }
resources:
  up:
    kind: ecs_cluster
    after: [down]
    attributes: { name: up }
  down:
    kind: ecs_cluster
    after: [up]
    attributes: { name: down }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Graph(GraphError::CycleDetected { .. })));
    }

    #[test]
    fn test_unknown_reference_is_unresolved() {
        let err = build(
            r#"
project: { name: airflow }
resources:
  service:
    kind: ecs_service
    attributes: { name: s, cluster: c, task_definition: "${task_def.arn}" }
"#,
        )
        .unwrap_err();

        match err {
            ProvisionError::Graph(GraphError::UnresolvedReference { resource, reference }) => {
                assert_eq!(resource, "service");
                assert_eq!(reference, "task_def.arn");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_variable_and_after_are_unresolved() {
        let err = build(
            r#"
project: { name: airflow }
resources:
  c:
    kind: ecs_cluster
    attributes: { name: "${var.nope}" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Graph(GraphError::UnresolvedReference { .. })));

        let err = build(
            r#"
project: { name: airflow }
resources:
  c:
    kind: ecs_cluster
    after: [ghost]
    attributes: { name: c }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Graph(GraphError::UnresolvedReference { .. })));
    }

    #[test]
    fn test_ordered_siblings_share_rank() {
        let graph = build(
            r#"
project: { name: airflow }
resources:
  target:
    kind: appautoscaling_target
    attributes:
      service_namespace: ecs
      resource_id: service/airflow/scheduler
      scalable_dimension: ecs:service:DesiredCount
      min_capacity: 0
      max_capacity: 1
  scale_up:
    kind: appautoscaling_scheduled_action
    attributes:
      name: up
      schedule: cron(0 6 * * ? *)
      service_namespace: "${target.service_namespace}"
      resource_id: "${target.resource_id}"
      scalable_dimension: "${target.scalable_dimension}"
  scale_down:
    kind: appautoscaling_scheduled_action
    after: [scale_up]
    attributes:
      name: down
      schedule: cron(0 20 * * ? *)
      service_namespace: "${target.service_namespace}"
      resource_id: "${target.resource_id}"
      scalable_dimension: "${target.scalable_dimension}"
"#,
        )
        .unwrap();

        let up = graph.index_of("scale_up").unwrap();
        let down = graph.index_of("scale_down").unwrap();
        assert_eq!(graph.rank(up), 1);
        assert_eq!(graph.rank(down), 1);
        assert_eq!(graph.ordering(down), &[up]);

        let order = graph.topological_order();
        let pos = |i| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(up) < pos(down));
    }
}
