//! Resource graph module.
//!
//! This module turns the desired-state document into a validated DAG:
//! - Resource nodes and per-kind attribute schemas
//! - `${...}` reference scanning and resolution
//! - Topological ordering and ranking

mod builder;
mod dag;
mod node;
pub mod reference;

pub use builder::GraphBuilder;
pub(crate) use builder::topological_sort;
pub use dag::ResourceGraph;
pub use node::{Attributes, KindSchema, ResourceKind, ResourceNode};
pub use reference::Reference;

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::{Attributes, GraphBuilder, ResourceGraph, ResourceKind, ResourceNode};

    /// Builds a node with declared dependencies.
    pub fn node(id: &str, kind: ResourceKind, deps: &[&str]) -> ResourceNode {
        let mut attributes = Attributes::from([(String::from("name"), json!(id))]);
        for dep in deps {
            attributes.insert(format!("{dep}_ref"), json!(format!("${{{dep}.id}}")));
        }
        let mut node = ResourceNode::new(id, kind, attributes);
        node.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        node
    }

    /// `ecr_repo`, `security_group`, `task_def -> ecr_repo`,
    /// `service -> task_def, security_group`.
    pub fn scenario_graph() -> ResourceGraph {
        GraphBuilder::assemble(vec![
            node("service", ResourceKind::EcsService, &["task_def", "security_group"]),
            node("task_def", ResourceKind::EcsTaskDefinition, &["ecr_repo"]),
            node("security_group", ResourceKind::SecurityGroup, &[]),
            node("ecr_repo", ResourceKind::EcrRepository, &[]),
        ])
        .unwrap()
    }
}
