//! Resource nodes and per-kind attribute schemas.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Attribute mapping of a resource (key to nested value).
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Resource kinds understood by the provisioning core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Container image repository.
    EcrRepository,
    /// IAM role assumed by tasks.
    IamRole,
    /// VPC security group.
    SecurityGroup,
    /// ECS cluster.
    EcsCluster,
    /// CloudWatch log group.
    CloudwatchLogGroup,
    /// SSM parameter.
    SsmParameter,
    /// ECS task definition.
    EcsTaskDefinition,
    /// ECS service.
    EcsService,
    /// Application Auto Scaling target.
    AppautoscalingTarget,
    /// Application Auto Scaling scheduled action.
    AppautoscalingScheduledAction,
}

/// Attribute schema of a resource kind.
#[derive(Debug, Clone, Copy)]
pub struct KindSchema {
    /// Attributes that must be present.
    pub required: &'static [&'static str],
    /// Attributes whose change forces replacement.
    pub force_new: &'static [&'static str],
}

/// A node in the resource graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical identifier, unique within the document.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired attributes, with `${...}` references left symbolic.
    pub attributes: Attributes,
    /// Logical identifiers this node reads values from.
    pub dependencies: BTreeSet<String>,
    /// Siblings that must finish before this node starts.
    pub after: BTreeSet<String>,
}

impl ResourceKind {
    /// All known kinds.
    pub const ALL: [Self; 10] = [
        Self::EcrRepository,
        Self::IamRole,
        Self::SecurityGroup,
        Self::EcsCluster,
        Self::CloudwatchLogGroup,
        Self::SsmParameter,
        Self::EcsTaskDefinition,
        Self::EcsService,
        Self::AppautoscalingTarget,
        Self::AppautoscalingScheduledAction,
    ];

    /// Returns the attribute schema of this kind.
    #[must_use]
    pub const fn schema(self) -> KindSchema {
        match self {
            Self::IamRole => KindSchema {
                required: &["name", "assume_role_policy"],
                force_new: &["name"],
            },
            Self::SecurityGroup => KindSchema {
                required: &["name", "vpc_id"],
                force_new: &["name", "vpc_id", "description"],
            },
            Self::EcrRepository | Self::EcsCluster | Self::CloudwatchLogGroup => KindSchema {
                required: &["name"],
                force_new: &["name"],
            },
            Self::SsmParameter => KindSchema {
                required: &["name", "type", "value"],
                force_new: &["name"],
            },
            // Every change to a task definition registers a new revision.
            Self::EcsTaskDefinition => KindSchema {
                required: &["family", "cpu", "memory", "container_definitions"],
                force_new: &[
                    "family",
                    "network_mode",
                    "requires_compatibilities",
                    "cpu",
                    "memory",
                    "container_definitions",
                    "execution_role_arn",
                    "task_role_arn",
                ],
            },
            Self::EcsService => KindSchema {
                required: &["name", "cluster", "task_definition"],
                force_new: &["name", "cluster", "launch_type"],
            },
            Self::AppautoscalingTarget => KindSchema {
                required: &[
                    "service_namespace",
                    "resource_id",
                    "scalable_dimension",
                    "min_capacity",
                    "max_capacity",
                ],
                force_new: &["service_namespace", "resource_id", "scalable_dimension"],
            },
            Self::AppautoscalingScheduledAction => KindSchema {
                required: &[
                    "name",
                    "schedule",
                    "resource_id",
                    "scalable_dimension",
                    "service_namespace",
                ],
                force_new: &[
                    "name",
                    "resource_id",
                    "scalable_dimension",
                    "service_namespace",
                ],
            },
        }
    }

    /// Returns true if changing `attribute` forces replacement.
    #[must_use]
    pub fn forces_replacement(self, attribute: &str) -> bool {
        self.schema().force_new.contains(&attribute)
    }

    /// Returns the canonical snake-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EcrRepository => "ecr_repository",
            Self::IamRole => "iam_role",
            Self::SecurityGroup => "security_group",
            Self::EcsCluster => "ecs_cluster",
            Self::CloudwatchLogGroup => "cloudwatch_log_group",
            Self::SsmParameter => "ssm_parameter",
            Self::EcsTaskDefinition => "ecs_task_definition",
            Self::EcsService => "ecs_service",
            Self::AppautoscalingTarget => "appautoscaling_target",
            Self::AppautoscalingScheduledAction => "appautoscaling_scheduled_action",
        }
    }

    /// AWS service prefix used in ARNs.
    #[must_use]
    pub const fn service(self) -> &'static str {
        match self {
            Self::EcrRepository => "ecr",
            Self::IamRole => "iam",
            Self::SecurityGroup => "ec2",
            Self::EcsCluster | Self::EcsTaskDefinition | Self::EcsService => "ecs",
            Self::CloudwatchLogGroup => "logs",
            Self::SsmParameter => "ssm",
            Self::AppautoscalingTarget | Self::AppautoscalingScheduledAction => {
                "application-autoscaling"
            }
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ResourceNode {
    /// Creates a node with no edges.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind, attributes: Attributes) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes,
            dependencies: BTreeSet::new(),
            after: BTreeSet::new(),
        }
    }

    /// Returns the `name` attribute if it is a literal string.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.attributes.get("name").and_then(serde_json::Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_forces_replacement() {
        assert!(ResourceKind::EcsTaskDefinition.forces_replacement("network_mode"));
        assert!(!ResourceKind::EcsService.forces_replacement("desired_count"));
        assert!(ResourceKind::EcsService.forces_replacement("cluster"));
    }

    #[test]
    fn test_kind_names_match_serde() {
        for kind in ResourceKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_required_attributes_are_declared() {
        for kind in ResourceKind::ALL {
            assert!(!kind.schema().required.is_empty(), "{kind} has no required attributes");
        }
    }
}
