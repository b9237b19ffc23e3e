//! Desired-state document types.
//!
//! This module defines the structs that map to the `ecsprov.yaml` file.
//! A document is a mapping of logical resource names to typed specs that
//! refer to each other through `${...}` references.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::graph::{Attributes, ResourceKind};

/// The root desired-state document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesiredDocument {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Values available to resources as `${var.<name>}`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Plan executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// AWS region the resources live in.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Plan executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries for retryable provider errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Spec of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Siblings that must finish before this resource is applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: Attributes,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl DesiredDocument {
    /// Returns the number of resources of `kind`.
    #[must_use]
    pub fn count_kind(&self, kind: ResourceKind) -> usize {
        self.resources.values().filter(|r| r.kind == kind).count()
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_concurrency() -> usize {
    4
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_base_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let yaml = "project:\n  name: airflow\n";
        let doc: DesiredDocument = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(doc.project.environment, "dev");
        assert_eq!(doc.state.backend, StateBackend::Local);
        assert_eq!(doc.executor, ExecutorConfig::default());
        assert!(doc.resources.is_empty());
    }

    #[test]
    fn test_unknown_resource_field_rejected() {
        let yaml = r"
project:
  name: airflow
resources:
  repo:
    kind: ecr_repository
    attribute: {}
";
        assert!(serde_yaml::from_str::<DesiredDocument>(yaml).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let yaml = r"
project:
  name: airflow
resources:
  bucket:
    kind: s3_bucket
";
        assert!(serde_yaml::from_str::<DesiredDocument>(yaml).is_err());
    }

    #[test]
    fn test_count_kind() {
        let yaml = r"
project:
  name: airflow
resources:
  a: { kind: ecs_cluster, attributes: { name: a } }
  b: { kind: ecs_cluster, attributes: { name: b } }
  r: { kind: ecr_repository, attributes: { name: r } }
";
        let doc: DesiredDocument = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.count_kind(ResourceKind::EcsCluster), 2);
    }
}
