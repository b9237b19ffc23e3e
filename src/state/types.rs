//! State types for tracking applied resources.
//!
//! These types represent what the last apply recorded for each resource,
//! used by the diff engine to decide what changes and by the executor to
//! resolve references to provider-assigned values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::graph::{Attributes, ResourceKind};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept in state.
const MAX_HISTORY: usize = 100;

/// The complete applied state of a project environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// Hash of the last applied document.
    #[serde(default)]
    pub document_hash: String,
    /// Applied resources keyed by logical identifier.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
}

/// State of a single applied resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Logical identifier from the document.
    pub logical_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned identifier (ARN-style).
    pub provider_id: String,
    /// Symbolic attributes as last applied.
    pub attributes: Attributes,
    /// Hash of `attributes`.
    pub attributes_hash: String,
    /// Values reported by the provider (e.g. `repository_url`).
    #[serde(default)]
    pub outputs: Attributes,
    /// Logical identifiers this resource depended on when applied.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Values its references resolved to when applied, keyed by
    /// `target` or `target.attribute`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved: BTreeMap<String, Value>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the apply finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: ApplyOperation,
    /// Document hash at time of apply.
    pub document_hash: String,
    /// Resources that were changed.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOperation {
    /// Apply of a desired-state document.
    Apply,
    /// Destruction of every applied resource.
    Destroy,
}

impl AppliedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            document_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by logical identifier.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&ResourceState> {
        self.resources.get(logical_id)
    }

    /// Adds or replaces a resource.
    pub fn set(&mut self, resource: ResourceState) {
        self.resources.insert(resource.logical_id.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by logical identifier.
    pub fn remove(&mut self, logical_id: &str) -> Option<ResourceState> {
        let result = self.resources.remove(logical_id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Replaces every resource with `resources`.
    pub fn replace_resources(&mut self, resources: BTreeMap<String, ResourceState>) {
        self.resources = resources;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Marks the state as saved once more.
    pub fn bump_serial(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Returns all logical identifiers.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl ResourceState {
    /// Creates a resource state for a freshly created provider object.
    #[must_use]
    pub fn new(
        logical_id: &str,
        kind: ResourceKind,
        provider_id: &str,
        attributes: Attributes,
        attributes_hash: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            logical_id: logical_id.to_string(),
            kind,
            provider_id: provider_id.to_string(),
            attributes,
            attributes_hash: attributes_hash.to_string(),
            outputs: Attributes::new(),
            dependencies: BTreeSet::new(),
            resolved: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolves the value another resource reads through
    /// `${logical_id.attribute}` (or `${logical_id}` when `attribute` is
    /// `None`).
    ///
    /// `id` and `arn` resolve to the provider identifier; other names are
    /// looked up in provider outputs first, then in applied attributes.
    #[must_use]
    pub fn lookup(&self, attribute: Option<&str>) -> Option<Value> {
        match attribute {
            None | Some("id" | "arn") => Some(Value::String(self.provider_id.clone())),
            Some(name) => self
                .outputs
                .get(name)
                .or_else(|| self.attributes.get(name))
                .cloned(),
        }
    }
}

impl ApplyHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: ApplyOperation, document_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            document_hash: document_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: ApplyOperation,
        document_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            document_hash: document_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for ApplyOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
