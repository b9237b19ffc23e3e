//! In-process provider standing in for the AWS APIs.
//!
//! Objects live in an inventory that can be persisted to a JSON file, so
//! consecutive CLI runs see the same "cloud". Failures and latency can be
//! injected per resource kind, and every call is recorded with its start
//! and finish instants.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ProviderError, ProvisionError, Result};
use crate::graph::{Attributes, ResourceKind};

use super::{CloudProvider, ProviderResource};

/// Default region for generated identifiers.
const DEFAULT_REGION: &str = "us-east-1";

/// Default account for generated identifiers.
const DEFAULT_ACCOUNT: &str = "000000000000";

/// Injected failure for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureRule {
    /// Whether the injected error is retryable.
    pub retryable: bool,
    /// How many calls fail before the kind recovers; `None` fails forever.
    pub remaining: Option<u32>,
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Operation name (`create`, `update`, `delete`, `read`).
    pub operation: &'static str,
    /// Kind of the object, if known.
    pub kind: Option<ResourceKind>,
    /// Natural name of the object (name, family or identifier).
    pub name: String,
    /// When the call started.
    pub started: Instant,
    /// When the call finished.
    pub finished: Instant,
    /// Whether the call succeeded.
    pub succeeded: bool,
}

/// Persisted inventory.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    #[serde(default)]
    resources: BTreeMap<String, ProviderResource>,
    /// Last registered revision per task definition family.
    #[serde(default)]
    revisions: BTreeMap<String, u64>,
}

/// Simulated cloud provider.
#[derive(Debug)]
pub struct SimulatedProvider {
    region: String,
    account: String,
    path: Option<PathBuf>,
    latency: Duration,
    inventory: Mutex<Inventory>,
    failures: Mutex<HashMap<ResourceKind, FailureRule>>,
    calls: Mutex<Vec<CallRecord>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    /// Creates an empty, in-memory provider.
    #[must_use]
    pub fn new() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            account: DEFAULT_ACCOUNT.to_string(),
            path: None,
            latency: Duration::ZERO,
            inventory: Mutex::new(Inventory::default()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Opens a provider whose inventory is persisted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let inventory = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                ProvisionError::internal(format!(
                    "Failed to parse provider inventory {}: {e}",
                    path.display()
                ))
            })?
        } else {
            Inventory::default()
        };
        info!(
            "Simulated provider opened at {} ({} objects)",
            path.display(),
            inventory.resources.len()
        );

        Ok(Self {
            path: Some(path),
            inventory: Mutex::new(inventory),
            ..Self::new()
        })
    }

    /// Sets the region used in identifiers.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Injects a failure rule for `kind`.
    pub fn fail(&self, kind: ResourceKind, rule: FailureRule) {
        locked(&self.failures).insert(kind, rule);
    }

    /// Makes every call on `kind` fail with a non-retryable error.
    pub fn fail_always(&self, kind: ResourceKind) {
        self.fail(kind, FailureRule { retryable: false, remaining: None });
    }

    /// Makes the next `times` calls on `kind` fail with a retryable error.
    pub fn fail_transiently(&self, kind: ResourceKind, times: u32) {
        self.fail(kind, FailureRule { retryable: true, remaining: Some(times) });
    }

    /// Path of the persisted inventory, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns a copy of the call log.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        locked(&self.calls).clone()
    }

    /// Returns every object currently held.
    #[must_use]
    pub fn resources(&self) -> Vec<ProviderResource> {
        locked(&self.inventory).resources.values().cloned().collect()
    }

    /// Changes an attribute out of band, as an operator would in the console.
    pub fn set_attribute(&self, id: &str, key: &str, value: Value) -> bool {
        locked(&self.inventory)
            .resources
            .get_mut(id)
            .map(|r| r.attributes.insert(key.to_string(), value))
            .is_some()
    }

    /// Removes an object out of band.
    pub fn forget(&self, id: &str) -> bool {
        locked(&self.inventory).resources.remove(id).is_some()
    }

    fn take_failure(&self, kind: ResourceKind, operation: &str) -> Option<ProviderError> {
        let mut failures = locked(&self.failures);
        let rule = failures.get_mut(&kind)?;

        match rule.remaining.as_mut() {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }

        let message = format!("injected failure for {kind}");
        Some(if rule.retryable {
            ProviderError::transient(operation, format!("{message} (ThrottlingException)"))
        } else {
            ProviderError::permanent(operation, format!("{message} (InvalidParameterException)"))
        })
    }

    async fn persist(&self) {
        let Some(path) = &self.path else { return };

        let serialized = {
            let inventory = locked(&self.inventory);
            serde_json::to_vec_pretty(&*inventory)
        };
        let content = match serialized {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to serialize provider inventory: {e}");
                return;
            }
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("Failed to create {}: {e}", parent.display());
                return;
            }
        }
        if let Err(e) = tokio::fs::write(path, content).await {
            warn!("Failed to persist provider inventory to {}: {e}", path.display());
        }
    }

    /// Runs one call: latency, failure injection, `apply`, call log.
    async fn invoke<T>(
        &self,
        operation: &'static str,
        kind: Option<ResourceKind>,
        name: String,
        apply: impl FnOnce(&mut Inventory) -> std::result::Result<T, ProviderError>,
    ) -> std::result::Result<T, ProviderError> {
        let started = Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = match kind.and_then(|k| self.take_failure(k, operation)) {
            Some(err) => Err(err),
            None => {
                let mut inventory = locked(&self.inventory);
                apply(&mut inventory)
            }
        };

        debug!(
            "{} {operation} {name}: {}",
            self.name(),
            if result.is_ok() { "ok" } else { "failed" }
        );
        locked(&self.calls).push(CallRecord {
            operation,
            kind,
            name,
            started,
            finished: Instant::now(),
            succeeded: result.is_ok(),
        });

        if result.is_ok() && operation != "read" {
            self.persist().await;
        }
        result
    }

    fn kind_of(&self, id: &str) -> Option<ResourceKind> {
        locked(&self.inventory).resources.get(id).map(|r| r.kind)
    }

    fn arn(&self, service: &str, resource: &str) -> String {
        format!("arn:aws:{service}:{}:{}:{resource}", self.region, self.account)
    }

    /// Builds the identifier and provider outputs for a new object.
    fn materialize(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
        inventory: &mut Inventory,
    ) -> (String, Attributes) {
        let name = object_name(kind, attributes);
        let token = Uuid::new_v4().simple().to_string();
        let mut outputs = Attributes::new();

        let id = match kind {
            ResourceKind::EcrRepository => {
                outputs.insert(
                    String::from("repository_url"),
                    json!(format!(
                        "{}.dkr.ecr.{}.amazonaws.com/{name}",
                        self.account, self.region
                    )),
                );
                outputs.insert(String::from("registry_id"), json!(self.account));
                self.arn("ecr", &format!("repository/{name}"))
            }
            ResourceKind::IamRole => {
                outputs.insert(
                    String::from("unique_id"),
                    json!(format!("AROA{}", token[..16].to_uppercase())),
                );
                format!("arn:aws:iam::{}:role/{name}", self.account)
            }
            ResourceKind::SecurityGroup => {
                let group_id = format!("sg-{}", &token[..17]);
                outputs.insert(String::from("group_id"), json!(group_id));
                self.arn("ec2", &format!("security-group/{group_id}"))
            }
            ResourceKind::EcsCluster => self.arn("ecs", &format!("cluster/{name}")),
            ResourceKind::CloudwatchLogGroup => self.arn("logs", &format!("log-group:{name}")),
            ResourceKind::SsmParameter => {
                outputs.insert(String::from("version"), json!(1));
                self.arn("ssm", &format!("parameter/{}", name.trim_start_matches('/')))
            }
            ResourceKind::EcsTaskDefinition => {
                let revision = inventory.revisions.entry(name.clone()).or_insert(0);
                *revision += 1;
                outputs.insert(String::from("family"), json!(name));
                outputs.insert(String::from("revision"), json!(*revision));
                self.arn("ecs", &format!("task-definition/{name}:{revision}"))
            }
            ResourceKind::EcsService => {
                let cluster = attributes
                    .get("cluster")
                    .and_then(Value::as_str)
                    .and_then(|c| c.rsplit('/').next())
                    .unwrap_or("default")
                    .to_string();
                outputs.insert(String::from("status"), json!("ACTIVE"));
                self.arn("ecs", &format!("service/{cluster}/{name}"))
            }
            ResourceKind::AppautoscalingTarget => {
                self.arn("application-autoscaling", &format!("scalable-target/{}", &token[..20]))
            }
            ResourceKind::AppautoscalingScheduledAction => self.arn(
                "autoscaling",
                &format!("scheduledAction:{token}:scheduledActionName/{name}"),
            ),
        };

        outputs.insert(String::from("arn"), json!(id));
        (id, outputs)
    }
}

/// Natural name of an object, used in identifiers and the call log.
fn object_name(kind: ResourceKind, attributes: &Attributes) -> String {
    let key = match kind {
        ResourceKind::EcsTaskDefinition => "family",
        ResourceKind::AppautoscalingTarget => "resource_id",
        _ => "name",
    };
    attributes
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("unnamed")
        .to_string()
}

#[async_trait]
impl CloudProvider for SimulatedProvider {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        let name = object_name(kind, attributes);
        self.invoke("create", Some(kind), name, |inventory| {
            let (id, outputs) = self.materialize(kind, attributes, inventory);
            if inventory.resources.contains_key(&id) {
                return Err(ProviderError::permanent(
                    "create",
                    format!("ResourceAlreadyExists: {id}"),
                ));
            }
            let resource = ProviderResource {
                id: id.clone(),
                kind,
                attributes: attributes.clone(),
                outputs,
            };
            inventory.resources.insert(id, resource.clone());
            Ok(resource)
        })
        .await
    }

    async fn update(
        &self,
        id: &str,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> std::result::Result<ProviderResource, ProviderError> {
        let name = object_name(kind, attributes);
        self.invoke("update", Some(kind), name, |inventory| {
            let resource = inventory
                .resources
                .get_mut(id)
                .ok_or_else(|| ProviderError::not_found(id))?;
            resource.attributes = attributes.clone();
            if kind == ResourceKind::SsmParameter {
                let version = resource.outputs.get("version").and_then(Value::as_u64).unwrap_or(0);
                resource.outputs.insert(String::from("version"), json!(version + 1));
            }
            Ok(resource.clone())
        })
        .await
    }

    async fn delete(&self, id: &str) -> std::result::Result<(), ProviderError> {
        let kind = self.kind_of(id);
        self.invoke("delete", kind, id.to_string(), |inventory| {
            inventory
                .resources
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::not_found(id))
        })
        .await
    }

    async fn read(&self, id: &str) -> std::result::Result<ProviderResource, ProviderError> {
        let kind = self.kind_of(id);
        self.invoke("read", kind, id.to_string(), |inventory| {
            inventory
                .resources
                .get(id)
                .cloned()
                .ok_or_else(|| ProviderError::not_found(id))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(value: Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_arn_and_outputs() {
        let provider = SimulatedProvider::new().with_region("eu-west-1");

        let repo = provider
            .create(ResourceKind::EcrRepository, &attrs(json!({"name": "airflow"})))
            .await
            .unwrap();
        assert_eq!(repo.id, "arn:aws:ecr:eu-west-1:000000000000:repository/airflow");
        assert_eq!(
            repo.outputs["repository_url"],
            "000000000000.dkr.ecr.eu-west-1.amazonaws.com/airflow"
        );

        let task = attrs(json!({"family": "scheduler", "cpu": 256}));
        let first = provider.create(ResourceKind::EcsTaskDefinition, &task).await.unwrap();
        let second = provider.create(ResourceKind::EcsTaskDefinition, &task).await.unwrap();
        assert!(first.id.ends_with("task-definition/scheduler:1"));
        assert!(second.id.ends_with("task-definition/scheduler:2"));
        assert_eq!(second.outputs["revision"], 2);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let provider = SimulatedProvider::new();
        let cluster = attrs(json!({"name": "airflow"}));

        provider.create(ResourceKind::EcsCluster, &cluster).await.unwrap();
        let err = provider.create(ResourceKind::EcsCluster, &cluster).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_update_delete_read() {
        let provider = SimulatedProvider::new();
        let param = provider
            .create(
                ResourceKind::SsmParameter,
                &attrs(json!({"name": "/airflow/fernet", "type": "SecureString", "value": "a"})),
            )
            .await
            .unwrap();

        let updated = provider
            .update(
                &param.id,
                ResourceKind::SsmParameter,
                &attrs(json!({"name": "/airflow/fernet", "type": "SecureString", "value": "b"})),
            )
            .await
            .unwrap();
        assert_eq!(updated.attributes["value"], "b");
        assert_eq!(updated.outputs["version"], 2);

        provider.delete(&param.id).await.unwrap();
        assert!(provider.read(&param.id).await.unwrap_err().is_not_found());
        assert!(provider.delete(&param.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_transient_failures_recover() {
        let provider = SimulatedProvider::new();
        provider.fail_transiently(ResourceKind::EcsCluster, 2);
        let cluster = attrs(json!({"name": "airflow"}));

        assert!(provider.create(ResourceKind::EcsCluster, &cluster).await.unwrap_err().is_retryable());
        assert!(provider.create(ResourceKind::EcsCluster, &cluster).await.unwrap_err().is_retryable());
        assert!(provider.create(ResourceKind::EcsCluster, &cluster).await.is_ok());

        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls.iter().filter(|c| c.succeeded).count(), 1);
        assert_eq!(calls[0].name, "airflow");
    }

    #[tokio::test]
    async fn test_inventory_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.json");

        let id = {
            let provider = SimulatedProvider::open(&path).unwrap();
            provider
                .create(ResourceKind::CloudwatchLogGroup, &attrs(json!({"name": "/ecs/airflow"})))
                .await
                .unwrap()
                .id
        };

        let reopened = SimulatedProvider::open(&path).unwrap();
        assert_eq!(reopened.read(&id).await.unwrap().attributes["name"], "/ecs/airflow");
    }
}
