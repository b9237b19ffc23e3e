//! Validation of desired-state documents.
//!
//! Checks names, per-kind required attributes and value ranges before the
//! graph is built, collecting every problem instead of stopping at the first.

use crate::error::{ConfigError, ProvisionError, Result};
use crate::graph::ResourceKind;
use crate::graph::reference::VARIABLE_NAMESPACE;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

use super::spec::{DesiredDocument, ExecutorConfig, ProjectConfig, ResourceSpec, StateBackend, StateConfig};

/// Validator for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

/// Accepted prefixes of a scheduled action `schedule` expression.
const SCHEDULE_PREFIXES: &[&str] = &["cron(", "rate(", "at("];

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, document: &DesiredDocument) -> Result<ValidationResult> {
        let result = self.check(document);

        if let Some(first_error) = result.errors.first() {
            Err(ProvisionError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, document: &DesiredDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&document.project, &mut result);
        Self::validate_state(&document.state, &mut result);
        Self::validate_executor(&document.executor, &mut result);
        for (id, spec) in &document.resources {
            Self::validate_resource(id, spec, &mut result);
        }
        Self::check_unordered_schedules(&document.resources, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with '-' or '_', starting with a letter.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored with the local backend"));
                }
            }
        }
    }

    fn validate_executor(executor: &ExecutorConfig, result: &mut ValidationResult) {
        if executor.concurrency == 0 {
            result.error("executor.concurrency", "Concurrency must be at least 1");
        }
        if executor.base_backoff_ms > executor.max_backoff_ms {
            result.error(
                "executor.base_backoff_ms",
                "Base backoff cannot exceed max backoff",
            );
        }
    }

    fn validate_resource(id: &str, spec: &ResourceSpec, result: &mut ValidationResult) {
        let field = format!("resources.{id}");

        if !is_valid_name(id) {
            result.error(
                &field,
                format!("Resource name '{id}' is invalid. Must be lowercase alphanumeric with '-' or '_', starting with a letter."),
            );
        } else if id == VARIABLE_NAMESPACE {
            result.error(
                &field,
                format!("Resource name '{id}' is reserved for ${{{VARIABLE_NAMESPACE}.NAME}} variable references"),
            );
        }

        for required in spec.kind.schema().required {
            if !spec.attributes.contains_key(*required) {
                result.error(
                    format!("{field}.attributes.{required}"),
                    format!("{} '{id}' requires attribute '{required}'", spec.kind),
                );
            }
        }

        if spec.after.iter().any(|p| p == id) {
            result.error(format!("{field}.after"), format!("'{id}' cannot be ordered after itself"));
        }

        match spec.kind {
            ResourceKind::AppautoscalingScheduledAction => {
                if let Some(Value::String(schedule)) = spec.attributes.get("schedule") {
                    if !is_valid_schedule(schedule) {
                        result.error(
                            format!("{field}.attributes.schedule"),
                            format!("Schedule '{schedule}' must be cron(...), rate(...) or at(...)"),
                        );
                    }
                }
                Self::validate_capacity(&field, spec, result);
            }
            ResourceKind::AppautoscalingTarget => Self::validate_capacity(&field, spec, result),
            _ => {}
        }
    }

    fn validate_capacity(field: &str, spec: &ResourceSpec, result: &mut ValidationResult) {
        let min = spec.attributes.get("min_capacity").and_then(Value::as_i64);
        let max = spec.attributes.get("max_capacity").and_then(Value::as_i64);

        if min.is_some_and(|m| m < 0) {
            result.error(
                format!("{field}.attributes.min_capacity"),
                "min_capacity cannot be negative",
            );
        }
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                result.error(
                    format!("{field}.attributes.min_capacity"),
                    format!("min_capacity ({min}) cannot exceed max_capacity ({max})"),
                );
            }
        }
    }

    /// Warns when two scheduled actions target the same resource without
    /// an ordering constraint between them.
    fn check_unordered_schedules(
        resources: &BTreeMap<String, ResourceSpec>,
        result: &mut ValidationResult,
    ) {
        let mut by_target: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for (id, spec) in resources {
            if spec.kind != ResourceKind::AppautoscalingScheduledAction {
                continue;
            }
            if let Some(target) = spec.attributes.get("resource_id") {
                by_target.entry(target.to_string()).or_default().push(id);
            }
        }

        let ordered = |a: &str, b: &str| {
            resources[a].after.iter().any(|p| p == b) || resources[b].after.iter().any(|p| p == a)
        };

        for (target, actions) in by_target {
            for (i, a) in actions.iter().enumerate() {
                for b in &actions[i + 1..] {
                    if !ordered(a, b) {
                        result.warnings.push(format!(
                            "Scheduled actions '{a}' and '{b}' both target {target} without an 'after' constraint; they may be applied concurrently"
                        ));
                    }
                }
            }
        }
    }
}

/// Schedules holding a reference are checked once resolved by the provider.
fn is_valid_schedule(schedule: &str) -> bool {
    schedule.contains("${")
        || SCHEDULE_PREFIXES
            .iter()
            .any(|p| schedule.starts_with(p) && schedule.ends_with(')'))
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with `-` or `_`, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn check(yaml: &str) -> ValidationResult {
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        ConfigValidator::new().check(&document)
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("task_def"));
        assert!(is_valid_name("airflow-scheduler"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("repo2"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("TaskDef")); // uppercase
        assert!(!is_valid_name("2repo")); // starts with number
        assert!(!is_valid_name("repo-")); // ends with hyphen
        assert!(!is_valid_name("a--b")); // consecutive hyphens
        assert!(!is_valid_name("a.b"));
    }

    #[test]
    fn test_variable_namespace_is_reserved() {
        let result = check(
            r"
project: { name: airflow }
variables: { cluster_name: airflow }
resources:
  var:
    kind: ecs_cluster
    attributes: { name: airflow }
  cluster:
    kind: ecs_cluster
    attributes: { name: '${var.cluster_name}' }
",
        );

        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.field == "resources.var" && e.message.contains("reserved")));
        assert!(result.errors.iter().all(|e| e.field != "resources.cluster"));
    }

    #[test]
    fn test_missing_required_attribute() {
        let result = check(
            r"
project: { name: airflow }
resources:
  task_def:
    kind: ecs_task_definition
    attributes: { family: airflow, cpu: 256 }
",
        );

        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"resources.task_def.attributes.memory"));
        assert!(fields.contains(&"resources.task_def.attributes.container_definitions"));
    }

    #[test]
    fn test_schedule_and_capacity_rules() {
        let result = check(
            r"
project: { name: airflow }
resources:
  nightly:
    kind: appautoscaling_scheduled_action
    attributes:
      name: nightly
      schedule: every night
      service_namespace: ecs
      resource_id: service/airflow/scheduler
      scalable_dimension: ecs:service:DesiredCount
      min_capacity: 3
      max_capacity: 1
",
        );

        assert_eq!(result.error_count(), 2);
        assert!(result.errors[0].message.contains("cron(...)"));
        assert!(result.errors[1].message.contains("cannot exceed"));
    }

    #[test]
    fn test_s3_backend_requires_bucket_and_concurrency_positive() {
        let result = check(
            r"
project: { name: airflow }
state: { backend: s3 }
executor: { concurrency: 0 }
",
        );

        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["state.bucket", "executor.concurrency"]);
    }

    #[test]
    fn test_unordered_schedules_warn() {
        let yaml = r"
project: { name: airflow }
resources:
  up:
    kind: appautoscaling_scheduled_action
    attributes:
      name: up
      schedule: cron(0 6 * * ? *)
      service_namespace: ecs
      resource_id: service/airflow/scheduler
      scalable_dimension: ecs:service:DesiredCount
  down:
    kind: appautoscaling_scheduled_action
    attributes:
      name: down
      schedule: cron(0 20 * * ? *)
      service_namespace: ecs
      resource_id: service/airflow/scheduler
      scalable_dimension: ecs:service:DesiredCount
";
        let result = check(yaml);
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);

        let ordered = yaml.replace("  down:\n    kind: appautoscaling_scheduled_action\n", "  down:\n    kind: appautoscaling_scheduled_action\n    after: [up]\n");
        assert_eq!(check(&ordered).warning_count(), 0);
    }

    #[test]
    fn test_validate_returns_first_error() {
        let document = ConfigParser::new()
            .parse_yaml("project: { name: Airflow }\n", None)
            .unwrap();
        let err = ConfigValidator::new().validate(&document).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Config(ConfigError::ValidationError { field: Some(ref f), .. }) if f == "project.name"
        ));
    }
}
