//! Configuration parser for loading desired-state documents.
//!
//! This module handles loading documents from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ProvisionError, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use super::spec::DesiredDocument;

/// Configuration parser for loading desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DesiredDocument> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ProvisionError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DesiredDocument> {
        debug!("Parsing YAML configuration");

        let document: DesiredDocument = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ProvisionError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed {} resources for project: {}",
            document.resources.len(),
            document.project.name
        );
        Ok(document)
    }

    /// Loads a document with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `ECSPROV_<SECTION>_<KEY>` (e.g., `ECSPROV_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DesiredDocument> {
        let mut document = self.load_file(path)?;
        Self::apply_env_overrides(&mut document)?;
        Ok(document)
    }

    /// Applies environment variable overrides to the document.
    fn apply_env_overrides(document: &mut DesiredDocument) -> Result<()> {
        if let Ok(name) = std::env::var("ECSPROV_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            document.project.name = name;
        }

        if let Ok(env) = std::env::var("ECSPROV_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            document.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("ECSPROV_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            document.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("ECSPROV_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            document.state.prefix = Some(prefix);
        }

        if let Ok(concurrency) = std::env::var("ECSPROV_CONCURRENCY") {
            debug!("Overriding executor.concurrency from environment");
            document.executor.concurrency = concurrency.parse().map_err(|_| {
                ConfigError::validation(
                    format!("ECSPROV_CONCURRENCY must be a positive integer, got '{concurrency}'"),
                    "executor.concurrency",
                )
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ProvisionError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["ecsprov.yaml", "ecsprov.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start
        .canonicalize()
        .unwrap_or_else(|_| start.to_path_buf());

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    warn!("No configuration file found from {}", start.display());
    Err(ProvisionError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use crate::graph::ResourceKind;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: airflow
";
        let parser = ConfigParser::new();
        let document = parser.parse_yaml(yaml, None).unwrap();

        assert_eq!(document.project.name, "airflow");
        assert_eq!(document.project.environment, "dev");
        assert_eq!(document.executor.concurrency, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: airflow
  environment: prod
  region: eu-west-1

variables:
  cluster: airflow-prod

state:
  backend: s3
  bucket: airflow-state
  prefix: airflow/prod

executor:
  concurrency: 2
  max_retries: 5

resources:
  scheduler_logs:
    kind: cloudwatch_log_group
    attributes:
      name: /ecs/airflow-scheduler
      retention_in_days: 14
  scale_down_night:
    kind: appautoscaling_scheduled_action
    after: [scale_up_morning]
    attributes:
      name: scheduler-scale-down
      schedule: cron(0 20 * * ? *)
      service_namespace: ecs
      resource_id: service/airflow-prod/scheduler
      scalable_dimension: ecs:service:DesiredCount
      min_capacity: 0
      max_capacity: 0
  scale_up_morning:
    kind: appautoscaling_scheduled_action
    attributes:
      name: scheduler-scale-up
      schedule: cron(0 6 * * ? *)
      service_namespace: ecs
      resource_id: service/airflow-prod/scheduler
      scalable_dimension: ecs:service:DesiredCount
      min_capacity: 1
      max_capacity: 1
"#;
        let document = ConfigParser::new().parse_yaml(yaml, None).unwrap();

        assert_eq!(document.state.backend, StateBackend::S3);
        assert_eq!(document.executor.concurrency, 2);
        assert_eq!(document.executor.max_retries, 5);
        assert_eq!(document.resources.len(), 3);

        let down = &document.resources["scale_down_night"];
        assert_eq!(down.kind, ResourceKind::AppautoscalingScheduledAction);
        assert_eq!(down.after, vec![String::from("scale_up_morning")]);
        assert_eq!(down.attributes["min_capacity"], 0);
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", Some(Path::new("ecsprov.yaml")))
            .unwrap_err();

        match err {
            ProvisionError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("ecsprov.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("ecsprov.yaml"), "project: { name: a }\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert!(found.ends_with("ecsprov.yaml"));
    }
}
