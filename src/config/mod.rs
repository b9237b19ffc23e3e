//! Configuration module for the provisioning system.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `ecsprov.yaml`
//! - Validation of documents against per-kind schemas
//! - Computing document and attribute hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DesiredDocument, ExecutorConfig, ProjectConfig, ResourceSpec, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
