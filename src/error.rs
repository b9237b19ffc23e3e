//! Error types for the provisioning system.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph building, state management and provider calls.
//! Graph errors abort a run before any provider call is made; provider
//! errors are scoped to a single node and surface in the execution report.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the provisioning system.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Cloud provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Node-scoped plan execution errors.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },
}

/// Errors raised while building the resource graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Dependency edges form a cycle.
    #[error("Dependency cycle detected: {cycle}")]
    CycleDetected {
        /// The cycle path, e.g. `a -> b -> a`.
        cycle: String,
    },

    /// A resource references a name absent from the document.
    #[error("Resource '{resource}' references unknown '{reference}'")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The unresolved name.
        reference: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the failure.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock was released or taken over while it was held.
    #[error("State lock {lock_id} is no longer held by this run")]
    LockLost {
        /// Identifier of the lost lock.
        lock_id: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Errors reported by a [`CloudProvider`](crate::provider::CloudProvider).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider API rejected or failed the call.
    #[error("{operation} failed: {message}")]
    Api {
        /// Provider operation (create, update, delete, read).
        operation: String,
        /// Error message from the provider.
        message: String,
        /// Whether the call may succeed if repeated.
        retryable: bool,
    },

    /// The provider object does not exist.
    #[error("Resource not found: {id}")]
    NotFound {
        /// Provider-assigned identifier.
        id: String,
    },
}

/// Node-scoped errors raised while executing a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// A data dependency failed, so the node was never attempted.
    #[error("Resource '{resource}' blocked by failure of '{failed}'")]
    BlockedByFailure {
        /// The blocked resource.
        resource: String,
        /// The failed ancestor.
        failed: String,
    },

    /// The run was cancelled before the node was scheduled.
    #[error("Resource '{resource}' cancelled before it was scheduled")]
    Cancelled {
        /// The cancelled resource.
        resource: String,
    },
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a parse error without a location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location: None,
        }
    }
}

impl GraphError {
    /// Creates an unresolved reference error.
    #[must_use]
    pub fn unresolved(resource: impl Into<String>, reference: impl Into<String>) -> Self {
        Self::UnresolvedReference {
            resource: resource.into(),
            reference: reference.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable API error.
    #[must_use]
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable API error.
    #[must_use]
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Returns true if repeating the call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Api { retryable: true, .. })
    }

    /// Returns true if the provider object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::transient("create", "throttled").is_retryable());
        assert!(!ProviderError::permanent("create", "invalid cpu").is_retryable());
        assert!(!ProviderError::not_found("arn:x").is_retryable());
        assert!(ProviderError::not_found("arn:x").is_not_found());
    }

    #[test]
    fn test_retryable_propagates_through_wrapper() {
        let err = ProvisionError::from(ProviderError::transient("update", "ConcurrentUpdateException"));
        assert!(err.is_retryable());

        let err = ProvisionError::from(GraphError::unresolved("service", "task_def"));
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Graph error: Resource 'service' references unknown 'task_def'"
        );
    }
}
