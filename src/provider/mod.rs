//! Cloud provider boundary.
//!
//! The executor talks to the cloud only through [`CloudProvider`]. Every
//! call may fail with a [`ProviderError`] that says whether repeating it can
//! succeed.

mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

pub use simulated::{CallRecord, FailureRule, SimulatedProvider};

/// A provider object as reported after a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-assigned identifier (ARN-style).
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Attributes as the provider holds them, references resolved.
    pub attributes: Attributes,
    /// Values computed by the provider, readable through references.
    #[serde(default)]
    pub outputs: Attributes,
}

/// Operations the provisioning core needs from a cloud provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Creates an object of `kind`.
    async fn create(
        &self,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<ProviderResource, ProviderError>;

    /// Updates mutable attributes of an existing object.
    async fn update(
        &self,
        id: &str,
        kind: ResourceKind,
        attributes: &Attributes,
    ) -> Result<ProviderResource, ProviderError>;

    /// Deletes an object. Fails with [`ProviderError::NotFound`] if it does
    /// not exist.
    async fn delete(&self, id: &str) -> Result<(), ProviderError>;

    /// Reads the current state of an object.
    async fn read(&self, id: &str) -> Result<ProviderResource, ProviderError>;
}
