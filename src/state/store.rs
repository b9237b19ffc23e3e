//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.

use async_trait::async_trait;

use crate::error::{Result, StateError};
use super::types::{AppliedState, STATE_VERSION};
use super::lock::LockInfo;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the applied state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<AppliedState>>;

    /// Saves the applied state.
    async fn save(&self, state: &AppliedState) -> Result<()>;

    /// Deletes the applied state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Extends the expiry of `lock` if it is still the current lock.
    ///
    /// Fails with [`StateError::LockLost`] once another holder replaced it
    /// or it was released.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Describes where the state lives, for display.
    fn location(&self) -> String;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<AppliedState>> {
        (**self).load().await
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        (**self).refresh_lock(lock).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Rejects state written by an incompatible format version.
///
/// # Errors
///
/// Returns [`StateError::VersionMismatch`] if the major versions differ.
pub fn check_version(state: &AppliedState) -> Result<()> {
    let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
    if major(&state.version) == major(STATE_VERSION) {
        Ok(())
    } else {
        Err(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: state.version.clone(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_version() {
        let mut state = AppliedState::new("airflow", "dev");
        assert!(check_version(&state).is_ok());

        state.version = String::from("1.7");
        assert!(check_version(&state).is_ok());

        state.version = String::from("2.0");
        assert!(check_version(&state).is_err());
    }
}
