//! State locking.
//!
//! A lock record is written next to the state for the whole duration of an
//! apply or destroy. Records expire so a crashed run never wedges the
//! environment for longer than [`LOCK_EXPIRY_SECS`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 300;

/// Information about a state lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a lock record held by `holder`, expiring in five minutes.
    #[must_use]
    pub fn new(holder: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Returns the same lock with its expiry pushed back to five minutes
    /// from now.
    #[must_use]
    pub fn renewed(&self) -> Self {
        Self {
            expires_at: Utc::now() + Duration::seconds(LOCK_EXPIRY_SECS),
            ..self.clone()
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_expired() {
            write!(f, "{} held by {} (expired)", self.lock_id, self.holder)
        } else {
            write!(
                f,
                "{} held by {} since {} ({}s left)",
                self.lock_id,
                self.holder,
                self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                self.remaining_secs()
            )
        }
    }
}

/// Generates a holder identifier for the current process:
/// `<hostname>-<pid>-<8 hex chars>`.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());
    let pid = std::process::id();
    let suffix = &Uuid::new_v4().simple().to_string()[..8];

    format!("{hostname}-{pid}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live() {
        let lock = LockInfo::new("ci-runner");
        assert_eq!(lock.holder, "ci-runner");
        assert!(!lock.is_expired());
        assert!(lock.remaining_secs() > LOCK_EXPIRY_SECS - 5);
        assert!(lock.to_string().contains("held by ci-runner"));
    }

    #[test]
    fn test_expired_lock() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_secs(), 0);
        assert!(lock.to_string().ends_with("(expired)"));
    }

    #[test]
    fn test_renewed_lock_keeps_identity() {
        let mut lock = LockInfo::new("ci-runner");
        lock.expires_at = Utc::now() - Duration::seconds(1);

        let renewed = lock.renewed();
        assert_eq!(renewed.lock_id, lock.lock_id);
        assert_eq!(renewed.acquired_at, lock.acquired_at);
        assert!(!renewed.is_expired());
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
