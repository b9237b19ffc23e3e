//! Local file-based state storage backend.
//!
//! Keeps `state.json` and `state.lock` in a directory next to the document,
//! for single-operator use and tests.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{StateStore, check_version};
use super::types::AppliedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".ecsprov";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Attempts at creating the lock file when an expired lock is in the way.
const LOCK_ATTEMPTS: usize = 3;

/// Guard file held while an expired lock is removed.
const TAKEOVER_FILE: &str = "state.lock.takeover";

/// Age after which a takeover guard left by a crashed run is ignored.
const TAKEOVER_STALE_SECS: u64 = 30;

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.ecsprov`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ProvisionError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_path: base_dir.join(STATE_FILE),
            lock_path: base_dir.join(LOCK_FILE),
            base_dir,
        }
    }

    /// Returns the directory holding the state files.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Writes `content` to a temporary sibling and renames it over `path`.
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!("{file_name}.tmp"));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to create {}: {e}", temp_path.display())))?;
        file.write_all(content)
            .await
            .map_err(|e| StateError::write(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::write(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::write(format!("Failed to rename into {}: {e}", path.display())))?;
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };
        let lock_info = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })?;

        Ok(Some(lock_info))
    }

    /// Publishes `content` as the lock file unless one already exists.
    ///
    /// The record is written under a name unique to `lock_id` and then
    /// hard-linked into place. Returns false when the lock file already
    /// exists.
    async fn create_lock_file(&self, lock_id: &str, content: &[u8]) -> Result<bool> {
        let staging = self.base_dir.join(format!("{LOCK_FILE}.{lock_id}"));
        fs::write(&staging, content).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write {}: {e}", staging.display()),
        })?;

        let linked = fs::hard_link(&staging, &self.lock_path).await;
        if let Err(e) = fs::remove_file(&staging).await {
            debug!("Failed to remove {}: {e}", staging.display());
        }

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to create lock file: {e}"),
            }
            .into()),
        }
    }

    /// Removes the expired lock `expired` so a new one can be created.
    ///
    /// Runs under an exclusive takeover guard and only while `expired` is
    /// still the current lock. Returns false when another run holds the
    /// guard.
    async fn clear_expired_lock(&self, expired: &LockInfo, token: &str) -> Result<bool> {
        let guard = self.base_dir.join(TAKEOVER_FILE);
        if !Self::take_guard(&guard).await? {
            return Ok(false);
        }

        let cleared = self.remove_if_current(expired, token).await;
        if let Err(e) = fs::remove_file(&guard).await {
            debug!("Failed to remove {}: {e}", guard.display());
        }
        cleared.map(|()| true)
    }

    async fn take_guard(guard: &Path) -> Result<bool> {
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(guard).await {
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let stale = fs::metadata(guard)
                        .await
                        .ok()
                        .and_then(|meta| meta.modified().ok())
                        .and_then(|modified| modified.elapsed().ok())
                        .is_some_and(|age| age.as_secs() > TAKEOVER_STALE_SECS);
                    if !stale {
                        return Ok(false);
                    }
                    debug!("Removing takeover guard left by a crashed run");
                    if let Err(e) = fs::remove_file(guard).await {
                        debug!("Failed to remove {}: {e}", guard.display());
                    }
                }
                Err(e) => {
                    return Err(StateError::LockFailed {
                        message: format!("Failed to create {}: {e}", guard.display()),
                    }
                    .into());
                }
            }
        }
        Ok(false)
    }

    /// Moves the lock file aside if it is still `expired`. A lock that
    /// replaced it in between is linked back.
    async fn remove_if_current(&self, expired: &LockInfo, token: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(current) if current.lock_id == expired.lock_id => {}
            _ => return Ok(()),
        }

        let aside = self.base_dir.join(format!("{LOCK_FILE}.{token}.expired"));
        match fs::rename(&self.lock_path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to move expired lock aside: {e}"),
                }
                .into());
            }
        }

        let moved = fs::read_to_string(&aside)
            .await
            .ok()
            .and_then(|content| serde_json::from_str::<LockInfo>(&content).ok());
        if moved.is_some_and(|lock| lock.lock_id != expired.lock_id) {
            debug!("Expired lock was replaced before takeover, restoring it");
            if let Err(e) = fs::hard_link(&aside, &self.lock_path).await {
                debug!("Failed to restore lock: {e}");
            }
        }

        if let Err(e) = fs::remove_file(&aside).await {
            debug!("Failed to remove {}: {e}", aside.display());
        }
        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<AppliedState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read state file: {e}"),
        })?;
        let state: AppliedState = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state file: {e}"),
        })?;
        check_version(&state)?;

        Ok(Some(state))
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        info!("Saving state to: {}", self.state_path.display());

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        self.write_atomic(&self.state_path, &content).await?;

        debug!("State saved (serial {})", state.serial);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        if self.state_path.exists() {
            info!("Deleting state file: {}", self.state_path.display());
            fs::remove_file(&self.state_path)
                .await
                .map_err(|e| StateError::write(format!("Failed to delete state file: {e}")))?;
        }
        self.delete_lock_file().await
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state_path.exists())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);
        let content = serde_json::to_vec_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        for _ in 0..LOCK_ATTEMPTS {
            if self.create_lock_file(&lock_info.lock_id, &content).await? {
                info!(
                    "Acquired state lock: {} (expires in {LOCK_EXPIRY_SECS}s)",
                    lock_info.lock_id
                );
                return Ok(lock_info);
            }

            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some(existing) => {
                    debug!("Expired lock held by {} found, taking over", existing.holder);
                    if !self.clear_expired_lock(&existing, &lock_info.lock_id).await? {
                        return Err(StateError::LockFailed {
                            message: format!(
                                "another run is taking over the expired lock held by {}",
                                existing.holder
                            ),
                        }
                        .into());
                    }
                }
                None => debug!("Lock released while acquiring, retrying"),
            }
        }

        Err(StateError::LockFailed {
            message: String::from("lock file kept changing while acquiring"),
        }
        .into())
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => {
                let renewed = current.renewed();
                let content = serde_json::to_vec_pretty(&renewed)
                    .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
                self.write_atomic(&self.lock_path, &content).await?;
                debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
                Ok(renewed)
            }
            _ => Err(StateError::LockLost {
                lock_id: lock.lock_id.clone(),
            }
            .into()),
        }
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            }
            Some(existing) => {
                debug!("Lock ID mismatch: expected {lock_id}, found {}", existing.lock_id);
            }
            None => {}
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .read_lock_file()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.state_path.display().to_string()
    }
}
