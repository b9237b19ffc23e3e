//! S3-based state storage backend.
//!
//! Stores the applied state and its lock as JSON objects under a key
//! prefix, so several operators share one state per project environment.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{StateStore, check_version};
use super::types::AppliedState;

/// State object key suffix.
const STATE_KEY: &str = "state.json";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// Attempts at writing the lock object when an expired lock is in the way.
const LOCK_ATTEMPTS: usize = 3;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store using the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let loader = aws_config::from_env();
        let loader = match region {
            Some(region) => loader.region(aws_config::Region::new(region.to_string())),
            None => loader,
        };
        let config = loader.load().await;

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Reads and decodes a JSON object; `None` if the key does not exist.
    async fn get_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        Ok(self.get_tagged::<T>(file).await?.map(|(value, _)| value))
    }

    /// Like [`Self::get_json`], also returning the object's ETag.
    async fn get_tagged<T: DeserializeOwned>(&self, file: &str) -> Result<Option<(T, String)>> {
        let key = self.key(file);
        let response = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(response) => response,
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StateError::s3(format!("S3 get {key}: {service_err}")).into());
            }
        };

        let etag = response.e_tag().unwrap_or_default().to_string();
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StateError::s3(format!("Failed to read s3://{}/{key}: {e}", self.bucket)))?
            .into_bytes();

        let value = serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse s3://{}/{key}: {e}", self.bucket),
        })?;
        Ok(Some((value, etag)))
    }

    /// Writes the lock object only if the key is still absent (`etag` is
    /// `None`) or still holds the object tagged `etag`. Returns false when
    /// another writer got there first.
    async fn put_lock(&self, lock: &LockInfo, etag: Option<&str>) -> Result<bool> {
        let key = self.key(LOCK_KEY);
        let body = serde_json::to_vec_pretty(lock)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into())
            .content_type("application/json");
        let request = match etag {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if is_precondition_failure(&e) => Ok(false),
            Err(e) => Err(StateError::s3(format!("S3 put {key}: {e}")).into()),
        }
    }

    async fn put_json<T: Serialize + Sync>(&self, file: &str, value: &T) -> Result<()> {
        let key = self.key(file);
        let body = serde_json::to_vec_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {file}: {e}")))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body.into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put {key}: {e}")))?;
        Ok(())
    }

    async fn delete_key(&self, file: &str) -> Result<()> {
        let key = self.key(file);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete {key}: {e}")))?;
        Ok(())
    }
}

/// Whether a conditional write lost against a concurrent writer.
fn is_precondition_failure<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
    err.as_service_error()
        .and_then(ProvideErrorMetadata::code)
        .is_some_and(is_precondition_code)
}

fn is_precondition_code(code: &str) -> bool {
    matches!(code, "PreconditionFailed" | "ConditionalRequestConflict")
}

/// Trims slashes and appends a single trailing `/` to a non-empty prefix.
fn normalize_prefix(prefix: Option<&str>) -> String {
    match prefix.map(|p| p.trim_matches('/')) {
        Some(p) if !p.is_empty() => format!("{p}/"),
        _ => String::new(),
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<Option<AppliedState>> {
        debug!("Loading state from {}", self.location());

        let Some(state) = self.get_json::<AppliedState>(STATE_KEY).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };
        check_version(&state)?;

        info!(
            "Loaded state for {}/{} (serial {})",
            state.project, state.environment, state.serial
        );
        Ok(Some(state))
    }

    async fn save(&self, state: &AppliedState) -> Result<()> {
        info!("Saving state to {}", self.location());
        self.put_json(STATE_KEY, state).await
    }

    async fn delete(&self) -> Result<()> {
        info!("Deleting state from {}", self.location());
        self.delete_key(STATE_KEY).await?;
        self.delete_key(LOCK_KEY).await
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::s3(format!("S3 head {key}: {service_err}")).into())
                }
            }
        }
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock_info = LockInfo::new(&holder_id);

        for _ in 0..LOCK_ATTEMPTS {
            let acquired = match self.get_tagged::<LockInfo>(LOCK_KEY).await? {
                None => self.put_lock(&lock_info, None).await?,
                Some((existing, _)) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                Some((existing, etag)) => {
                    debug!("Expired lock held by {} found, taking over", existing.holder);
                    self.put_lock(&lock_info, Some(&etag)).await?
                }
            };

            if acquired {
                info!(
                    "Acquired state lock: {} (expires in {LOCK_EXPIRY_SECS}s)",
                    lock_info.lock_id
                );
                return Ok(lock_info);
            }
            debug!("Lock object changed while acquiring, retrying");
        }

        Err(StateError::LockFailed {
            message: String::from("lock object kept changing while acquiring"),
        }
        .into())
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        if let Some((current, etag)) = self.get_tagged::<LockInfo>(LOCK_KEY).await? {
            if current.lock_id == lock.lock_id {
                let renewed = current.renewed();
                if self.put_lock(&renewed, Some(&etag)).await? {
                    debug!("Renewed state lock {} until {}", renewed.lock_id, renewed.expires_at);
                    return Ok(renewed);
                }
            }
        }

        Err(StateError::LockLost {
            lock_id: lock.lock_id.clone(),
        }
        .into())
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        match self.get_json::<LockInfo>(LOCK_KEY).await? {
            Some(existing) if existing.lock_id == lock_id => {
                self.delete_key(LOCK_KEY).await?;
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
        self.get_json(LOCK_KEY).await
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key(STATE_KEY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("airflow/prod")), "airflow/prod/");
        assert_eq!(normalize_prefix(Some("/airflow/prod/")), "airflow/prod/");
    }

    #[test]
    fn test_lost_conditional_write_codes() {
        assert!(is_precondition_code("PreconditionFailed"));
        assert!(is_precondition_code("ConditionalRequestConflict"));
        assert!(!is_precondition_code("AccessDenied"));
        assert!(!is_precondition_code("NoSuchKey"));
    }
}
