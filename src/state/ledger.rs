//! In-process view of applied state shared by concurrent executor tasks.
//!
//! Each logical identifier owns an async mutex. Writers for different
//! identifiers never contend; writers for the same identifier take turns.
//! The outer map lock is only held to look up or insert a slot, never
//! across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::types::{AppliedState, ResourceState};

type Slot = Arc<AsyncMutex<Option<ResourceState>>>;

/// Per-resource scoped access to applied state.
#[derive(Debug, Default)]
pub struct StateLedger {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Exclusive access to one ledger entry.
///
/// Holding the entry blocks other writers of the same logical identifier
/// until it is dropped.
#[derive(Debug)]
pub struct LedgerEntry {
    logical_id: String,
    guard: OwnedMutexGuard<Option<ResourceState>>,
}

impl StateLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a ledger seeded with every resource of `state`.
    #[must_use]
    pub fn from_state(state: &AppliedState) -> Self {
        let slots = state
            .resources
            .iter()
            .map(|(id, resource)| (id.clone(), Arc::new(AsyncMutex::new(Some(resource.clone())))))
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn slot(&self, logical_id: &str) -> Slot {
        Arc::clone(
            self.slots()
                .entry(logical_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
        )
    }

    /// Waits for exclusive access to the entry of `logical_id`.
    pub async fn lock(&self, logical_id: &str) -> LedgerEntry {
        let guard = self.slot(logical_id).lock_owned().await;
        LedgerEntry {
            logical_id: logical_id.to_string(),
            guard,
        }
    }

    /// Returns a copy of the entry of `logical_id`, if recorded.
    pub async fn get(&self, logical_id: &str) -> Option<ResourceState> {
        let slot = self.slots().get(logical_id).cloned()?;
        let entry = slot.lock().await;
        entry.clone()
    }

    /// Records `resource` under its logical identifier.
    pub async fn commit(&self, resource: ResourceState) {
        let mut entry = self.lock(&resource.logical_id).await;
        entry.commit(resource);
    }

    /// Removes the entry of `logical_id`.
    pub async fn remove(&self, logical_id: &str) -> Option<ResourceState> {
        let mut entry = self.lock(logical_id).await;
        entry.remove()
    }

    /// Copies every recorded entry.
    pub async fn snapshot(&self) -> BTreeMap<String, ResourceState> {
        let slots: Vec<Slot> = self.slots().values().cloned().collect();

        let mut out = BTreeMap::new();
        for slot in slots {
            if let Some(resource) = slot.lock().await.clone() {
                out.insert(resource.logical_id.clone(), resource);
            }
        }
        out
    }
}

impl LedgerEntry {
    /// Logical identifier of this entry.
    #[must_use]
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    /// Current recorded state, if any.
    #[must_use]
    pub fn get(&self) -> Option<&ResourceState> {
        self.guard.as_ref()
    }

    /// Replaces the recorded state.
    pub fn commit(&mut self, resource: ResourceState) {
        debug!("Ledger commit: {} -> {}", self.logical_id, resource.provider_id);
        *self.guard = Some(resource);
    }

    /// Clears the recorded state.
    pub fn remove(&mut self) -> Option<ResourceState> {
        debug!("Ledger remove: {}", self.logical_id);
        self.guard.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Attributes, ResourceKind};
    use std::time::Duration;

    fn resource(id: &str, provider_id: &str) -> ResourceState {
        ResourceState::new(id, ResourceKind::EcsCluster, provider_id, Attributes::new(), "h")
    }

    #[tokio::test]
    async fn test_commit_get_remove() {
        let ledger = StateLedger::new();
        assert!(ledger.get("cluster").await.is_none());

        ledger.commit(resource("cluster", "arn:1")).await;
        assert_eq!(ledger.get("cluster").await.unwrap().provider_id, "arn:1");

        assert!(ledger.remove("cluster").await.is_some());
        assert!(ledger.get("cluster").await.is_none());
        assert!(ledger.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_seeded_from_state() {
        let mut state = AppliedState::new("airflow", "dev");
        state.set(resource("a", "arn:a"));
        state.set(resource("b", "arn:b"));

        let ledger = StateLedger::from_state(&state);
        let snapshot = ledger.snapshot().await;
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let ledger = StateLedger::new();
        let _held = ledger.lock("a").await;

        let other = tokio::time::timeout(Duration::from_millis(100), ledger.lock("b")).await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let ledger = Arc::new(StateLedger::new());
        let mut held = ledger.lock("a").await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), ledger.lock("a")).await;
        assert!(blocked.is_err());

        let writer = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.commit(resource("a", "arn:second")).await })
        };
        held.commit(resource("a", "arn:first"));
        drop(held);
        writer.await.unwrap();

        assert_eq!(ledger.get("a").await.unwrap().provider_id, "arn:second");
    }
}
