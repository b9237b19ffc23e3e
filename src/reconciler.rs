//! Reconciler driving a document to its applied state.
//!
//! Every mutating run holds the state lock from load to save: the applied
//! state is loaded, the document is validated and turned into a graph, the
//! diff becomes a plan, and the plan executes against the provider. What
//! the executor recorded is saved even when some actions failed, so a
//! re-run only retries what is left.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ConfigValidator, DesiredDocument};
use crate::error::Result;
use crate::graph::{GraphBuilder, ResourceGraph, ResourceKind, reference};
use crate::planner::{
    CancelSignal, DiffEngine, ExecutionReport, PlanExecutor, ProvisionPlan, RetryPolicy,
};
use crate::provider::CloudProvider;
use crate::state::{
    AppliedState, ApplyHistoryEntry, ApplyOperation, LOCK_EXPIRY_SECS, LockInfo, StateLedger,
    StateStore, check_version, generate_holder_id,
};

/// Interval between lock renewals while a plan executes.
const LOCK_RENEWAL: Duration = Duration::from_secs(LOCK_EXPIRY_SECS.unsigned_abs() / 3);

/// Reconciler for one document and one state backend.
pub struct Reconciler<'a, S: StateStore> {
    /// Desired-state document.
    document: &'a DesiredDocument,
    /// State store.
    state_store: &'a S,
    /// Cloud provider.
    provider: &'a dyn CloudProvider,
    hasher: ConfigHasher,
    diff_engine: DiffEngine,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: Option<CancelSignal>,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct ApplyResult {
    /// The plan that was computed.
    pub plan: ProvisionPlan,
    /// Whether the plan was confirmed. Plans without changes count as
    /// confirmed.
    pub confirmed: bool,
    /// Execution report, if the plan ran.
    pub report: Option<ExecutionReport>,
}

/// Drift status of one applied resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    /// Provider object matches the applied attributes.
    InSync,
    /// Provider object differs on the listed attributes.
    Changed {
        /// Attributes that differ.
        fields: Vec<String>,
    },
    /// Provider no longer has the object.
    Missing,
}

/// Drift of one applied resource.
#[derive(Debug, Clone, Serialize)]
pub struct DriftEntry {
    /// Logical identifier.
    pub logical_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider identifier.
    pub provider_id: String,
    /// Drift status.
    #[serde(flatten)]
    pub status: DriftStatus,
}

/// Report of drift detection.
#[derive(Debug, Serialize)]
pub struct DriftReport {
    /// One entry per applied resource.
    pub entries: Vec<DriftEntry>,
    /// Resources whose document attributes changed since the last apply.
    pub pending: Vec<String>,
}

impl<'a, S: StateStore> Reconciler<'a, S> {
    /// Creates a new reconciler using the document's executor settings.
    #[must_use]
    pub fn new(
        document: &'a DesiredDocument,
        state_store: &'a S,
        provider: &'a dyn CloudProvider,
    ) -> Self {
        Self {
            document,
            state_store,
            provider,
            hasher: ConfigHasher::new(),
            diff_engine: DiffEngine::new(),
            concurrency: document.executor.concurrency,
            retry: RetryPolicy::from_config(&document.executor),
            cancel: None,
        }
    }

    /// Overrides the maximum number of provider calls in flight.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops scheduling new actions once `signal` fires.
    #[must_use]
    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Validates the document and builds its resource graph.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails, a reference is unresolved, or
    /// the graph has a cycle.
    pub fn graph(&self) -> Result<ResourceGraph> {
        let validation = ConfigValidator::new().validate(self.document)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }
        GraphBuilder::new().build(self.document)
    }

    /// Computes the plan without taking the lock or calling the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be built or state cannot be
    /// loaded.
    pub async fn plan(&self) -> Result<ProvisionPlan> {
        let graph = self.graph()?;
        let state = self.load_state().await?;
        self.plan_for(&graph, state.as_ref())
    }

    /// Plans and, if `confirm` accepts the plan, applies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, the graph cannot be
    /// built, or state cannot be loaded or saved. Failed actions are not
    /// errors; they are reported in the execution report.
    pub async fn apply<F>(&self, confirm: F) -> Result<ApplyResult>
    where
        F: FnOnce(&ProvisionPlan) -> bool + Send,
    {
        info!(
            "Applying {}/{}",
            self.document.project.name, self.document.project.environment
        );
        self.locked(|lock| async move {
            let graph = self.graph()?;
            let mut state = self.load_state().await?.unwrap_or_else(|| self.empty_state());
            let plan = self.plan_for(&graph, Some(&state))?;
            info!("{}", plan.summary());

            if !plan.has_changes() {
                info!("No changes required - state is converged");
                return Ok(ApplyResult {
                    plan,
                    confirmed: true,
                    report: None,
                });
            }
            if !confirm(&plan) {
                info!("Apply declined");
                return Ok(ApplyResult {
                    plan,
                    confirmed: false,
                    report: None,
                });
            }

            let report = self.execute(&plan, &mut state, ApplyOperation::Apply, &lock).await?;
            Ok(ApplyResult {
                plan,
                confirmed: true,
                report: Some(report),
            })
        })
        .await
    }

    /// Plans and, if `confirm` accepts, deletes every applied resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken or state cannot be
    /// loaded or saved.
    pub async fn destroy<F>(&self, confirm: F) -> Result<ApplyResult>
    where
        F: FnOnce(&ProvisionPlan) -> bool + Send,
    {
        info!(
            "Destroying {}/{}",
            self.document.project.name, self.document.project.environment
        );
        self.locked(|lock| async move {
            let mut state = self.load_state().await?.unwrap_or_else(|| self.empty_state());
            let plan = ProvisionPlan::destroy(&state)?;

            if !plan.has_changes() {
                info!("Nothing to destroy");
                return Ok(ApplyResult {
                    plan,
                    confirmed: true,
                    report: None,
                });
            }
            if !confirm(&plan) {
                return Ok(ApplyResult {
                    plan,
                    confirmed: false,
                    report: None,
                });
            }

            let report = self.execute(&plan, &mut state, ApplyOperation::Destroy, &lock).await?;
            Ok(ApplyResult {
                plan,
                confirmed: true,
                report: Some(report),
            })
        })
        .await
    }

    /// Reads every applied resource from the provider and compares it with
    /// state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a provider read fails
    /// for another reason than a missing object.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.document.project.name, self.document.project.environment
        );

        let Some(state) = self.load_state().await? else {
            return Ok(DriftReport {
                entries: Vec::new(),
                pending: Vec::new(),
            });
        };

        let mut entries = Vec::with_capacity(state.resources.len());
        for resource in state.resources.values() {
            let status = match self.provider.read(&resource.provider_id).await {
                Ok(object) => {
                    // Attributes holding references were resolved by the
                    // executor and cannot be compared literally.
                    let fields: Vec<String> = resource
                        .attributes
                        .iter()
                        .filter(|(_, value)| reference::scan(value).is_empty())
                        .filter(|(key, value)| object.attributes.get(*key) != Some(*value))
                        .map(|(key, _)| key.clone())
                        .collect();
                    if fields.is_empty() {
                        DriftStatus::InSync
                    } else {
                        DriftStatus::Changed { fields }
                    }
                }
                Err(e) if e.is_not_found() => DriftStatus::Missing,
                Err(e) => return Err(e.into()),
            };
            debug!("{}: {status:?}", resource.logical_id);
            entries.push(DriftEntry {
                logical_id: resource.logical_id.clone(),
                kind: resource.kind,
                provider_id: resource.provider_id.clone(),
                status,
            });
        }

        let pending = match self.graph() {
            Ok(graph) => self
                .diff_engine
                .compute_diff(&graph, Some(&state))
                .actionable_diffs()
                .into_iter()
                .map(|d| d.logical_id.clone())
                .collect(),
            Err(e) => {
                warn!("Skipping document comparison: {e}");
                Vec::new()
            }
        };

        Ok(DriftReport { entries, pending })
    }

    /// Runs `work` while holding the state lock, releasing it afterwards
    /// whatever the outcome.
    async fn locked<T, F, Fut>(&self, work: F) -> Result<T>
    where
        F: FnOnce(LockInfo) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let holder = generate_holder_id();
        let lock = self.state_store.acquire_lock(&holder).await?;
        let lock_id = lock.lock_id.clone();
        debug!("Acquired state lock {lock_id}");

        let result = work(lock).await;

        if let Err(e) = self.state_store.release_lock(&lock_id).await {
            warn!("Failed to release state lock {lock_id}: {e}");
        }
        result
    }

    async fn load_state(&self) -> Result<Option<AppliedState>> {
        let state = self.state_store.load().await?;
        if let Some(state) = &state {
            check_version(state)?;
            debug!(
                "Loaded state serial {} with {} resources",
                state.serial,
                state.resources.len()
            );
        }
        Ok(state)
    }

    fn empty_state(&self) -> AppliedState {
        AppliedState::new(&self.document.project.name, &self.document.project.environment)
    }

    fn plan_for(&self, graph: &ResourceGraph, state: Option<&AppliedState>) -> Result<ProvisionPlan> {
        let diff = self.diff_engine.compute_diff(graph, state);
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.replaces, diff.deletes, diff.unchanged
        );
        let document_hash = self.hasher.hash_document(self.document);
        ProvisionPlan::from_diff(graph, &diff, state, &document_hash)
    }

    /// Executes `plan` and saves what the executor recorded.
    ///
    /// `lock` is renewed while the plan runs. State is only saved if the
    /// lock is still held when execution ends.
    async fn execute(
        &self,
        plan: &ProvisionPlan,
        state: &mut AppliedState,
        operation: ApplyOperation,
        lock: &LockInfo,
    ) -> Result<ExecutionReport> {
        let ledger = StateLedger::from_state(state);
        let mut executor = PlanExecutor::new(self.provider, &ledger)
            .with_concurrency(self.concurrency)
            .with_retry(self.retry);
        if let Some(signal) = &self.cancel {
            executor = executor.with_cancel(signal.clone());
        }

        let report = {
            let run = executor.execute(plan);
            tokio::pin!(run);
            let mut renewal = tokio::time::interval(LOCK_RENEWAL);
            renewal.tick().await;
            loop {
                tokio::select! {
                    report = &mut run => break report,
                    _ = renewal.tick() => {
                        if let Err(e) = self.state_store.refresh_lock(lock).await {
                            warn!("Failed to renew state lock {}: {e}", lock.lock_id);
                        }
                    }
                }
            }
        };

        if let Err(e) = self.state_store.refresh_lock(lock).await {
            error!(
                "Not saving state to {}: {e}. Changed by this run: {}",
                self.state_store.location(),
                report.changed().join(", ")
            );
            return Err(e);
        }

        state.replace_resources(ledger.snapshot().await);
        let entry = if report.all_successful() {
            state.document_hash.clone_from(&plan.document_hash);
            ApplyHistoryEntry::new(operation, &plan.document_hash, report.changed())
        } else {
            ApplyHistoryEntry::failed(
                operation,
                &plan.document_hash,
                report.changed(),
                &report.to_string(),
            )
        };
        state.add_history(entry);
        state.bump_serial();
        self.state_store.save(state).await?;
        info!(
            "Saved state serial {} to {}",
            state.serial,
            self.state_store.location()
        );

        Ok(report)
    }
}

impl ApplyResult {
    /// Returns true if nothing needed to change or every action succeeded.
    #[must_use]
    pub fn success(&self) -> bool {
        self.confirmed
            && self
                .report
                .as_ref()
                .is_none_or(ExecutionReport::all_successful)
    }
}

impl DriftReport {
    /// Returns true if the provider matches state and the document matches
    /// the last apply.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.pending.is_empty() && self.entries.iter().all(|e| e.status == DriftStatus::InSync)
    }

    /// Entries that are not in sync.
    #[must_use]
    pub fn drifted(&self) -> Vec<&DriftEntry> {
        self.entries
            .iter()
            .filter(|e| e.status != DriftStatus::InSync)
            .collect()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }

        let drifted = self.drifted();
        if !drifted.is_empty() {
            writeln!(f, "Drift detected:")?;
            for entry in drifted {
                match &entry.status {
                    DriftStatus::Missing => writeln!(f, "  - {} (missing)", entry.logical_id)?,
                    DriftStatus::Changed { fields } => {
                        writeln!(f, "  ~ {} ({})", entry.logical_id, fields.join(", "))?;
                    }
                    DriftStatus::InSync => {}
                }
            }
        }
        if !self.pending.is_empty() {
            writeln!(f, "Document changes not yet applied:")?;
            for id in &self.pending {
                writeln!(f, "  * {id}")?;
            }
        }
        Ok(())
    }
}
