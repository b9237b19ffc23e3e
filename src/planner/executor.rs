//! Plan executor for applying provisioning plans.
//!
//! Actions run as soon as their data dependencies have succeeded and their
//! ordering predecessors have finished, with at most `concurrency` provider
//! calls in flight. A failed action blocks its dependents but not
//! independent branches; a cancel signal stops scheduling while in-flight
//! calls complete.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{GraphError, PlanError, ProviderError, ProvisionError, Result};
use crate::graph::{Attributes, Reference, ResourceKind, reference};
use crate::provider::{CloudProvider, ProviderResource};
use crate::state::{LedgerEntry, ResourceState, StateLedger};

use super::plan::{ActionType, PlannedAction, ProvisionPlan};

/// Bounded exponential backoff for retryable provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}

impl RetryPolicy {
    /// Builds the policy from executor settings.
    #[must_use]
    pub const fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Triggers cancellation of a running plan.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

/// Observes cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

/// Creates a connected cancel handle and signal.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(Arc::new(tx)), CancelSignal(rx))
}

impl CancelHandle {
    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelSignal {
    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes when cancellation is requested. Never completes if every
    /// handle is dropped first.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Terminal status of one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    /// The action completed (NoOp included).
    Succeeded,
    /// The provider call failed.
    Failed {
        /// Rendered error.
        error: String,
        /// Whether the last error was retryable.
        retryable: bool,
    },
    /// A data dependency failed; the action was never attempted.
    BlockedByFailure {
        /// The failed ancestor.
        failed: String,
    },
    /// The run was cancelled before the action was scheduled.
    Cancelled,
}

/// Outcome of one action.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    /// Logical identifier.
    pub logical_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Planned action.
    pub action: ActionType,
    /// Terminal status.
    #[serde(flatten)]
    pub status: NodeStatus,
    /// Provider identifier after the action, if any.
    pub provider_id: Option<String>,
    /// Provider call attempts (retries included).
    pub attempts: u32,
    /// Wall time spent on the action in milliseconds.
    pub duration_ms: u64,
}

/// Report of a whole plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// One outcome per action, in plan order.
    pub outcomes: Vec<NodeOutcome>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
    /// Total wall time in milliseconds.
    pub duration_ms: u64,
}

/// Executor for provisioning plans.
pub struct PlanExecutor<'a> {
    provider: &'a dyn CloudProvider,
    ledger: &'a StateLedger,
    concurrency: usize,
    retry: RetryPolicy,
    cancel: Option<CancelSignal>,
}

/// Scheduling bookkeeping for one run.
struct Schedule<'p> {
    plan: &'p ProvisionPlan,
    /// `(successor, is_data_edge)` per action.
    successors: Vec<Vec<(usize, bool)>>,
    /// Unfinished predecessors per action.
    waiting: Vec<usize>,
    /// Position of each action in `plan.order()`.
    position: Vec<usize>,
    /// Ready actions by order position.
    ready: BTreeSet<usize>,
    /// Failed ancestor per action.
    blocked_by: Vec<Option<String>>,
    outcomes: Vec<Option<NodeOutcome>>,
}

impl<'p> Schedule<'p> {
    fn new(plan: &'p ProvisionPlan) -> Self {
        let n = plan.actions.len();
        let mut successors = vec![Vec::new(); n];
        let mut waiting = vec![0; n];
        for (idx, action) in plan.actions.iter().enumerate() {
            for &dep in &action.dependencies {
                successors[dep].push((idx, true));
            }
            for &pred in &action.ordering {
                successors[pred].push((idx, false));
            }
            waiting[idx] = action.dependencies.len() + action.ordering.len();
        }

        let mut position = vec![0; n];
        for (pos, &idx) in plan.order().iter().enumerate() {
            position[idx] = pos;
        }
        let ready = (0..n).filter(|&i| waiting[i] == 0).map(|i| position[i]).collect();

        Self {
            plan,
            successors,
            waiting,
            position,
            ready,
            blocked_by: vec![None; n],
            outcomes: vec![None; n],
        }
    }

    /// Next ready action, earliest in plan order first.
    fn peek(&self) -> Option<usize> {
        self.ready.first().map(|&pos| self.plan.order()[pos])
    }

    fn take(&mut self, idx: usize) {
        self.ready.remove(&self.position[idx]);
    }

    /// Records a terminal outcome and releases successors.
    fn complete(&mut self, idx: usize, outcome: NodeOutcome) {
        let root = match &outcome.status {
            NodeStatus::Succeeded => None,
            NodeStatus::Failed { .. } => Some(outcome.logical_id.clone()),
            NodeStatus::BlockedByFailure { failed } => Some(failed.clone()),
            NodeStatus::Cancelled => {
                self.outcomes[idx] = Some(outcome);
                return;
            }
        };
        self.outcomes[idx] = Some(outcome);

        for &(succ, data) in &self.successors[idx] {
            if data {
                if let Some(root) = &root {
                    self.blocked_by[succ].get_or_insert_with(|| root.clone());
                }
            }
            self.waiting[succ] -= 1;
            if self.waiting[succ] == 0 {
                self.ready.insert(self.position[succ]);
            }
        }
    }

    fn into_outcomes(self) -> Vec<NodeOutcome> {
        let plan = self.plan;
        plan.order()
            .iter()
            .map(|&idx| {
                self.outcomes[idx].clone().unwrap_or_else(|| {
                    let action = &plan.actions[idx];
                    NodeOutcome::skipped(action, NodeStatus::Cancelled)
                })
            })
            .collect()
    }
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(provider: &'a dyn CloudProvider, ledger: &'a StateLedger) -> Self {
        Self {
            provider,
            ledger,
            concurrency: ExecutorConfig::default().concurrency,
            retry: RetryPolicy::default(),
            cancel: None,
        }
    }

    /// Sets the maximum number of provider calls in flight.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stops scheduling once `signal` fires.
    #[must_use]
    pub fn with_cancel(mut self, signal: CancelSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Executes a provisioning plan.
    ///
    /// Never fails as a whole: every action ends with an outcome in the
    /// report.
    pub async fn execute(&self, plan: &ProvisionPlan) -> ExecutionReport {
        info!(
            "Executing plan with {} actions (concurrency {})",
            plan.action_count(),
            self.concurrency
        );
        let started = Instant::now();
        let mut schedule = Schedule::new(plan);
        let mut in_flight = FuturesUnordered::new();
        let mut cancel = self.cancel.clone();
        let mut cancelled = false;

        loop {
            if !cancelled && cancel.as_ref().is_some_and(CancelSignal::is_cancelled) {
                warn!("Cancellation requested, no further actions will be scheduled");
                cancelled = true;
            }

            while !cancelled {
                let Some(idx) = schedule.peek() else { break };
                let action = &plan.actions[idx];

                if let Some(failed) = schedule.blocked_by[idx].clone() {
                    schedule.take(idx);
                    warn!("Skipping {}: blocked by failure of {failed}", action.logical_id);
                    let outcome = NodeOutcome::skipped(action, NodeStatus::BlockedByFailure { failed });
                    schedule.complete(idx, outcome);
                    continue;
                }
                if action.action == ActionType::NoOp {
                    schedule.take(idx);
                    debug!("{} is unchanged", action.logical_id);
                    let mut outcome = NodeOutcome::skipped(action, NodeStatus::Succeeded);
                    outcome.provider_id.clone_from(&action.provider_id);
                    schedule.complete(idx, outcome);
                    continue;
                }
                if in_flight.len() >= self.concurrency {
                    break;
                }

                schedule.take(idx);
                in_flight.push(self.run_action(idx, action));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((idx, outcome)) = in_flight.next() => schedule.complete(idx, outcome),
                () = wait_cancelled(&mut cancel), if !cancelled => {
                    warn!("Cancellation requested, waiting for {} in-flight actions", in_flight.len());
                    cancelled = true;
                }
                else => break,
            }
        }

        let report = ExecutionReport {
            outcomes: schedule.into_outcomes(),
            cancelled,
            duration_ms: millis(started.elapsed()),
        };
        info!("{report}");
        report
    }

    /// Runs one action and returns its outcome.
    async fn run_action(&self, idx: usize, action: &PlannedAction) -> (usize, NodeOutcome) {
        info!("Executing action {idx}: {}", action.description());
        let started = Instant::now();
        let mut attempts = 0;

        let result = match self.resolve(action).await {
            Ok(resolved) => {
                let mut entry = self.ledger.lock(&action.logical_id).await;
                self.apply(action, &resolved, &mut entry, &mut attempts).await
            }
            Err(e) => Err(e),
        };

        let mut outcome = NodeOutcome::skipped(action, NodeStatus::Succeeded);
        outcome.attempts = attempts;
        outcome.duration_ms = millis(started.elapsed());
        match result {
            Ok(provider_id) => {
                info!("{} {} succeeded", action.action, action.logical_id);
                outcome.provider_id = provider_id;
            }
            Err(e) => {
                error!("{} {} failed: {e}", action.action, action.logical_id);
                outcome.provider_id.clone_from(&action.provider_id);
                outcome.status = NodeStatus::Failed {
                    error: e.to_string(),
                    retryable: e.is_retryable(),
                };
            }
        }
        (idx, outcome)
    }

    /// Performs the provider calls of `action` and records the result in
    /// `entry`. Returns the resulting provider identifier.
    async fn apply(
        &self,
        action: &PlannedAction,
        resolved: &Resolved,
        entry: &mut LedgerEntry,
        attempts: &mut u32,
    ) -> Result<Option<String>> {
        let attributes = &resolved.attributes;
        let previous = entry.get().cloned();
        let existing_id = previous
            .as_ref()
            .map(|p| p.provider_id.clone())
            .or_else(|| action.provider_id.clone());

        match action.action {
            ActionType::Create => {
                let created = self.create(action, attributes, attempts).await?;
                let id = created.id.clone();
                entry.commit(record(action, created, resolved, None));
                Ok(Some(id))
            }
            ActionType::UpdateInPlace => {
                let id = existing_id.ok_or_else(|| missing_id(action))?;
                let id = id.as_str();
                let provider = self.provider;
                let kind = action.kind;
                let updated = self
                    .retrying(action, attempts, move || provider.update(id, kind, attributes))
                    .await?;
                let id = updated.id.clone();
                entry.commit(record(action, updated, resolved, previous.as_ref()));
                Ok(Some(id))
            }
            ActionType::Replace => {
                if let Some(id) = existing_id {
                    self.delete(action, &id, attempts).await?;
                }
                entry.remove();
                let created = self.create(action, attributes, attempts).await?;
                let id = created.id.clone();
                entry.commit(record(action, created, resolved, None));
                Ok(Some(id))
            }
            ActionType::Delete => {
                if let Some(id) = existing_id {
                    self.delete(action, &id, attempts).await?;
                }
                entry.remove();
                Ok(None)
            }
            ActionType::NoOp => Ok(existing_id),
        }
    }

    async fn create(
        &self,
        action: &PlannedAction,
        attributes: &Attributes,
        attempts: &mut u32,
    ) -> Result<ProviderResource> {
        let provider = self.provider;
        let kind = action.kind;
        Ok(self
            .retrying(action, attempts, move || provider.create(kind, attributes))
            .await?)
    }

    /// Deletes `id`; an object the provider no longer knows counts as gone.
    async fn delete(&self, action: &PlannedAction, id: &str, attempts: &mut u32) -> Result<()> {
        let provider = self.provider;
        match self.retrying(action, attempts, move || provider.delete(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!("{} ({id}) was already deleted", action.logical_id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Repeats `call` while it fails with a retryable error, up to the
    /// policy's retry budget.
    async fn retrying<T, F, Fut>(
        &self,
        action: &PlannedAction,
        attempts: &mut u32,
        mut call: F,
    ) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut retries = 0;
        loop {
            *attempts += 1;
            match call().await {
                Err(e) if e.is_retryable() && retries < self.retry.max_retries => {
                    let delay = self.retry.backoff(retries);
                    warn!(
                        "{} attempt {} failed: {e}; retrying in {delay:?}",
                        action.logical_id, *attempts
                    );
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                result => return result,
            }
        }
    }

    /// Substitutes resource references with values from the ledger.
    async fn resolve(&self, action: &PlannedAction) -> Result<Resolved> {
        if matches!(action.action, ActionType::Delete | ActionType::NoOp) {
            return Ok(Resolved {
                attributes: action.attributes.clone(),
                values: BTreeMap::new(),
            });
        }

        let mut applied: HashMap<&str, ResourceState> = HashMap::new();
        for target in &action.references {
            if let Some(resource) = self.ledger.get(target).await {
                applied.insert(target.as_str(), resource);
            }
        }

        let mut values = BTreeMap::new();
        let mut lookup = |r: &Reference| {
            let value = applied
                .get(r.target.as_str())
                .and_then(|resource| resource.lookup(r.attribute.as_deref()));
            if let Some(value) = &value {
                values.insert(r.to_string(), value.clone());
            }
            value
        };
        let skip = |r: &Reference| r.is_variable();

        let attributes = action
            .attributes
            .iter()
            .map(|(key, value)| {
                reference::substitute(value, &skip, &mut lookup)
                    .map(|resolved| (key.clone(), resolved))
                    .map_err(|r| ProvisionError::from(GraphError::unresolved(&action.logical_id, r.to_string())))
            })
            .collect::<Result<Attributes>>()?;

        Ok(Resolved { attributes, values })
    }
}

/// Attributes with references substituted, and the value each reference
/// read.
struct Resolved {
    attributes: Attributes,
    values: BTreeMap<String, Value>,
}

async fn wait_cancelled(signal: &mut Option<CancelSignal>) {
    match signal {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Builds the ledger entry for a provider object.
fn record(
    action: &PlannedAction,
    object: ProviderResource,
    resolved: &Resolved,
    previous: Option<&ResourceState>,
) -> ResourceState {
    let mut resource = ResourceState::new(
        &action.logical_id,
        action.kind,
        &object.id,
        action.attributes.clone(),
        &action.attributes_hash,
    );
    resource.outputs = object.outputs;
    resource.dependencies = action.references.clone();
    resource.resolved.clone_from(&resolved.values);
    if let Some(previous) = previous {
        resource.created_at = previous.created_at;
    }
    resource
}

fn missing_id(action: &PlannedAction) -> ProvisionError {
    ProvisionError::internal(format!(
        "No provider identifier recorded for '{}'",
        action.logical_id
    ))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl NodeOutcome {
    /// Outcome of an action that made no provider call.
    fn skipped(action: &PlannedAction, status: NodeStatus) -> Self {
        Self {
            logical_id: action.logical_id.clone(),
            kind: action.kind,
            action: action.action,
            status,
            provider_id: None,
            attempts: 0,
            duration_ms: 0,
        }
    }

    /// Returns true if the action succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Succeeded
    }

    /// The node-scoped error of a blocked or cancelled action.
    #[must_use]
    pub fn plan_error(&self) -> Option<PlanError> {
        match &self.status {
            NodeStatus::BlockedByFailure { failed } => Some(PlanError::BlockedByFailure {
                resource: self.logical_id.clone(),
                failed: failed.clone(),
            }),
            NodeStatus::Cancelled => Some(PlanError::Cancelled {
                resource: self.logical_id.clone(),
            }),
            NodeStatus::Succeeded | NodeStatus::Failed { .. } => None,
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { error, .. } => write!(f, "failed: {error}"),
            Self::BlockedByFailure { failed } => write!(f, "blocked by {failed}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl ExecutionReport {
    /// Returns true if every action succeeded.
    #[must_use]
    pub fn all_successful(&self) -> bool {
        !self.cancelled && self.outcomes.iter().all(NodeOutcome::succeeded)
    }

    /// Looks up the outcome of a logical identifier.
    #[must_use]
    pub fn get(&self, logical_id: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.logical_id == logical_id)
    }

    /// Number of successful actions.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.succeeded()).count()
    }

    /// Number of failed actions.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, NodeStatus::Failed { .. }))
    }

    /// Number of actions blocked by a failed dependency.
    #[must_use]
    pub fn blocked(&self) -> usize {
        self.count(|s| matches!(s, NodeStatus::BlockedByFailure { .. }))
    }

    /// Number of actions never scheduled because of cancellation.
    #[must_use]
    pub fn cancelled_count(&self) -> usize {
        self.count(|s| *s == NodeStatus::Cancelled)
    }

    /// Logical identifiers whose action changed something.
    #[must_use]
    pub fn changed(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.succeeded() && o.action != ActionType::NoOp)
            .map(|o| o.logical_id.clone())
            .collect()
    }

    fn count(&self, predicate: impl Fn(&NodeStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions: {} succeeded, {} failed, {} blocked, {} cancelled",
            self.outcomes.len(),
            self.succeeded(),
            self.failed(),
            self.blocked(),
            self.cancelled_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigHasher;
    use crate::graph::tests::{node, scenario_graph};
    use crate::graph::{GraphBuilder, ResourceGraph};
    use crate::planner::DiffEngine;
    use crate::provider::{MockCloudProvider, SimulatedProvider};
    use crate::state::AppliedState;
    use mockall::Sequence;
    use serde_json::json;

    fn no_backoff(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn plan_for(graph: &ResourceGraph, state: Option<&AppliedState>) -> ProvisionPlan {
        let diff = DiffEngine::new().compute_diff(graph, state);
        ProvisionPlan::from_diff(graph, &diff, state, "hash").unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_creates_scenario_and_resolves_references() {
        let provider = SimulatedProvider::new();
        let ledger = StateLedger::new();
        let plan = plan_for(&scenario_graph(), None);

        let report = PlanExecutor::new(&provider, &ledger).execute(&plan).await;

        assert!(report.all_successful(), "{report}");
        assert_eq!(report.changed().len(), 4);
        let repo = ledger.get("ecr_repo").await.unwrap();
        let task = provider
            .resources()
            .into_iter()
            .find(|r| r.kind == ResourceKind::EcsTaskDefinition)
            .unwrap();
        assert_eq!(task.attributes["ecr_repo_ref"], json!(repo.provider_id));
        assert!(ledger.get("service").await.unwrap().dependencies.contains("task_def"));
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let provider = SimulatedProvider::new();
        provider.fail_always(ResourceKind::EcsTaskDefinition);
        let ledger = StateLedger::new();
        let plan = plan_for(&scenario_graph(), None);

        let report = PlanExecutor::new(&provider, &ledger)
            .with_retry(no_backoff(3))
            .execute(&plan)
            .await;

        let task = report.get("task_def").unwrap();
        assert!(matches!(task.status, NodeStatus::Failed { retryable: false, .. }));
        assert_eq!(task.attempts, 1);

        let service = report.get("service").unwrap();
        assert_eq!(
            service.plan_error(),
            Some(PlanError::BlockedByFailure {
                resource: String::from("service"),
                failed: String::from("task_def"),
            })
        );
        assert!(report.get("security_group").unwrap().succeeded());
        assert!(report.get("ecr_repo").unwrap().succeeded());
        assert!(!report.all_successful());

        assert!(ledger.get("security_group").await.is_some());
        assert!(ledger.get("task_def").await.is_none());
        assert!(provider.calls().iter().all(|c| c.kind != Some(ResourceKind::EcsService)));
    }

    #[tokio::test]
    async fn test_ordered_siblings_never_overlap() {
        let mut up = node("up", ResourceKind::AppautoscalingScheduledAction, &["target"]);
        let mut down = node("down", ResourceKind::AppautoscalingScheduledAction, &["target"]);
        let other = node("other", ResourceKind::AppautoscalingScheduledAction, &["target"]);
        down.after.insert(String::from("up"));
        up.attributes.insert(String::from("min_capacity"), json!(1));
        down.attributes.insert(String::from("min_capacity"), json!(0));
        let graph = GraphBuilder::assemble(vec![
            node("target", ResourceKind::AppautoscalingTarget, &[]),
            up,
            down,
            other,
        ])
        .unwrap();

        let provider = SimulatedProvider::new().with_latency(Duration::from_millis(30));
        let ledger = StateLedger::new();
        let plan = plan_for(&graph, None);
        let report = PlanExecutor::new(&provider, &ledger)
            .with_concurrency(4)
            .execute(&plan)
            .await;
        assert!(report.all_successful(), "{report}");

        let calls = provider.calls();
        let call = |name: &str| calls.iter().find(|c| c.name == name).unwrap();
        assert!(call("up").finished <= call("down").started);
        // Without an ordering edge, siblings run side by side.
        assert!(call("other").started < call("up").finished);
    }

    #[tokio::test]
    async fn test_ordering_predecessor_failure_does_not_block() {
        let first = node("first", ResourceKind::SsmParameter, &[]);
        let mut second = node("second", ResourceKind::CloudwatchLogGroup, &[]);
        second.after.insert(String::from("first"));
        let graph = GraphBuilder::assemble(vec![first, second]).unwrap();

        let provider = SimulatedProvider::new();
        provider.fail_always(ResourceKind::SsmParameter);
        let ledger = StateLedger::new();
        let report = PlanExecutor::new(&provider, &ledger)
            .execute(&plan_for(&graph, None))
            .await;

        assert_eq!(report.failed(), 1);
        assert!(report.get("second").unwrap().succeeded());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = SimulatedProvider::new();
        provider.fail_transiently(ResourceKind::EcrRepository, 2);
        let ledger = StateLedger::new();

        let report = PlanExecutor::new(&provider, &ledger)
            .with_retry(no_backoff(3))
            .execute(&plan_for(&scenario_graph(), None))
            .await;

        assert!(report.all_successful(), "{report}");
        assert_eq!(report.get("ecr_repo").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let provider = SimulatedProvider::new();
        provider.fail_transiently(ResourceKind::SecurityGroup, 10);
        let ledger = StateLedger::new();

        let report = PlanExecutor::new(&provider, &ledger)
            .with_retry(no_backoff(1))
            .execute(&plan_for(&scenario_graph(), None))
            .await;

        let sg = report.get("security_group").unwrap();
        assert!(matches!(sg.status, NodeStatus::Failed { retryable: true, .. }));
        assert_eq!(sg.attempts, 2);
        assert_eq!(report.blocked(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start_schedules_nothing() {
        let provider = SimulatedProvider::new();
        let ledger = StateLedger::new();
        let (handle, signal) = cancel_pair();
        handle.cancel();

        let report = PlanExecutor::new(&provider, &ledger)
            .with_cancel(signal)
            .execute(&plan_for(&scenario_graph(), None))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.cancelled_count(), 4);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_lets_in_flight_finish() {
        let provider = SimulatedProvider::new().with_latency(Duration::from_millis(100));
        let ledger = StateLedger::new();
        let (handle, signal) = cancel_pair();
        let plan = plan_for(&scenario_graph(), None);
        let executor = PlanExecutor::new(&provider, &ledger)
            .with_concurrency(1)
            .with_cancel(signal);

        let (report, ()) = tokio::join!(executor.execute(&plan), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });

        assert!(report.cancelled);
        assert!(report.get("ecr_repo").unwrap().succeeded());
        assert_eq!(report.cancelled_count(), 3);
        assert_eq!(
            report.get("service").unwrap().plan_error(),
            Some(PlanError::Cancelled { resource: String::from("service") })
        );
        assert!(ledger.get("ecr_repo").await.is_some());
    }

    #[tokio::test]
    async fn test_replace_deletes_then_creates() {
        let graph = GraphBuilder::assemble(vec![node("repo", ResourceKind::EcrRepository, &[])]).unwrap();
        let mut state = AppliedState::new("airflow", "dev");
        let old_attributes = Attributes::from([(String::from("name"), json!("old"))]);
        let hash = ConfigHasher::new().hash_attributes(&old_attributes);
        state.set(ResourceState::new("repo", ResourceKind::EcrRepository, "arn:old", old_attributes, &hash));
        let plan = plan_for(&graph, Some(&state));
        assert_eq!(plan.get("repo").unwrap().action, ActionType::Replace);

        let mut provider = MockCloudProvider::new();
        let mut seq = Sequence::new();
        provider
            .expect_delete()
            .withf(|id| id.to_string() == "arn:old")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|id| Err(ProviderError::not_found(id)));
        provider
            .expect_create()
            .withf(|kind, _| *kind == ResourceKind::EcrRepository)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|kind, attributes| {
                Ok(ProviderResource {
                    id: String::from("arn:new"),
                    kind,
                    attributes: attributes.clone(),
                    outputs: Attributes::new(),
                })
            });

        let ledger = StateLedger::from_state(&state);
        let report = PlanExecutor::new(&provider, &ledger).execute(&plan).await;

        assert!(report.all_successful(), "{report}");
        assert_eq!(ledger.get("repo").await.unwrap().provider_id, "arn:new");
    }

    #[tokio::test]
    async fn test_delete_of_missing_object_succeeds() {
        let mut state = AppliedState::new("airflow", "dev");
        state.set(ResourceState::new(
            "old_logs",
            ResourceKind::CloudwatchLogGroup,
            "arn:aws:logs:us-east-1:000000000000:log-group:gone",
            Attributes::new(),
            "h",
        ));
        let plan = ProvisionPlan::destroy(&state).unwrap();

        let provider = SimulatedProvider::new();
        let ledger = StateLedger::from_state(&state);
        let report = PlanExecutor::new(&provider, &ledger).execute(&plan).await;

        assert!(report.all_successful(), "{report}");
        assert!(ledger.snapshot().await.is_empty());
    }
}
