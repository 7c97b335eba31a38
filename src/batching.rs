//! # Test Case Batching Service
//!
//! Groups dequeued completion messages into batches under a configurable
//! [`GroupingStrategy`] and tracks each batch through its lifecycle until it
//! is handed to a reporter and removed.
//!
//! ## Key Components
//!
//! - **Grouping keys**: one key per message, derived from the active strategy
//!   and the message's typed metadata ([`grouping_key`])
//! - **Batch table**: a `DashMap` keyed by batch id that owns every batch
//! - **Open index**: a `DashMap` from grouping key to the id of the single
//!   `Pending` batch currently accepting messages for that key
//!
//! ## Concurrency
//!
//! Lookup-or-create-then-append for one key runs while holding that key's
//! entry in the open index, so two concurrent messages for the same new key
//! can never open two batches. Distinct keys land in different shards and
//! proceed independently. Lock order inside the service is always
//! lifecycle → strategy → open index → batch table; paths that touch both
//! maps without holding the lifecycle lock release one before taking the other.

use crate::config::{SharedTuning, TunableSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::message::{
    Batch, BatchStatus, CompletionMessage, GroupingStrategy, MetadataKey,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Mean-time bucket boundaries (ms) for `ByPerformanceProfile`.
const FAST_THRESHOLD_MS: f64 = 10.0;
const MEDIUM_THRESHOLD_MS: f64 = 100.0;
const SLOW_THRESHOLD_MS: f64 = 1000.0;

/// Lifecycle of the batching service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Created,
    Running,
    Stopped,
    Completed,
}

/// Test class of a message: explicit metadata first, then the case-id prefix.
pub fn test_class_of(message: &CompletionMessage) -> String {
    if let Some(class) = message.metadata.text(&MetadataKey::TestClassName) {
        return class;
    }
    let id = message.test_case_id.trim();
    let without_params = id.split('(').next().unwrap_or(id);
    match without_params.rsplit_once('.') {
        Some((class, _method)) if !class.is_empty() => class.to_string(),
        _ => "Unknown".to_string(),
    }
}

fn performance_bucket(mean_ms: f64) -> &'static str {
    if mean_ms < FAST_THRESHOLD_MS {
        "Fast"
    } else if mean_ms < MEDIUM_THRESHOLD_MS {
        "Medium"
    } else if mean_ms < SLOW_THRESHOLD_MS {
        "Slow"
    } else {
        "VerySlow"
    }
}

/// Compute the grouping key for `message` under `strategy`.
///
/// Keys carry a strategy prefix so batches opened under different strategies
/// never collide. Under `None` every call yields a fresh key.
pub fn grouping_key(strategy: GroupingStrategy, message: &CompletionMessage) -> String {
    let by_class = || format!("TestClass_{}", test_class_of(message));
    match strategy {
        GroupingStrategy::ByTestClass => by_class(),
        GroupingStrategy::ByComparisonAttribute => message
            .performance
            .grouping_id
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_string)
            .or_else(|| message.metadata.text(&MetadataKey::ComparisonGroup))
            .map(|group| format!("Comparison_{}", group))
            .unwrap_or_else(by_class),
        GroupingStrategy::ByCustomCriteria => message
            .metadata
            .text(&MetadataKey::BatchingCriteria)
            .map(|criteria| format!("Custom_{}", criteria))
            .unwrap_or_else(by_class),
        GroupingStrategy::ByExecutionContext => format!(
            "Context_{}",
            message
                .metadata
                .text(&MetadataKey::ExecutionContext)
                .unwrap_or_else(|| "Default".to_string())
        ),
        GroupingStrategy::ByPerformanceProfile => {
            format!("Performance_{}", performance_bucket(message.performance.mean_ms))
        }
        GroupingStrategy::None => format!(
            "Individual_{}_{}",
            message.test_case_id,
            crate::utils::generate_token()
        ),
    }
}

/// Owns every batch from creation until removal.
pub struct BatchingService {
    batches: DashMap<String, Batch>,
    open: DashMap<String, String>,
    strategy: RwLock<GroupingStrategy>,
    lifecycle: RwLock<ServiceState>,
    tuning: SharedTuning,
}

impl BatchingService {
    pub fn new(strategy: GroupingStrategy, tuning: SharedTuning) -> Self {
        Self {
            batches: DashMap::new(),
            open: DashMap::new(),
            strategy: RwLock::new(strategy),
            lifecycle: RwLock::new(ServiceState::Created),
            tuning,
        }
    }

    pub fn start(&self) -> PipelineResult<()> {
        let mut lifecycle = self.lifecycle.write();
        match *lifecycle {
            ServiceState::Running => Err(PipelineError::invalid_state(
                "batching service is already running",
            )),
            ServiceState::Completed => Err(PipelineError::invalid_state(
                "batching service has been completed and cannot be restarted",
            )),
            ServiceState::Created | ServiceState::Stopped => {
                *lifecycle = ServiceState::Running;
                info!("Batching service started with strategy {}", *self.strategy.read());
                Ok(())
            }
        }
    }

    /// Stop accepting messages and complete every pending batch.
    pub fn stop(&self) -> usize {
        let mut lifecycle = self.lifecycle.write();
        if *lifecycle == ServiceState::Completed {
            return 0;
        }
        *lifecycle = ServiceState::Stopped;
        let completed = self.complete_pending();
        info!("Batching service stopped, {} pending batch(es) completed", completed);
        completed
    }

    /// End of run: complete every pending batch regardless of its expected size.
    pub fn complete_all(&self) -> usize {
        let mut lifecycle = self.lifecycle.write();
        *lifecycle = ServiceState::Completed;
        let completed = self.complete_pending();
        info!("Batching service completed, {} pending batch(es) force-completed", completed);
        completed
    }

    fn complete_pending(&self) -> usize {
        let mut completed = 0;
        for mut batch in self.batches.iter_mut() {
            if batch.status == BatchStatus::Pending && batch.transition(BatchStatus::Complete).is_ok() {
                completed += 1;
            }
        }
        self.open.clear();
        completed
    }

    pub fn state(&self) -> ServiceState {
        *self.lifecycle.read()
    }

    /// Place `message` in the batch for its grouping key and return that batch's id.
    pub fn add_to_batch(&self, message: CompletionMessage) -> PipelineResult<String> {
        message.validate()?;

        let lifecycle = self.lifecycle.read();
        if *lifecycle != ServiceState::Running {
            return Err(PipelineError::invalid_state(format!(
                "cannot add {}: batching service is {:?}",
                message.test_case_id, *lifecycle
            )));
        }
        let strategy_guard = self.strategy.read();
        let strategy = *strategy_guard;
        let key = grouping_key(strategy, &message);
        let tunables = self.tuning.current();

        let batch_id = match self.open.entry(key.clone()) {
            Entry::Occupied(mut open) => {
                let current_id = open.get().clone();
                match self.append_to_open(&current_id, message, &tunables)? {
                    Ok(now_complete) => {
                        if now_complete {
                            open.remove();
                        }
                        current_id
                    }
                    Err(message) => {
                        // The indexed batch left Pending under us (timeout or removal).
                        let (batch, now_complete) =
                            self.open_batch(strategy, &key, message, &tunables)?;
                        let id = batch.id.clone();
                        self.batches.insert(id.clone(), batch);
                        if now_complete {
                            open.remove();
                        } else {
                            open.insert(id.clone());
                        }
                        id
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (batch, now_complete) = self.open_batch(strategy, &key, message, &tunables)?;
                let id = batch.id.clone();
                self.batches.insert(id.clone(), batch);
                if !now_complete {
                    vacant.insert(id.clone());
                }
                id
            }
        };

        drop(strategy_guard);
        drop(lifecycle);
        Ok(batch_id)
    }

    /// Append to an indexed batch if it is still pending; otherwise hand the
    /// message back.
    fn append_to_open(
        &self,
        batch_id: &str,
        message: CompletionMessage,
        tunables: &TunableSettings,
    ) -> PipelineResult<Result<bool, CompletionMessage>> {
        match self.batches.get_mut(batch_id) {
            Some(mut batch) if batch.status == BatchStatus::Pending => {
                Self::append(&mut batch, message, tunables).map(Ok)
            }
            _ => Ok(Err(message)),
        }
    }

    fn open_batch(
        &self,
        strategy: GroupingStrategy,
        key: &str,
        message: CompletionMessage,
        tunables: &TunableSettings,
    ) -> PipelineResult<(Batch, bool)> {
        let id = if strategy == GroupingStrategy::None {
            key.to_string()
        } else {
            crate::utils::generate_batch_id(key)
        };
        let mut batch = Batch::new(id, strategy, key);
        batch.expected_size = if strategy == GroupingStrategy::None {
            Some(1)
        } else {
            message.expected_batch_size()
        };
        batch.completion_timeout = Some(
            message
                .completion_timeout()
                .unwrap_or_else(|| tunables.completion_timeout_for(strategy)),
        );
        let mut inherited = MetadataKey::relevant_to(strategy);
        inherited.push(MetadataKey::MethodName);
        batch.metadata = message.metadata.subset(&inherited);

        debug!(
            "Opened batch {} (strategy {}, expected size {:?})",
            batch.id, strategy, batch.expected_size
        );
        let complete = Self::append(&mut batch, message, tunables)?;
        Ok((batch, complete))
    }

    /// Append and evaluate the completion predicate. Returns true when the
    /// batch just became `Complete`.
    fn append(
        batch: &mut Batch,
        message: CompletionMessage,
        tunables: &TunableSettings,
    ) -> PipelineResult<bool> {
        batch.messages.push(message);
        let reached = match batch.expected_size {
            Some(expected) => batch.len() >= expected,
            None => batch.len() >= tunables.max_batch_size,
        };
        if reached {
            batch.transition(BatchStatus::Complete)?;
            info!(
                "Batch {} complete with {} message(s)",
                batch.id,
                batch.len()
            );
        }
        Ok(reached)
    }

    pub fn is_batch_complete(&self, batch_id: &str) -> PipelineResult<bool> {
        Ok(self.get_batch_status(batch_id)?.is_complete())
    }

    pub fn get_batch_status(&self, batch_id: &str) -> PipelineResult<BatchStatus> {
        self.batches
            .get(batch_id)
            .map(|batch| batch.status)
            .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))
    }

    pub fn get_batch(&self, batch_id: &str) -> Option<Batch> {
        self.batches.get(batch_id).map(|batch| batch.clone())
    }

    pub fn get_all_batches(&self) -> Vec<Batch> {
        self.collect(|_| true)
    }

    /// Batches in `Complete` status, ready to be claimed for reporting.
    pub fn get_completed_batches(&self) -> Vec<Batch> {
        self.collect(|status| status == BatchStatus::Complete)
    }

    pub fn get_pending_batches(&self) -> Vec<Batch> {
        self.collect(|status| status == BatchStatus::Pending)
    }

    fn collect<F>(&self, keep: F) -> Vec<Batch>
    where
        F: Fn(BatchStatus) -> bool,
    {
        let mut batches: Vec<Batch> = self
            .batches
            .iter()
            .filter(|entry| keep(entry.status))
            .map(|entry| entry.value().clone())
            .collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        batches
    }

    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }

    pub fn pending_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|entry| entry.status == BatchStatus::Pending)
            .count()
    }

    /// Delete a batch. Returns false for unknown ids, so repeated calls are harmless.
    pub fn remove_batch(&self, batch_id: &str) -> bool {
        match self.batches.remove(batch_id) {
            Some((id, batch)) => {
                self.open
                    .remove_if(&batch.grouping_criteria, |_, open_id| *open_id == id);
                debug!("Removed batch {}", id);
                true
            }
            None => false,
        }
    }

    /// Atomically move a `Complete` or `TimedOut` batch to `Processing`.
    ///
    /// Returns the batch as it was before the claim, or `None` if it was not
    /// claimable (already claimed by someone else, or still pending).
    pub fn claim_batch(&self, batch_id: &str) -> PipelineResult<Option<Batch>> {
        let mut batch = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))?;
        if !batch.status.is_reportable() {
            return Ok(None);
        }
        let snapshot = batch.clone();
        batch.transition(BatchStatus::Processing)?;
        Ok(Some(snapshot))
    }

    pub fn mark_processed(&self, batch_id: &str) -> PipelineResult<()> {
        self.update(batch_id, |batch| batch.transition(BatchStatus::Processed))
    }

    pub fn mark_failed(&self, batch_id: &str, error: &str) -> PipelineResult<()> {
        self.update(batch_id, |batch| {
            batch.transition(BatchStatus::Error)?;
            batch.error = Some(error.to_string());
            Ok(())
        })
    }

    /// Atomically move a `Pending` batch to `TimedOut`.
    ///
    /// Returns the timed-out batch, or `None` when it completed naturally in
    /// the meantime.
    pub fn mark_timed_out(&self, batch_id: &str) -> PipelineResult<Option<Batch>> {
        let snapshot = {
            let mut batch = self
                .batches
                .get_mut(batch_id)
                .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))?;
            if batch.status != BatchStatus::Pending {
                return Ok(None);
            }
            batch.transition(BatchStatus::TimedOut)?;
            batch.clone()
        };
        self.open
            .remove_if(&snapshot.grouping_criteria, |_, open_id| *open_id == snapshot.id);
        Ok(Some(snapshot))
    }

    fn update<F>(&self, batch_id: &str, change: F) -> PipelineResult<()>
    where
        F: FnOnce(&mut Batch) -> PipelineResult<()>,
    {
        let mut batch = self
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| PipelineError::BatchNotFound(batch_id.to_string()))?;
        change(&mut batch)
    }

    /// Change the grouping strategy. Rejected while any batch is still pending.
    pub fn set_strategy(&self, strategy: GroupingStrategy) -> PipelineResult<()> {
        let mut current = self.strategy.write();
        let pending = self.pending_count();
        if pending > 0 {
            return Err(PipelineError::invalid_state(format!(
                "cannot switch strategy from {} to {} while {} batch(es) are pending",
                *current, strategy, pending
            )));
        }
        if *current != strategy {
            info!("Grouping strategy changed from {} to {}", *current, strategy);
            *current = strategy;
        }
        Ok(())
    }

    pub fn get_strategy(&self) -> GroupingStrategy {
        *self.strategy.read()
    }
}
