//! # Batch Timeout Handler
//!
//! Background watchdog that force-completes batches which stayed `Pending`
//! past their completion deadline. A timed-out batch keeps whatever messages
//! it collected; partial batches are still reported.
//!
//! ## Sweep
//!
//! Each sweep lists the pending batches, and for every batch whose age
//! exceeds its deadline:
//!
//! 1. atomically moves it `Pending → TimedOut` (skipped if it completed
//!    naturally in the meantime)
//! 2. records one batch-timeout metric with expected versus actual size
//! 3. hands it to the dispatcher, when one is attached
//!
//! A failure on one batch is counted and logged; the sweep carries on with
//! the rest.

use crate::batching::BatchingService;
use crate::config::SharedTuning;
use crate::dispatch::{BatchDispatcher, DispatchOutcome};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::MetricsCollector;
use crate::shutdown::{BackgroundTask, ShutdownSignal};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepOutcome {
    /// Batches moved to `TimedOut` (and reported, if a dispatcher is attached).
    pub processed: usize,
    /// Batches whose forced completion or hand-off failed.
    pub failed: usize,
}

pub struct BatchTimeoutHandler {
    batching: Arc<BatchingService>,
    metrics: Arc<MetricsCollector>,
    tuning: SharedTuning,
    dispatcher: Option<Arc<BatchDispatcher>>,
    interval: Duration,
    task: Mutex<Option<BackgroundTask>>,
}

impl BatchTimeoutHandler {
    pub fn new(
        batching: Arc<BatchingService>,
        metrics: Arc<MetricsCollector>,
        tuning: SharedTuning,
        interval: Duration,
    ) -> Self {
        Self {
            batching,
            metrics,
            tuning,
            dispatcher: None,
            interval,
            task: Mutex::new(None),
        }
    }

    /// Report timed-out batches through `dispatcher` instead of leaving them
    /// in the table.
    pub fn with_dispatcher(mut self, dispatcher: Arc<BatchDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn start(self: &Arc<Self>) -> PipelineResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(PipelineError::invalid_state("timeout handler is already running"));
        }
        let handler = Arc::clone(self);
        *task = Some(BackgroundTask::spawn("timeout-handler", move |signal| async move {
            handler.run(signal).await
        }));
        info!("Timeout handler started (check interval {:?})", self.interval);
        Ok(())
    }

    async fn run(&self, signal: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = ticker.tick() => {
                    let outcome = self.process_timed_out_batches().await;
                    if outcome.processed > 0 || outcome.failed > 0 {
                        info!(
                            "Timeout sweep: {} batch(es) forced, {} failed",
                            outcome.processed, outcome.failed
                        );
                    }
                }
            }
        }
        debug!("Timeout handler loop exited");
    }

    /// End the periodic sweep without a final pass.
    pub async fn cancel(&self) {
        let running = self.task.lock().take();
        if let Some(task) = running {
            task.stop().await;
        }
    }

    /// Stop the periodic sweep, then run one last sweep.
    pub async fn stop(&self) -> SweepOutcome {
        self.cancel().await;
        let outcome = self.process_timed_out_batches().await;
        info!(
            "Timeout handler stopped; final sweep forced {} batch(es), {} failed",
            outcome.processed, outcome.failed
        );
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Force every overdue pending batch to `TimedOut`. Usable on demand.
    pub async fn process_timed_out_batches(&self) -> SweepOutcome {
        let now = Utc::now();
        let settings = self.tuning.current();
        let mut outcome = SweepOutcome::default();

        for batch in self.batching.get_pending_batches() {
            let default_timeout = settings.completion_timeout_for(batch.strategy);
            if !batch.is_overdue(now, default_timeout) {
                continue;
            }
            match self.force(&batch.id, default_timeout).await {
                Ok(None) => debug!("Batch {} completed before it could time out", batch.id),
                Ok(Some(DispatchOutcome::Failed)) => outcome.failed += 1,
                Ok(Some(_)) => outcome.processed += 1,
                Err(e) => {
                    warn!("Could not time out batch {}: {}", batch.id, e);
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Returns `None` when the batch left `Pending` on its own. Without a
    /// dispatcher a forced batch counts as `Skipped`.
    async fn force(
        &self,
        batch_id: &str,
        default_timeout: Duration,
    ) -> PipelineResult<Option<DispatchOutcome>> {
        let batch = match self.batching.mark_timed_out(batch_id)? {
            Some(batch) => batch,
            None => return Ok(None),
        };
        let timeout = batch.completion_timeout.unwrap_or(default_timeout);
        warn!(
            "Batch {} timed out after {:?} with {} of {} message(s)",
            batch.id,
            timeout,
            batch.len(),
            batch
                .expected_size
                .map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );
        self.metrics
            .record_batch_timeout(&batch.id, batch.expected_size, batch.len(), timeout)?;

        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(&batch.id).await.map(Some),
            None => Ok(Some(DispatchOutcome::Skipped)),
        }
    }
}
