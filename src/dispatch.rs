//! # Batch Dispatch
//!
//! Hands reportable batches to the [`BatchReporter`] collaborator. A batch is
//! claimed (`Processing`), reported under the processing timeout with
//! exponential retry backoff, then marked `Processed` and removed, or left
//! in the table as `Error`.

use crate::batching::BatchingService;
use crate::config::SharedTuning;
use crate::error::PipelineResult;
use crate::message::Batch;
use crate::metrics::MetricsCollector;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Processor name under which reporter failures are recorded.
pub const REPORTER_PROCESSOR: &str = "reporter";

/// Downstream collaborator that turns a finished batch into a report
#[async_trait]
pub trait BatchReporter: Send + Sync {
    /// Report one batch in status `Complete` or `TimedOut`
    async fn report(&self, batch: &Batch) -> Result<()>;

    /// Reporter name for identification in logs
    fn name(&self) -> &str;
}

/// What happened to a batch handed to [`BatchDispatcher::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchOutcome {
    /// Reporter accepted the batch; it was removed from the table
    Reported,
    /// Reporter kept failing; the batch is in `Error`
    Failed,
    /// Someone else claimed it first, or it was not ready
    Skipped,
}

/// Counts for a bulk dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub reported: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DispatchSummary {
    pub fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Reported => self.reported += 1,
            DispatchOutcome::Failed => self.failed += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Hands finished batches to the reporter exactly once.
///
/// The claim (`Complete|TimedOut → Processing`) is atomic in the batching
/// service, so concurrent dispatchers for the same batch id race harmlessly:
/// one reports it, the others see `Skipped`.
pub struct BatchDispatcher {
    batching: Arc<BatchingService>,
    metrics: Arc<MetricsCollector>,
    reporter: Arc<dyn BatchReporter>,
    tuning: SharedTuning,
    base_retry_delay: Duration,
}

impl BatchDispatcher {
    pub fn new(
        batching: Arc<BatchingService>,
        metrics: Arc<MetricsCollector>,
        reporter: Arc<dyn BatchReporter>,
        tuning: SharedTuning,
        base_retry_delay: Duration,
    ) -> Self {
        Self {
            batching,
            metrics,
            reporter,
            tuning,
            base_retry_delay,
        }
    }

    pub fn reporter_name(&self) -> &str {
        self.reporter.name()
    }

    /// Backoff before retry number `attempt` (1-based).
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_retry_delay.saturating_mul(1u32 << exponent)
    }

    /// Claim, report with retries, then finalize one batch.
    ///
    /// ## Returns
    /// - `Ok(outcome)`: reporter failures are contained and reported as `Failed`
    /// - `Err`: only for an unknown batch id or a lifecycle violation
    pub async fn dispatch(&self, batch_id: &str) -> PipelineResult<DispatchOutcome> {
        let batch = match self.batching.claim_batch(batch_id)? {
            Some(batch) => batch,
            None => {
                debug!("Batch {} not claimable, skipping", batch_id);
                return Ok(DispatchOutcome::Skipped);
            }
        };

        let started = Instant::now();
        let settings = self.tuning.current();
        let mut attempt = 0u32;
        let result = loop {
            let report = tokio::time::timeout(settings.processing_timeout, self.reporter.report(&batch));
            let error = match report.await {
                Ok(Ok(())) => break Ok(()),
                Ok(Err(e)) => e,
                Err(_) => anyhow!(
                    "reporter {} did not finish within {:?}",
                    self.reporter.name(),
                    settings.processing_timeout
                ),
            };
            if attempt >= settings.max_retry_attempts {
                break Err(error);
            }
            attempt += 1;
            let delay = self.retry_delay(attempt);
            warn!(
                "Reporter {} failed on batch {} (attempt {}/{}), retrying in {:?}: {:#}",
                self.reporter.name(),
                batch.id,
                attempt,
                settings.max_retry_attempts,
                delay,
                error
            );
            if let Err(e) = self.metrics.record_retry(&batch.id) {
                debug!("Could not record retry: {}", e);
            }
            tokio::time::sleep(delay).await;
        };
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                self.batching.mark_processed(&batch.id)?;
                if let Err(e) =
                    self.metrics
                        .record_batch_completion(&batch.id, batch.len(), true, elapsed)
                {
                    debug!("Could not record batch completion: {}", e);
                }
                self.batching.remove_batch(&batch.id);
                info!(
                    "Reported batch {} ({} message(s), {}) via {} in {:?}",
                    batch.id,
                    batch.len(),
                    batch.status,
                    self.reporter.name(),
                    elapsed
                );
                Ok(DispatchOutcome::Reported)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(
                    "Giving up on batch {} after {} attempt(s): {}",
                    batch.id,
                    attempt + 1,
                    message
                );
                self.batching.mark_failed(&batch.id, &message)?;
                if let Err(e) =
                    self.metrics
                        .record_batch_completion(&batch.id, batch.len(), false, elapsed)
                {
                    debug!("Could not record batch completion: {}", e);
                }
                for case in &batch.messages {
                    if let Err(e) =
                        self.metrics
                            .record_message_failed(&case.test_case_id, REPORTER_PROCESSOR, &message)
                    {
                        debug!("Could not record message failure: {}", e);
                    }
                }
                Ok(DispatchOutcome::Failed)
            }
        }
    }

    /// Dispatch every batch currently in `Complete` or `TimedOut` status.
    pub async fn dispatch_ready(&self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let ready = self
            .batching
            .get_all_batches()
            .into_iter()
            .filter(|batch| batch.status.is_reportable());
        for batch in ready {
            match self.dispatch(&batch.id).await {
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    warn!("Dispatch of batch {} failed: {}", batch.id, e);
                    summary.record(DispatchOutcome::Skipped);
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        BatchStatus, CompletionMessage, GroupingStrategy, PerformanceSummary, TestOutcome,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyReporter {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchReporter for FlakyReporter {
        async fn report(&self, _batch: &Batch) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(anyhow!("transient failure {}", call))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn setup(failures: usize) -> (Arc<BatchingService>, Arc<MetricsCollector>, BatchDispatcher, Arc<FlakyReporter>) {
        let tuning = SharedTuning::default();
        let batching = Arc::new(BatchingService::new(GroupingStrategy::None, tuning.clone()));
        batching.start().unwrap();
        let metrics = Arc::new(MetricsCollector::default());
        let reporter = Arc::new(FlakyReporter {
            failures,
            calls: AtomicUsize::new(0),
        });
        let dispatcher = BatchDispatcher::new(
            batching.clone(),
            metrics.clone(),
            reporter.clone(),
            tuning,
            Duration::from_millis(1),
        );
        (batching, metrics, dispatcher, reporter)
    }

    fn add(batching: &BatchingService, id: &str) -> String {
        batching
            .add_to_batch(CompletionMessage::new(
                id,
                TestOutcome::passed(),
                PerformanceSummary::default(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_dispatch_removes_batch() {
        let (batching, metrics, dispatcher, _) = setup(0);
        let id = add(&batching, "A.one");

        assert_eq!(dispatcher.dispatch(&id).await.unwrap(), DispatchOutcome::Reported);
        assert!(batching.get_batch(&id).is_none());
        // Second hand-off of the same id is impossible.
        assert!(dispatcher.dispatch(&id).await.is_err());

        let batches = metrics.get_batch_metrics(None, None).unwrap();
        assert_eq!(batches.completed_batches, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (batching, metrics, dispatcher, reporter) = setup(2);
        let id = add(&batching, "A.one");

        assert_eq!(dispatcher.dispatch(&id).await.unwrap(), DispatchOutcome::Reported);
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.totals().retried, 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_marks_error() {
        let (batching, metrics, dispatcher, reporter) = setup(usize::MAX);
        let id = add(&batching, "A.one");

        assert_eq!(dispatcher.dispatch(&id).await.unwrap(), DispatchOutcome::Failed);
        assert_eq!(reporter.calls.load(Ordering::SeqCst), 4);

        let batch = batching.get_batch(&id).unwrap();
        assert_eq!(batch.status, BatchStatus::Error);
        assert!(batch.error.unwrap().contains("transient failure"));

        assert_eq!(metrics.totals().failed, 1);
        assert_eq!(metrics.get_processor_names(), vec![REPORTER_PROCESSOR.to_string()]);
        assert_eq!(metrics.get_batch_metrics(None, None).unwrap().failed_batches, 1);
    }

    #[tokio::test]
    async fn test_dispatch_ready_covers_every_finished_batch() {
        let (batching, _, dispatcher, _) = setup(0);
        for i in 0..5 {
            add(&batching, &format!("A.case{}", i));
        }
        let claimed = add(&batching, "A.claimed");
        batching.claim_batch(&claimed).unwrap();

        let summary = dispatcher.dispatch_ready().await;
        assert_eq!(summary.reported, 5);
        assert_eq!(summary.skipped, 0);
        batching.mark_processed(&claimed).unwrap();
        batching.remove_batch(&claimed);
        assert_eq!(batching.batch_count(), 0);
    }

    #[test]
    fn test_retry_delay_doubles() {
        let (_, _, dispatcher, _) = setup(0);
        assert_eq!(dispatcher.retry_delay(1), Duration::from_millis(1));
        assert_eq!(dispatcher.retry_delay(2), Duration::from_millis(2));
        assert_eq!(dispatcher.retry_delay(4), Duration::from_millis(8));
    }
}
