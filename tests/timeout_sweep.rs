use anyhow::{bail, Result};
use async_trait::async_trait;
use completion_pipeline::{
    results::CollectingReporter, timeout::BatchTimeoutHandler, timeout::SweepOutcome, Batch,
    BatchDispatcher, BatchReporter, BatchStatus, BatchingService, CompletionMessage,
    GroupingStrategy, MetadataKey, MetricsCollector, PerformanceSummary, SharedTuning,
    TestOutcome,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    batching: Arc<BatchingService>,
    metrics: Arc<MetricsCollector>,
    tuning: SharedTuning,
}

impl Fixture {
    fn new() -> Result<Self> {
        let tuning = SharedTuning::default();
        let batching = Arc::new(BatchingService::new(GroupingStrategy::ByTestClass, tuning.clone()));
        batching.start()?;
        Ok(Self {
            batching,
            metrics: Arc::new(MetricsCollector::default()),
            tuning,
        })
    }

    fn handler(&self, interval: Duration) -> BatchTimeoutHandler {
        BatchTimeoutHandler::new(
            self.batching.clone(),
            self.metrics.clone(),
            self.tuning.clone(),
            interval,
        )
    }

    fn dispatcher(&self, reporter: Arc<dyn BatchReporter>) -> Arc<BatchDispatcher> {
        Arc::new(BatchDispatcher::new(
            self.batching.clone(),
            self.metrics.clone(),
            reporter,
            self.tuning.clone(),
            Duration::from_millis(1),
        ))
    }
}

fn with_deadline(id: &str, timeout_ms: i64) -> CompletionMessage {
    CompletionMessage::new(id, TestOutcome::passed(), PerformanceSummary::default())
        .with_metadata(MetadataKey::CompletionTimeoutMs, timeout_ms)
}

#[tokio::test]
async fn fifty_millisecond_batch_times_out_after_one_sweep() -> Result<()> {
    let fixture = Fixture::new()?;
    let handler = fixture.handler(Duration::from_secs(3600));
    let id = fixture.batching.add_to_batch(with_deadline("Slow.only", 50))?;

    tokio::time::sleep(Duration::from_millis(60)).await;
    let outcome = handler.process_timed_out_batches().await;

    assert_eq!(outcome, SweepOutcome { processed: 1, failed: 0 });
    assert_eq!(fixture.batching.get_batch_status(&id)?, BatchStatus::TimedOut);
    assert!(fixture
        .batching
        .get_pending_batches()
        .iter()
        .all(|batch| batch.id != id));
    assert_eq!(
        fixture.metrics.get_batch_timeout(&id),
        Some((None, 1, Duration::from_millis(50)))
    );
    Ok(())
}

#[tokio::test]
async fn periodic_sweep_reports_partial_batches() -> Result<()> {
    let fixture = Fixture::new()?;
    let reporter = Arc::new(CollectingReporter::new());
    let handler = Arc::new(
        fixture
            .handler(Duration::from_millis(10))
            .with_dispatcher(fixture.dispatcher(reporter.clone())),
    );
    handler.start()?;

    for i in 0..2 {
        fixture.batching.add_to_batch(
            with_deadline(&format!("Partial.case{}", i), 30)
                .with_metadata(MetadataKey::ExpectedBatchSize, 5i64),
        )?;
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    handler.stop().await;

    let reported = reporter.batches();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].status, BatchStatus::TimedOut);
    assert_eq!(reported[0].len(), 2);
    assert_eq!(reported[0].expected_size, Some(5));
    assert_eq!(fixture.batching.batch_count(), 0);

    let batches = fixture.metrics.get_batch_metrics(None, None)?;
    assert_eq!(batches.timed_out_batches, 1);
    Ok(())
}

/// Fails every batch opened for the `Broken` class.
struct SelectiveReporter;

#[async_trait]
impl BatchReporter for SelectiveReporter {
    async fn report(&self, batch: &Batch) -> Result<()> {
        if batch.grouping_criteria.contains("Broken") {
            bail!("report sink rejected {}", batch.id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "selective"
    }
}

#[tokio::test]
async fn one_failing_batch_does_not_block_the_sweep() -> Result<()> {
    let fixture = Fixture::new()?;
    let handler = fixture
        .handler(Duration::from_secs(3600))
        .with_dispatcher(fixture.dispatcher(Arc::new(SelectiveReporter)));

    let broken = fixture.batching.add_to_batch(with_deadline("Broken.case", 10))?;
    let healthy = fixture.batching.add_to_batch(with_deadline("Healthy.case", 10))?;
    tokio::time::sleep(Duration::from_millis(30)).await;

    let outcome = handler.process_timed_out_batches().await;
    assert_eq!(outcome, SweepOutcome { processed: 1, failed: 1 });

    let failed = fixture.batching.get_batch(&broken).expect("failed batch stays in the table");
    assert_eq!(failed.status, BatchStatus::Error);
    assert!(fixture.batching.get_batch(&healthy).is_none());
    assert_eq!(fixture.metrics.totals().failed, 1);
    Ok(())
}
