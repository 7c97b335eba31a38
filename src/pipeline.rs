//! # Completion Pipeline
//!
//! Builds every component from one [`PipelineConfig`], wires them together
//! and drives the run lifecycle.
//!
//! ## Lifecycle
//!
//! 1. [`CompletionPipeline::new`] validates the configuration and builds the
//!    components (nothing runs yet)
//! 2. [`start`](CompletionPipeline::start) starts the queue and batching
//!    service, spawns the consumer pool, and starts the timeout handler,
//!    health monitor and optimizer
//! 3. producers publish through [`publisher`](CompletionPipeline::publisher)
//! 4. [`complete`](CompletionPipeline::complete) drains everything in order
//!    and returns a [`PipelineSummary`]; [`shutdown`](CompletionPipeline::shutdown)
//!    instead cancels without draining

use crate::batching::BatchingService;
use crate::config::{PipelineConfig, SharedTuning};
use crate::consumer::{ConsumerContext, ConsumerPool};
use crate::dispatch::{BatchDispatcher, BatchReporter, DispatchSummary};
use crate::error::{PipelineError, PipelineResult};
use crate::health::{HealthMonitor, HealthStatus};
use crate::metrics::{
    BatchMetrics, CounterTotals, MetricsCollector, MetricsSnapshot, ProcessingRateMetrics,
};
use crate::optimizer::{OptimizationOutcome, PerformanceOptimizer};
use crate::publisher::CompletionPublisher;
use crate::queue::CompletionQueue;
use crate::timeout::{BatchTimeoutHandler, SweepOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What the end-of-run drain did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Pending batches force-completed by `CompleteAll`.
    pub forced_complete: usize,
    pub dispatch: DispatchSummary,
    pub final_sweep: SweepOutcome,
    /// Batches still in the table afterwards (failed reports).
    pub remaining_batches: usize,
}

/// End-of-run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub generated_at: DateTime<Utc>,
    pub uptime: Duration,
    pub totals: CounterTotals,
    pub metrics: MetricsSnapshot,
    pub batches: BatchMetrics,
    pub processing: ProcessingRateMetrics,
    pub health: HealthStatus,
    pub last_optimization: Option<OptimizationOutcome>,
    pub drain: DrainReport,
}

impl PipelineSummary {
    /// Summary of everything `metrics` observed since it started.
    pub fn from_metrics(metrics: &MetricsCollector, health: HealthStatus) -> PipelineResult<Self> {
        Ok(Self {
            generated_at: Utc::now(),
            uptime: metrics.uptime(),
            totals: metrics.totals(),
            metrics: metrics.get_metrics(None, None)?,
            batches: metrics.get_batch_metrics(None, None)?,
            processing: metrics.get_processing_rates(),
            health,
            last_optimization: None,
            drain: DrainReport::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Created,
    Running,
    Draining,
    Finished,
}

pub struct CompletionPipeline {
    config: PipelineConfig,
    tuning: SharedTuning,
    queue: Arc<CompletionQueue>,
    batching: Arc<BatchingService>,
    metrics: Arc<MetricsCollector>,
    dispatcher: Arc<BatchDispatcher>,
    timeout: Arc<BatchTimeoutHandler>,
    health: Arc<HealthMonitor>,
    optimizer: Arc<PerformanceOptimizer>,
    consumers: Mutex<Option<ConsumerPool>>,
    state: Mutex<RunState>,
}

impl CompletionPipeline {
    pub fn new(config: PipelineConfig, reporter: Arc<dyn BatchReporter>) -> PipelineResult<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(PipelineError::Configuration(errors));
        }

        let tuning = SharedTuning::new(config.tunables());
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics_retention,
            config.recent_window,
        ));
        let queue = Arc::new(CompletionQueue::new(tuning.clone(), config.publish_timeout));
        let batching = Arc::new(BatchingService::new(config.grouping_strategy, tuning.clone()));
        let dispatcher = Arc::new(BatchDispatcher::new(
            batching.clone(),
            metrics.clone(),
            reporter,
            tuning.clone(),
            config.base_retry_delay,
        ));
        let timeout = Arc::new(
            BatchTimeoutHandler::new(
                batching.clone(),
                metrics.clone(),
                tuning.clone(),
                config.timeout_check_interval,
            )
            .with_dispatcher(dispatcher.clone()),
        );
        let health = Arc::new(
            HealthMonitor::new(
                metrics.clone(),
                tuning.clone(),
                config.health_thresholds.clone(),
                config.health_check_interval,
                config.recent_window,
            )
            .with_queue(queue.clone()),
        );
        let optimizer = Arc::new(
            PerformanceOptimizer::new(
                metrics.clone(),
                tuning.clone(),
                config.optimizer.clone(),
                config.recent_window,
            )
            .with_queue(queue.clone()),
        );

        Ok(Self {
            config,
            tuning,
            queue,
            batching,
            metrics,
            dispatcher,
            timeout,
            health,
            optimizer,
            consumers: Mutex::new(None),
            state: Mutex::new(RunState::Created),
        })
    }

    /// Start every component. Must be called from within a Tokio runtime.
    pub fn start(&self) -> PipelineResult<()> {
        {
            let mut state = self.state.lock();
            if *state != RunState::Created {
                return Err(PipelineError::invalid_state(
                    "pipeline can only be started once",
                ));
            }
            *state = RunState::Running;
        }

        self.queue.start()?;
        self.batching.start()?;
        let pool = ConsumerPool::spawn(
            self.config.consumer_workers,
            ConsumerContext {
                queue: self.queue.clone(),
                batching: self.batching.clone(),
                metrics: self.metrics.clone(),
                dispatcher: self.dispatcher.clone(),
            },
        );
        *self.consumers.lock() = Some(pool);
        self.timeout.start()?;
        self.health.start()?;
        if self.config.optimizer.enabled {
            self.optimizer.start()?;
        }

        info!(
            "Completion pipeline started: strategy {}, capacity {}, {} worker(s), reporter {}",
            self.config.grouping_strategy,
            self.config.queue_capacity,
            self.config.consumer_workers,
            self.dispatcher.reporter_name()
        );
        Ok(())
    }

    pub fn publisher(&self) -> CompletionPublisher {
        CompletionPublisher::new(self.queue.clone(), self.metrics.clone())
    }

    /// End of run: drain the queue, complete and report every batch, stop the
    /// background tasks and summarize.
    pub async fn complete(&self) -> PipelineResult<PipelineSummary> {
        {
            let mut state = self.state.lock();
            if *state != RunState::Running {
                return Err(PipelineError::invalid_state(
                    "pipeline must be running to complete",
                ));
            }
            *state = RunState::Draining;
        }
        info!("Draining completion pipeline ({} queued)", self.queue.depth());

        self.queue.complete();
        let pool = self.consumers.lock().take();
        if let Some(pool) = pool {
            pool.join().await;
        }

        let forced_complete = self.batching.complete_all();
        let dispatch = self.dispatcher.dispatch_ready().await;
        let final_sweep = self.timeout.stop().await;
        self.health.stop().await;
        self.optimizer.stop().await;

        let remaining_batches = self.batching.batch_count();
        if remaining_batches > 0 {
            warn!("{} batch(es) could not be reported", remaining_batches);
        }

        let health = self.health.check_now();
        let mut summary = PipelineSummary::from_metrics(&self.metrics, health)?;
        summary.last_optimization = self.optimizer.last_outcome();
        summary.drain = DrainReport {
            forced_complete,
            dispatch,
            final_sweep,
            remaining_batches,
        };

        *self.state.lock() = RunState::Finished;
        info!(
            "Completion pipeline finished: {} published, {} processed, {} failed",
            summary.totals.published, summary.totals.processed, summary.totals.failed
        );
        Ok(summary)
    }

    /// Cancel every task without draining. Partial batches stay in the table.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == RunState::Finished {
                return;
            }
            *state = RunState::Finished;
        }
        self.queue.stop();
        let pool = self.consumers.lock().take();
        if let Some(pool) = pool {
            pool.stop().await;
        }
        self.timeout.cancel().await;
        self.health.stop().await;
        self.optimizer.stop().await;
        info!(
            "Completion pipeline shut down with {} queued and {} batch(es) in the table",
            self.queue.depth(),
            self.batching.batch_count()
        );
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tuning(&self) -> &SharedTuning {
        &self.tuning
    }

    pub fn queue(&self) -> &Arc<CompletionQueue> {
        &self.queue
    }

    pub fn batching(&self) -> &Arc<BatchingService> {
        &self.batching
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn dispatcher(&self) -> &Arc<BatchDispatcher> {
        &self.dispatcher
    }

    pub fn timeout_handler(&self) -> &Arc<BatchTimeoutHandler> {
        &self.timeout
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn optimizer(&self) -> &Arc<PerformanceOptimizer> {
        &self.optimizer
    }
}
