//! # Completion Pipeline Library
//!
//! Asynchronous pipeline that carries finished performance-test results from
//! the test runner to reporting. Completion messages are published into a
//! bounded queue, drained by consumer workers into batches of related cases,
//! and each finished batch is handed to a downstream reporter exactly once.
//!
//! ## Components
//!
//! - **Completion queue** (`queue`): bounded FIFO with backpressure and a
//!   `Created → Running → Completed/Stopped` lifecycle
//! - **Batching service** (`batching`): groups messages by a configurable
//!   strategy and tracks each batch through its status state machine
//! - **Timeout handler** (`timeout`): force-completes batches that stay
//!   pending past their deadline so partial results are still reported
//! - **Metrics collector** (`metrics`): timestamped event log, per-case
//!   histories, HDR latency histograms and windowed aggregates
//! - **Health monitor** (`health`): classifies the pipeline against
//!   configurable thresholds and broadcasts level changes
//! - **Performance optimizer** (`optimizer`): detects bottlenecks and tunes
//!   the runtime settings shared through [`config::SharedTuning`]
//!
//! [`pipeline::CompletionPipeline`] builds and wires all of them from one
//! [`config::PipelineConfig`].
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use completion_pipeline::{
//!     CollectingReporter, CompletionMessage, CompletionPipeline, PerformanceSummary,
//!     PipelineConfig, TestOutcome,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reporter = Arc::new(CollectingReporter::new());
//!     let pipeline = CompletionPipeline::new(PipelineConfig::default(), reporter.clone())?;
//!     pipeline.start()?;
//!
//!     let publisher = pipeline.publisher();
//!     publisher
//!         .publish(CompletionMessage::new(
//!             "Suite.case1",
//!             TestOutcome::passed(),
//!             PerformanceSummary::from_samples(vec![1.2, 1.3, 1.1]),
//!         ))
//!         .await?;
//!
//!     let summary = pipeline.complete().await?;
//!     println!("Reported {} batch(es)", summary.drain.dispatch.reported);
//!     Ok(())
//! }
//! ```

pub mod batching;

/// Command-line interface and configuration
///
/// Argument parsing with clap, including human-readable durations
/// (e.g. "250ms", "10s", "5m").
pub mod cli;

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod logging;
pub mod message;

/// Event recording and windowed aggregation
///
/// Every publish, process, failure, retry, queue-depth sample and batch
/// outcome lands here. Read-side queries take an optional time window and
/// reject inverted ones.
pub mod metrics;

pub mod optimizer;
pub mod pipeline;
pub mod publisher;
pub mod queue;

/// Reporter implementations and report output
///
/// Streaming JSON report writer, logging reporter and in-memory collecting
/// reporter, plus the final report document with system information.
pub mod results;

pub mod shutdown;
pub mod timeout;
pub mod utils;
pub mod workload;

pub use batching::BatchingService;
pub use cli::Args;
pub use config::{PipelineConfig, SharedTuning, TunableSettings};
pub use dispatch::{BatchDispatcher, BatchReporter};
pub use error::{PipelineError, PipelineResult};
pub use health::{HealthLevel, HealthMonitor, HealthStatus};
pub use message::{
    Batch, BatchStatus, CompletionMessage, GroupingStrategy, MetadataKey, PerformanceSummary,
    TestOutcome,
};
pub use metrics::MetricsCollector;
pub use optimizer::{OptimizationStrategy, PerformanceOptimizer};
pub use pipeline::{CompletionPipeline, PipelineSummary};
pub use publisher::CompletionPublisher;
pub use queue::CompletionQueue;
pub use results::{CollectingReporter, JsonReportWriter, LoggingReporter};

/// The current version of the completion pipeline
///
/// Populated from Cargo.toml and written into every report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Every `PipelineConfig` field not given on the command line falls back to
/// one of these.
pub mod defaults {
    use std::time::Duration;

    /// Bounded queue size
    pub const QUEUE_CAPACITY: usize = 1000;

    /// How long a publish waits for capacity before failing with `QueueFull`
    pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

    /// Latency budget for reporting one batch
    pub const PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default deadline for a pending batch
    pub const BATCH_COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

    /// Size at which a batch without an expected size completes
    pub const MAX_BATCH_SIZE: usize = 50;

    pub const MAX_RETRY_ATTEMPTS: u32 = 3;

    /// Backoff base; retry `n` waits `BASE_RETRY_DELAY * 2^(n-1)`
    pub const BASE_RETRY_DELAY: Duration = Duration::from_millis(100);

    /// Consumer pool size
    ///
    /// A single worker keeps each batch's messages in publish order.
    pub const CONSUMER_WORKERS: usize = 1;

    pub const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(15);

    /// Event-log and depth-history retention horizon
    pub const METRICS_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Window for "current" rates, health averages and trends
    pub const RECENT_WINDOW: Duration = Duration::from_secs(5 * 60);

    pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

    pub const OPTIMIZER_INTERVAL: Duration = Duration::from_secs(60);

    /// Minimum spacing between two applied optimizations
    pub const MIN_OPTIMIZATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Ceiling the optimizer may grow the queue capacity to
    pub const MAX_QUEUE_CAPACITY: usize = 100_000;

    /// Ceiling the optimizer may grow the batch completion timeout to
    pub const MAX_BATCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    /// Ceiling the optimizer may grow the processing timeout to
    pub const MAX_PROCESSING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    /// Default output file name
    pub const OUTPUT_FILE: &str = "pipeline_report.json";
}
