//! # Performance Optimizer
//!
//! Periodically scores pipeline performance, detects bottlenecks and
//! translates the active [`OptimizationStrategy`] into concrete changes to the
//! runtime-tunable settings.
//!
//! ## Key Components
//!
//! - **Analysis**: a 0–100 score plus a list of [`Bottleneck`]s derived from the
//!   same health inputs the health monitor uses
//! - **Planning**: bottleneck fixes first, then strategy deltas, clamped to the
//!   configured bounds ([`plan_settings`])
//! - **Events**: [`OptimizationApplied`] with before/after settings and
//!   [`BottleneckDetected`] for newly observed bottlenecks, both on
//!   `tokio::sync::broadcast` channels
//!
//! The optimizer never blocks the pipeline. When analysis fails the cycle is
//! skipped and logged.

use crate::config::{OptimizerSettings, SharedTuning, TunableSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::health::{collect_health_metrics, HealthMetrics};
use crate::metrics::MetricsCollector;
use crate::queue::CompletionQueue;
use crate::shutdown::{BackgroundTask, ShutdownSignal};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;
const MAX_RETRY_CEILING: u32 = 5;
const LATENCY_BATCH_SIZE_FLOOR: usize = 20;
const MEMORY_BATCH_SIZE_FLOOR: usize = 25;
const MEMORY_CAPACITY_FLOOR: usize = 500;

/// Objective guiding configuration changes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize,
)]
pub enum OptimizationStrategy {
    /// Favor throughput: larger queue, longer batch windows, bigger batches
    #[clap(name = "throughput")]
    Throughput,

    /// Favor latency: shorter batch windows, smaller batches
    #[clap(name = "latency")]
    Latency,

    /// Favor a small footprint: smaller queue and batches
    #[clap(name = "memory")]
    Memory,

    /// Adjust only where metrics show pressure
    #[clap(name = "balanced")]
    Balanced,

    /// Pick one of the above each cycle from the current analysis
    #[clap(name = "adaptive")]
    Adaptive,
}

impl fmt::Display for OptimizationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationStrategy::Throughput => write!(f, "Throughput"),
            OptimizationStrategy::Latency => write!(f, "Latency"),
            OptimizationStrategy::Memory => write!(f, "Memory"),
            OptimizationStrategy::Balanced => write!(f, "Balanced"),
            OptimizationStrategy::Adaptive => write!(f, "Adaptive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BottleneckKind {
    QueueCapacity,
    ProcessingSpeed,
    LowThroughput,
    ErrorRate,
    BatchTimeout,
}

impl fmt::Display for BottleneckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BottleneckKind::QueueCapacity => "QueueCapacity",
            BottleneckKind::ProcessingSpeed => "ProcessingSpeed",
            BottleneckKind::LowThroughput => "LowThroughput",
            BottleneckKind::ErrorRate => "ErrorRate",
            BottleneckKind::BatchTimeout => "BatchTimeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BottleneckSeverity {
    fn score_penalty(self) -> f64 {
        match self {
            BottleneckSeverity::Critical => 25.0,
            BottleneckSeverity::High => 15.0,
            BottleneckSeverity::Medium => 10.0,
            BottleneckSeverity::Low => 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub kind: BottleneckKind,
    pub severity: BottleneckSeverity,
    pub description: String,
    pub affected_metrics: Vec<String>,
    pub suggested_resolution: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecommendationPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl From<BottleneckSeverity> for RecommendationPriority {
    fn from(severity: BottleneckSeverity) -> Self {
        match severity {
            BottleneckSeverity::Low => RecommendationPriority::Low,
            BottleneckSeverity::Medium => RecommendationPriority::Medium,
            BottleneckSeverity::High => RecommendationPriority::High,
            BottleneckSeverity::Critical => RecommendationPriority::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImplementationEffort {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: RecommendationPriority,
    pub category: String,
    pub description: String,
    pub expected_impact: String,
    /// Parameter name → suggested value.
    pub configuration_changes: BTreeMap<String, String>,
    pub effort: ImplementationEffort,
}

/// Result of one analysis pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub metrics: HealthMetrics,
    pub strategy: OptimizationStrategy,
    pub should_optimize: bool,
}

impl PerformanceAnalysis {
    fn count(&self, severity: BottleneckSeverity) -> usize {
        self.bottlenecks
            .iter()
            .filter(|b| b.severity == severity)
            .count()
    }

    pub fn severity_of(&self, kind: BottleneckKind) -> Option<BottleneckSeverity> {
        self.bottlenecks
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.severity)
            .max()
    }

    /// Whether the analysis alone justifies changing configuration.
    pub fn needs_attention(&self) -> bool {
        self.score < 70.0
            || self.count(BottleneckSeverity::Critical) > 0
            || self.count(BottleneckSeverity::High) >= 2
    }
}

/// One changed parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub parameter: String,
    pub previous: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub timestamp: DateTime<Utc>,
    /// Strategy actually applied (Adaptive resolves to a concrete one).
    pub strategy: OptimizationStrategy,
    pub score: f64,
    pub changes: Vec<ConfigChange>,
    pub expected_impact: String,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationApplied {
    pub previous: TunableSettings,
    pub current: TunableSettings,
    pub outcome: OptimizationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckDetected {
    pub bottleneck: Bottleneck,
    pub timestamp: DateTime<Utc>,
}

fn latency_percent(metrics: &HealthMetrics, processing_timeout: Duration) -> f64 {
    let budget_ms = processing_timeout.as_secs_f64() * 1000.0;
    if budget_ms > 0.0 {
        metrics.average_processing_time_ms / budget_ms * 100.0
    } else {
        0.0
    }
}

fn average_depth_percent(metrics: &HealthMetrics) -> f64 {
    if metrics.queue_capacity == 0 {
        return 0.0;
    }
    metrics.average_queue_depth / metrics.queue_capacity as f64 * 100.0
}

/// Detect bottlenecks in `metrics` given the current latency budget.
pub fn detect_bottlenecks(metrics: &HealthMetrics, processing_timeout: Duration) -> Vec<Bottleneck> {
    let mut found = Vec::new();

    let depth_pct = average_depth_percent(metrics);
    let queue_severity = if depth_pct > 90.0 {
        Some(BottleneckSeverity::Critical)
    } else if depth_pct > 70.0 {
        Some(BottleneckSeverity::High)
    } else {
        None
    };
    if let Some(severity) = queue_severity {
        found.push(Bottleneck {
            kind: BottleneckKind::QueueCapacity,
            severity,
            description: format!(
                "Average queue depth {:.0} is {:.1}% of capacity {}",
                metrics.average_queue_depth, depth_pct, metrics.queue_capacity
            ),
            affected_metrics: vec!["queue_depth".to_string(), "queue_capacity".to_string()],
            suggested_resolution: "Increase queue capacity or add consumer workers".to_string(),
        });
    }

    let latency_pct = latency_percent(metrics, processing_timeout);
    let latency_severity = if latency_pct > 80.0 {
        Some(BottleneckSeverity::High)
    } else if latency_pct > 60.0 {
        Some(BottleneckSeverity::Medium)
    } else {
        None
    };
    if let Some(severity) = latency_severity {
        found.push(Bottleneck {
            kind: BottleneckKind::ProcessingSpeed,
            severity,
            description: format!(
                "Average processing time {:.1}ms is {:.1}% of the processing timeout",
                metrics.average_processing_time_ms, latency_pct
            ),
            affected_metrics: vec!["average_processing_time_ms".to_string()],
            suggested_resolution: "Raise the processing timeout or speed up batch handling"
                .to_string(),
        });
    }

    if metrics.messages_processed_per_second < 1.0 && metrics.queue_depth > 0 {
        found.push(Bottleneck {
            kind: BottleneckKind::LowThroughput,
            severity: BottleneckSeverity::High,
            description: format!(
                "Processing {:.2} msg/s with {} message(s) waiting",
                metrics.messages_processed_per_second, metrics.queue_depth
            ),
            affected_metrics: vec![
                "messages_processed_per_second".to_string(),
                "queue_depth".to_string(),
            ],
            suggested_resolution: "Add consumer workers".to_string(),
        });
    }

    let error_severity = if metrics.error_rate > 10.0 {
        Some(BottleneckSeverity::Critical)
    } else if metrics.error_rate > 5.0 {
        Some(BottleneckSeverity::Medium)
    } else {
        None
    };
    if let Some(severity) = error_severity {
        found.push(Bottleneck {
            kind: BottleneckKind::ErrorRate,
            severity,
            description: format!("Error rate is {:.1}%", metrics.error_rate),
            affected_metrics: vec!["error_rate".to_string(), "retry_rate".to_string()],
            suggested_resolution: "Investigate reporter failures and allow more retries"
                .to_string(),
        });
    }

    let timeout_severity = if metrics.batch_timeout_rate > 20.0 {
        Some(BottleneckSeverity::High)
    } else if metrics.batch_timeout_rate > 10.0 {
        Some(BottleneckSeverity::Medium)
    } else {
        None
    };
    if let Some(severity) = timeout_severity {
        found.push(Bottleneck {
            kind: BottleneckKind::BatchTimeout,
            severity,
            description: format!("{:.1}% of batches timed out", metrics.batch_timeout_rate),
            affected_metrics: vec!["batch_timeout_rate".to_string()],
            suggested_resolution: "Lengthen the batch completion timeout".to_string(),
        });
    }

    found
}

/// Overall performance score in 0..=100.
pub fn score(metrics: &HealthMetrics, bottlenecks: &[Bottleneck]) -> f64 {
    let mut score = 100.0;
    score -= bottlenecks
        .iter()
        .map(|b| b.severity.score_penalty())
        .sum::<f64>();
    score -= (metrics.error_rate * 2.0).min(20.0);
    score -= metrics.batch_timeout_rate.min(15.0);
    if metrics.messages_processed_per_second > 10.0 {
        score += 5.0;
    }
    if metrics.error_rate == 0.0 && metrics.batch_timeout_rate == 0.0 {
        score += 10.0;
    }
    score.clamp(0.0, 100.0)
}

/// Concrete strategy Adaptive picks for `metrics`.
pub fn resolve_adaptive(metrics: &HealthMetrics, processing_timeout: Duration) -> OptimizationStrategy {
    if metrics.messages_processed_per_second < 2.0 && metrics.queue_depth > 0 {
        OptimizationStrategy::Throughput
    } else if latency_percent(metrics, processing_timeout) > 70.0 {
        OptimizationStrategy::Latency
    } else if average_depth_percent(metrics) > 80.0 {
        OptimizationStrategy::Memory
    } else {
        OptimizationStrategy::Balanced
    }
}

fn scale(value: usize, factor: f64) -> usize {
    (value as f64 * factor).ceil() as usize
}

/// Scale a duration up, saturating at `ceiling`.
///
/// A value already above `ceiling` is left where it is.
fn grow(value: Duration, factor: f64, ceiling: Duration) -> Duration {
    let ceiling = ceiling.max(value);
    Duration::try_from_secs_f64(value.as_secs_f64() * factor)
        .map_or(ceiling, |scaled| scaled.min(ceiling))
}

/// Shrink toward `floor` without raising a value that is already below it.
fn shrink(value: usize, by: usize, floor: usize) -> usize {
    value.saturating_sub(by).max(floor.min(value))
}

/// Compute the settings `strategy` would produce from `current`.
///
/// Returns the concrete strategy applied and the planned settings. Capacity
/// stays within `1..=settings.max_queue_capacity`; batch size within
/// `1..=capacity`. Timeouts never grow past `settings.max_batch_timeout` and
/// `settings.max_processing_timeout`.
pub fn plan_settings(
    strategy: OptimizationStrategy,
    analysis: &PerformanceAnalysis,
    current: &TunableSettings,
    settings: &OptimizerSettings,
) -> (OptimizationStrategy, TunableSettings) {
    let metrics = &analysis.metrics;
    let mut next = current.clone();
    let at_least = |kind, floor| {
        analysis
            .severity_of(kind)
            .map_or(false, |severity| severity >= floor)
    };

    if at_least(BottleneckKind::QueueCapacity, BottleneckSeverity::High) {
        next.queue_capacity = scale(next.queue_capacity, 1.5);
    }
    if at_least(BottleneckKind::ProcessingSpeed, BottleneckSeverity::High) {
        next.processing_timeout = grow(next.processing_timeout, 1.2, settings.max_processing_timeout);
    }
    if at_least(BottleneckKind::BatchTimeout, BottleneckSeverity::Medium) {
        next.batch_completion_timeout = grow(next.batch_completion_timeout, 1.3, settings.max_batch_timeout);
    }
    if at_least(BottleneckKind::ErrorRate, BottleneckSeverity::Medium)
        && next.max_retry_attempts < MAX_RETRY_CEILING
    {
        next.max_retry_attempts += 1;
    }

    let effective = match strategy {
        OptimizationStrategy::Adaptive => resolve_adaptive(metrics, current.processing_timeout),
        other => other,
    };
    let depth_pct = average_depth_percent(metrics);
    let latency_pct = latency_percent(metrics, current.processing_timeout);

    match effective {
        OptimizationStrategy::Throughput => {
            if depth_pct > 60.0 {
                next.queue_capacity = scale(next.queue_capacity, 1.3);
            }
            next.batch_completion_timeout =
                grow(next.batch_completion_timeout, 1.25, settings.max_batch_timeout);
            next.max_batch_size += 20;
        }
        OptimizationStrategy::Latency => {
            let shortened = next.batch_completion_timeout.mul_f64(0.75);
            let floor = settings.min_batch_timeout.min(next.batch_completion_timeout);
            next.batch_completion_timeout = shortened.max(floor);
            next.max_batch_size = shrink(next.max_batch_size, 10, LATENCY_BATCH_SIZE_FLOOR);
        }
        OptimizationStrategy::Memory => {
            next.queue_capacity = shrink(next.queue_capacity, 200, MEMORY_CAPACITY_FLOOR);
            next.max_batch_size = shrink(next.max_batch_size, 15, MEMORY_BATCH_SIZE_FLOOR);
        }
        OptimizationStrategy::Balanced | OptimizationStrategy::Adaptive => {
            if metrics.messages_processed_per_second < 5.0 && depth_pct > 70.0 {
                next.queue_capacity = scale(next.queue_capacity, 1.2);
            }
            if latency_pct > 60.0 {
                next.processing_timeout =
                    grow(next.processing_timeout, 1.1, settings.max_processing_timeout);
            }
        }
    }

    next.queue_capacity = next.queue_capacity.clamp(1, settings.max_queue_capacity.max(1));
    next.max_batch_size = next.max_batch_size.clamp(1, next.queue_capacity);
    (effective, next)
}

/// Parameter-level difference between two settings.
pub fn diff_settings(previous: &TunableSettings, next: &TunableSettings) -> Vec<ConfigChange> {
    let mut changes = Vec::new();
    let mut push = |parameter: &str, before: String, after: String| {
        if before != after {
            changes.push(ConfigChange {
                parameter: parameter.to_string(),
                previous: before,
                new: after,
            });
        }
    };
    push(
        "queue_capacity",
        previous.queue_capacity.to_string(),
        next.queue_capacity.to_string(),
    );
    push(
        "batch_completion_timeout",
        format!("{:?}", previous.batch_completion_timeout),
        format!("{:?}", next.batch_completion_timeout),
    );
    push(
        "processing_timeout",
        format!("{:?}", previous.processing_timeout),
        format!("{:?}", next.processing_timeout),
    );
    push(
        "max_retry_attempts",
        previous.max_retry_attempts.to_string(),
        next.max_retry_attempts.to_string(),
    );
    push(
        "max_batch_size",
        previous.max_batch_size.to_string(),
        next.max_batch_size.to_string(),
    );
    changes
}

fn expected_impact(strategy: OptimizationStrategy, changes: &[ConfigChange]) -> String {
    if changes.is_empty() {
        return "No configuration change needed".to_string();
    }
    let goal = match strategy {
        OptimizationStrategy::Throughput => "higher sustained throughput with longer batch windows",
        OptimizationStrategy::Latency => "faster batch turnaround with smaller batches",
        OptimizationStrategy::Memory => "lower memory footprint from a smaller queue and batches",
        OptimizationStrategy::Balanced | OptimizationStrategy::Adaptive => {
            "relief where metrics show pressure"
        }
    };
    format!("{} parameter(s) adjusted for {}", changes.len(), goal)
}

#[derive(Default)]
struct OptimizerState {
    last_applied: Option<Instant>,
    last_outcome: Option<OptimizationOutcome>,
    active_bottlenecks: HashSet<(BottleneckKind, BottleneckSeverity)>,
}

pub struct PerformanceOptimizer {
    metrics: Arc<MetricsCollector>,
    tuning: SharedTuning,
    settings: OptimizerSettings,
    recent_window: Duration,
    queue: Option<Arc<CompletionQueue>>,
    strategy: RwLock<OptimizationStrategy>,
    state: Mutex<OptimizerState>,
    applied_tx: broadcast::Sender<OptimizationApplied>,
    bottleneck_tx: broadcast::Sender<BottleneckDetected>,
    task: Mutex<Option<BackgroundTask>>,
}

impl PerformanceOptimizer {
    pub fn new(
        metrics: Arc<MetricsCollector>,
        tuning: SharedTuning,
        settings: OptimizerSettings,
        recent_window: Duration,
    ) -> Self {
        let (applied_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (bottleneck_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            metrics,
            tuning,
            strategy: RwLock::new(settings.initial_strategy),
            settings,
            recent_window,
            queue: None,
            state: Mutex::new(OptimizerState::default()),
            applied_tx,
            bottleneck_tx,
            task: Mutex::new(None),
        }
    }

    /// Sample `queue` before every analysis.
    pub fn with_queue(mut self, queue: Arc<CompletionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn start(self: &Arc<Self>) -> PipelineResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(PipelineError::invalid_state("optimizer is already running"));
        }
        let optimizer = Arc::clone(self);
        *task = Some(BackgroundTask::spawn("optimizer", move |signal| async move {
            optimizer.run(signal).await
        }));
        info!(
            "Performance optimizer started (strategy {}, interval {:?}, auto-apply {})",
            self.current_strategy(),
            self.settings.interval,
            self.settings.auto_apply
        );
        Ok(())
    }

    async fn run(&self, signal: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; there is nothing to analyze yet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = ticker.tick() => self.cycle(),
            }
        }
        debug!("Optimizer loop exited");
    }

    fn cycle(&self) {
        let analysis = match self.analyze_performance() {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!("Performance analysis failed, skipping cycle: {}", e);
                return;
            }
        };
        if !self.settings.auto_apply || !analysis.should_optimize {
            debug!(
                "Optimizer cycle: score {:.0}, {} bottleneck(s), no change applied",
                analysis.score,
                analysis.bottlenecks.len()
            );
            return;
        }
        self.apply(analysis);
    }

    pub async fn stop(&self) {
        let running = self.task.lock().take();
        if let Some(task) = running {
            task.stop().await;
            info!("Performance optimizer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn current_strategy(&self) -> OptimizationStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: OptimizationStrategy) {
        let mut current = self.strategy.write();
        if *current != strategy {
            info!("Optimization strategy changed from {} to {}", *current, strategy);
            *current = strategy;
        }
    }

    pub fn subscribe_applied(&self) -> broadcast::Receiver<OptimizationApplied> {
        self.applied_tx.subscribe()
    }

    pub fn subscribe_bottlenecks(&self) -> broadcast::Receiver<BottleneckDetected> {
        self.bottleneck_tx.subscribe()
    }

    pub fn last_outcome(&self) -> Option<OptimizationOutcome> {
        self.state.lock().last_outcome.clone()
    }

    /// Score current performance and list bottlenecks.
    ///
    /// Raises [`BottleneckDetected`] for every (kind, severity) pair absent
    /// from the previous analysis.
    pub fn analyze_performance(&self) -> PipelineResult<PerformanceAnalysis> {
        let tunables = self.tuning.current();
        if let Some(queue) = &self.queue {
            self.metrics.record_queue_depth(queue.depth());
        }
        let metrics =
            collect_health_metrics(&self.metrics, tunables.queue_capacity, self.recent_window)?;
        let bottlenecks = detect_bottlenecks(&metrics, tunables.processing_timeout);
        let score = score(&metrics, &bottlenecks);
        let timestamp = Utc::now();

        let mut analysis = PerformanceAnalysis {
            timestamp,
            score,
            bottlenecks,
            metrics,
            strategy: self.current_strategy(),
            should_optimize: false,
        };

        let mut state = self.state.lock();
        let spacing_elapsed = state
            .last_applied
            .map_or(true, |at| at.elapsed() >= self.settings.min_optimization_interval);
        analysis.should_optimize = spacing_elapsed && analysis.needs_attention();

        let observed: HashSet<_> = analysis
            .bottlenecks
            .iter()
            .map(|b| (b.kind, b.severity))
            .collect();
        for bottleneck in &analysis.bottlenecks {
            if !state.active_bottlenecks.contains(&(bottleneck.kind, bottleneck.severity)) {
                warn!(
                    "Bottleneck detected: {} ({:?}) - {}",
                    bottleneck.kind, bottleneck.severity, bottleneck.description
                );
                let _ = self.bottleneck_tx.send(BottleneckDetected {
                    bottleneck: bottleneck.clone(),
                    timestamp,
                });
            }
        }
        state.active_bottlenecks = observed;
        drop(state);

        debug!(
            "Performance score {:.1} with {} bottleneck(s)",
            analysis.score,
            analysis.bottlenecks.len()
        );
        Ok(analysis)
    }

    /// Analyze and apply the active strategy now, regardless of spacing.
    pub fn optimize_configuration(&self) -> PipelineResult<OptimizationOutcome> {
        let analysis = self.analyze_performance()?;
        Ok(self.apply(analysis))
    }

    fn apply(&self, analysis: PerformanceAnalysis) -> OptimizationOutcome {
        let current = self.tuning.current();
        let (effective, planned) =
            plan_settings(analysis.strategy, &analysis, &current, &self.settings);
        let changes = diff_settings(&current, &planned);
        let applied = !changes.is_empty();

        let outcome = OptimizationOutcome {
            timestamp: Utc::now(),
            strategy: effective,
            score: analysis.score,
            expected_impact: expected_impact(effective, &changes),
            changes,
            applied,
        };

        if applied {
            let (previous, current) = self.tuning.update(|settings| *settings = planned);
            for change in &outcome.changes {
                info!(
                    "Optimizer ({}) set {}: {} -> {}",
                    effective, change.parameter, change.previous, change.new
                );
            }
            let _ = self.applied_tx.send(OptimizationApplied {
                previous,
                current,
                outcome: outcome.clone(),
            });
        } else {
            debug!("Optimizer ({}) found nothing to change", effective);
        }

        let mut state = self.state.lock();
        if applied {
            state.last_applied = Some(Instant::now());
        }
        state.last_outcome = Some(outcome.clone());
        outcome
    }

    /// Suggestions derived from the current analysis. Nothing is applied.
    pub fn get_optimization_recommendations(&self) -> PipelineResult<Vec<Recommendation>> {
        let analysis = self.analyze_performance()?;
        Ok(recommendations_for(&analysis, &self.tuning.current(), &self.settings))
    }
}

/// Map an analysis to prioritized recommendations, most urgent first.
pub fn recommendations_for(
    analysis: &PerformanceAnalysis,
    current: &TunableSettings,
    settings: &OptimizerSettings,
) -> Vec<Recommendation> {
    let mut recommendations: Vec<Recommendation> = analysis
        .bottlenecks
        .iter()
        .map(|bottleneck| {
            let mut changes = BTreeMap::new();
            let (effort, impact) = match bottleneck.kind {
                BottleneckKind::QueueCapacity => {
                    let target = scale(current.queue_capacity, 1.5).min(settings.max_queue_capacity);
                    changes.insert("queue_capacity".to_string(), target.to_string());
                    (ImplementationEffort::Low, "Fewer producers blocked on a full queue")
                }
                BottleneckKind::ProcessingSpeed => {
                    changes.insert(
                        "processing_timeout".to_string(),
                        format!(
                            "{:?}",
                            grow(current.processing_timeout, 1.2, settings.max_processing_timeout)
                        ),
                    );
                    (ImplementationEffort::Medium, "Fewer batches exceeding the latency budget")
                }
                BottleneckKind::LowThroughput => {
                    changes.insert(
                        "consumer_workers".to_string(),
                        crate::utils::get_recommended_workers().max(2).to_string(),
                    );
                    (ImplementationEffort::Medium, "Backlog drained faster")
                }
                BottleneckKind::BatchTimeout => {
                    changes.insert(
                        "batch_completion_timeout".to_string(),
                        format!(
                            "{:?}",
                            grow(current.batch_completion_timeout, 1.3, settings.max_batch_timeout)
                        ),
                    );
                    (ImplementationEffort::Low, "More batches complete naturally")
                }
                BottleneckKind::ErrorRate => {
                    changes.insert(
                        "max_retry_attempts".to_string(),
                        (current.max_retry_attempts + 1).min(MAX_RETRY_CEILING).to_string(),
                    );
                    (ImplementationEffort::High, "Transient reporter failures absorbed by retries")
                }
            };
            Recommendation {
                priority: bottleneck.severity.into(),
                category: bottleneck.kind.to_string(),
                description: bottleneck.suggested_resolution.clone(),
                expected_impact: impact.to_string(),
                configuration_changes: changes,
                effort,
            }
        })
        .collect();

    if analysis.score < 80.0 {
        let mut changes = BTreeMap::new();
        if analysis.strategy != OptimizationStrategy::Adaptive {
            changes.insert(
                "optimization_strategy".to_string(),
                OptimizationStrategy::Adaptive.to_string(),
            );
        }
        recommendations.push(Recommendation {
            priority: RecommendationPriority::Medium,
            category: "General".to_string(),
            description: format!(
                "Performance score is {:.0}; review pipeline configuration",
                analysis.score
            ),
            expected_impact: "Configuration follows observed load".to_string(),
            configuration_changes: changes,
            effort: ImplementationEffort::Low,
        });
    }

    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
    recommendations
}
