//! # Health Monitor
//!
//! Periodically derives a coarse [`HealthLevel`] from the metrics collector
//! and publishes a [`HealthStatusChanged`] event whenever the level moves.
//!
//! ## Classification
//!
//! Four metrics are classified independently against their own
//! [`LevelThresholds`](crate::config::LevelThresholds) triple and the overall
//! level is the worst of them:
//!
//! - queue utilisation (current depth as a percentage of capacity)
//! - error rate over the recent window
//! - batch timeout rate over the run
//! - average processing time as a percentage of the processing timeout
//!
//! Every tick produces a fresh status even when the level is unchanged. A
//! failure while evaluating is logged and the previous status is kept.

use crate::config::{HealthThresholds, SharedTuning};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::MetricsCollector;
use crate::queue::CompletionQueue;
use crate::shutdown::{BackgroundTask, ShutdownSignal};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Ordered health classification, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Unhealthy,
    Critical,
}

impl HealthLevel {
    fn label(self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Warning => "warning",
            HealthLevel::Unhealthy => "unhealthy",
            HealthLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthLevel::Healthy => write!(f, "Healthy"),
            HealthLevel::Warning => write!(f, "Warning"),
            HealthLevel::Unhealthy => write!(f, "Unhealthy"),
            HealthLevel::Critical => write!(f, "Critical"),
        }
    }
}

/// Level plus a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub details: BTreeMap<String, String>,
}

impl HealthStatus {
    fn not_started() -> Self {
        Self {
            level: HealthLevel::Healthy,
            status: "Not started".to_string(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.level == HealthLevel::Healthy
    }
}

/// Inputs to one health evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    /// Live depth when the monitor has a queue attached, else the latest recorded sample.
    pub queue_depth: usize,
    pub average_queue_depth: f64,
    pub peak_queue_depth: usize,
    pub queue_capacity: usize,
    pub messages_processed_per_second: f64,
    pub average_processing_time_ms: f64,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub batch_completion_rate: f64,
    pub batch_timeout_rate: f64,
    pub uptime: Duration,
    pub last_check: DateTime<Utc>,
}

impl HealthMetrics {
    pub fn queue_utilization(&self) -> f64 {
        if self.queue_capacity == 0 {
            return 0.0;
        }
        self.queue_depth as f64 / self.queue_capacity as f64 * 100.0
    }
}

/// Raised when a check yields a level different from the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatusChanged {
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// Health inputs drawn from `metrics`: recent-window rates and depth, run-wide batch rates.
pub fn collect_health_metrics(
    metrics: &MetricsCollector,
    queue_capacity: usize,
    recent_window: Duration,
) -> PipelineResult<HealthMetrics> {
    let now = Utc::now();
    let recent = chrono::Duration::from_std(recent_window)
        .map_err(|e| PipelineError::validation(format!("recent window out of range: {}", e)))?;
    let from = (now - recent).max(metrics.started_at());

    let snapshot = metrics.get_metrics(Some(from), None)?;
    let depth = metrics.get_queue_depth_metrics(Some(from), None)?;
    let batches = metrics.get_batch_metrics(None, None)?;
    let rates = metrics.get_processing_rates();

    Ok(HealthMetrics {
        queue_depth: depth.current_depth,
        average_queue_depth: depth.average_depth,
        peak_queue_depth: depth.peak_depth,
        queue_capacity,
        messages_processed_per_second: rates.current_rate_per_second,
        average_processing_time_ms: snapshot.average_processing_time_ms,
        error_rate: snapshot.error_rate,
        retry_rate: snapshot.retry_rate,
        batch_completion_rate: if batches.total_batches == 0 {
            100.0
        } else {
            batches.completion_rate
        },
        batch_timeout_rate: batches.timeout_rate,
        uptime: metrics.uptime(),
        last_check: now,
    })
}

pub struct HealthMonitor {
    metrics: Arc<MetricsCollector>,
    tuning: SharedTuning,
    thresholds: HealthThresholds,
    interval: Duration,
    recent_window: Duration,
    queue: Option<Arc<CompletionQueue>>,
    status: RwLock<HealthStatus>,
    events: broadcast::Sender<HealthStatusChanged>,
    task: Mutex<Option<BackgroundTask>>,
}

impl HealthMonitor {
    pub fn new(
        metrics: Arc<MetricsCollector>,
        tuning: SharedTuning,
        thresholds: HealthThresholds,
        interval: Duration,
        recent_window: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            metrics,
            tuning,
            thresholds,
            interval,
            recent_window,
            queue: None,
            status: RwLock::new(HealthStatus::not_started()),
            events,
            task: Mutex::new(None),
        }
    }

    /// Sample `queue` at every check so depth readings never go stale.
    pub fn with_queue(mut self, queue: Arc<CompletionQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Spawn the periodic check. The first check runs immediately.
    pub fn start(self: &Arc<Self>) -> PipelineResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(PipelineError::invalid_state("health monitor is already running"));
        }
        let monitor = Arc::clone(self);
        *task = Some(BackgroundTask::spawn("health-monitor", move |signal| async move {
            monitor.run(signal).await
        }));
        info!("Health monitor started (interval {:?})", self.interval);
        Ok(())
    }

    async fn run(&self, signal: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = signal.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_now();
                }
            }
        }
        debug!("Health monitor loop exited");
    }

    /// Cancel the periodic check and wait for it to finish. No-op when not running.
    pub async fn stop(&self) {
        let running = self.task.lock().take();
        if let Some(task) = running {
            task.stop().await;
            info!("Health monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthStatusChanged> {
        self.events.subscribe()
    }

    pub fn get_health_status(&self) -> HealthStatus {
        self.status.read().clone()
    }

    /// Evaluate immediately and publish the result.
    pub fn check_now(&self) -> HealthStatus {
        let metrics = match self.get_health_metrics() {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Health check failed, keeping previous status: {}", e);
                return self.get_health_status();
            }
        };
        let current = self.evaluate(&metrics);

        let previous = {
            let mut status = self.status.write();
            std::mem::replace(&mut *status, current.clone())
        };

        if previous.level != current.level {
            if current.level > previous.level {
                warn!("Health degraded {} -> {}: {}", previous.level, current.level, current.status);
            } else {
                info!("Health improved {} -> {}: {}", previous.level, current.level, current.status);
            }
            // No subscribers is fine.
            let _ = self.events.send(HealthStatusChanged {
                previous,
                current: current.clone(),
                timestamp: current.timestamp,
            });
        } else {
            debug!("Health check: {}", current.status);
        }
        current
    }

    /// Fresh health inputs from the metrics collector.
    pub fn get_health_metrics(&self) -> PipelineResult<HealthMetrics> {
        if let Some(queue) = &self.queue {
            self.metrics.record_queue_depth(queue.depth());
        }
        collect_health_metrics(&self.metrics, self.tuning.queue_capacity(), self.recent_window)
    }

    /// Classify `metrics` against the configured thresholds.
    pub fn evaluate(&self, metrics: &HealthMetrics) -> HealthStatus {
        let budget_ms = self.tuning.current().processing_timeout.as_secs_f64() * 1000.0;
        let latency_pct = if budget_ms > 0.0 {
            metrics.average_processing_time_ms / budget_ms * 100.0
        } else {
            0.0
        };
        let utilization = metrics.queue_utilization();

        let checks = [
            (
                self.thresholds.queue_utilization.classify(utilization),
                format!(
                    "queue at {:.1}% of capacity ({}/{})",
                    utilization, metrics.queue_depth, metrics.queue_capacity
                ),
            ),
            (
                self.thresholds.error_rate.classify(metrics.error_rate),
                format!("error rate {:.1}%", metrics.error_rate),
            ),
            (
                self.thresholds.batch_timeout_rate.classify(metrics.batch_timeout_rate),
                format!("batch timeout rate {:.1}%", metrics.batch_timeout_rate),
            ),
            (
                self.thresholds.processing_latency.classify(latency_pct),
                format!(
                    "average processing time {:.1}ms is {:.1}% of the budget",
                    metrics.average_processing_time_ms, latency_pct
                ),
            ),
        ];

        let level = checks
            .iter()
            .map(|(level, _)| *level)
            .max()
            .unwrap_or(HealthLevel::Healthy);

        let status = if level == HealthLevel::Healthy {
            format!(
                "Queue system is healthy - depth: {}, error rate: {:.1}%",
                metrics.queue_depth, metrics.error_rate
            )
        } else {
            let issues: Vec<&str> = checks
                .iter()
                .filter(|(l, _)| *l > HealthLevel::Healthy)
                .map(|(_, issue)| issue.as_str())
                .collect();
            format!("Queue system {}: {}", level.label(), issues.join("; "))
        };

        let mut details = BTreeMap::new();
        details.insert("queue_depth".to_string(), metrics.queue_depth.to_string());
        details.insert("queue_capacity".to_string(), metrics.queue_capacity.to_string());
        details.insert("queue_utilization".to_string(), format!("{:.1}", utilization));
        details.insert("error_rate".to_string(), format!("{:.2}", metrics.error_rate));
        details.insert(
            "batch_timeout_rate".to_string(),
            format!("{:.2}", metrics.batch_timeout_rate),
        );
        details.insert(
            "average_processing_time_ms".to_string(),
            format!("{:.2}", metrics.average_processing_time_ms),
        );
        details.insert(
            "messages_per_second".to_string(),
            format!("{:.2}", metrics.messages_processed_per_second),
        );
        details.insert(
            "uptime".to_string(),
            crate::utils::format_duration(metrics.uptime),
        );

        HealthStatus {
            level,
            status,
            timestamp: metrics.last_check,
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(metrics: Arc<MetricsCollector>) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            metrics,
            SharedTuning::default(),
            HealthThresholds::default(),
            Duration::from_millis(20),
            Duration::from_secs(300),
        ))
    }

    fn record_outcomes(metrics: &MetricsCollector, processed: usize, failed: usize) {
        for i in 0..processed {
            metrics
                .record_message_processed(&format!("ok{}", i), "batching", Duration::from_millis(2))
                .unwrap();
        }
        for i in 0..failed {
            metrics
                .record_message_failed(&format!("bad{}", i), "batching", "boom")
                .unwrap();
        }
    }

    #[test]
    fn test_initial_status_is_not_started() {
        let monitor = monitor(Arc::new(MetricsCollector::default()));
        let status = monitor.get_health_status();
        assert_eq!(status.level, HealthLevel::Healthy);
        assert_eq!(status.status, "Not started");
    }

    #[test]
    fn test_quiet_pipeline_is_healthy() {
        let metrics = Arc::new(MetricsCollector::default());
        let monitor = monitor(metrics.clone());
        let status = monitor.check_now();
        assert_eq!(status.level, HealthLevel::Healthy);
        assert_eq!(status.status, "Queue system is healthy - depth: 0, error rate: 0.0%");

        let health = monitor.get_health_metrics().unwrap();
        assert_eq!(health.batch_completion_rate, 100.0);
        assert_eq!(health.error_rate, 0.0);
    }

    #[test]
    fn test_error_rate_drives_level() {
        let metrics = Arc::new(MetricsCollector::default());
        record_outcomes(&metrics, 88, 12);
        let status = monitor(metrics).check_now();
        assert_eq!(status.level, HealthLevel::Unhealthy);
        assert!(status.status.starts_with("Queue system unhealthy: "));
        assert!(status.status.contains("error rate 12.0%"));
        assert_eq!(status.details["error_rate"], "12.00");
    }

    #[test]
    fn test_worst_metric_wins() {
        let metrics = Arc::new(MetricsCollector::default());
        record_outcomes(&metrics, 94, 6);
        metrics.record_queue_depth(990);
        let status = monitor(metrics).check_now();
        assert_eq!(status.level, HealthLevel::Critical);
        assert!(status.status.contains("queue at 99.0% of capacity"));
        assert!(status.status.contains("error rate 6.0%"));
    }

    #[test]
    fn test_level_is_monotonic_in_error_rate() {
        let monitor = monitor(Arc::new(MetricsCollector::default()));
        let base = monitor.get_health_metrics().unwrap();
        let mut last = HealthLevel::Healthy;
        for rate in 0..=100 {
            let level = monitor
                .evaluate(&HealthMetrics {
                    error_rate: rate as f64,
                    ..base.clone()
                })
                .level;
            assert!(level >= last, "level dropped at {}%", rate);
            last = level;
        }
        assert_eq!(last, HealthLevel::Critical);
    }

    #[test]
    fn test_level_change_is_broadcast() {
        let metrics = Arc::new(MetricsCollector::default());
        let monitor = monitor(metrics.clone());
        let mut events = monitor.subscribe();

        monitor.check_now();
        // Healthy -> Healthy publishes nothing.
        assert!(events.try_recv().is_err());

        metrics.record_queue_depth(850);
        monitor.check_now();
        let change = events.try_recv().unwrap();
        assert_eq!(change.previous.level, HealthLevel::Healthy);
        assert_eq!(change.current.level, HealthLevel::Unhealthy);
    }

    #[tokio::test]
    async fn test_periodic_checks_run_until_stopped() {
        let metrics = Arc::new(MetricsCollector::default());
        let monitor = monitor(metrics.clone());
        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(PipelineError::InvalidState(_))));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_ne!(monitor.get_health_status().status, "Not started");

        monitor.stop().await;
        assert!(!monitor.is_running());
        monitor.stop().await;
    }
}
