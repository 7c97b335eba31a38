//! # Pipeline Configuration
//!
//! Everything the pipeline needs is supplied at construction through
//! [`PipelineConfig`]. A subset of it, [`TunableSettings`], may be adjusted
//! while the pipeline runs; those values live in a [`SharedTuning`] handle
//! backed by a `tokio::sync::watch` channel so that readers always see a
//! consistent snapshot and waiters can be woken when a value changes.
//!
//! ## Key Components
//!
//! - **PipelineConfig**: construction-time surface with defaults and validation
//! - **HealthThresholds / LevelThresholds**: warning/unhealthy/critical cut-offs
//! - **OptimizerSettings**: optimizer cadence, strategy and bounds
//! - **TunableSettings / SharedTuning**: runtime-adjustable parameters

use crate::cli::Args;
use crate::error::{PipelineError, PipelineResult};
use crate::health::HealthLevel;
use crate::message::GroupingStrategy;
use crate::optimizer::OptimizationStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Warning / unhealthy / critical cut-offs for one health metric.
///
/// A value strictly above a cut-off is classified at that level, so with
/// non-decreasing cut-offs a worse value never yields a better level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    pub warning: f64,
    pub unhealthy: f64,
    pub critical: f64,
}

impl LevelThresholds {
    pub const fn new(warning: f64, unhealthy: f64, critical: f64) -> Self {
        Self {
            warning,
            unhealthy,
            critical,
        }
    }

    pub fn classify(&self, value: f64) -> HealthLevel {
        if value > self.critical {
            HealthLevel::Critical
        } else if value > self.unhealthy {
            HealthLevel::Unhealthy
        } else if value > self.warning {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn is_ordered(&self) -> bool {
        self.warning >= 0.0 && self.warning <= self.unhealthy && self.unhealthy <= self.critical
    }
}

/// Health classification rules. All values are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Current queue depth as a percentage of capacity.
    pub queue_utilization: LevelThresholds,
    pub error_rate: LevelThresholds,
    pub batch_timeout_rate: LevelThresholds,
    /// Average processing time as a percentage of the processing timeout.
    pub processing_latency: LevelThresholds,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_utilization: LevelThresholds::new(60.0, 80.0, 95.0),
            error_rate: LevelThresholds::new(5.0, 10.0, 25.0),
            batch_timeout_rate: LevelThresholds::new(10.0, 20.0, 50.0),
            processing_latency: LevelThresholds::new(60.0, 80.0, 100.0),
        }
    }
}

/// Performance optimizer cadence and bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub enabled: bool,
    /// Period of the analysis task.
    pub interval: Duration,
    /// Minimum spacing between two applied optimizations.
    pub min_optimization_interval: Duration,
    pub initial_strategy: OptimizationStrategy,
    /// When false the periodic task only analyzes and raises events.
    pub auto_apply: bool,
    /// Upper bound for queue capacity growth.
    pub max_queue_capacity: usize,
    /// Lower bound the Latency strategy will not shrink the batch timeout below.
    pub min_batch_timeout: Duration,
    /// Upper bound for batch completion timeout growth.
    pub max_batch_timeout: Duration,
    /// Upper bound for processing timeout growth.
    pub max_processing_timeout: Duration,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: crate::defaults::OPTIMIZER_INTERVAL,
            min_optimization_interval: crate::defaults::MIN_OPTIMIZATION_INTERVAL,
            initial_strategy: OptimizationStrategy::Balanced,
            auto_apply: true,
            max_queue_capacity: crate::defaults::MAX_QUEUE_CAPACITY,
            min_batch_timeout: Duration::from_secs(30),
            max_batch_timeout: crate::defaults::MAX_BATCH_TIMEOUT,
            max_processing_timeout: crate::defaults::MAX_PROCESSING_TIMEOUT,
        }
    }
}

/// Construction-time configuration for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub publish_timeout: Duration,
    pub processing_timeout: Duration,
    pub batch_completion_timeout: Duration,
    /// Per-strategy overrides of `batch_completion_timeout`.
    pub strategy_timeouts: BTreeMap<GroupingStrategy, Duration>,
    pub grouping_strategy: GroupingStrategy,
    pub max_batch_size: usize,
    pub max_retry_attempts: u32,
    pub base_retry_delay: Duration,
    pub consumer_workers: usize,
    pub timeout_check_interval: Duration,
    pub metrics_retention: Duration,
    /// Window used for "current" rates, health averages and trends.
    pub recent_window: Duration,
    pub health_check_interval: Duration,
    pub health_thresholds: HealthThresholds,
    pub optimizer: OptimizerSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: crate::defaults::QUEUE_CAPACITY,
            publish_timeout: crate::defaults::PUBLISH_TIMEOUT,
            processing_timeout: crate::defaults::PROCESSING_TIMEOUT,
            batch_completion_timeout: crate::defaults::BATCH_COMPLETION_TIMEOUT,
            strategy_timeouts: BTreeMap::new(),
            grouping_strategy: GroupingStrategy::ByTestClass,
            max_batch_size: crate::defaults::MAX_BATCH_SIZE,
            max_retry_attempts: crate::defaults::MAX_RETRY_ATTEMPTS,
            base_retry_delay: crate::defaults::BASE_RETRY_DELAY,
            consumer_workers: crate::defaults::CONSUMER_WORKERS,
            timeout_check_interval: crate::defaults::TIMEOUT_CHECK_INTERVAL,
            metrics_retention: crate::defaults::METRICS_RETENTION,
            recent_window: crate::defaults::RECENT_WINDOW,
            health_check_interval: crate::defaults::HEALTH_CHECK_INTERVAL,
            health_thresholds: HealthThresholds::default(),
            optimizer: OptimizerSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Build a configuration from parsed command-line arguments.
    pub fn from_args(args: &Args) -> PipelineResult<Self> {
        let mut config = Self {
            queue_capacity: args.queue_capacity,
            publish_timeout: args.publish_timeout,
            processing_timeout: args.processing_timeout,
            batch_completion_timeout: args.batch_timeout,
            grouping_strategy: args.strategy,
            max_batch_size: args.max_batch_size,
            max_retry_attempts: args.max_retries,
            consumer_workers: args.workers,
            timeout_check_interval: args.timeout_check_interval,
            health_check_interval: args.health_interval,
            base_retry_delay: args.retry_delay,
            metrics_retention: args.metrics_retention,
            recent_window: args.recent_window,
            ..Self::default()
        };
        config.optimizer.enabled = !args.no_optimizer;
        config.optimizer.interval = args.optimizer_interval;
        config.optimizer.initial_strategy = args.optimization_strategy;
        config.optimizer.auto_apply = !args.advisory_only;
        config.optimizer.max_batch_timeout = args.max_batch_timeout;
        config.optimizer.max_processing_timeout = args.max_processing_timeout;

        let errors = config.validate();
        if !errors.is_empty() {
            return Err(PipelineError::Configuration(errors));
        }
        Ok(config)
    }

    /// Check every field and return all problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let positive_durations = [
            ("publish_timeout", self.publish_timeout),
            ("processing_timeout", self.processing_timeout),
            ("batch_completion_timeout", self.batch_completion_timeout),
            ("base_retry_delay", self.base_retry_delay),
            ("timeout_check_interval", self.timeout_check_interval),
            ("metrics_retention", self.metrics_retention),
            ("recent_window", self.recent_window),
            ("health_check_interval", self.health_check_interval),
            ("optimizer.interval", self.optimizer.interval),
        ];
        for (name, value) in positive_durations {
            if value.is_zero() {
                errors.push(format!("{} must be greater than zero", name));
            }
        }

        for (strategy, timeout) in &self.strategy_timeouts {
            if timeout.is_zero() {
                errors.push(format!("completion timeout for {} must be greater than zero", strategy));
            }
        }

        if self.queue_capacity == 0 {
            errors.push("queue_capacity must be greater than zero".to_string());
        }
        if self.max_batch_size == 0 {
            errors.push("max_batch_size must be greater than zero".to_string());
        } else if self.max_batch_size > self.queue_capacity {
            errors.push(format!(
                "max_batch_size ({}) must not exceed queue_capacity ({})",
                self.max_batch_size, self.queue_capacity
            ));
        }
        if self.consumer_workers == 0 {
            errors.push("consumer_workers must be greater than zero".to_string());
        }
        if self.max_retry_attempts > 10 {
            errors.push(format!(
                "max_retry_attempts ({}) must not exceed 10",
                self.max_retry_attempts
            ));
        }
        if self.optimizer.max_batch_timeout < self.batch_completion_timeout {
            errors.push(format!(
                "optimizer.max_batch_timeout ({:?}) must be at least batch_completion_timeout ({:?})",
                self.optimizer.max_batch_timeout, self.batch_completion_timeout
            ));
        }
        if self.optimizer.max_processing_timeout < self.processing_timeout {
            errors.push(format!(
                "optimizer.max_processing_timeout ({:?}) must be at least processing_timeout ({:?})",
                self.optimizer.max_processing_timeout, self.processing_timeout
            ));
        }
        if self.optimizer.max_queue_capacity < self.queue_capacity {
            errors.push(format!(
                "optimizer.max_queue_capacity ({}) must be at least queue_capacity ({})",
                self.optimizer.max_queue_capacity, self.queue_capacity
            ));
        }

        let thresholds = [
            ("queue_utilization", &self.health_thresholds.queue_utilization),
            ("error_rate", &self.health_thresholds.error_rate),
            ("batch_timeout_rate", &self.health_thresholds.batch_timeout_rate),
            ("processing_latency", &self.health_thresholds.processing_latency),
        ];
        for (name, t) in thresholds {
            if !t.is_ordered() {
                errors.push(format!(
                    "health threshold {} must satisfy 0 <= warning <= unhealthy <= critical",
                    name
                ));
            }
        }

        errors
    }

    pub fn tunables(&self) -> TunableSettings {
        TunableSettings {
            queue_capacity: self.queue_capacity,
            batch_completion_timeout: self.batch_completion_timeout,
            strategy_timeouts: self.strategy_timeouts.clone(),
            processing_timeout: self.processing_timeout,
            max_retry_attempts: self.max_retry_attempts,
            max_batch_size: self.max_batch_size,
        }
    }
}

/// Parameters the optimizer may change while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunableSettings {
    pub queue_capacity: usize,
    pub batch_completion_timeout: Duration,
    pub strategy_timeouts: BTreeMap<GroupingStrategy, Duration>,
    pub processing_timeout: Duration,
    pub max_retry_attempts: u32,
    pub max_batch_size: usize,
}

impl TunableSettings {
    pub fn completion_timeout_for(&self, strategy: GroupingStrategy) -> Duration {
        self.strategy_timeouts
            .get(&strategy)
            .copied()
            .unwrap_or(self.batch_completion_timeout)
    }
}

impl Default for TunableSettings {
    fn default() -> Self {
        PipelineConfig::default().tunables()
    }
}

/// Shared handle to the current [`TunableSettings`].
#[derive(Debug, Clone)]
pub struct SharedTuning {
    tx: Arc<watch::Sender<TunableSettings>>,
}

impl SharedTuning {
    pub fn new(settings: TunableSettings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current settings.
    pub fn current(&self) -> TunableSettings {
        self.tx.borrow().clone()
    }

    pub fn queue_capacity(&self) -> usize {
        self.tx.borrow().queue_capacity
    }

    pub fn subscribe(&self) -> watch::Receiver<TunableSettings> {
        self.tx.subscribe()
    }

    /// Apply `change` and return the (previous, new) settings.
    pub fn update<F>(&self, change: F) -> (TunableSettings, TunableSettings)
    where
        F: FnOnce(&mut TunableSettings),
    {
        let mut previous = None;
        self.tx.send_modify(|settings| {
            previous = Some(settings.clone());
            change(settings);
        });
        let current = self.current();
        (previous.unwrap_or_else(|| current.clone()), current)
    }
}

impl Default for SharedTuning {
    fn default() -> Self {
        Self::new(TunableSettings::default())
    }
}
