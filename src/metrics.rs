//! # Pipeline Metrics Collection
//!
//! The [`MetricsCollector`] observes every stage of the pipeline without
//! being on its critical path. Writers append time-stamped events; readers
//! ask for point-in-time or time-ranged summaries.
//!
//! ## Key Components
//!
//! - **Counters**: monotonically increasing published/processed/failed/retried totals (atomics)
//! - **Event logs**: per test-case id, per processor name and per batch id
//! - **Depth history**: queue-depth samples pruned past the retention horizon
//! - **Read models**: [`MetricsSnapshot`], [`ProcessingRateMetrics`],
//!   [`QueueDepthMetrics`] and [`BatchMetrics`]
//!
//! ## Numeric Semantics
//!
//! Rates are event counts divided by the wall time of the requested window.
//! An empty window yields a rate of 0 and an `Unknown` trend; error rate is
//! `failed / (processed + failed) * 100`, or 0 when nothing has happened yet.
//! No read ever divides by zero.
//!
//! ## Latency Percentiles
//!
//! Processing-time percentiles are computed with an HDR histogram over
//! microsecond values, which keeps p95 accurate without sorting every sample.

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Relative band used when labelling trends.
const TREND_THRESHOLD: f64 = 0.10;

/// Direction of a metric over a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    Unknown,
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trend::Increasing => write!(f, "Increasing"),
            Trend::Decreasing => write!(f, "Decreasing"),
            Trend::Stable => write!(f, "Stable"),
            Trend::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Compare the first half of `values` against the second half.
///
/// `min_delta` keeps tiny absolute wobbles (one message of depth) from being
/// reported as a trend.
pub fn classify_trend(values: &[f64], min_delta: f64) -> Trend {
    match values.len() {
        0 => Trend::Unknown,
        1 => Trend::Stable,
        len => {
            let mid = len / 2;
            let first = mean(&values[..mid]);
            let second = mean(&values[mid..]);
            let threshold = (first.abs() * TREND_THRESHOLD).max(min_delta);
            if second - first > threshold {
                Trend::Increasing
            } else if first - second > threshold {
                Trend::Decreasing
            } else {
                Trend::Stable
            }
        }
    }
}

/// Compare a current figure against its long-run average.
pub fn compare_to_average(current: f64, average: f64) -> Trend {
    let threshold = average.abs() * TREND_THRESHOLD;
    if current - average > threshold {
        Trend::Increasing
    } else if average - current > threshold {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn rate(count: u64, span: chrono::Duration) -> f64 {
    let secs = span.num_milliseconds() as f64 / 1000.0;
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Kind of event recorded for a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseEventKind {
    Published,
    Processed,
    Failed,
}

/// One entry in a test case's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: CaseEventKind,
    pub processor: Option<String>,
    pub processing_time_ms: Option<f64>,
    pub error: Option<String>,
}

/// One queue-depth sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueDepthSample {
    pub timestamp: DateTime<Utc>,
    pub depth: usize,
}

#[derive(Debug, Clone)]
struct ProcessorEvent {
    timestamp: DateTime<Utc>,
    success: bool,
    processing_time_ms: f64,
}

#[derive(Debug, Clone)]
struct BatchCompletionRecord {
    timestamp: DateTime<Utc>,
    size: usize,
    success: bool,
    processing_time_ms: f64,
}

#[derive(Debug, Clone)]
struct BatchTimeoutRecord {
    timestamp: DateTime<Utc>,
    expected_size: Option<usize>,
    actual_size: usize,
    timeout: Duration,
}

#[derive(Debug, Clone, Default)]
struct BatchLog {
    completion: Option<BatchCompletionRecord>,
    timeout: Option<BatchTimeoutRecord>,
    retries: u32,
}

impl BatchLog {
    fn in_window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let inside = |t: DateTime<Utc>| t >= from && t <= to;
        self.completion.as_ref().map_or(false, |c| inside(c.timestamp))
            || self.timeout.as_ref().map_or(false, |t| inside(t.timestamp))
    }

    fn last_update(&self) -> Option<DateTime<Utc>> {
        let completion = self.completion.as_ref().map(|c| c.timestamp);
        let timeout = self.timeout.as_ref().map(|t| t.timestamp);
        completion.max(timeout)
    }

    fn size(&self) -> usize {
        self.completion
            .as_ref()
            .map(|c| c.size)
            .or_else(|| self.timeout.as_ref().map(|t| t.actual_size))
            .unwrap_or(0)
    }
}

struct MetricsState {
    started_at: DateTime<Utc>,
    cases: HashMap<String, Vec<CaseEvent>>,
    processors: HashMap<String, VecDeque<ProcessorEvent>>,
    batches: HashMap<String, BatchLog>,
    depth_history: VecDeque<QueueDepthSample>,
    retries: VecDeque<DateTime<Utc>>,
    last_pruned: DateTime<Utc>,
}

impl MetricsState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            cases: HashMap::new(),
            processors: HashMap::new(),
            batches: HashMap::new(),
            depth_history: VecDeque::new(),
            retries: VecDeque::new(),
            last_pruned: now,
        }
    }

    fn window(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> PipelineResult<(DateTime<Utc>, DateTime<Utc>)> {
        let from = from.unwrap_or(self.started_at);
        let to = to.unwrap_or(now);
        if from > to {
            return Err(PipelineError::validation(format!(
                "metrics window start {} is after its end {}",
                from, to
            )));
        }
        Ok((from, to))
    }

    fn processor_events_in(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = (&String, &ProcessorEvent)> + '_ {
        self.processors.iter().flat_map(move |(name, events)| {
            events
                .iter()
                .filter(move |e| e.timestamp >= from && e.timestamp <= to)
                .map(move |e| (name, e))
        })
    }

    fn depth_samples_in(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<QueueDepthSample> {
        self.depth_history
            .iter()
            .filter(|s| s.timestamp >= from && s.timestamp <= to)
            .copied()
            .collect()
    }
}

/// Counts for a window of processor events.
#[derive(Debug, Clone, Copy, Default)]
struct EventTally {
    processed: u64,
    failed: u64,
    processing_time_ms: f64,
}

impl EventTally {
    fn add(&mut self, event: &ProcessorEvent) {
        if event.success {
            self.processed += 1;
            self.processing_time_ms += event.processing_time_ms;
        } else {
            self.failed += 1;
        }
    }

    fn average_processing_time_ms(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.processing_time_ms / self.processed as f64
        }
    }

    fn error_rate(&self) -> f64 {
        percentage(self.failed, self.processed + self.failed)
    }
}

/// Queue depth summary inside a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDepthStats {
    pub average: f64,
    pub peak: usize,
    pub min: usize,
    pub trend: Trend,
}

/// Batch summary inside a metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: u64,
    /// Reported successfully without having timed out.
    pub completed: u64,
    pub timed_out: u64,
    /// Reporter gave up on them.
    pub failed: u64,
    pub completion_rate: f64,
    pub timeout_rate: f64,
}

/// Per-processor summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub failed: u64,
    pub average_processing_time_ms: f64,
    pub error_rate: f64,
}

/// Everything observed inside a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub messages_published: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub retries: u64,
    pub average_processing_time_ms: f64,
    pub processing_rate_per_second: f64,
    pub error_rate: f64,
    pub retry_rate: f64,
    pub queue_depth: QueueDepthStats,
    pub batches: BatchStats,
    pub processors: BTreeMap<String, ProcessorStats>,
}

/// Throughput and latency figures, current versus long-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRateMetrics {
    pub current_rate_per_second: f64,
    pub average_rate_per_second: f64,
    pub peak_rate_per_second: f64,
    pub current_latency_ms: f64,
    pub average_latency_ms: f64,
    pub peak_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub throughput_trend: Trend,
    pub latency_trend: Trend,
}

/// Queue depth figures with the raw history for the window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDepthMetrics {
    pub current_depth: usize,
    pub average_depth: f64,
    pub peak_depth: usize,
    pub min_depth: usize,
    pub trend: Trend,
    pub history: Vec<QueueDepthSample>,
}

/// Batch outcome figures for a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    pub total_batches: u64,
    pub completed_batches: u64,
    pub timed_out_batches: u64,
    pub failed_batches: u64,
    pub completion_rate: f64,
    pub timeout_rate: f64,
    pub average_batch_size: f64,
    pub average_processing_time_ms: f64,
    /// Batch size → number of batches of that size.
    pub size_distribution: BTreeMap<usize, u64>,
}

/// Lifetime counter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterTotals {
    pub published: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
}

/// Thread-safe collector shared by every pipeline component.
pub struct MetricsCollector {
    state: Mutex<MetricsState>,
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    retention: chrono::Duration,
    recent_window: chrono::Duration,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(
            crate::defaults::METRICS_RETENTION,
            crate::defaults::RECENT_WINDOW,
        )
    }
}

impl MetricsCollector {
    pub fn new(retention: Duration, recent_window: Duration) -> Self {
        Self {
            state: Mutex::new(MetricsState::new(Utc::now())),
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            retention: to_chrono(retention),
            recent_window: to_chrono(recent_window),
        }
    }

    pub fn record_message_published(&self, test_case_id: &str) -> PipelineResult<()> {
        require_id("test case id", test_case_id)?;
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state
                .cases
                .entry(test_case_id.to_string())
                .or_default()
                .push(CaseEvent {
                    timestamp: now,
                    kind: CaseEventKind::Published,
                    processor: None,
                    processing_time_ms: None,
                    error: None,
                });
            self.prune_if_due(&mut state, now);
        }
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_message_processed(
        &self,
        test_case_id: &str,
        processor: &str,
        processing_time: Duration,
    ) -> PipelineResult<()> {
        require_id("test case id", test_case_id)?;
        require_id("processor name", processor)?;
        let now = Utc::now();
        let processing_time_ms = processing_time.as_secs_f64() * 1000.0;
        {
            let mut state = self.state.lock();
            state
                .cases
                .entry(test_case_id.to_string())
                .or_default()
                .push(CaseEvent {
                    timestamp: now,
                    kind: CaseEventKind::Processed,
                    processor: Some(processor.to_string()),
                    processing_time_ms: Some(processing_time_ms),
                    error: None,
                });
            state
                .processors
                .entry(processor.to_string())
                .or_default()
                .push_back(ProcessorEvent {
                    timestamp: now,
                    success: true,
                    processing_time_ms,
                });
            self.prune_if_due(&mut state, now);
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_message_failed(
        &self,
        test_case_id: &str,
        processor: &str,
        error: &str,
    ) -> PipelineResult<()> {
        require_id("test case id", test_case_id)?;
        require_id("processor name", processor)?;
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state
                .cases
                .entry(test_case_id.to_string())
                .or_default()
                .push(CaseEvent {
                    timestamp: now,
                    kind: CaseEventKind::Failed,
                    processor: Some(processor.to_string()),
                    processing_time_ms: None,
                    error: Some(error.to_string()),
                });
            state
                .processors
                .entry(processor.to_string())
                .or_default()
                .push_back(ProcessorEvent {
                    timestamp: now,
                    success: false,
                    processing_time_ms: 0.0,
                });
            self.prune_if_due(&mut state, now);
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record one reporter retry for a batch.
    pub fn record_retry(&self, batch_id: &str) -> PipelineResult<()> {
        require_id("batch id", batch_id)?;
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state.batches.entry(batch_id.to_string()).or_default().retries += 1;
            state.retries.push_back(now);
        }
        self.retried.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_queue_depth(&self, depth: usize) {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.depth_history.push_back(QueueDepthSample {
            timestamp: now,
            depth,
        });
        let cutoff = now - self.retention;
        while state
            .depth_history
            .front()
            .map_or(false, |s| s.timestamp < cutoff)
        {
            state.depth_history.pop_front();
        }
    }

    pub fn record_batch_completion(
        &self,
        batch_id: &str,
        size: usize,
        success: bool,
        processing_time: Duration,
    ) -> PipelineResult<()> {
        require_id("batch id", batch_id)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        state.batches.entry(batch_id.to_string()).or_default().completion =
            Some(BatchCompletionRecord {
                timestamp: now,
                size,
                success,
                processing_time_ms: processing_time.as_secs_f64() * 1000.0,
            });
        self.prune_if_due(&mut state, now);
        Ok(())
    }

    pub fn record_batch_timeout(
        &self,
        batch_id: &str,
        expected_size: Option<usize>,
        actual_size: usize,
        timeout: Duration,
    ) -> PipelineResult<()> {
        require_id("batch id", batch_id)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        state.batches.entry(batch_id.to_string()).or_default().timeout = Some(BatchTimeoutRecord {
            timestamp: now,
            expected_size,
            actual_size,
            timeout,
        });
        self.prune_if_due(&mut state, now);
        Ok(())
    }

    /// Summary of everything observed between `from` and `to`.
    ///
    /// `from` defaults to the collector start (or last reset), `to` to now.
    pub fn get_metrics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> PipelineResult<MetricsSnapshot> {
        let now = Utc::now();
        let state = self.state.lock();
        let (from, to) = state.window(from, to, now)?;

        let published = state
            .cases
            .values()
            .flatten()
            .filter(|e| e.kind == CaseEventKind::Published && e.timestamp >= from && e.timestamp <= to)
            .count() as u64;

        let mut overall = EventTally::default();
        let mut per_processor: BTreeMap<String, EventTally> = BTreeMap::new();
        for (name, event) in state.processor_events_in(from, to) {
            overall.add(event);
            per_processor.entry(name.clone()).or_default().add(event);
        }

        let retries = state
            .retries
            .iter()
            .filter(|t| **t >= from && **t <= to)
            .count() as u64;

        let depths: Vec<f64> = state
            .depth_samples_in(from, to)
            .iter()
            .map(|s| s.depth as f64)
            .collect();
        let queue_depth = QueueDepthStats {
            average: mean(&depths),
            peak: depths.iter().cloned().fold(0.0, f64::max) as usize,
            min: if depths.is_empty() {
                0
            } else {
                depths.iter().cloned().fold(f64::INFINITY, f64::min) as usize
            },
            trend: classify_trend(&depths, 1.0),
        };

        let batch_metrics = Self::batch_metrics_locked(&state, from, to);

        Ok(MetricsSnapshot {
            window_start: from,
            window_end: to,
            messages_published: published,
            messages_processed: overall.processed,
            messages_failed: overall.failed,
            retries,
            average_processing_time_ms: overall.average_processing_time_ms(),
            processing_rate_per_second: rate(overall.processed, to - from),
            error_rate: overall.error_rate(),
            retry_rate: percentage(retries, overall.processed + overall.failed),
            queue_depth,
            batches: BatchStats {
                total: batch_metrics.total_batches,
                completed: batch_metrics.completed_batches,
                timed_out: batch_metrics.timed_out_batches,
                failed: batch_metrics.failed_batches,
                completion_rate: batch_metrics.completion_rate,
                timeout_rate: batch_metrics.timeout_rate,
            },
            processors: per_processor
                .into_iter()
                .map(|(name, tally)| {
                    (
                        name,
                        ProcessorStats {
                            processed: tally.processed,
                            failed: tally.failed,
                            average_processing_time_ms: tally.average_processing_time_ms(),
                            error_rate: tally.error_rate(),
                        },
                    )
                })
                .collect(),
        })
    }

    /// Current (recent window) versus average (since start) throughput and latency.
    pub fn get_processing_rates(&self) -> ProcessingRateMetrics {
        let now = Utc::now();
        let state = self.state.lock();
        let since_start = now - state.started_at;
        let recent_span = since_start.min(self.recent_window);
        let recent_start = now - recent_span;

        let mut histogram = Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3).ok();
        let mut total = 0u64;
        let mut total_latency = 0.0;
        let mut peak_latency: f64 = 0.0;
        let mut recent = 0u64;
        let mut recent_latency = 0.0;
        let mut per_minute: HashMap<i64, u64> = HashMap::new();

        for (_, event) in state.processor_events_in(state.started_at, now) {
            if !event.success {
                continue;
            }
            total += 1;
            total_latency += event.processing_time_ms;
            peak_latency = peak_latency.max(event.processing_time_ms);
            if let Some(h) = histogram.as_mut() {
                h.saturating_record((event.processing_time_ms * 1000.0).max(1.0) as u64);
            }
            *per_minute.entry(event.timestamp.timestamp() / 60).or_default() += 1;
            if event.timestamp >= recent_start {
                recent += 1;
                recent_latency += event.processing_time_ms;
            }
        }

        let current_rate = rate(recent, recent_span);
        let average_rate = rate(total, since_start);
        let busiest_minute = per_minute.values().copied().max().unwrap_or(0) as f64 / 60.0;
        let current_latency = if recent > 0 { recent_latency / recent as f64 } else { 0.0 };
        let average_latency = if total > 0 { total_latency / total as f64 } else { 0.0 };
        let p95 = histogram
            .filter(|h| !h.is_empty())
            .map(|h| h.value_at_percentile(95.0) as f64 / 1000.0)
            .unwrap_or(0.0);

        let (throughput_trend, latency_trend) = if total == 0 {
            (Trend::Unknown, Trend::Unknown)
        } else {
            (
                compare_to_average(current_rate, average_rate),
                compare_to_average(current_latency, average_latency),
            )
        };

        ProcessingRateMetrics {
            current_rate_per_second: current_rate,
            average_rate_per_second: average_rate,
            peak_rate_per_second: busiest_minute.max(current_rate).max(average_rate),
            current_latency_ms: current_latency,
            average_latency_ms: average_latency,
            peak_latency_ms: peak_latency,
            p95_latency_ms: p95,
            throughput_trend,
            latency_trend,
        }
    }

    pub fn get_queue_depth_metrics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> PipelineResult<QueueDepthMetrics> {
        let now = Utc::now();
        let state = self.state.lock();
        let (from, to) = state.window(from, to, now)?;
        let history = state.depth_samples_in(from, to);
        let depths: Vec<f64> = history.iter().map(|s| s.depth as f64).collect();

        Ok(QueueDepthMetrics {
            current_depth: state.depth_history.back().map_or(0, |s| s.depth),
            average_depth: mean(&depths),
            peak_depth: history.iter().map(|s| s.depth).max().unwrap_or(0),
            min_depth: history.iter().map(|s| s.depth).min().unwrap_or(0),
            trend: classify_trend(&depths, 1.0),
            history,
        })
    }

    pub fn get_batch_metrics(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> PipelineResult<BatchMetrics> {
        let now = Utc::now();
        let state = self.state.lock();
        let (from, to) = state.window(from, to, now)?;
        Ok(Self::batch_metrics_locked(&state, from, to))
    }

    fn batch_metrics_locked(
        state: &MetricsState,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BatchMetrics {
        let mut metrics = BatchMetrics {
            total_batches: 0,
            completed_batches: 0,
            timed_out_batches: 0,
            failed_batches: 0,
            completion_rate: 0.0,
            timeout_rate: 0.0,
            average_batch_size: 0.0,
            average_processing_time_ms: 0.0,
            size_distribution: BTreeMap::new(),
        };
        let mut total_size = 0usize;
        let mut processing_ms = Vec::new();

        for log in state.batches.values().filter(|log| log.in_window(from, to)) {
            metrics.total_batches += 1;
            let size = log.size();
            total_size += size;
            *metrics.size_distribution.entry(size).or_default() += 1;

            if log.timeout.is_some() {
                metrics.timed_out_batches += 1;
            }
            if let Some(completion) = &log.completion {
                processing_ms.push(completion.processing_time_ms);
                if !completion.success {
                    metrics.failed_batches += 1;
                } else if log.timeout.is_none() {
                    metrics.completed_batches += 1;
                }
            }
        }

        metrics.completion_rate = percentage(metrics.completed_batches, metrics.total_batches);
        metrics.timeout_rate = percentage(metrics.timed_out_batches, metrics.total_batches);
        if metrics.total_batches > 0 {
            metrics.average_batch_size = total_size as f64 / metrics.total_batches as f64;
        }
        metrics.average_processing_time_ms = mean(&processing_ms);
        metrics
    }

    /// Recorded history of a single test case, oldest first.
    pub fn get_message_history(&self, test_case_id: &str) -> Vec<CaseEvent> {
        self.state
            .lock()
            .cases
            .get(test_case_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Expected versus actual size recorded when a batch was forced to time out.
    pub fn get_batch_timeout(&self, batch_id: &str) -> Option<(Option<usize>, usize, Duration)> {
        self.state
            .lock()
            .batches
            .get(batch_id)
            .and_then(|log| log.timeout.as_ref())
            .map(|t| (t.expected_size, t.actual_size, t.timeout))
    }

    pub fn get_processor_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().processors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn totals(&self) -> CounterTotals {
        CounterTotals {
            published: self.published.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }

    /// Lifetime error rate in percent, 0 before any message was handled.
    pub fn error_rate(&self) -> f64 {
        let totals = self.totals();
        percentage(totals.failed, totals.processed + totals.failed)
    }

    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.state.lock().started_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.state.lock().started_at
    }

    pub fn reset_metrics(&self) {
        let now = Utc::now();
        *self.state.lock() = MetricsState::new(now);
        self.published.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.retried.store(0, Ordering::Relaxed);
        debug!("Metrics reset");
    }

    fn prune_if_due(&self, state: &mut MetricsState, now: DateTime<Utc>) {
        let interval = chrono::Duration::seconds(60).min(self.retention);
        if now - state.last_pruned < interval {
            return;
        }
        state.last_pruned = now;
        let cutoff = now - self.retention;

        for events in state.processors.values_mut() {
            while events.front().map_or(false, |e| e.timestamp < cutoff) {
                events.pop_front();
            }
        }
        state.processors.retain(|_, events| !events.is_empty());
        state.cases.retain(|_, events| {
            events.retain(|e| e.timestamp >= cutoff);
            !events.is_empty()
        });
        state
            .batches
            .retain(|_, log| log.last_update().map_or(true, |t| t >= cutoff));
        while state.retries.front().map_or(false, |t| *t < cutoff) {
            state.retries.pop_front();
        }
        while state
            .depth_history
            .front()
            .map_or(false, |s| s.timestamp < cutoff)
        {
            state.depth_history.pop_front();
        }
    }
}

fn require_id(what: &str, value: &str) -> PipelineResult<()> {
    if value.trim().is_empty() {
        Err(PipelineError::validation(format!("{} must not be empty", what)))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_collector_has_zero_rates() {
        let metrics = MetricsCollector::default();
        let snapshot = metrics.get_metrics(None, None).unwrap();

        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.processing_rate_per_second, 0.0);
        assert_eq!(snapshot.retry_rate, 0.0);
        assert_eq!(snapshot.queue_depth.trend, Trend::Unknown);
        assert_eq!(snapshot.batches.completion_rate, 0.0);
        assert!(!snapshot.error_rate.is_nan());

        let rates = metrics.get_processing_rates();
        assert_eq!(rates.current_rate_per_second, 0.0);
        assert_eq!(rates.throughput_trend, Trend::Unknown);
        assert_eq!(metrics.error_rate(), 0.0);
    }

    #[test]
    fn test_error_rate_and_processor_breakdown() {
        let metrics = MetricsCollector::default();
        for i in 0..3 {
            let id = format!("case-{}", i);
            metrics.record_message_published(&id).unwrap();
            metrics
                .record_message_processed(&id, "batching", Duration::from_millis(4))
                .unwrap();
        }
        metrics
            .record_message_failed("case-3", "reporter", "sink offline")
            .unwrap();

        let snapshot = metrics.get_metrics(None, None).unwrap();
        assert_eq!(snapshot.messages_published, 3);
        assert_eq!(snapshot.messages_processed, 3);
        assert_eq!(snapshot.messages_failed, 1);
        assert!((snapshot.error_rate - 25.0).abs() < 1e-9);
        assert!((snapshot.average_processing_time_ms - 4.0).abs() < 1e-6);

        let batching = &snapshot.processors["batching"];
        assert_eq!(batching.processed, 3);
        assert_eq!(batching.error_rate, 0.0);
        assert_eq!(snapshot.processors["reporter"].failed, 1);

        assert_eq!(
            metrics.totals(),
            CounterTotals {
                published: 3,
                processed: 3,
                failed: 1,
                retried: 0
            }
        );
    }

    #[test]
    fn test_validation_of_ids_and_windows() {
        let metrics = MetricsCollector::default();
        assert!(matches!(
            metrics.record_message_published(""),
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            metrics.record_batch_timeout(" ", None, 0, Duration::from_secs(1)),
            Err(PipelineError::Validation(_))
        ));

        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);
        assert!(matches!(
            metrics.get_metrics(Some(now), Some(earlier)),
            Err(PipelineError::Validation(_))
        ));
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(classify_trend(&[], 1.0), Trend::Unknown);
        assert_eq!(classify_trend(&[5.0], 1.0), Trend::Stable);
        assert_eq!(classify_trend(&[1.0, 2.0, 10.0, 12.0], 1.0), Trend::Increasing);
        assert_eq!(classify_trend(&[20.0, 18.0, 4.0, 2.0], 1.0), Trend::Decreasing);
        assert_eq!(classify_trend(&[10.0, 10.5, 10.2, 10.4], 1.0), Trend::Stable);

        assert_eq!(compare_to_average(12.0, 10.0), Trend::Increasing);
        assert_eq!(compare_to_average(8.5, 10.0), Trend::Decreasing);
        assert_eq!(compare_to_average(10.5, 10.0), Trend::Stable);
    }

    #[test]
    fn test_queue_depth_metrics() {
        let metrics = MetricsCollector::default();
        for depth in [2, 4, 8, 6] {
            metrics.record_queue_depth(depth);
        }
        let depth = metrics.get_queue_depth_metrics(None, None).unwrap();
        assert_eq!(depth.current_depth, 6);
        assert_eq!(depth.peak_depth, 8);
        assert_eq!(depth.min_depth, 2);
        assert_eq!(depth.average_depth, 5.0);
        assert_eq!(depth.history.len(), 4);
        assert_eq!(depth.trend, Trend::Increasing);
    }

    #[test]
    fn test_batch_metrics_distinguish_outcomes() {
        let metrics = MetricsCollector::default();
        metrics
            .record_batch_completion("b1", 3, true, Duration::from_millis(10))
            .unwrap();
        metrics
            .record_batch_completion("b2", 1, false, Duration::from_millis(30))
            .unwrap();
        metrics
            .record_batch_timeout("b3", Some(4), 2, Duration::from_millis(50))
            .unwrap();
        metrics
            .record_batch_completion("b3", 2, true, Duration::from_millis(20))
            .unwrap();

        let batches = metrics.get_batch_metrics(None, None).unwrap();
        assert_eq!(batches.total_batches, 3);
        assert_eq!(batches.completed_batches, 1);
        assert_eq!(batches.failed_batches, 1);
        assert_eq!(batches.timed_out_batches, 1);
        assert!((batches.timeout_rate - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(batches.average_batch_size, 2.0);
        assert_eq!(batches.size_distribution.get(&2), Some(&1));
        assert!((batches.average_processing_time_ms - 20.0).abs() < 1e-6);

        assert_eq!(
            metrics.get_batch_timeout("b3"),
            Some((Some(4), 2, Duration::from_millis(50)))
        );
    }

    #[test]
    fn test_processing_rates_use_histogram_percentiles() {
        let metrics = MetricsCollector::default();
        for i in 1..=100u64 {
            metrics
                .record_message_processed(&format!("c{}", i), "batching", Duration::from_millis(i))
                .unwrap();
        }
        let rates = metrics.get_processing_rates();
        assert!((rates.average_latency_ms - 50.5).abs() < 0.01);
        assert_eq!(rates.peak_latency_ms, 100.0);
        assert!((rates.p95_latency_ms - 95.0).abs() < 1.0, "{}", rates.p95_latency_ms);
        assert!(rates.current_rate_per_second > 0.0);
    }

    #[test]
    fn test_message_history_and_reset() {
        let metrics = MetricsCollector::default();
        metrics.record_message_published("A.M1").unwrap();
        metrics
            .record_message_processed("A.M1", "batching", Duration::from_millis(1))
            .unwrap();

        let history = metrics.get_message_history("A.M1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, CaseEventKind::Published);
        assert_eq!(history[1].processor.as_deref(), Some("batching"));

        metrics.record_retry("b1").unwrap();
        metrics.reset_metrics();
        assert!(metrics.get_message_history("A.M1").is_empty());
        assert_eq!(metrics.totals().retried, 0);
        assert!(metrics.get_processor_names().is_empty());
    }
}
