//! # Message and Batch Model
//!
//! Plain data types that flow through the pipeline: the [`CompletionMessage`]
//! describing one finished test case, and the [`Batch`] that groups related
//! messages until they are handed to a reporter.
//!
//! ## Key Components
//!
//! - **CompletionMessage**: case id, outcome, timing statistics and a typed metadata bag
//! - **Metadata**: closed set of well-known keys plus `Custom` extension keys
//! - **Batch / BatchStatus**: batch record and its lifecycle state machine
//! - **GroupingStrategy**: rule deciding which batch a message joins
//!
//! Messages are moved, never shared: the producer hands a message to the
//! queue, the queue hands it to one consumer, and the consumer hands it to
//! the batching service.

use crate::error::{PipelineError, PipelineResult};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Outcome of executing one test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub success: bool,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub error_type: Option<String>,
}

impl TestOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            error_message: None,
            error_details: None,
            error_type: None,
        }
    }

    pub fn failed(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            error_details: None,
            error_type: Some(error_type.into()),
        }
    }
}

/// Timing statistics captured for a test case.
///
/// All times are in milliseconds. The statistics themselves are computed by
/// the test framework; [`PerformanceSummary::from_samples`] exists for
/// producers that only have raw samples.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSummary {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub std_dev_ms: f64,
    pub variance: f64,
    pub raw_samples_ms: Vec<f64>,
    pub filtered_samples_ms: Vec<f64>,
    pub lower_outliers_ms: Vec<f64>,
    pub upper_outliers_ms: Vec<f64>,
    pub total_outliers: usize,
    pub sample_size: usize,
    pub warmup_iterations: usize,
    /// Comparison group the framework assigned to this case, if any.
    pub grouping_id: Option<String>,
}

impl PerformanceSummary {
    /// Build a summary from raw samples with no outlier removal.
    pub fn from_samples(samples_ms: Vec<f64>) -> Self {
        let (mean, _min, _max, std_dev) = crate::utils::calculate_stats(&samples_ms);
        let median = crate::utils::calculate_percentiles(&samples_ms, &[50.0])
            .first()
            .map(|&(_, value)| value)
            .unwrap_or(0.0);

        Self {
            mean_ms: mean,
            median_ms: median,
            std_dev_ms: std_dev,
            variance: std_dev * std_dev,
            sample_size: samples_ms.len(),
            filtered_samples_ms: samples_ms.clone(),
            raw_samples_ms: samples_ms,
            ..Self::default()
        }
    }

    pub fn with_grouping_id(mut self, grouping_id: impl Into<String>) -> Self {
        self.grouping_id = Some(grouping_id.into());
        self
    }

    /// Whether every scalar statistic is a finite number.
    pub fn is_finite(&self) -> bool {
        [self.mean_ms, self.median_ms, self.std_dev_ms, self.variance]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Well-known metadata keys.
///
/// Each grouping strategy reads a fixed subset of these (see
/// [`MetadataKey::relevant_to`]); anything else goes under `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetadataKey {
    TestClassName,
    MethodName,
    ComparisonGroup,
    BatchingCriteria,
    ExecutionContext,
    ExpectedBatchSize,
    CompletionTimeoutMs,
    Custom(String),
}

impl MetadataKey {
    pub fn as_str(&self) -> &str {
        match self {
            MetadataKey::TestClassName => "TestClassName",
            MetadataKey::MethodName => "MethodName",
            MetadataKey::ComparisonGroup => "ComparisonGroup",
            MetadataKey::BatchingCriteria => "BatchingCriteria",
            MetadataKey::ExecutionContext => "ExecutionContext",
            MetadataKey::ExpectedBatchSize => "ExpectedBatchSize",
            MetadataKey::CompletionTimeoutMs => "CompletionTimeoutMs",
            MetadataKey::Custom(name) => name,
        }
    }

    /// Keys a strategy consults when computing a grouping key.
    ///
    /// `ExpectedBatchSize` and `CompletionTimeoutMs` apply under every strategy
    /// and are not listed here.
    pub fn relevant_to(strategy: GroupingStrategy) -> Vec<MetadataKey> {
        match strategy {
            GroupingStrategy::ByTestClass => vec![MetadataKey::TestClassName],
            GroupingStrategy::ByComparisonAttribute => {
                vec![MetadataKey::ComparisonGroup, MetadataKey::TestClassName]
            }
            GroupingStrategy::ByCustomCriteria => {
                vec![MetadataKey::BatchingCriteria, MetadataKey::TestClassName]
            }
            GroupingStrategy::ByExecutionContext => vec![MetadataKey::ExecutionContext],
            GroupingStrategy::ByPerformanceProfile | GroupingStrategy::None => Vec::new(),
        }
    }
}

impl From<String> for MetadataKey {
    fn from(value: String) -> Self {
        match value.as_str() {
            "TestClassName" => MetadataKey::TestClassName,
            "MethodName" => MetadataKey::MethodName,
            "ComparisonGroup" => MetadataKey::ComparisonGroup,
            "BatchingCriteria" => MetadataKey::BatchingCriteria,
            "ExecutionContext" => MetadataKey::ExecutionContext,
            "ExpectedBatchSize" => MetadataKey::ExpectedBatchSize,
            "CompletionTimeoutMs" => MetadataKey::CompletionTimeoutMs,
            _ => MetadataKey::Custom(value),
        }
    }
}

impl From<MetadataKey> for String {
    fn from(key: MetadataKey) -> Self {
        match key {
            MetadataKey::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Flag(v) => write!(f, "{}", v),
            MetadataValue::Integer(v) => write!(f, "{}", v),
            MetadataValue::Float(v) => write!(f, "{}", v),
            MetadataValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Flag(value)
    }
}

/// Key/value bag attached to messages and batches.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<MetadataKey, MetadataValue>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: MetadataKey, value: impl Into<MetadataValue>) {
        self.0.insert(key, value.into());
    }

    pub fn get(&self, key: &MetadataKey) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Non-empty text value for `key`. Numbers and flags are rendered as text.
    pub fn text(&self, key: &MetadataKey) -> Option<String> {
        let rendered = self.0.get(key)?.to_string();
        let trimmed = rendered.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    /// Integer value for `key`, accepting numeric text.
    pub fn integer(&self, key: &MetadataKey) -> Option<i64> {
        match self.0.get(key)? {
            MetadataValue::Integer(v) => Some(*v),
            MetadataValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            MetadataValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn contains(&self, key: &MetadataKey) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetadataKey, &MetadataValue)> {
        self.0.iter()
    }

    /// Copy of the entries whose key is in `keys`.
    pub fn subset(&self, keys: &[MetadataKey]) -> Metadata {
        Metadata(
            self.0
                .iter()
                .filter(|(k, _)| keys.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// A finished test case travelling through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub test_case_id: String,
    pub outcome: TestOutcome,
    pub completed_at: DateTime<Utc>,
    pub performance: PerformanceSummary,
    #[serde(default)]
    pub metadata: Metadata,
}

impl CompletionMessage {
    pub fn new(
        test_case_id: impl Into<String>,
        outcome: TestOutcome,
        performance: PerformanceSummary,
    ) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            outcome,
            completed_at: Utc::now(),
            performance,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: MetadataKey, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Reject messages that cannot be grouped or reported.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.test_case_id.trim().is_empty() {
            return Err(PipelineError::validation(
                "completion message must carry a non-empty test case id",
            ));
        }
        if !self.performance.is_finite() {
            return Err(PipelineError::validation(format!(
                "completion message {} carries non-finite timing statistics",
                self.test_case_id
            )));
        }
        Ok(())
    }

    /// Expected batch size declared by the producer, if positive.
    pub fn expected_batch_size(&self) -> Option<usize> {
        self.metadata
            .integer(&MetadataKey::ExpectedBatchSize)
            .filter(|&n| n > 0)
            .map(|n| n as usize)
    }

    /// Batch deadline declared by the producer, if positive.
    pub fn completion_timeout(&self) -> Option<Duration> {
        self.metadata
            .integer(&MetadataKey::CompletionTimeoutMs)
            .filter(|&ms| ms > 0)
            .map(|ms| Duration::from_millis(ms as u64))
    }
}

/// Rule used to decide which batch a message joins.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum, Serialize, Deserialize,
)]
pub enum GroupingStrategy {
    /// Group by the test class the case belongs to
    #[clap(name = "test-class")]
    ByTestClass,

    /// Group by the comparison group of the case
    #[clap(name = "comparison")]
    ByComparisonAttribute,

    /// Group by the producer-supplied batching criteria
    #[clap(name = "custom")]
    ByCustomCriteria,

    /// Group by execution context fingerprint
    #[clap(name = "context")]
    ByExecutionContext,

    /// Group by mean-time bucket
    #[clap(name = "profile")]
    ByPerformanceProfile,

    /// Every case is its own singleton batch
    #[clap(name = "none")]
    None,
}

impl fmt::Display for GroupingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupingStrategy::ByTestClass => write!(f, "ByTestClass"),
            GroupingStrategy::ByComparisonAttribute => write!(f, "ByComparisonAttribute"),
            GroupingStrategy::ByCustomCriteria => write!(f, "ByCustomCriteria"),
            GroupingStrategy::ByExecutionContext => write!(f, "ByExecutionContext"),
            GroupingStrategy::ByPerformanceProfile => write!(f, "ByPerformanceProfile"),
            GroupingStrategy::None => write!(f, "None"),
        }
    }
}

/// Batch lifecycle.
///
/// ```text
/// Pending ──► Complete ──► Processing ──► Processed
///    │                        ▲     └───► Error
///    └──────► TimedOut ───────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Pending,
    Complete,
    Processing,
    Processed,
    TimedOut,
    Error,
}

impl BatchStatus {
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Complete)
                | (Pending, TimedOut)
                | (Complete, Processing)
                | (TimedOut, Processing)
                | (Processing, Processed)
                | (Processing, Error)
        )
    }

    /// Ready to be claimed by a reporter.
    pub fn is_reportable(self) -> bool {
        matches!(self, BatchStatus::Complete | BatchStatus::TimedOut)
    }

    /// No longer accepting messages and not failed.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            BatchStatus::Complete
                | BatchStatus::Processing
                | BatchStatus::Processed
                | BatchStatus::TimedOut
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BatchStatus::Pending => "Pending",
            BatchStatus::Complete => "Complete",
            BatchStatus::Processing => "Processing",
            BatchStatus::Processed => "Processed",
            BatchStatus::TimedOut => "TimedOut",
            BatchStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

/// A group of related completion messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub messages: Vec<CompletionMessage>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub strategy: GroupingStrategy,
    pub grouping_criteria: String,
    pub expected_size: Option<usize>,
    pub completion_timeout: Option<Duration>,
    pub metadata: Metadata,
    /// Last reporter error, set when the batch moves to `Error`.
    pub error: Option<String>,
}

impl Batch {
    pub fn new(
        id: impl Into<String>,
        strategy: GroupingStrategy,
        grouping_criteria: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            strategy,
            grouping_criteria: grouping_criteria.into(),
            expected_size: None,
            completion_timeout: None,
            metadata: Metadata::new(),
            error: None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn passed_count(&self) -> usize {
        self.messages.iter().filter(|m| m.outcome.success).count()
    }

    pub fn failed_count(&self) -> usize {
        self.len() - self.passed_count()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: BatchStatus) -> PipelineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::invalid_state(format!(
                "batch {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        if matches!(next, BatchStatus::Complete | BatchStatus::TimedOut) {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Whether a `Pending` batch has outlived its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>, default_timeout: Duration) -> bool {
        self.status == BatchStatus::Pending
            && self.age(now) > self.completion_timeout.unwrap_or(default_timeout)
    }
}
