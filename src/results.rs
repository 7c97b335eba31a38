//! # Batch Reporters
//!
//! Implementations of [`BatchReporter`] shipped with the pipeline.
//!
//! ## Key Components
//!
//! - **JsonReportWriter**: collects one [`BatchReport`] per reported batch,
//!   optionally streams each as it arrives into a JSON array file, and writes a
//!   final document with run metadata and the [`PipelineSummary`]
//! - **LoggingReporter**: logs each batch through `tracing`
//! - **CollectingReporter**: keeps reported batches in memory

use crate::dispatch::BatchReporter;
use crate::message::{Batch, BatchStatus, GroupingStrategy};
use crate::pipeline::PipelineSummary;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Aggregate of the per-case mean times in a batch, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingStats {
    pub mean_of_means_ms: f64,
    pub min_mean_ms: f64,
    pub max_mean_ms: f64,
    pub std_dev_ms: f64,
}

/// Serializable record of one reported batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub strategy: GroupingStrategy,
    pub grouping_criteria: String,
    /// `Complete` or `TimedOut`
    pub status: BatchStatus,
    pub expected_size: Option<usize>,
    pub actual_size: usize,
    pub passed: usize,
    pub failed: usize,
    pub timing: TimingStats,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub test_case_ids: Vec<String>,
}

impl BatchReport {
    pub fn from_batch(batch: &Batch) -> Self {
        let means: Vec<f64> = batch.messages.iter().map(|m| m.performance.mean_ms).collect();
        let (mean, min, max, std_dev) = crate::utils::calculate_stats(&means);
        Self {
            batch_id: batch.id.clone(),
            strategy: batch.strategy,
            grouping_criteria: batch.grouping_criteria.clone(),
            status: batch.status,
            expected_size: batch.expected_size,
            actual_size: batch.len(),
            passed: batch.passed_count(),
            failed: batch.failed_count(),
            timing: TimingStats {
                mean_of_means_ms: mean,
                min_mean_ms: min,
                max_mean_ms: max,
                std_dev_ms: std_dev,
            },
            created_at: batch.created_at,
            completed_at: batch.completed_at,
            test_case_ids: batch.messages.iter().map(|m| m.test_case_id.clone()).collect(),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.expected_size.map_or(false, |n| self.actual_size < n)
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub rust_version: String,
    pub pipeline_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: crate::utils::get_cpu_cores(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            pipeline_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata at the top of the final report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub total_batches: usize,
    pub partial_batches: usize,
    pub system_info: SystemInfo,
}

/// Final report document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    pub metadata: ReportMetadata,
    pub summary: PipelineSummary,
    pub batches: Vec<BatchReport>,
}

#[derive(Default)]
struct StreamState {
    path: Option<PathBuf>,
    streamed: usize,
}

/// Reporter that writes batch reports as JSON
pub struct JsonReportWriter {
    output_file: PathBuf,
    reports: Mutex<Vec<BatchReport>>,
    // Only locked around file I/O on blocking threads or in the sync API.
    stream: Arc<Mutex<StreamState>>,
}

impl JsonReportWriter {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            reports: Mutex::new(Vec::new()),
            stream: Arc::new(Mutex::new(StreamState::default())),
        }
    }

    /// Stream each report into `streaming_file` as soon as it arrives.
    ///
    /// The file is truncated and holds a JSON array that is closed by
    /// [`finalize`](Self::finalize).
    pub fn enable_streaming<P: AsRef<Path>>(&self, streaming_file: P) -> Result<()> {
        let path = streaming_file.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create streaming file {:?}", path))?;
        writeln!(file, "[")?;

        debug!("Enabled streaming to: {:?}", path);
        let mut stream = self.stream.lock();
        stream.path = Some(path);
        stream.streamed = 0;
        Ok(())
    }

    pub fn reports(&self) -> Vec<BatchReport> {
        self.reports.lock().clone()
    }

    fn is_streaming(&self) -> bool {
        self.stream.lock().path.is_some()
    }

    /// Append `report` to the streaming file on a blocking thread.
    ///
    /// The write and the element count update under one lock, so the array
    /// stays well-formed even if the awaiting future is dropped.
    async fn stream_in_background(&self, report: BatchReport) -> Result<()> {
        let stream = Arc::clone(&self.stream);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut stream = stream.lock();
            if let Some(path) = stream.path.clone() {
                Self::stream(&path, stream.streamed == 0, &report)?;
                stream.streamed += 1;
            }
            Ok(())
        })
        .await
        .context("Streaming write task failed")?
    }

    fn stream(path: &Path, first: bool, report: &BatchReport) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(path)?;
        if !first {
            writeln!(file, ",")?;
        }
        let json = serde_json::to_string_pretty(report)?;
        write!(file, "{}", json)?;
        file.flush()?;
        Ok(())
    }

    /// Close the streaming array and write the final report.
    pub fn finalize(&self, summary: &PipelineSummary) -> Result<()> {
        info!("Finalizing batch reports");
        if let Some(path) = self.stream.lock().path.take() {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            writeln!(file, "\n]")?;
            file.flush()?;
        }
        let reports = self.reports();

        let report = FinalReport {
            metadata: ReportMetadata {
                version: crate::VERSION.to_string(),
                timestamp: Utc::now(),
                total_batches: reports.len(),
                partial_batches: reports.iter().filter(|r| r.is_partial()).count(),
                system_info: SystemInfo::default(),
            },
            summary: summary.clone(),
            batches: reports,
        };
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write report {:?}", self.output_file))?;

        info!("Report written to: {:?}", self.output_file);
        Ok(())
    }
}

#[async_trait]
impl BatchReporter for JsonReportWriter {
    async fn report(&self, batch: &Batch) -> Result<()> {
        let report = BatchReport::from_batch(batch);
        if self.is_streaming() {
            self.stream_in_background(report.clone()).await?;
        }
        self.reports.lock().push(report);
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}

/// Reporter that only logs
#[derive(Debug, Default)]
pub struct LoggingReporter;

#[async_trait]
impl BatchReporter for LoggingReporter {
    async fn report(&self, batch: &Batch) -> Result<()> {
        info!(
            "Batch {} [{}] {}: {} case(s), {} passed, {} failed",
            batch.id,
            batch.status,
            batch.grouping_criteria,
            batch.len(),
            batch.passed_count(),
            batch.failed_count()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Reporter that keeps every batch in memory
#[derive(Debug, Default)]
pub struct CollectingReporter {
    batches: Mutex<Vec<Batch>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

#[async_trait]
impl BatchReporter for CollectingReporter {
    async fn report(&self, batch: &Batch) -> Result<()> {
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "collecting"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthLevel, HealthStatus};
    use crate::message::{CompletionMessage, PerformanceSummary, TestOutcome};
    use crate::metrics::MetricsCollector;
    use std::collections::BTreeMap;
    use tempfile::NamedTempFile;

    fn batch(id: &str, means: &[f64], status: BatchStatus) -> Batch {
        let mut batch = Batch::new(id, GroupingStrategy::ByTestClass, "TestClass_Suite");
        batch.expected_size = Some(3);
        for (i, mean) in means.iter().enumerate() {
            let outcome = if i == 0 {
                TestOutcome::failed("assertion failed", "AssertionError")
            } else {
                TestOutcome::passed()
            };
            batch.messages.push(CompletionMessage::new(
                format!("Suite.case{}", i),
                outcome,
                PerformanceSummary::from_samples(vec![*mean]),
            ));
        }
        batch.transition(status).unwrap();
        batch
    }

    fn summary() -> PipelineSummary {
        let health = HealthStatus {
            level: HealthLevel::Healthy,
            status: "ok".to_string(),
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        };
        PipelineSummary::from_metrics(&MetricsCollector::default(), health).unwrap()
    }

    #[test]
    fn test_batch_report_aggregates() {
        let report = BatchReport::from_batch(&batch("b1", &[10.0, 20.0, 30.0], BatchStatus::Complete));
        assert_eq!(report.actual_size, 3);
        assert_eq!(report.passed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.timing.mean_of_means_ms, 20.0);
        assert_eq!(report.timing.min_mean_ms, 10.0);
        assert_eq!(report.timing.max_mean_ms, 30.0);
        assert!(!report.is_partial());

        let partial = BatchReport::from_batch(&batch("b2", &[5.0], BatchStatus::TimedOut));
        assert_eq!(partial.status, BatchStatus::TimedOut);
        assert!(partial.is_partial());
    }

    #[tokio::test]
    async fn test_json_writer_streams_and_finalizes() {
        let output = NamedTempFile::new().unwrap();
        let streaming = NamedTempFile::new().unwrap();
        let writer = JsonReportWriter::new(output.path());
        writer.enable_streaming(streaming.path()).unwrap();

        writer
            .report(&batch("b1", &[1.0, 2.0, 3.0], BatchStatus::Complete))
            .await
            .unwrap();
        writer
            .report(&batch("b2", &[4.0], BatchStatus::TimedOut))
            .await
            .unwrap();
        writer.finalize(&summary()).unwrap();

        let streamed: Vec<BatchReport> =
            serde_json::from_str(&std::fs::read_to_string(streaming.path()).unwrap()).unwrap();
        assert_eq!(streamed.len(), 2);
        assert_eq!(streamed[1].batch_id, "b2");

        let final_report: FinalReport =
            serde_json::from_str(&std::fs::read_to_string(output.path()).unwrap()).unwrap();
        assert_eq!(final_report.metadata.total_batches, 2);
        assert_eq!(final_report.metadata.partial_batches, 1);
        assert_eq!(final_report.batches, writer.reports());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_stream_a_valid_array() {
        let output = NamedTempFile::new().unwrap();
        let streaming = NamedTempFile::new().unwrap();
        let writer = Arc::new(JsonReportWriter::new(output.path()));
        writer.enable_streaming(streaming.path()).unwrap();

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let writer = writer.clone();
                tokio::spawn(async move {
                    writer
                        .report(&batch(&format!("b{}", i), &[1.0, 2.0], BatchStatus::Complete))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        writer.finalize(&summary()).unwrap();

        let streamed: Vec<BatchReport> =
            serde_json::from_str(&std::fs::read_to_string(streaming.path()).unwrap()).unwrap();
        let ids: std::collections::BTreeSet<_> = streamed.iter().map(|r| r.batch_id.clone()).collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(writer.reports().len(), 20);
    }

    #[tokio::test]
    async fn test_finalize_without_streaming_writes_empty_report() {
        let output = NamedTempFile::new().unwrap();
        let writer = JsonReportWriter::new(output.path());
        writer.finalize(&summary()).unwrap();

        let final_report: FinalReport =
            serde_json::from_str(&std::fs::read_to_string(output.path()).unwrap()).unwrap();
        assert!(final_report.batches.is_empty());
        assert!(final_report.metadata.system_info.cpu_cores > 0);
    }

    #[tokio::test]
    async fn test_collecting_and_logging_reporters() {
        let collecting = CollectingReporter::new();
        let b = batch("b1", &[1.0], BatchStatus::Complete);
        collecting.report(&b).await.unwrap();
        assert_eq!(collecting.len(), 1);
        assert_eq!(collecting.batches()[0].id, "b1");

        LoggingReporter.report(&b).await.unwrap();
        assert_eq!(LoggingReporter.name(), "logging");
    }
}
