use crate::message::GroupingStrategy;
use crate::optimizer::OptimizationStrategy;
use crate::workload::WorkloadSpec;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Completion Pipeline - batch, report and monitor performance-test results
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// JSON-lines file of completion messages to replay (generates a synthetic workload if absent)
    #[clap(short = 'i', long, help_heading = "Workload")]
    pub input: Option<PathBuf>,

    /// Number of synthetic test cases
    #[clap(long, default_value_t = 200, help_heading = "Workload")]
    pub cases: usize,

    /// Number of synthetic test classes
    #[clap(long, default_value_t = 8, help_heading = "Workload")]
    pub classes: usize,

    /// Fraction of synthetic cases reported as failed
    #[clap(long, default_value_t = 0.05, value_parser = parse_ratio, help_heading = "Workload")]
    pub failure_ratio: f64,

    /// Seed for the synthetic workload (random if omitted)
    #[clap(long, help_heading = "Workload")]
    pub seed: Option<u64>,

    /// Number of concurrent producer tasks publishing the workload
    #[clap(short = 'p', long, default_value_t = 4, help_heading = "Workload")]
    pub producers: usize,

    /// Grouping strategy for batches
    #[clap(short = 's', long, value_enum, default_value_t = GroupingStrategy::ByTestClass, help_heading = "Pipeline")]
    pub strategy: GroupingStrategy,

    /// Completion queue capacity
    #[clap(short = 'q', long, default_value_t = crate::defaults::QUEUE_CAPACITY, help_heading = "Pipeline")]
    pub queue_capacity: usize,

    /// How long a publish waits for queue capacity
    #[clap(long, default_value = "5s", value_parser = parse_duration, help_heading = "Pipeline")]
    pub publish_timeout: Duration,

    /// Latency budget for reporting one batch
    #[clap(long, default_value = "30s", value_parser = parse_duration, help_heading = "Pipeline")]
    pub processing_timeout: Duration,

    /// Default deadline for a batch to fill up
    #[clap(long, default_value = "60s", value_parser = parse_duration, help_heading = "Pipeline")]
    pub batch_timeout: Duration,

    /// Largest batch when the expected size is unknown
    #[clap(long, default_value_t = crate::defaults::MAX_BATCH_SIZE, help_heading = "Pipeline")]
    pub max_batch_size: usize,

    /// Reporter retry attempts per batch
    #[clap(long, default_value_t = crate::defaults::MAX_RETRY_ATTEMPTS, help_heading = "Pipeline")]
    pub max_retries: u32,

    /// Number of consumer workers
    #[clap(short = 'w', long, default_value_t = crate::defaults::CONSUMER_WORKERS, help_heading = "Pipeline")]
    pub workers: usize,

    /// Period of the batch timeout sweep
    #[clap(long, default_value = "15s", value_parser = parse_duration, help_heading = "Pipeline")]
    pub timeout_check_interval: Duration,

    /// Delay before the first reporter retry (doubles on each further attempt)
    #[clap(long, default_value = "100ms", value_parser = parse_duration, help_heading = "Pipeline")]
    pub retry_delay: Duration,

    /// How long event logs and queue-depth history are kept
    #[clap(long, default_value = "24h", value_parser = parse_duration, help_heading = "Monitoring")]
    pub metrics_retention: Duration,

    /// Window used for current rates, health averages and trends
    #[clap(long, default_value = "5m", value_parser = parse_duration, help_heading = "Monitoring")]
    pub recent_window: Duration,

    /// Period of the health check
    #[clap(long, default_value = "10s", value_parser = parse_duration, help_heading = "Monitoring")]
    pub health_interval: Duration,

    /// Disable the performance optimizer
    #[clap(long, default_value_t = false, help_heading = "Monitoring")]
    pub no_optimizer: bool,

    /// Period of the optimizer cycle
    #[clap(long, default_value = "60s", value_parser = parse_duration, help_heading = "Monitoring")]
    pub optimizer_interval: Duration,

    /// Objective used by the optimizer
    #[clap(long, value_enum, default_value_t = OptimizationStrategy::Balanced, help_heading = "Monitoring")]
    pub optimization_strategy: OptimizationStrategy,

    /// Ceiling the optimizer may raise the batch timeout to
    #[clap(long, default_value = "30m", value_parser = parse_duration, help_heading = "Monitoring")]
    pub max_batch_timeout: Duration,

    /// Ceiling the optimizer may raise the processing timeout to
    #[clap(long, default_value = "10m", value_parser = parse_duration, help_heading = "Monitoring")]
    pub max_processing_timeout: Duration,

    /// Analyze and raise events but never change settings
    #[clap(long, default_value_t = false, help_heading = "Monitoring")]
    pub advisory_only: bool,

    /// Output file for the final report (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Output")]
    pub output: PathBuf,

    /// JSON output file for streaming batch reports as they are produced
    #[clap(long, help_heading = "Output")]
    pub streaming_output: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false, help_heading = "Output")]
    pub verbose: bool,

    /// Use the default tracing format instead of colored lines
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub plain_logs: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn workload_spec(&self) -> WorkloadSpec {
        WorkloadSpec {
            cases: self.cases,
            classes: self.classes,
            failure_ratio: self.failure_ratio,
            seed: self.seed,
            ..WorkloadSpec::default()
        }
    }
}

/// Parse duration from string (e.g., "250ms", "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|e| format!("Duration out of range: {}: {}", s, e))
}

fn parse_ratio(s: &str) -> Result<f64, String> {
    let value: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid ratio: {}", s))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("Ratio must be between 0 and 1, got {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::PipelineError;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-3s").is_err());
        assert!(parse_duration("1e20s").is_err());
        assert!(parse_duration("1e17h").is_err());
        assert!(parse_duration("inf").is_err());
    }

    #[test]
    fn test_parse_ratio() {
        assert_eq!(parse_ratio("0.25").unwrap(), 0.25);
        assert!(parse_ratio("1.01").is_err());
        assert!(parse_ratio("x").is_err());
    }

    #[test]
    fn test_defaults_build_a_valid_config() {
        let args = Args::parse_from(["completion-pipeline"]);
        let config = PipelineConfig::from_args(&args).unwrap();
        assert_eq!(config.queue_capacity, crate::defaults::QUEUE_CAPACITY);
        assert_eq!(config.grouping_strategy, GroupingStrategy::ByTestClass);
        assert_eq!(config.batch_completion_timeout, Duration::from_secs(60));
        assert!(config.optimizer.enabled);
        assert!(config.optimizer.auto_apply);
        assert!(args.input.is_none());
    }

    #[test]
    fn test_flags_map_onto_config() {
        let args = Args::parse_from([
            "completion-pipeline",
            "--strategy",
            "profile",
            "--batch-timeout",
            "250ms",
            "--workers",
            "3",
            "--no-optimizer",
            "--advisory-only",
            "--optimization-strategy",
            "latency",
            "--seed",
            "42",
            "--retry-delay",
            "20ms",
            "--metrics-retention",
            "2h",
            "--recent-window",
            "90s",
            "--max-batch-timeout",
            "5m",
        ]);
        let config = PipelineConfig::from_args(&args).unwrap();
        assert_eq!(config.grouping_strategy, GroupingStrategy::ByPerformanceProfile);
        assert_eq!(config.batch_completion_timeout, Duration::from_millis(250));
        assert_eq!(config.consumer_workers, 3);
        assert!(!config.optimizer.enabled);
        assert!(!config.optimizer.auto_apply);
        assert_eq!(config.optimizer.initial_strategy, OptimizationStrategy::Latency);
        assert_eq!(args.workload_spec().seed, Some(42));
        assert_eq!(config.base_retry_delay, Duration::from_millis(20));
        assert_eq!(config.metrics_retention, Duration::from_secs(2 * 3600));
        assert_eq!(config.recent_window, Duration::from_secs(90));
        assert_eq!(config.optimizer.max_batch_timeout, Duration::from_secs(300));
        assert_eq!(
            config.optimizer.max_processing_timeout,
            crate::defaults::MAX_PROCESSING_TIMEOUT
        );
    }

    #[test]
    fn test_timeout_above_optimizer_ceiling_is_rejected() {
        let args = Args::parse_from([
            "completion-pipeline",
            "--batch-timeout",
            "2h",
            "--max-batch-timeout",
            "1h",
        ]);
        match PipelineConfig::from_args(&args) {
            Err(PipelineError::Configuration(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("max_batch_timeout"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_flags_are_collected() {
        let args = Args::parse_from([
            "completion-pipeline",
            "--workers",
            "0",
            "--max-batch-size",
            "5000",
        ]);
        match PipelineConfig::from_args(&args) {
            Err(PipelineError::Configuration(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }
}
