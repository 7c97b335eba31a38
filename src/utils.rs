//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the pipeline: identifier generation, human
//! readable formatting for log lines and summaries, descriptive statistics
//! over timing samples, and CPU-based defaults.
//!
//! ## Key Functionality Categories
//!
//! - **Identifiers**: unique batch ids derived from grouping keys
//! - **Formatting**: durations, message rates and percentages
//! - **Statistics**: mean/min/max/standard deviation and percentiles
//! - **System Information**: CPU core detection for worker-pool sizing
//!
//! ## Usage Examples
//!
//! ```rust
//! use completion_pipeline::utils::*;
//! use std::time::Duration;
//!
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! assert_eq!(format_message_rate(1500.0), "1.50K msg/s");
//! assert_eq!(format_percentage(12.345), "12.35%");
//! ```

use std::time::Duration;
use uuid::Uuid;

/// Generate a unique batch identifier for a grouping key
///
/// The key stays readable at the front of the id so log lines can be
/// correlated by eye, while the UUID suffix keeps ids unique when the same
/// key opens a second batch after the first one completed.
///
/// ## Examples
///
/// ```rust
/// # use completion_pipeline::utils::generate_batch_id;
/// let id = generate_batch_id("TestClass_Orders");
/// assert!(id.starts_with("TestClass_Orders#"));
/// ```
pub fn generate_batch_id(grouping_key: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}#{}", grouping_key, &suffix[..12])
}

/// Generate a short unique token, used for singleton grouping keys.
pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Format a duration with the most appropriate unit
///
/// ## Unit Selection
///
/// - Nanoseconds for values < 1μs
/// - Microseconds and milliseconds with 2 decimal places
/// - Seconds with 2 decimal places below one minute
/// - Compound minutes/seconds or hours/minutes/seconds above that
///
/// ## Examples
///
/// ```rust
/// # use completion_pipeline::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a millisecond figure as a duration string.
pub fn format_millis(ms: f64) -> String {
    if !ms.is_finite() || ms <= 0.0 {
        return "0ns".to_string();
    }
    format_duration(Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX))
}

/// Format a message rate with K/M scaling
///
/// ```rust
/// # use completion_pipeline::utils::format_message_rate;
/// assert_eq!(format_message_rate(750.0), "750 msg/s");
/// assert_eq!(format_message_rate(2300000.0), "2.30M msg/s");
/// ```
pub fn format_message_rate(messages_per_second: f64) -> String {
    if messages_per_second < 1000.0 {
        format!("{:.0} msg/s", messages_per_second)
    } else if messages_per_second < 1_000_000.0 {
        format!("{:.2}K msg/s", messages_per_second / 1000.0)
    } else {
        format!("{:.2}M msg/s", messages_per_second / 1_000_000.0)
    }
}

pub fn format_percentage(value: f64) -> String {
    format!("{:.2}%", value)
}

/// Calculate statistics from a slice of values
///
/// ## Returns
/// Tuple of (mean, min, max, standard_deviation)
///
/// ## Empty Dataset Handling
///
/// An empty slice yields (0.0, 0.0, 0.0, 0.0) rather than NaN.
///
/// ## Standard Deviation Calculation
///
/// Uses the population formula σ = √(Σ(x - μ)² / N).
///
/// ```rust
/// # use completion_pipeline::utils::calculate_stats;
/// let (mean, min, max, _std_dev) = calculate_stats(&[1.0, 2.0, 3.0, 4.0, 5.0]);
/// assert_eq!((mean, min, max), (3.0, 1.0, 5.0));
/// ```
pub fn calculate_stats(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let sum: f64 = values.iter().sum();
    let count = values.len() as f64;
    let mean = sum / count;

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
    let std_dev = variance.sqrt();

    (mean, min, max, std_dev)
}

/// Calculate percentiles using linear interpolation
///
/// For percentile P the fractional index is (P/100) * (N-1); values between
/// two samples are interpolated. An empty slice pairs every requested
/// percentile with 0.0.
pub fn calculate_percentiles(values: &[f64], percentiles: &[f64]) -> Vec<(f64, f64)> {
    if values.is_empty() {
        return percentiles.iter().map(|&p| (p, 0.0)).collect();
    }

    let mut sorted_values = values.to_vec();
    sorted_values.sort_by(|a, b| a.total_cmp(b));
    let last = sorted_values.len() - 1;

    percentiles
        .iter()
        .map(|&p| {
            let index = (p.clamp(0.0, 100.0) / 100.0) * last as f64;
            let lower = index.floor() as usize;
            let upper = index.ceil() as usize;
            let value = if lower == upper {
                sorted_values[lower]
            } else {
                let weight = index - lower as f64;
                sorted_values[lower] * (1.0 - weight) + sorted_values[upper] * weight
            };
            (p, value)
        })
        .collect()
}

/// Number of logical CPU cores, via `num_cpus`.
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Recommended consumer worker count
///
/// Batching work is short and lock-bound, so more than a handful of
/// consumers only adds contention. Uses half the cores, at least one and at
/// most four.
pub fn get_recommended_workers() -> usize {
    (get_cpu_cores() / 2).clamp(1, 4)
}
