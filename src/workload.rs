//! # Workload Sources
//!
//! Message sources for the binary: JSON-lines replay and synthetic generation.

use crate::message::{CompletionMessage, MetadataKey, PerformanceSummary, TestOutcome};
use anyhow::{bail, Context, Result};
use rand::prelude::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info};

/// Read one `CompletionMessage` per non-blank line.
pub fn load_messages(path: &Path) -> Result<Vec<CompletionMessage>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open workload file: {:?}", path))?;
    let mut messages = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {} of {:?}", index + 1, path))?;
        if line.trim().is_empty() {
            continue;
        }
        let message: CompletionMessage = serde_json::from_str(&line)
            .with_context(|| format!("Invalid completion message on line {} of {:?}", index + 1, path))?;
        messages.push(message);
    }
    info!("Loaded {} completion message(s) from {:?}", messages.len(), path);
    Ok(messages)
}

/// Shape of a synthetic workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub cases: usize,
    pub classes: usize,
    /// Fraction of cases reported as failed, in `[0, 1]`.
    pub failure_ratio: f64,
    pub samples_per_case: usize,
    pub seed: Option<u64>,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            cases: 200,
            classes: 8,
            failure_ratio: 0.05,
            samples_per_case: 20,
            seed: None,
        }
    }
}

/// Seeded generator of completion messages spread across test classes.
///
/// Every class declares its exact case count as `ExpectedBatchSize`, so a
/// `ByTestClass` run completes each batch naturally once its last case lands.
pub struct WorkloadGenerator {
    rng: StdRng,
    spec: WorkloadSpec,
}

impl WorkloadGenerator {
    pub fn new(spec: WorkloadSpec) -> Result<Self> {
        if spec.cases == 0 {
            bail!("workload needs at least one case");
        }
        if spec.classes == 0 {
            bail!("workload needs at least one test class");
        }
        if !(0.0..=1.0).contains(&spec.failure_ratio) {
            bail!("failure ratio must be within [0, 1], got {}", spec.failure_ratio);
        }
        if spec.samples_per_case == 0 {
            bail!("each case needs at least one timing sample");
        }
        let rng = match spec.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self { rng, spec })
    }

    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    /// Generate the whole workload, shuffled across classes.
    pub fn generate(&mut self) -> Vec<CompletionMessage> {
        let classes = self.spec.classes.min(self.spec.cases);
        let mut sizes: BTreeMap<usize, usize> = BTreeMap::new();
        for case in 0..self.spec.cases {
            *sizes.entry(case % classes).or_insert(0) += 1;
        }

        let baselines: Vec<f64> = (0..classes).map(|_| self.rng.gen_range(0.5..250.0)).collect();
        let mut messages = Vec::with_capacity(self.spec.cases);
        for case in 0..self.spec.cases {
            let class = case % classes;
            let class_name = format!("Perf.Class{:02}", class);
            let method = format!("case{:04}", case / classes);
            let expected = sizes.get(&class).copied().unwrap_or(1);
            let message = CompletionMessage::new(
                format!("{}.{}", class_name, method),
                self.outcome(),
                self.timings(baselines[class]),
            )
            .with_metadata(MetadataKey::TestClassName, class_name)
            .with_metadata(MetadataKey::MethodName, method)
            .with_metadata(MetadataKey::ExpectedBatchSize, expected as i64);
            messages.push(message);
        }
        messages.shuffle(&mut self.rng);

        debug!(
            "Generated {} case(s) across {} class(es)",
            messages.len(),
            classes
        );
        messages
    }

    fn outcome(&mut self) -> TestOutcome {
        if self.rng.gen_bool(self.spec.failure_ratio) {
            TestOutcome::failed("measured mean exceeded the regression threshold", "RegressionError")
        } else {
            TestOutcome::passed()
        }
    }

    fn timings(&mut self, baseline_ms: f64) -> PerformanceSummary {
        let samples = (0..self.spec.samples_per_case)
            .map(|_| baseline_ms * self.rng.gen_range(0.85..1.25))
            .collect();
        PerformanceSummary::from_samples(samples)
    }
}
