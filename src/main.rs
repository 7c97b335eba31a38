//! # Completion Pipeline - Main Entry Point
//!
//! Replays or generates a workload of completion messages, pushes it through
//! the pipeline and writes the batch reports.
//!
//! 1. **Initialize logging**: colored `tracing` output, optionally mirrored to a file
//! 2. **Parse arguments**: build a validated `PipelineConfig`
//! 3. **Load the workload**: `--input` JSON lines, or a seeded synthetic set
//! 4. **Run**: publish from `--producers` concurrent tasks, then drain
//! 5. **Report**: finalize the JSON report and print a summary
//!
//! Ctrl-C during publishing shuts the pipeline down without draining.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use completion_pipeline::{
    cli::Args,
    health::HealthLevel,
    logging::init_logging,
    utils::{format_duration, format_message_rate, format_millis, format_percentage},
    workload::{load_messages, WorkloadGenerator},
    CompletionMessage, CompletionPipeline, CompletionPublisher, JsonReportWriter, PipelineConfig,
    PipelineSummary,
};
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.verbose, args.plain_logs, args.log_file.as_deref())?;

    info!("Starting Completion Pipeline v{}", completion_pipeline::VERSION);
    let config = PipelineConfig::from_args(&args)?;

    let messages = match args.input {
        Some(ref path) => load_messages(path)?,
        None => {
            let mut generator = WorkloadGenerator::new(args.workload_spec())?;
            let messages = generator.generate();
            info!(
                "Generated synthetic workload: {} case(s) across {} class(es)",
                messages.len(),
                generator.spec().classes
            );
            messages
        }
    };

    let writer = Arc::new(JsonReportWriter::new(&args.output));
    if let Some(ref streaming_file) = args.streaming_output {
        info!("Streaming batch reports to: {:?}", streaming_file);
        writer.enable_streaming(streaming_file)?;
    }

    let pipeline = CompletionPipeline::new(config, writer.clone())?;
    pipeline.start()?;
    watch_health(&pipeline);

    let producers = args.producers.max(1);
    tokio::select! {
        published = publish_all(pipeline.publisher(), messages, producers) => {
            let (published, rejected) = published?;
            info!("Published {} message(s), {} rejected", published, rejected);
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; shutting down without draining");
            pipeline.shutdown().await;
            return Ok(());
        }
    }

    let summary = pipeline.complete().await?;
    writer.finalize(&summary)?;
    print_summary(&summary);

    info!("Completion Pipeline finished");
    Ok(())
}

/// Publish `messages` round-robin from `producers` concurrent tasks.
///
/// Returns `(published, rejected)`. A rejected message is logged by the
/// publisher and does not stop the others.
async fn publish_all(
    publisher: CompletionPublisher,
    messages: Vec<CompletionMessage>,
    producers: usize,
) -> Result<(usize, usize)> {
    let mut shards: Vec<Vec<CompletionMessage>> = (0..producers).map(|_| Vec::new()).collect();
    for (i, message) in messages.into_iter().enumerate() {
        shards[i % producers].push(message);
    }

    let handles: Vec<_> = shards
        .into_iter()
        .map(|shard| {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                let mut published = 0usize;
                let mut rejected = 0usize;
                for message in shard {
                    match publisher.publish(message).await {
                        Ok(()) => published += 1,
                        Err(_) => rejected += 1,
                    }
                }
                (published, rejected)
            })
        })
        .collect();

    let mut totals = (0, 0);
    for handle in handles {
        let (published, rejected) = handle.await.context("Producer task panicked")?;
        totals.0 += published;
        totals.1 += rejected;
    }
    Ok(totals)
}

/// Log health level changes while the pipeline runs.
fn watch_health(pipeline: &CompletionPipeline) {
    let mut changes = pipeline.health().subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            match change.current.level {
                HealthLevel::Healthy => info!("Health recovered: {}", change.current.status),
                HealthLevel::Warning => warn!("Health degraded: {}", change.current.status),
                _ => error!("Health {}: {}", change.current.level, change.current.status),
            }
        }
    });
}

fn print_summary(summary: &PipelineSummary) {
    println!();
    println!("{}", "Completion Pipeline Summary".bold().underline());
    println!("  Uptime:              {}", format_duration(summary.uptime));
    println!(
        "  Messages:            {} published, {} processed, {} failed, {} retries",
        summary.totals.published,
        summary.totals.processed,
        summary.totals.failed,
        summary.totals.retried
    );
    println!(
        "  Throughput:          {} (peak {})",
        format_message_rate(summary.processing.average_rate_per_second),
        format_message_rate(summary.processing.peak_rate_per_second)
    );
    println!(
        "  Processing latency:  {} avg, {} peak",
        format_millis(summary.processing.average_latency_ms),
        format_millis(summary.processing.peak_latency_ms)
    );
    println!(
        "  Batches:             {} total, {} completed, {} timed out, {} failed",
        summary.batches.total_batches,
        summary.batches.completed_batches,
        summary.batches.timed_out_batches,
        summary.batches.failed_batches
    );
    println!(
        "  Batch rates:         {} completed, {} timed out, avg size {:.1}",
        format_percentage(summary.batches.completion_rate),
        format_percentage(summary.batches.timeout_rate),
        summary.batches.average_batch_size
    );
    println!(
        "  Drain:               {} forced, {} reported, {} failed, {} unreported",
        summary.drain.forced_complete,
        summary.drain.dispatch.reported,
        summary.drain.dispatch.failed,
        summary.drain.remaining_batches
    );
    if let Some(ref outcome) = summary.last_optimization {
        println!(
            "  Last optimization:   {} (score {:.0}, {} change(s), {})",
            outcome.strategy,
            outcome.score,
            outcome.changes.len(),
            if outcome.applied { "applied" } else { "advisory" }
        );
    }

    let health = format!("{}: {}", summary.health.level, summary.health.status);
    let health = match summary.health.level {
        HealthLevel::Healthy => health.green(),
        HealthLevel::Warning => health.yellow(),
        HealthLevel::Unhealthy | HealthLevel::Critical => health.red().bold(),
    };
    println!("  Health:              {}", health);
    println!();
}
