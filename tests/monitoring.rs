use anyhow::Result;
use completion_pipeline::{
    config::{HealthThresholds, OptimizerSettings},
    optimizer::BottleneckKind,
    CompletionMessage, CompletionQueue, HealthLevel, HealthMonitor, MetricsCollector,
    OptimizationStrategy, PerformanceOptimizer, PerformanceSummary, SharedTuning, TestOutcome,
};
use std::sync::Arc;
use std::time::Duration;

const WINDOW: Duration = Duration::from_secs(300);

fn record_outcomes(metrics: &MetricsCollector, prefix: &str, processed: usize, failed: usize) -> Result<()> {
    for i in 0..processed {
        metrics.record_message_processed(&format!("{}.ok{}", prefix, i), "batching", Duration::from_millis(5))?;
    }
    for i in 0..failed {
        metrics.record_message_failed(&format!("{}.bad{}", prefix, i), "reporter", "sink unavailable")?;
    }
    Ok(())
}

#[tokio::test]
async fn health_degrades_step_by_step_and_broadcasts_each_change() -> Result<()> {
    let metrics = Arc::new(MetricsCollector::default());
    let monitor = HealthMonitor::new(
        metrics.clone(),
        SharedTuning::default(),
        HealthThresholds::default(),
        Duration::from_secs(3600),
        WINDOW,
    );
    let mut changes = monitor.subscribe();

    assert_eq!(monitor.check_now().level, HealthLevel::Healthy);

    // 1 of 10 failed: 10% error rate.
    record_outcomes(&metrics, "First", 9, 1)?;
    let warning = monitor.check_now();
    assert_eq!(warning.level, HealthLevel::Warning);
    assert!(warning.status.contains("error rate"));

    // 4 of 16 failed: 25% error rate.
    record_outcomes(&metrics, "Second", 3, 3)?;
    assert_eq!(monitor.check_now().level, HealthLevel::Unhealthy);

    // Unchanged level: a status is produced but no event.
    assert_eq!(monitor.check_now().level, HealthLevel::Unhealthy);

    let first = changes.try_recv()?;
    assert_eq!(first.previous.level, HealthLevel::Healthy);
    assert_eq!(first.current.level, HealthLevel::Warning);
    let second = changes.try_recv()?;
    assert_eq!(second.previous.level, HealthLevel::Warning);
    assert_eq!(second.current.level, HealthLevel::Unhealthy);
    assert!(changes.try_recv().is_err());

    assert_eq!(monitor.get_health_status().level, HealthLevel::Unhealthy);
    Ok(())
}

#[tokio::test]
async fn saturated_queue_is_detected_and_capacity_grows() -> Result<()> {
    let metrics = Arc::new(MetricsCollector::default());
    let tuning = SharedTuning::default();
    let queue = CompletionQueue::new(tuning.clone(), Duration::from_secs(1));
    let before = queue.capacity();

    let settings = OptimizerSettings {
        initial_strategy: OptimizationStrategy::Balanced,
        ..OptimizerSettings::default()
    };
    let optimizer = PerformanceOptimizer::new(metrics.clone(), tuning.clone(), settings.clone(), WINDOW);
    let mut applied = optimizer.subscribe_applied();
    let mut bottlenecks = optimizer.subscribe_bottlenecks();

    metrics.record_queue_depth(before * 95 / 100);

    let analysis = optimizer.analyze_performance()?;
    assert!(analysis.score < 100.0);
    assert!(analysis.severity_of(BottleneckKind::QueueCapacity).is_some());
    let detected = bottlenecks.try_recv()?;
    assert_eq!(detected.bottleneck.kind, BottleneckKind::QueueCapacity);

    let recommendations = optimizer.get_optimization_recommendations()?;
    assert!(recommendations
        .iter()
        .any(|r| r.configuration_changes.contains_key("queue_capacity")));

    let outcome = optimizer.optimize_configuration()?;
    assert!(outcome.applied);
    assert!(outcome.changes.iter().any(|c| c.parameter == "queue_capacity"));

    let event = applied.try_recv()?;
    assert_eq!(event.previous.queue_capacity, before);
    assert!(event.current.queue_capacity > before);
    assert!(event.current.queue_capacity <= settings.max_queue_capacity);

    // The queue reads the shared settings, so the change is live.
    assert_eq!(queue.capacity(), event.current.queue_capacity);
    assert_eq!(optimizer.last_outcome(), Some(outcome));
    Ok(())
}

#[tokio::test]
async fn background_monitors_start_and_stop_cleanly() -> Result<()> {
    let metrics = Arc::new(MetricsCollector::default());
    let tuning = SharedTuning::default();
    let monitor = Arc::new(HealthMonitor::new(
        metrics.clone(),
        tuning.clone(),
        HealthThresholds::default(),
        Duration::from_millis(10),
        WINDOW,
    ));
    let optimizer = Arc::new(PerformanceOptimizer::new(
        metrics,
        tuning,
        OptimizerSettings {
            interval: Duration::from_millis(10),
            auto_apply: false,
            ..OptimizerSettings::default()
        },
        WINDOW,
    ));

    monitor.start()?;
    optimizer.start()?;
    assert!(monitor.start().is_err());
    assert!(optimizer.start().is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ne!(monitor.get_health_status().status, "Not started");

    monitor.stop().await;
    optimizer.stop().await;
    assert!(!monitor.is_running());
    assert!(!optimizer.is_running());
    // Advisory mode never records an applied outcome.
    assert!(optimizer.last_outcome().is_none());
    Ok(())
}

#[tokio::test]
async fn attached_queue_gives_live_depth_readings() -> Result<()> {
    let metrics = Arc::new(MetricsCollector::default());
    let tuning = SharedTuning::default();
    let queue = Arc::new(CompletionQueue::new(tuning.clone(), Duration::from_secs(1)));
    queue.start()?;

    // Enqueued directly, so no depth sample reaches the collector.
    for i in 0..3 {
        queue.try_enqueue(CompletionMessage::new(
            format!("Idle.case{}", i),
            TestOutcome::passed(),
            PerformanceSummary::default(),
        ))?;
    }

    let detached = HealthMonitor::new(
        metrics.clone(),
        tuning.clone(),
        HealthThresholds::default(),
        Duration::from_secs(3600),
        WINDOW,
    );
    assert_eq!(detached.get_health_metrics()?.queue_depth, 0);

    let attached = HealthMonitor::new(
        metrics.clone(),
        tuning.clone(),
        HealthThresholds::default(),
        Duration::from_secs(3600),
        WINDOW,
    )
    .with_queue(queue.clone());
    assert_eq!(attached.get_health_metrics()?.queue_depth, 3);

    assert!(queue.try_dequeue().is_some());
    assert_eq!(attached.get_health_metrics()?.queue_depth, 2);

    let optimizer = PerformanceOptimizer::new(
        metrics,
        tuning,
        OptimizerSettings::default(),
        WINDOW,
    )
    .with_queue(queue.clone());
    assert_eq!(optimizer.analyze_performance()?.metrics.queue_depth, 2);
    Ok(())
}
