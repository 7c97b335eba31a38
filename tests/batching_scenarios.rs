use anyhow::Result;
use completion_pipeline::{
    BatchStatus, BatchingService, CompletionMessage, GroupingStrategy, MetadataKey,
    PerformanceSummary, SharedTuning, TestOutcome,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

fn running(strategy: GroupingStrategy) -> Result<BatchingService> {
    let service = BatchingService::new(strategy, SharedTuning::default());
    service.start()?;
    Ok(service)
}

fn case(id: &str) -> CompletionMessage {
    CompletionMessage::new(id, TestOutcome::passed(), PerformanceSummary::default())
}

#[test]
fn class_batch_completes_on_third_message() -> Result<()> {
    let service = running(GroupingStrategy::ByTestClass)?;
    let mut ids = Vec::new();
    for method in ["first", "second", "third"] {
        let message = case(&format!("ClassA.{}", method))
            .with_metadata(MetadataKey::TestClassName, "ClassA")
            .with_metadata(MetadataKey::ExpectedBatchSize, 3i64);
        ids.push(service.add_to_batch(message)?);
        if ids.len() < 3 {
            assert_eq!(service.get_batch_status(&ids[0])?, BatchStatus::Pending);
            assert!(service.get_completed_batches().is_empty());
        }
    }

    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(service.get_batch_status(&ids[0])?, BatchStatus::Complete);
    assert!(service.is_batch_complete(&ids[0])?);

    let completed = service.get_completed_batches();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].len(), 3);
    assert_eq!(completed[0].grouping_criteria, "TestClass_ClassA");
    assert!(service.get_pending_batches().is_empty());
    Ok(())
}

#[test]
fn hundred_singletons_from_ten_threads() -> Result<()> {
    let service = Arc::new(running(GroupingStrategy::None)?);

    let handles: Vec<_> = (0..10)
        .map(|producer| {
            let service = service.clone();
            thread::spawn(move || {
                (0..10)
                    .map(|i| service.add_to_batch(case(&format!("Producer{}.case{}", producer, i))))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut batch_ids = BTreeSet::new();
    for handle in handles {
        for id in handle.join().expect("producer thread panicked") {
            assert!(batch_ids.insert(id?), "duplicate batch id");
        }
    }
    assert_eq!(batch_ids.len(), 100);

    let batches = service.get_all_batches();
    assert_eq!(batches.len(), 100);
    let mut cases = BTreeSet::new();
    for batch in &batches {
        assert_eq!(batch.status, BatchStatus::Complete);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.expected_size, Some(1));
        assert!(cases.insert(batch.messages[0].test_case_id.clone()));
    }
    assert_eq!(cases.len(), 100);
    Ok(())
}

#[test]
fn equal_keys_share_a_pending_batch_under_every_strategy() -> Result<()> {
    let pairs: Vec<(GroupingStrategy, CompletionMessage, CompletionMessage)> = vec![
        (
            GroupingStrategy::ByTestClass,
            case("Suite.a"),
            case("Suite.b"),
        ),
        (
            GroupingStrategy::ByComparisonAttribute,
            case("X.a").with_metadata(MetadataKey::ComparisonGroup, "baseline"),
            case("Y.b").with_metadata(MetadataKey::ComparisonGroup, "baseline"),
        ),
        (
            GroupingStrategy::ByCustomCriteria,
            case("X.a").with_metadata(MetadataKey::BatchingCriteria, "nightly"),
            case("Y.b").with_metadata(MetadataKey::BatchingCriteria, "nightly"),
        ),
        (
            GroupingStrategy::ByExecutionContext,
            case("X.a").with_metadata(MetadataKey::ExecutionContext, "linux-x64"),
            case("Y.b").with_metadata(MetadataKey::ExecutionContext, "linux-x64"),
        ),
        (
            GroupingStrategy::ByPerformanceProfile,
            CompletionMessage::new(
                "X.a",
                TestOutcome::passed(),
                PerformanceSummary::from_samples(vec![20.0, 22.0]),
            ),
            CompletionMessage::new(
                "Y.b",
                TestOutcome::passed(),
                PerformanceSummary::from_samples(vec![55.0, 60.0]),
            ),
        ),
    ];

    for (strategy, first, second) in pairs {
        let service = running(strategy)?;
        let a = service.add_to_batch(first)?;
        let b = service.add_to_batch(second)?;
        assert_eq!(a, b, "strategy {} split equal keys", strategy);
        assert_eq!(service.get_batch_status(&a)?, BatchStatus::Pending);
        assert_eq!(service.get_pending_batches().len(), 1);
    }
    Ok(())
}

#[test]
fn remove_batch_is_idempotent() -> Result<()> {
    let service = running(GroupingStrategy::ByTestClass)?;
    let keep = service.add_to_batch(case("Keep.one"))?;
    let drop = service.add_to_batch(case("Drop.one"))?;

    assert!(service.remove_batch(&drop));
    assert!(!service.remove_batch(&drop));
    assert!(!service.remove_batch("never-existed"));
    assert_eq!(service.batch_count(), 1);
    assert!(service.get_batch(&keep).is_some());

    // The removed key opens a fresh batch.
    let reopened = service.add_to_batch(case("Drop.two"))?;
    assert_ne!(reopened, drop);
    Ok(())
}

#[test]
fn complete_all_flushes_partial_batches() -> Result<()> {
    let service = running(GroupingStrategy::ByTestClass)?;
    for i in 0..3 {
        service.add_to_batch(
            case(&format!("Partial.case{}", i)).with_metadata(MetadataKey::ExpectedBatchSize, 10i64),
        )?;
    }
    service.add_to_batch(case("Other.case0"))?;

    assert_eq!(service.complete_all(), 2);
    assert!(service.get_pending_batches().is_empty());
    assert_eq!(service.get_completed_batches().len(), 2);
    assert!(service.add_to_batch(case("Late.case0")).is_err());
    Ok(())
}
