//! # Completion Publisher
//!
//! Producer-side entry point of the pipeline: validates each finished test
//! case, enqueues it and records the publish in metrics.

use crate::error::PipelineResult;
use crate::message::CompletionMessage;
use crate::metrics::MetricsCollector;
use crate::queue::CompletionQueue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Producer-side handle onto the completion queue.
///
/// Cheap to clone; every producer task gets its own. Publishing validates the
/// message, enqueues it (waiting for capacity up to the publish timeout) and
/// records the publish and the resulting queue depth.
#[derive(Clone)]
pub struct CompletionPublisher {
    queue: Arc<CompletionQueue>,
    metrics: Arc<MetricsCollector>,
}

impl CompletionPublisher {
    pub fn new(queue: Arc<CompletionQueue>, metrics: Arc<MetricsCollector>) -> Self {
        Self { queue, metrics }
    }

    pub async fn publish(&self, message: CompletionMessage) -> PipelineResult<()> {
        let case_id = message.test_case_id.clone();
        if let Err(e) = self.queue.enqueue(message).await {
            warn!("Failed to publish {}: {}", case_id, e);
            return Err(e);
        }
        self.record(&case_id);
        Ok(())
    }

    /// Publish without waiting for capacity.
    pub fn try_publish(&self, message: CompletionMessage) -> PipelineResult<()> {
        let case_id = message.test_case_id.clone();
        self.queue.try_enqueue(message)?;
        self.record(&case_id);
        Ok(())
    }

    fn record(&self, case_id: &str) {
        if let Err(e) = self.metrics.record_message_published(case_id) {
            debug!("Could not record publish of {}: {}", case_id, e);
        }
        self.metrics.record_queue_depth(self.queue.depth());
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::message::{PerformanceSummary, TestOutcome};

    fn publisher(capacity: usize) -> CompletionPublisher {
        let queue = Arc::new(CompletionQueue::with_capacity(capacity));
        queue.start().unwrap();
        CompletionPublisher::new(queue, Arc::new(MetricsCollector::default()))
    }

    fn message(id: &str) -> CompletionMessage {
        CompletionMessage::new(id, TestOutcome::passed(), PerformanceSummary::default())
    }

    #[tokio::test]
    async fn test_publish_records_metrics() {
        let publisher = publisher(4);
        publisher.publish(message("A.one")).await.unwrap();
        publisher.try_publish(message("A.two")).unwrap();

        assert_eq!(publisher.queue_depth(), 2);
        assert_eq!(publisher.metrics.totals().published, 2);
        let depth = publisher.metrics.get_queue_depth_metrics(None, None).unwrap();
        assert_eq!(depth.current_depth, 2);
        assert_eq!(depth.peak_depth, 2);
        assert_eq!(publisher.metrics.get_message_history("A.one").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_messages_are_not_counted() {
        let publisher = publisher(1);
        assert!(matches!(
            publisher.publish(message("  ")).await,
            Err(PipelineError::Validation(_))
        ));
        publisher.try_publish(message("A.one")).unwrap();
        assert!(matches!(
            publisher.try_publish(message("A.two")),
            Err(PipelineError::QueueFull { capacity: 1 })
        ));
        assert_eq!(publisher.metrics.totals().published, 1);
    }
}
