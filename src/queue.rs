//! # Completion Queue
//!
//! Bounded, thread-safe FIFO that is the single hand-off point between the
//! producers publishing finished test cases and the consumer workers that
//! feed the batching service.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──start──► Running ──stop──► Stopped ──start──► Running
//!    │                  │                  │
//!    └──────────────────┴──complete────────┴──► Completed (terminal)
//! ```
//!
//! Only a `Running` queue accepts messages. A `Stopped` queue can still be
//! drained. Once `Completed` and empty, every waiting and future `dequeue`
//! returns `None` immediately so consumers exit cleanly.
//!
//! ## Concurrency
//!
//! The buffer and lifecycle state sit behind one `parking_lot::Mutex` that is
//! never held across an `.await`. Waiting is done on two `tokio::sync::Notify`
//! instances, one for consumers and one for producers blocked on capacity.
//! Capacity is read from [`SharedTuning`] on every check, so the optimizer can
//! grow or shrink it while the queue is live.

use crate::config::SharedTuning;
use crate::error::{PipelineError, PipelineResult};
use crate::message::CompletionMessage;
use crate::shutdown::ShutdownSignal;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// Lifecycle state of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Created,
    Running,
    Stopped,
    Completed,
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Created => write!(f, "created"),
            QueueState::Running => write!(f, "running"),
            QueueState::Stopped => write!(f, "stopped"),
            QueueState::Completed => write!(f, "completed"),
        }
    }
}

struct QueueInner {
    state: QueueState,
    buffer: VecDeque<CompletionMessage>,
}

/// Bounded in-memory completion queue.
pub struct CompletionQueue {
    inner: Mutex<QueueInner>,
    not_empty: Notify,
    not_full: Notify,
    tuning: SharedTuning,
    publish_timeout: Duration,
}

impl CompletionQueue {
    pub fn new(tuning: SharedTuning, publish_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                state: QueueState::Created,
                buffer: VecDeque::new(),
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            tuning,
            publish_timeout,
        }
    }

    /// Queue with a fixed capacity and the default publish timeout.
    pub fn with_capacity(capacity: usize) -> Self {
        let tuning = SharedTuning::default();
        tuning.update(|s| s.queue_capacity = capacity);
        Self::new(tuning, crate::defaults::PUBLISH_TIMEOUT)
    }

    pub fn start(&self) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            QueueState::Running => Err(PipelineError::invalid_state("queue is already running")),
            QueueState::Completed => Err(PipelineError::invalid_state(
                "queue has been completed and cannot be restarted",
            )),
            QueueState::Created | QueueState::Stopped => {
                inner.state = QueueState::Running;
                info!("Completion queue started (capacity {})", self.capacity());
                Ok(())
            }
        }
    }

    /// Stop accepting messages. Buffered messages can still be dequeued.
    pub fn stop(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == QueueState::Completed {
                return;
            }
            inner.state = QueueState::Stopped;
        }
        // Producers waiting for capacity must observe the new state.
        self.not_full.notify_waiters();
        info!("Completion queue stopped");
    }

    /// Signal that no more messages will arrive. Idempotent.
    pub fn complete(&self) {
        let remaining = {
            let mut inner = self.inner.lock();
            if inner.state == QueueState::Completed {
                return;
            }
            inner.state = QueueState::Completed;
            inner.buffer.len()
        };
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        info!("Completion queue completed with {} message(s) left to drain", remaining);
    }

    /// Enqueue without waiting. Fails with `QueueFull` at capacity.
    pub fn try_enqueue(&self, message: CompletionMessage) -> PipelineResult<()> {
        message.validate()?;
        let capacity = self.capacity();
        {
            let mut inner = self.inner.lock();
            Self::ensure_accepting(inner.state)?;
            if inner.buffer.len() >= capacity {
                return Err(PipelineError::QueueFull { capacity });
            }
            inner.buffer.push_back(message);
        }
        self.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue, waiting up to the publish timeout for free capacity.
    pub async fn enqueue(&self, message: CompletionMessage) -> PipelineResult<()> {
        message.validate()?;
        let deadline = Instant::now() + self.publish_timeout;
        let mut tuning_rx = self.tuning.subscribe();

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let capacity = self.capacity();
            {
                let mut inner = self.inner.lock();
                Self::ensure_accepting(inner.state)?;
                if inner.buffer.len() < capacity {
                    inner.buffer.push_back(message);
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            debug!("Completion queue full ({}), waiting for capacity", capacity);
            tokio::select! {
                _ = &mut notified => {}
                changed = tuning_rx.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep_until(deadline).await;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(PipelineError::QueueFull { capacity });
                }
            }
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` once the queue is completed and drained, and
    /// `Err(Cancelled)` if `shutdown` fires first.
    pub async fn dequeue(
        &self,
        shutdown: &ShutdownSignal,
    ) -> PipelineResult<Option<CompletionMessage>> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if let Some(message) = inner.buffer.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(Some(message));
                }
                if inner.state == QueueState::Completed {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.cancelled() => {
                    // Pass on a wake-up this consumer may have absorbed.
                    if self.depth() > 0 {
                        self.not_empty.notify_one();
                    }
                    return Err(PipelineError::Cancelled);
                }
            }
        }
    }

    /// Take the next message if one is buffered. Never waits.
    pub fn try_dequeue(&self) -> Option<CompletionMessage> {
        let message = self.inner.lock().buffer.pop_front();
        if message.is_some() {
            self.not_full.notify_one();
        }
        message
    }

    /// Exact number of buffered messages.
    pub fn depth(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.tuning.queue_capacity()
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == QueueState::Running
    }

    pub fn is_completed(&self) -> bool {
        self.state() == QueueState::Completed
    }

    fn ensure_accepting(state: QueueState) -> PipelineResult<()> {
        match state {
            QueueState::Running => Ok(()),
            other => Err(PipelineError::invalid_state(format!(
                "cannot enqueue: queue is {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{PerformanceSummary, TestOutcome};
    use std::sync::Arc;

    fn message(id: &str) -> CompletionMessage {
        CompletionMessage::new(id, TestOutcome::passed(), PerformanceSummary::default())
    }

    #[test]
    fn test_lifecycle_rules() {
        let queue = CompletionQueue::with_capacity(4);
        assert_eq!(queue.state(), QueueState::Created);
        assert!(queue.try_enqueue(message("a")).is_err());

        queue.start().unwrap();
        assert!(matches!(queue.start(), Err(PipelineError::InvalidState(_))));

        queue.stop();
        assert!(!queue.is_running());
        assert!(matches!(
            queue.try_enqueue(message("a")),
            Err(PipelineError::InvalidState(_))
        ));

        queue.start().unwrap();
        queue.complete();
        assert!(queue.is_completed());
        assert!(matches!(queue.start(), Err(PipelineError::InvalidState(_))));
        assert!(matches!(
            queue.try_enqueue(message("a")),
            Err(PipelineError::InvalidState(_))
        ));
    }

    #[test]
    fn test_empty_id_is_rejected_before_state_check() {
        let queue = CompletionQueue::with_capacity(4);
        let err = queue.try_enqueue(message("")).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn test_try_enqueue_respects_capacity() {
        let queue = CompletionQueue::with_capacity(2);
        queue.start().unwrap();
        queue.try_enqueue(message("a")).unwrap();
        queue.try_enqueue(message("b")).unwrap();
        assert_eq!(
            queue.try_enqueue(message("c")),
            Err(PipelineError::QueueFull { capacity: 2 })
        );
        assert_eq!(queue.depth(), 2);

        assert_eq!(queue.try_dequeue().unwrap().test_case_id, "a");
        assert_eq!(queue.depth(), 1);
        queue.try_enqueue(message("c")).unwrap();
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = CompletionQueue::with_capacity(16);
        queue.start().unwrap();
        for i in 0..10 {
            queue.enqueue(message(&format!("case-{}", i))).await.unwrap();
        }

        let signal = ShutdownSignal::never();
        for i in 0..10 {
            let next = queue.dequeue(&signal).await.unwrap().unwrap();
            assert_eq!(next.test_case_id, format!("case-{}", i));
        }
        assert!(queue.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_complete_releases_waiting_consumers() {
        let queue = Arc::new(CompletionQueue::with_capacity(4));
        queue.start().unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move {
                queue.dequeue(&ShutdownSignal::never()).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.complete();

        for waiter in waiters {
            let result = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("consumer should be released")
                .unwrap();
            assert_eq!(result, Ok(None));
        }
    }

    #[tokio::test]
    async fn test_drains_before_reporting_empty() {
        let queue = CompletionQueue::with_capacity(4);
        queue.start().unwrap();
        queue.enqueue(message("a")).await.unwrap();
        queue.complete();

        let signal = ShutdownSignal::never();
        assert!(queue.dequeue(&signal).await.unwrap().is_some());
        assert!(queue.dequeue(&signal).await.unwrap().is_none());
        assert!(queue.dequeue(&signal).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_honours_cancellation() {
        let queue = CompletionQueue::with_capacity(4);
        queue.start().unwrap();
        let (trigger, signal) = crate::shutdown::channel();
        trigger.trigger();
        assert_eq!(queue.dequeue(&signal).await, Err(PipelineError::Cancelled));
    }

    #[tokio::test]
    async fn test_enqueue_waits_for_capacity() {
        let queue = Arc::new(CompletionQueue::with_capacity(1));
        queue.start().unwrap();
        queue.enqueue(message("a")).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(message("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.try_dequeue().unwrap().test_case_id, "a");
        producer.await.unwrap().unwrap();
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_times_out_when_full() {
        let tuning = SharedTuning::default();
        tuning.update(|s| s.queue_capacity = 1);
        let queue = CompletionQueue::new(tuning, Duration::from_millis(30));
        queue.start().unwrap();
        queue.enqueue(message("a")).await.unwrap();

        let err = queue.enqueue(message("b")).await.unwrap_err();
        assert_eq!(err, PipelineError::QueueFull { capacity: 1 });
    }

    #[tokio::test]
    async fn test_capacity_growth_wakes_blocked_producer() {
        let tuning = SharedTuning::default();
        tuning.update(|s| s.queue_capacity = 1);
        let queue = Arc::new(CompletionQueue::new(tuning.clone(), Duration::from_secs(5)));
        queue.start().unwrap();
        queue.enqueue(message("a")).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(message("b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tuning.update(|s| s.queue_capacity = 2);

        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should be woken by capacity change")
            .unwrap()
            .unwrap();
        assert_eq!(queue.depth(), 2);
    }
}
