//! # Consumer Pool
//!
//! Workers draining the completion queue into the batching service.
//!
//! Each worker loops on [`CompletionQueue::dequeue`], places the message in
//! its batch, records the outcome in metrics and dispatches the batch as soon
//! as it becomes `Complete`. Workers exit when the queue is completed and
//! drained, or when the pool is stopped.

use crate::batching::BatchingService;
use crate::dispatch::BatchDispatcher;
use crate::error::PipelineError;
use crate::message::{BatchStatus, CompletionMessage};
use crate::metrics::MetricsCollector;
use crate::queue::CompletionQueue;
use crate::shutdown::{BackgroundTask, ShutdownSignal};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Processor name under which batching outcomes are recorded.
pub const BATCHING_PROCESSOR: &str = "batching";

/// Pause after an unexpected dequeue error before trying again.
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a worker touches, shared by all workers of a pool.
#[derive(Clone)]
pub struct ConsumerContext {
    pub queue: Arc<CompletionQueue>,
    pub batching: Arc<BatchingService>,
    pub metrics: Arc<MetricsCollector>,
    pub dispatcher: Arc<BatchDispatcher>,
}

impl ConsumerContext {
    /// Batch one message, record it, and dispatch its batch if that completed it.
    pub async fn handle(&self, message: CompletionMessage) {
        let started = Instant::now();
        let case_id = message.test_case_id.clone();

        match self.batching.add_to_batch(message) {
            Ok(batch_id) => {
                if let Err(e) =
                    self.metrics
                        .record_message_processed(&case_id, BATCHING_PROCESSOR, started.elapsed())
                {
                    debug!("Could not record processed message: {}", e);
                }
                self.metrics.record_queue_depth(self.queue.depth());

                if matches!(self.batching.get_batch_status(&batch_id), Ok(BatchStatus::Complete)) {
                    if let Err(e) = self.dispatcher.dispatch(&batch_id).await {
                        warn!("Dispatch of batch {} failed: {}", batch_id, e);
                    }
                }
            }
            Err(e) => {
                warn!("Could not batch {}: {}", case_id, e);
                if let Err(record_err) =
                    self.metrics
                        .record_message_failed(&case_id, BATCHING_PROCESSOR, &e.to_string())
                {
                    debug!("Could not record failed message: {}", record_err);
                }
                self.metrics.record_queue_depth(self.queue.depth());
            }
        }
    }
}

async fn worker_loop(worker: usize, context: ConsumerContext, signal: ShutdownSignal) {
    let mut handled = 0usize;
    loop {
        match context.queue.dequeue(&signal).await {
            Ok(Some(message)) => {
                context.handle(message).await;
                handled += 1;
            }
            Ok(None) => {
                debug!("Consumer {} found the queue completed and drained", worker);
                break;
            }
            Err(PipelineError::Cancelled) => {
                debug!("Consumer {} cancelled", worker);
                break;
            }
            Err(e) => {
                warn!("Consumer {} dequeue error: {}", worker, e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
    info!("Consumer {} exiting after {} message(s)", worker, handled);
}

/// A fixed-size pool of consumer workers.
pub struct ConsumerPool {
    workers: Vec<BackgroundTask>,
}

impl ConsumerPool {
    pub fn spawn(workers: usize, context: ConsumerContext) -> Self {
        let workers = (0..workers.max(1))
            .map(|worker| {
                let context = context.clone();
                BackgroundTask::spawn("consumer", move |signal| {
                    worker_loop(worker, context, signal)
                })
            })
            .collect::<Vec<_>>();
        info!("Started {} consumer worker(s)", workers.len());
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit on its own (queue completed and drained).
    pub async fn join(self) {
        for worker in self.workers {
            worker.join().await;
        }
    }

    /// Cancel every worker and wait for them to exit.
    pub async fn stop(self) {
        for worker in self.workers {
            worker.stop().await;
        }
    }
}
