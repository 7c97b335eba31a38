//! # Shutdown Signalling
//!
//! Cancellation signal for blocking and periodic operations.
//!
//! A [`ShutdownTrigger`] flips a `tokio::sync::watch` flag once; any number
//! of cloned [`ShutdownSignal`]s observe it. Background tasks select on
//! [`ShutdownSignal::cancelled`] next to their timer or their `dequeue`.
//! [`BackgroundTask`] bundles a spawned task with the trigger that stops it.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
    // Keeps the sender alive for signals that can never fire.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx },
        ShutdownSignal {
            rx,
            _keepalive: None,
        },
    )
}

impl ShutdownTrigger {
    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            _keepalive: None,
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal fires, or once its trigger is dropped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A spawned task paired with the trigger that cancels it.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` on the current runtime with a fresh cancellation signal.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (trigger, signal) = channel();
        let handle = tokio::spawn(body(signal));
        Self {
            name,
            trigger,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to end on its own, without cancelling it.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!("{} task ended abnormally: {}", self.name, e);
        }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(self) {
        self.trigger.trigger();
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_every_clone() {
        let (trigger, signal) = channel();
        let other = signal.clone();

        let waiter = tokio::spawn(async move { other.cancelled().await });
        assert!(!signal.is_cancelled());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(signal.is_cancelled());
        assert!(trigger.is_triggered());
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let signal = ShutdownSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_background_task_stops_on_trigger() {
        let task = BackgroundTask::spawn("sleeper", |signal| async move {
            signal.cancelled().await;
        });
        assert_eq!(task.name(), "sleeper");
        assert!(!task.is_finished());
        tokio::time::timeout(Duration::from_secs(1), task.stop())
            .await
            .expect("stop should cancel the task");
    }

    #[tokio::test]
    async fn test_dropped_trigger_releases_waiters() {
        let (trigger, signal) = channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("dropping the trigger should release waiters");
    }
}
