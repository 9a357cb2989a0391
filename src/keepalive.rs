//! Background task that periodically forces a status update while the stream is idle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ReplicationError;
use crate::stream::FeedbackSender;
use crate::tracing_context::TracingContext;

/// Runs on a caller-provided `tokio::runtime::Handle`. Cancellation is cooperative: `stop`
/// clears `running` and wakes the loop's `Notify` so the final sleep is cut short.
pub struct KeepaliveLoop {
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    error_rx: watch::Receiver<Option<Arc<ReplicationError>>>,
    join_handle: Option<JoinHandle<()>>,
}

impl KeepaliveLoop {
    pub fn start(
        handle: Arc<dyn FeedbackSender>,
        interval: Duration,
        executor: &tokio::runtime::Handle,
        parent: &TracingContext,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let notify = Arc::new(Notify::new());
        let (error_tx, error_rx) = watch::channel(None);

        let running_task = running.clone();
        let notify_task = notify.clone();
        let context = parent.child_context("keepalive");

        let join_handle = executor.spawn(async move {
            // tokio::time::interval with Delay never races ahead after a slow tick, the
            // idiomatic equivalent of a non-drifting pacer.
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = notify_task.notified() => break,
                }

                if !running_task.load(Ordering::Acquire) {
                    break;
                }

                let sent = context.with_span(|| handle.send_feedback());
                if let Err(err) = sent {
                    warn!(%err, "keepalive status update failed, stopping loop");
                    let _ = error_tx.send(Some(Arc::new(err)));
                    break;
                }
                debug!("keepalive status update sent");
            }
        });

        Self {
            running,
            notify,
            error_rx,
            join_handle: Some(join_handle),
        }
    }

    /// Idempotent: stopping an already-stopped loop is a no-op.
    pub fn stop(&mut self) {
        if self
            .running
            .swap(false, Ordering::AcqRel)
        {
            self.notify.notify_one();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<Arc<ReplicationError>> {
        self.error_rx.borrow().clone()
    }
}

impl Drop for KeepaliveLoop {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationResult;
    use std::sync::atomic::AtomicUsize;

    /// Records how many status updates were sent, without touching any real connection.
    #[derive(Default)]
    struct FakeSender {
        sends: AtomicUsize,
    }

    impl FeedbackSender for FakeSender {
        fn send_feedback(&self) -> ReplicationResult<()> {
            self.sends.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let sender = Arc::new(FakeSender::default());
        let mut keepalive = KeepaliveLoop::start(
            sender,
            Duration::from_millis(10),
            &tokio::runtime::Handle::current(),
            &TracingContext::new(),
        );
        assert!(keepalive.is_running());
        keepalive.stop();
        keepalive.stop();
        assert!(!keepalive.is_running());
    }

    #[tokio::test]
    async fn running_loop_sends_periodic_feedback() {
        let sender = Arc::new(FakeSender::default());
        let mut keepalive = KeepaliveLoop::start(
            sender.clone(),
            Duration::from_millis(5),
            &tokio::runtime::Handle::current(),
            &TracingContext::new(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        keepalive.stop();
        assert!(sender.sends.load(Ordering::Relaxed) >= 2);
    }
}
