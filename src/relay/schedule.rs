use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connection::ConnectionHandle;
use crate::error::RelayError;

/// Capability to deliver a reply.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(&self, to: &str, text: &str) -> Result<(), RelayError>;
}

#[async_trait]
impl ReplySender for ConnectionHandle {
    async fn send_reply(&self, to: &str, text: &str) -> Result<(), RelayError> {
        self.send(to, text).await
    }
}

/// Uniform delay window. Samples fall strictly between `min` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayWindow {
    min: Duration,
    max: Duration,
}

impl DelayWindow {
    pub fn new(min: Duration, max: Duration) -> Self {
        if max < min {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        let span_ms = u64::try_from((self.max - self.min).as_millis()).unwrap_or(u64::MAX);
        let offset_ms = if span_ms < 2 {
            span_ms / 2
        } else {
            1 + rand::random::<u64>() % (span_ms - 1)
        };
        self.min + Duration::from_millis(offset_ms)
    }
}

impl Default for DelayWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(20))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReply {
    pub target: String,
    pub text: String,
    pub fire_at: Instant,
}

/// Runs each pending reply as its own timer task.
///
/// Replies are never coalesced; two replies to one target both fire in
/// timer order. A reply that fails at fire time is logged and dropped.
#[derive(Clone)]
pub struct ReplyScheduler {
    sender: Arc<dyn ReplySender>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ReplyScheduler {
    pub fn new(sender: Arc<dyn ReplySender>) -> Self {
        Self {
            sender,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn schedule(&self, reply: PendingReply) {
        let sender = Arc::clone(&self.sender);
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!(to = %reply.target, "Scheduled reply cancelled by shutdown");
                }
                () = tokio::time::sleep_until(reply.fire_at) => {
                    match sender.send_reply(&reply.target, &reply.text).await {
                        Ok(()) => tracing::info!(to = %reply.target, "Reply delivered"),
                        Err(e) => tracing::warn!(
                            to = %reply.target,
                            "Dropping reply: {e}"
                        ),
                    }
                }
            }
        });
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel timers that have not fired and wait for in-flight sends.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Records delivered replies with the (paused) clock time they fired.
    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<(String, String, Instant)>>,
        pub fail_with: Mutex<Option<RelayError>>,
    }

    #[async_trait]
    impl ReplySender for RecordingSender {
        async fn send_reply(&self, to: &str, text: &str) -> Result<(), RelayError> {
            if let Some(err) = self.fail_with.lock().clone() {
                return Err(err);
            }
            self.sent
                .lock()
                .push((to.to_string(), text.to_string(), Instant::now()));
            Ok(())
        }
    }
}
