//! Webhook relay with delayed, cancellable replies.

pub mod schedule;
pub mod webhook;

pub use schedule::{DelayWindow, PendingReply, ReplyScheduler, ReplySender};
pub use webhook::{extract_reply, WebhookClient, WebhookPayload};

use std::time::Duration;
use tokio::time::Instant;

use crate::inbound::InboundMessage;
use crate::util::truncate_with_ellipsis;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// No webhook configured; the message was only logged.
    NoWebhook,
    /// The automation chose not to answer.
    NoReply,
    /// A reply will be sent `delay` after the relay started.
    Scheduled { delay: Duration },
    /// The webhook call failed. Nothing is retried.
    Failed(String),
}

pub struct OutboundRelay {
    webhook: Option<WebhookClient>,
    scheduler: ReplyScheduler,
    window: DelayWindow,
}

impl OutboundRelay {
    pub fn new(webhook: Option<WebhookClient>, scheduler: ReplyScheduler, window: DelayWindow) -> Self {
        Self {
            webhook,
            scheduler,
            window,
        }
    }

    pub fn scheduler(&self) -> &ReplyScheduler {
        &self.scheduler
    }

    /// Forward `msg` to the webhook and schedule its reply, if any.
    pub async fn relay(&self, msg: InboundMessage) -> RelayOutcome {
        let started = Instant::now();

        let Some(webhook) = &self.webhook else {
            tracing::debug!(id = %msg.id, "No webhook configured; message not relayed");
            return RelayOutcome::NoWebhook;
        };

        let reply = match webhook.call(&msg).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                tracing::debug!(id = %msg.id, "Webhook returned no reply");
                return RelayOutcome::NoReply;
            }
            Err(e) => {
                let detail = format!("{e:#}");
                tracing::warn!(id = %msg.id, error = %detail, "Webhook relay failed");
                return RelayOutcome::Failed(detail);
            }
        };

        let delay = self.window.sample();
        tracing::info!(
            id = %msg.id,
            to = %msg.raw_source,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reply scheduled: {}",
            truncate_with_ellipsis(&reply, 80)
        );
        self.scheduler.schedule(PendingReply {
            target: msg.raw_source,
            text: reply,
            fire_at: started + delay,
        });
        RelayOutcome::Scheduled { delay }
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
