//! Admission, deduplication and sender normalization of inbound events.

pub mod dedup;
pub mod normalize;

pub use dedup::{DedupWindow, DEFAULT_DEDUP_CAPACITY};
pub use normalize::{
    classify, BrazilMobileDigitRule, IdentityKind, NumberRule, SenderNormalizer, PERSONAL_SERVER,
};

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::RawInbound;
use crate::error::RelayError;
use crate::util::truncate_with_ellipsis;

/// An admitted message, ready to relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    /// Canonical author identity.
    pub sender: String,
    /// Chat the message came from. Replies go here.
    pub raw_source: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_group: bool,
    pub push_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NoText,
    FromSelf,
    Channel,
    Duplicate,
    Malformed(RelayError),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoText => f.write_str("no text payload"),
            Self::FromSelf => f.write_str("sent by this session"),
            Self::Channel => f.write_str("broadcast or system channel"),
            Self::Duplicate => f.write_str("duplicate message id"),
            Self::Malformed(err) => write!(f, "{err}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Admit(InboundMessage),
    Drop(DropReason),
}

/// Stateful filter over the single inbound event stream.
///
/// Owned by one task; the dedup window has no other writer.
pub struct InboundFilter {
    dedup: DedupWindow,
    normalizer: SenderNormalizer,
}

impl InboundFilter {
    pub fn new(dedup: DedupWindow, normalizer: SenderNormalizer) -> Self {
        Self { dedup, normalizer }
    }

    pub fn normalizer(&self) -> &SenderNormalizer {
        &self.normalizer
    }

    pub fn process(&mut self, raw: RawInbound) -> FilterOutcome {
        let Some(text) = raw.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return FilterOutcome::Drop(DropReason::NoText);
        };
        if raw.from_me {
            return FilterOutcome::Drop(DropReason::FromSelf);
        }
        let kind = classify(&raw.remote_jid);
        if kind.is_channel() {
            return FilterOutcome::Drop(DropReason::Channel);
        }
        if raw.id.trim().is_empty() {
            return FilterOutcome::Drop(DropReason::Malformed(RelayError::MalformedInbound(
                "missing message id".into(),
            )));
        }

        if !self.dedup.insert(&raw.id) {
            return FilterOutcome::Drop(DropReason::Duplicate);
        }

        let Some(sender) = self.normalizer.resolve_sender(&raw) else {
            return FilterOutcome::Drop(DropReason::Malformed(RelayError::MalformedInbound(
                format!("no resolvable sender for message {}", raw.id),
            )));
        };

        let is_group = kind == IdentityKind::Group;
        // Replies target the chat exactly as the protocol named it.
        let raw_source = raw.remote_jid.trim().to_string();

        FilterOutcome::Admit(InboundMessage {
            text: text.to_string(),
            timestamp: raw
                .timestamp
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or_else(Utc::now),
            id: raw.id,
            sender,
            raw_source,
            is_group,
            push_name: raw.push_name.filter(|n| !n.trim().is_empty()),
        })
    }
}

/// Drain raw events through `filter` in arrival order.
///
/// Each admitted message is handed to `dispatch` immediately; dispatch is
/// expected to spawn rather than await network work. Returns when the
/// event source closes or `cancel` fires.
pub async fn run_filter<F>(
    mut filter: InboundFilter,
    mut events: mpsc::Receiver<RawInbound>,
    cancel: CancellationToken,
    mut dispatch: F,
) where
    F: FnMut(InboundMessage),
{
    loop {
        let raw = tokio::select! {
            () = cancel.cancelled() => break,
            raw = events.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };

        let id = raw.id.clone();
        match filter.process(raw) {
            FilterOutcome::Admit(message) => {
                tracing::info!(
                    id = %message.id,
                    sender = %message.sender,
                    group = message.is_group,
                    "Inbound message: {}",
                    truncate_with_ellipsis(&message.text, 80)
                );
                dispatch(message);
            }
            FilterOutcome::Drop(DropReason::Malformed(err)) => {
                tracing::warn!(id = %id, "Dropping inbound event: {err}");
            }
            FilterOutcome::Drop(reason) => {
                tracing::debug!(id = %id, "Dropping inbound event: {reason}");
            }
        }
    }
    tracing::debug!("Inbound filter stopped");
}
