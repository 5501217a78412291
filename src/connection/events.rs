//! Typed events surfaced by a protocol connection.

use serde::Deserialize;

use crate::session::CredentialBundle;

/// Close status the protocol uses for "this device was unlinked".
pub const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// One-time link material to show an operator (usually a QR payload).
    LinkChallenge(String),
    /// The session is open and can send.
    Open { own_identity: Option<String> },
    Closed(CloseReason),
    /// The credential bundle rotated. Carries the changed blobs; empty when
    /// the client already persisted them into the auth directory itself.
    CredentialsUpdated(CredentialBundle),
    Inbound(RawInbound),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit unlink on the protocol side. Never retried automatically.
    LoggedOut,
    Other {
        status_code: Option<u16>,
        message: String,
    },
}

impl CloseReason {
    pub fn classify(status_code: Option<u16>, logged_out: bool, message: impl Into<String>) -> Self {
        if logged_out || status_code == Some(LOGGED_OUT_STATUS) {
            Self::LoggedOut
        } else {
            Self::Other {
                status_code,
                message: message.into(),
            }
        }
    }

    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// An inbound message exactly as the protocol client reported it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawInbound {
    /// Protocol message id, stable across redelivery.
    #[serde(default)]
    pub id: String,
    /// Chat the message arrived in (personal, group, broadcast, ...).
    #[serde(default)]
    pub remote_jid: String,
    /// Author inside a multi-party chat.
    #[serde(default)]
    pub participant: Option<String>,
    /// Verified phone-number identity, when the protocol exposes one.
    #[serde(default)]
    pub sender_pn: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    /// Text payload; `None` for media, reactions and protocol messages.
    #[serde(default)]
    pub text: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub push_name: Option<String>,
}
