use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use super::transport::Session;
use crate::error::RelayError;

/// Lifecycle of the single protocol connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    AwaitingLink,
    Connected,
    /// Terminal until an operator relinks.
    LoggedOut,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingLink => "awaiting_link",
            Self::Connected => "connected",
            Self::LoggedOut => "logged_out",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared view of the connection, created once per process.
///
/// The supervisor is the only writer; the relay and the HTTP surface hold
/// clones to read state and send.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<Inner>,
}

struct Inner {
    state: watch::Sender<ConnectionState>,
    session: RwLock<Option<Arc<dyn Session>>>,
    link_challenge: RwLock<Option<String>>,
    own_identity: RwLock<Option<String>>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                state,
                session: RwLock::new(None),
                link_challenge: RwLock::new(None),
                own_identity: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Latest link challenge, kept until the link opens.
    pub fn link_challenge(&self) -> Option<String> {
        self.inner.link_challenge.read().clone()
    }

    /// Identity of the linked account, once known.
    pub fn own_identity(&self) -> Option<String> {
        self.inner.own_identity.read().clone()
    }

    /// Send a text message. Valid only while [`ConnectionState::Connected`].
    pub async fn send(&self, to: &str, text: &str) -> Result<(), RelayError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::LoggedOut => return Err(RelayError::LoggedOut),
            ConnectionState::Disconnected | ConnectionState::AwaitingLink => {
                return Err(RelayError::NotConnected);
            }
        }

        let session = self
            .inner
            .session
            .read()
            .clone()
            .ok_or(RelayError::NotConnected)?;
        session
            .send_text(to, text)
            .await
            .map_err(|e| RelayError::TransientNetwork(format!("{e:#}")))
    }

    pub(crate) fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let previous = self.inner.state.send_replace(next);
        if previous != next {
            tracing::info!(from = %previous, to = %next, "Connection state changed");
        }
        if next == ConnectionState::Connected {
            self.inner.link_challenge.write().take();
        }
        previous
    }

    pub(crate) fn set_link_challenge(&self, code: &str) {
        *self.inner.link_challenge.write() = Some(code.to_string());
    }

    pub(crate) fn set_own_identity(&self, identity: Option<String>) {
        *self.inner.own_identity.write() = identity;
    }

    pub(crate) fn attach(&self, session: Arc<dyn Session>) {
        *self.inner.session.write() = Some(session);
    }

    pub(crate) fn detach(&self) -> Option<Arc<dyn Session>> {
        self.inner.session.write().take()
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}
