//! Failure taxonomy shared by the relay components.
//!
//! Only [`RelayError::MissingConfig`] is fatal, and only at startup. Every
//! other variant degrades a single operation and the process keeps serving.

/// Categorised relay failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Remote store or webhook unreachable; the operation is skipped.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// A single blob could not be listed, fetched or stored; other blobs proceed.
    #[error("remote store inconsistent for `{name}`: {reason}")]
    RemoteStoreInconsistent { name: String, reason: String },

    /// Send attempted while the connection is not open.
    #[error("connection is not open")]
    NotConnected,

    /// The session was logged out on the protocol side and needs a new link.
    #[error("session logged out; operator must relink")]
    LoggedOut,

    /// Inbound event with no resolvable sender or text.
    #[error("malformed inbound event: {0}")]
    MalformedInbound(String),

    /// Required startup configuration is absent.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),
}

impl RelayError {
    /// Whether the failure should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingConfig(_))
    }
}
