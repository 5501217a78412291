use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::events::ConnectionEvent;

/// An open protocol session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Send a plain text message to a fully-qualified identity.
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;

    /// Unlink this device on the protocol side.
    async fn logout(&self) -> Result<()>;

    /// Drop the connection without unlinking.
    async fn close(&self);
}

/// A freshly opened connection: the send side and its ordered event stream.
///
/// The stream ends when the underlying connection is gone.
pub struct Connection {
    pub session: Arc<dyn Session>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Opens protocol sessions from the credential bundle stored in `auth_dir`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self, auth_dir: &Path) -> Result<Connection>;
}
