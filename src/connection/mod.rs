//! Connection lifecycle supervision.
//!
//! [`ConnectionSupervisor`] owns the only writable view of the connection.
//! It restores credentials, opens sessions through a [`Connector`], turns
//! the session's events into state transitions, and reconnects after
//! non-terminal closes. Inbound messages leave through an mpsc channel in
//! delivery order.

pub mod backoff;
pub mod bridge;
pub mod events;
pub mod qr;
pub mod state;
pub mod transport;
#[cfg(feature = "whatsapp-web")]
pub mod whatsapp_web;

pub use backoff::ReconnectPolicy;
pub use bridge::BridgeConnector;
pub use events::{CloseReason, ConnectionEvent, RawInbound};
pub use qr::{LinkChallengeSink, SilentSink, TerminalQrSink};
pub use state::{ConnectionHandle, ConnectionState};
pub use transport::{Connection, Connector, Session};
#[cfg(feature = "whatsapp-web")]
pub use whatsapp_web::WhatsAppWebConnector;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::session::CredentialStore;

/// State reached after `event` is observed in `current`.
///
/// [`ConnectionState::LoggedOut`] absorbs every event.
pub fn next_state(current: ConnectionState, event: &ConnectionEvent) -> ConnectionState {
    if current == ConnectionState::LoggedOut {
        return current;
    }
    match event {
        ConnectionEvent::Open { .. } => ConnectionState::Connected,
        ConnectionEvent::Closed(CloseReason::LoggedOut) => ConnectionState::LoggedOut,
        ConnectionEvent::Closed(CloseReason::Other { .. }) => ConnectionState::Disconnected,
        ConnectionEvent::LinkChallenge(_)
        | ConnectionEvent::CredentialsUpdated(_)
        | ConnectionEvent::Inbound(_) => current,
    }
}

/// How a single session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Closed(CloseReason),
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    credentials: Arc<CredentialStore>,
    handle: ConnectionHandle,
    link_sink: Arc<dyn LinkChallengeSink>,
    inbound: mpsc::Sender<RawInbound>,
    auth_dir: PathBuf,
    policy: ReconnectPolicy,
    clear_on_logout: bool,
    background: TaskTracker,
    last_rotation: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        credentials: Arc<CredentialStore>,
        handle: ConnectionHandle,
        inbound: mpsc::Sender<RawInbound>,
        auth_dir: PathBuf,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            connector,
            credentials,
            handle,
            link_sink: Arc::new(TerminalQrSink),
            inbound,
            auth_dir,
            policy,
            clear_on_logout: false,
            background: TaskTracker::new(),
            last_rotation: None,
        }
    }

    #[must_use]
    pub fn with_link_sink(mut self, sink: Arc<dyn LinkChallengeSink>) -> Self {
        self.link_sink = sink;
        self
    }

    /// Tear down local and remote credentials when the device is unlinked.
    #[must_use]
    pub fn clear_on_logout(mut self, enabled: bool) -> Self {
        self.clear_on_logout = enabled;
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run until cancelled or logged out.
    ///
    /// Returns after in-flight credential syncs have finished.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ConnectionState> {
        self.restore_credentials().await;

        let final_state = loop {
            if cancel.is_cancelled() {
                break ConnectionState::Disconnected;
            }

            self.handle.set_state(ConnectionState::AwaitingLink);
            tracing::info!(connector = self.connector.name(), "Opening protocol session");

            let connected = tokio::select! {
                () = cancel.cancelled() => break ConnectionState::Disconnected,
                result = self.connector.connect(&self.auth_dir) => result,
            };

            let reason = match connected {
                Ok(connection) => {
                    let session = Arc::clone(&connection.session);
                    self.handle.attach(Arc::clone(&session));
                    let end = self.drive(connection.events, &cancel).await;
                    self.handle.detach();

                    match end {
                        SessionEnd::Cancelled => {
                            session.close().await;
                            break ConnectionState::Disconnected;
                        }
                        SessionEnd::Closed(reason) => {
                            session.close().await;
                            reason
                        }
                    }
                }
                Err(e) => CloseReason::Other {
                    status_code: None,
                    message: format!("{e:#}"),
                },
            };

            match reason {
                CloseReason::LoggedOut => {
                    self.handle.set_state(ConnectionState::LoggedOut);
                    tracing::warn!(
                        "Device was unlinked. Relink required; automatic reconnect stopped"
                    );
                    if self.clear_on_logout {
                        self.teardown_credentials().await;
                    }
                    break ConnectionState::LoggedOut;
                }
                CloseReason::Other {
                    status_code,
                    message,
                } => {
                    self.handle.set_state(ConnectionState::Disconnected);
                    let delay = self.policy.next_delay();
                    tracing::warn!(
                        ?status_code,
                        "Protocol session closed: {message}. Reconnecting in {}ms",
                        delay.as_millis()
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break ConnectionState::Disconnected,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if final_state != ConnectionState::LoggedOut {
            self.handle.set_state(ConnectionState::Disconnected);
        }

        self.background.close();
        self.background.wait().await;
        Ok(final_state)
    }

    async fn restore_credentials(&self) {
        match self.credentials.fetch_into(&self.auth_dir).await {
            Ok(true) => tracing::info!(
                namespace = self.credentials.namespace(),
                "Restored credential bundle from remote store"
            ),
            Ok(false) => tracing::info!(
                namespace = self.credentials.namespace(),
                "No remote credentials found; a new link will be required"
            ),
            Err(e) => tracing::warn!(
                namespace = self.credentials.namespace(),
                "Credential restore failed, continuing with local copy: {e:#}"
            ),
        }
    }

    async fn teardown_credentials(&self) {
        // A pending rotation must not recreate the directory afterwards.
        self.background.close();
        self.background.wait().await;
        if let Err(e) = self.credentials.teardown(&self.auth_dir).await {
            tracing::warn!("Credential teardown after logout failed: {e:#}");
        }
    }

    async fn drive(
        &mut self,
        mut events: mpsc::Receiver<ConnectionEvent>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return SessionEnd::Cancelled,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                return SessionEnd::Closed(CloseReason::Other {
                    status_code: None,
                    message: "event stream ended".to_string(),
                });
            };

            let next = next_state(self.handle.state(), &event);
            match event {
                ConnectionEvent::LinkChallenge(code) => {
                    self.handle.set_link_challenge(&code);
                    self.link_sink.present(&code);
                }
                ConnectionEvent::Open { own_identity } => {
                    self.handle.set_own_identity(own_identity);
                    self.handle.set_state(next);
                    self.policy.reset();
                }
                ConnectionEvent::Closed(reason) => return SessionEnd::Closed(reason),
                ConnectionEvent::CredentialsUpdated(bundle) => {
                    self.persist_rotation(bundle);
                }
                ConnectionEvent::Inbound(raw) => {
                    if self.inbound.send(raw).await.is_err() {
                        tracing::warn!("Inbound pipeline is gone; dropping message");
                    }
                }
            }
        }
    }

    /// Write rotated blobs and sync them, off the event loop.
    ///
    /// Rotations run in arrival order on the tracker; inbound forwarding
    /// never waits on the disk or the remote store.
    fn persist_rotation(&mut self, bundle: crate::session::CredentialBundle) {
        let credentials = Arc::clone(&self.credentials);
        let auth_dir = self.auth_dir.clone();
        let previous = self.last_rotation.take();
        let done = self.background.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            let changed: Option<Vec<String>> = if bundle.is_empty() {
                None
            } else {
                if let Err(e) = bundle.write_into(&auth_dir).await {
                    tracing::warn!("Failed to persist rotated credentials locally: {e:#}");
                    return;
                }
                Some(bundle.names().map(str::to_string).collect())
            };

            match credentials.sync_from(&auth_dir, changed.as_deref()).await {
                Ok(report) if !report.failed.is_empty() => tracing::warn!(
                    uploaded = report.uploaded.len(),
                    failed = report.failed.len(),
                    "Credential sync finished with failures"
                ),
                Ok(report) => tracing::debug!(
                    uploaded = report.uploaded.len(),
                    unchanged = report.unchanged,
                    "Credential sync finished"
                ),
                Err(e) => tracing::warn!("Credential sync failed: {e:#}"),
            }
        });
        self.last_rotation = Some(done);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{RecordingSession, ScriptedConnector};
    use super::*;
    use crate::session::testing::RecordingStore;
    use crate::session::{CredentialBundle, SyncMode};
    use std::time::Duration;

    struct Fixture {
        connector: Arc<ScriptedConnector>,
        store: Arc<RecordingStore>,
        handle: ConnectionHandle,
        inbound_rx: mpsc::Receiver<RawInbound>,
        cancel: CancellationToken,
        join: tokio::task::JoinHandle<Result<ConnectionState>>,
        _tmp: tempfile::TempDir,
    }

    fn start(connector: Arc<ScriptedConnector>, clear_on_logout: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let credentials = Arc::new(CredentialStore::new(
            store.clone(),
            "client-a",
            SyncMode::Incremental,
        ));
        let handle = ConnectionHandle::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        let supervisor = ConnectionSupervisor::new(
            connector.clone(),
            credentials,
            handle.clone(),
            inbound_tx,
            tmp.path().join("auth"),
            ReconnectPolicy::fixed(Duration::from_secs(5)),
        )
        .with_link_sink(Arc::new(SilentSink))
        .clear_on_logout(clear_on_logout);

        let cancel = CancellationToken::new();
        let join = tokio::spawn(supervisor.run(cancel.clone()));
        Fixture {
            connector,
            store,
            handle,
            inbound_rx,
            cancel,
            join,
            _tmp: tmp,
        }
    }

    async fn wait_for_state(handle: &ConnectionHandle, want: ConnectionState) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .expect("state channel closed");
    }

    #[test]
    fn logged_out_absorbs_every_event() {
        let open = ConnectionEvent::Open { own_identity: None };
        assert_eq!(
            next_state(ConnectionState::LoggedOut, &open),
            ConnectionState::LoggedOut
        );
        assert_eq!(
            next_state(ConnectionState::AwaitingLink, &open),
            ConnectionState::Connected
        );
        assert_eq!(
            next_state(
                ConnectionState::AwaitingLink,
                &ConnectionEvent::LinkChallenge("2@x".into())
            ),
            ConnectionState::AwaitingLink
        );
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_close_stops_without_retry() {
        let connector = Arc::new(ScriptedConnector::default());
        let events = connector.push(Arc::new(RecordingSession::default()));
        let fx = start(connector, false);

        wait_for_state(&fx.handle, ConnectionState::AwaitingLink).await;
        events
            .send(ConnectionEvent::Closed(CloseReason::LoggedOut))
            .await
            .unwrap();

        let final_state = fx.join.await.unwrap().unwrap();
        assert_eq!(final_state, ConnectionState::LoggedOut);
        assert_eq!(fx.handle.state(), ConnectionState::LoggedOut);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(fx.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_close_schedules_exactly_one_retry_after_backoff() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = connector.push(Arc::new(RecordingSession::default()));
        let _second = connector.push(Arc::new(RecordingSession::default()));
        let fx = start(connector, false);

        wait_for_state(&fx.handle, ConnectionState::AwaitingLink).await;
        first
            .send(ConnectionEvent::Closed(CloseReason::Other {
                status_code: Some(428),
                message: "connection lost".into(),
            }))
            .await
            .unwrap();

        wait_for_state(&fx.handle, ConnectionState::Disconnected).await;
        assert_eq!(fx.connector.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(fx.connector.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        wait_for_state(&fx.handle, ConnectionState::AwaitingLink).await;
        assert_eq!(fx.connector.attempts(), 2);

        fx.cancel.cancel();
        assert_eq!(
            fx.join.await.unwrap().unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn open_connects_and_send_reaches_session() {
        let connector = Arc::new(ScriptedConnector::default());
        let session = Arc::new(RecordingSession::default());
        let events = connector.push(session.clone());
        let fx = start(connector, false);

        wait_for_state(&fx.handle, ConnectionState::AwaitingLink).await;
        assert_eq!(
            fx.handle.send("1@s.whatsapp.net", "early").await,
            Err(crate::error::RelayError::NotConnected)
        );

        events
            .send(ConnectionEvent::LinkChallenge("2@qr".into()))
            .await
            .unwrap();
        events
            .send(ConnectionEvent::Open {
                own_identity: Some("5511999999999@s.whatsapp.net".into()),
            })
            .await
            .unwrap();
        wait_for_state(&fx.handle, ConnectionState::Connected).await;
        assert!(fx.handle.link_challenge().is_none());
        assert_eq!(
            fx.handle.own_identity().as_deref(),
            Some("5511999999999@s.whatsapp.net")
        );

        fx.handle.send("1@s.whatsapp.net", "hi").await.unwrap();
        assert_eq!(
            session.sent.lock().clone(),
            vec![("1@s.whatsapp.net".to_string(), "hi".to_string())]
        );

        fx.cancel.cancel();
        fx.join.await.unwrap().unwrap();
        assert_eq!(fx.handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_events_are_forwarded_in_order() {
        let connector = Arc::new(ScriptedConnector::default());
        let events = connector.push(Arc::new(RecordingSession::default()));
        let mut fx = start(connector, false);

        for id in ["A", "B", "C"] {
            events
                .send(ConnectionEvent::Inbound(RawInbound {
                    id: id.into(),
                    ..RawInbound::default()
                }))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(fx.inbound_rx.recv().await.unwrap().id);
        }
        assert_eq!(seen, vec!["A", "B", "C"]);
        fx.cancel.cancel();
        fx.join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn credential_rotation_is_written_and_synced() {
        let connector = Arc::new(ScriptedConnector::default());
        let events = connector.push(Arc::new(RecordingSession::default()));
        let fx = start(connector, false);

        let mut bundle = CredentialBundle::new();
        bundle.insert("creds.json", b"{\"rotated\":true}".to_vec());
        events
            .send(ConnectionEvent::CredentialsUpdated(bundle))
            .await
            .unwrap();

        // Cancelling waits for background syncs to drain.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.cancel.cancel();
        fx.join.await.unwrap().unwrap();

        let uploaded = fx.store.blobs.lock().get("client-a/creds.json").cloned();
        assert_eq!(uploaded.as_deref(), Some(&b"{\"rotated\":true}"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_with_clear_tears_down_credentials() {
        let connector = Arc::new(ScriptedConnector::default());
        let events = connector.push(Arc::new(RecordingSession::default()));
        let fx = start(connector, true);
        fx.store
            .blobs
            .lock()
            .insert("client-a/creds.json".into(), b"old".to_vec());

        wait_for_state(&fx.handle, ConnectionState::AwaitingLink).await;
        events
            .send(ConnectionEvent::Closed(CloseReason::LoggedOut))
            .await
            .unwrap();
        fx.join.await.unwrap().unwrap();

        assert!(fx.store.blobs.lock().is_empty());
    }

    #[tokio::test]
    async fn rotations_apply_in_order_without_holding_back_inbound() {
        let connector = Arc::new(ScriptedConnector::default());
        let events = connector.push(Arc::new(RecordingSession::default()));
        let mut fx = start(connector, false);
        let auth_dir = fx._tmp.path().join("auth");

        for content in [&b"v1"[..], &b"v2"[..]] {
            let mut bundle = CredentialBundle::new();
            bundle.insert("creds.json", content.to_vec());
            events
                .send(ConnectionEvent::CredentialsUpdated(bundle))
                .await
                .unwrap();
        }
        events
            .send(ConnectionEvent::Inbound(RawInbound {
                id: "after-rotation".into(),
                ..RawInbound::default()
            }))
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), fx.inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.id, "after-rotation");

        fx.cancel.cancel();
        fx.join.await.unwrap().unwrap();

        assert_eq!(std::fs::read(auth_dir.join("creds.json")).unwrap(), b"v2");
        let uploaded = fx.store.blobs.lock().get("client-a/creds.json").cloned();
        assert_eq!(uploaded.as_deref(), Some(&b"v2"[..]));
    }
}
