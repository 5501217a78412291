//! WebSocket client for the protocol bridge.
//!
//! The bridge is a sidecar process that speaks the WhatsApp multi-device
//! protocol and exposes it as JSON text frames over a local WebSocket.
//!
//! Frames sent to the bridge:
//! - `{"type":"login","auth_dir":"..."}` once, right after connecting
//! - `{"type":"send","request_id":"...","to":"...","text":"..."}`
//! - `{"type":"logout"}`
//!
//! Frames received from the bridge:
//! - `{"type":"qr","code":"..."}`
//! - `{"type":"open","me":"..."}`
//! - `{"type":"close","reason":"...","status_code":401,"logged_out":true}`
//! - `{"type":"creds","files":{"creds.json":"<base64>"}}`
//! - `{"type":"message","id":"...","remote_jid":"...",...}`
//! - `{"type":"send_result","request_id":"...","ok":true,"error":null}`

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::events::{CloseReason, ConnectionEvent, RawInbound};
use super::transport::{Connection, Connector, Session};
use crate::session::CredentialBundle;

const EVENT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Login { auth_dir: &'a str },
    Send { request_id: &'a str, to: &'a str, text: &'a str },
    Logout,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Qr {
        code: String,
    },
    Open {
        #[serde(default)]
        me: Option<String>,
    },
    Close {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        logged_out: bool,
    },
    Creds {
        #[serde(default)]
        files: BTreeMap<String, String>,
    },
    Message(RawInbound),
    SendResult {
        request_id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

enum Outgoing {
    Frame(String),
    Close,
}

type PendingSends = Arc<Mutex<HashMap<String, oneshot::Sender<Result<(), String>>>>>;

/// Connects to a bridge sidecar at a `ws://` or `wss://` URL.
pub struct BridgeConnector {
    url: String,
    send_timeout: Duration,
}

impl BridgeConnector {
    pub fn new(url: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            send_timeout,
        }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn connect(&self, auth_dir: &Path) -> Result<Connection> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to protocol bridge at {}", self.url))?;
        tracing::debug!(url = %self.url, "Protocol bridge WebSocket connected");

        let (mut write, mut read) = ws_stream.split();

        let login = serde_json::to_string(&OutboundFrame::Login {
            auth_dir: &auth_dir.to_string_lossy(),
        })?;
        write
            .send(Message::Text(login.into()))
            .await
            .context("Failed to send login frame to protocol bridge")?;

        let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(EVENT_BUFFER);
        let pending: PendingSends = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(outgoing) = out_rx.recv().await {
                let message = match outgoing {
                    Outgoing::Frame(json) => Message::Text(json.into()),
                    Outgoing::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = write.send(message).await {
                    tracing::warn!("Protocol bridge write failed: {e}");
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut close_reported = false;
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let parsed = match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                tracing::warn!("Ignoring malformed bridge frame: {e}");
                                continue;
                            }
                        };
                        let Some(event) = translate_frame(parsed, &reader_pending) else {
                            continue;
                        };
                        let is_close = matches!(event, ConnectionEvent::Closed(_));
                        if event_tx.send(event).await.is_err() {
                            break;
                        }
                        if is_close {
                            close_reported = true;
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "Protocol bridge closed the WebSocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Protocol bridge read failed: {e}");
                        break;
                    }
                }
            }

            fail_pending(&reader_pending, "connection closed");
            if !close_reported {
                let _ = event_tx
                    .send(ConnectionEvent::Closed(CloseReason::classify(
                        None,
                        false,
                        "bridge connection lost",
                    )))
                    .await;
            }
        });

        let session = BridgeSession {
            commands: out_tx,
            pending,
            send_timeout: self.send_timeout,
        };

        Ok(Connection {
            session: Arc::new(session),
            events: event_rx,
        })
    }
}

fn translate_frame(frame: InboundFrame, pending: &PendingSends) -> Option<ConnectionEvent> {
    match frame {
        InboundFrame::Qr { code } => Some(ConnectionEvent::LinkChallenge(code)),
        InboundFrame::Open { me } => Some(ConnectionEvent::Open { own_identity: me }),
        InboundFrame::Close {
            reason,
            status_code,
            logged_out,
        } => Some(ConnectionEvent::Closed(CloseReason::classify(
            status_code,
            logged_out,
            reason.unwrap_or_default(),
        ))),
        InboundFrame::Creds { files } => Some(ConnectionEvent::CredentialsUpdated(decode_creds(files))),
        InboundFrame::Message(raw) => Some(ConnectionEvent::Inbound(raw)),
        InboundFrame::SendResult {
            request_id,
            ok,
            error,
        } => {
            let waiter = pending.lock().remove(&request_id);
            match waiter {
                Some(tx) => {
                    let outcome = if ok {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| "send rejected by bridge".to_string()))
                    };
                    let _ = tx.send(outcome);
                }
                None => tracing::debug!(request_id, "send_result for unknown request"),
            }
            None
        }
    }
}

fn decode_creds(files: BTreeMap<String, String>) -> CredentialBundle {
    let mut bundle = CredentialBundle::new();
    for (name, encoded) in files {
        match base64::engine::general_purpose::STANDARD.decode(encoded.as_bytes()) {
            Ok(content) => bundle.insert(name, content),
            Err(e) => tracing::warn!(blob = %name, "Skipping undecodable credential blob: {e}"),
        }
    }
    bundle
}

fn fail_pending(pending: &PendingSends, reason: &str) {
    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(reason.to_string()));
    }
}

struct BridgeSession {
    commands: mpsc::Sender<Outgoing>,
    pending: PendingSends,
    send_timeout: Duration,
}

impl BridgeSession {
    async fn push(&self, frame: &OutboundFrame<'_>) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.commands
            .send(Outgoing::Frame(json))
            .await
            .map_err(|_| anyhow::anyhow!("protocol bridge connection is closed"))
    }
}

#[async_trait]
impl Session for BridgeSession {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self
            .push(&OutboundFrame::Send {
                request_id: &request_id,
                to,
                text,
            })
            .await
        {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.send_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => anyhow::bail!("bridge rejected send: {reason}"),
            Ok(Err(_)) => anyhow::bail!("protocol bridge dropped the send request"),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                anyhow::bail!(
                    "timed out after {}s waiting for send confirmation",
                    self.send_timeout.as_secs()
                )
            }
        }
    }

    async fn logout(&self) -> Result<()> {
        self.push(&OutboundFrame::Logout).await
    }

    async fn close(&self) {
        let _ = self.commands.send(Outgoing::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn spawn_fake_bridge<F, Fut>(script: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}")
    }

    async fn next_json(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> serde_json::Value {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn surfaces_bridge_events_in_order() {
        let url = spawn_fake_bridge(|mut ws| async move {
            let login = next_json(&mut ws).await;
            assert_eq!(login["type"], "login");
            assert_eq!(login["auth_dir"], "/tmp/auth");

            let creds = base64::engine::general_purpose::STANDARD.encode(b"{\"k\":1}");
            for frame in [
                serde_json::json!({"type": "qr", "code": "2@abc"}),
                serde_json::json!({"type": "open", "me": "5511999999999@s.whatsapp.net"}),
                serde_json::json!({"type": "creds", "files": {"creds.json": creds}}),
                serde_json::json!({
                    "type": "message",
                    "id": "M1",
                    "remote_jid": "5511988887777@s.whatsapp.net",
                    "text": "oi"
                }),
                serde_json::json!({"type": "close", "status_code": 401, "reason": "logged out"}),
            ] {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }
            let _ = ws.next().await;
        })
        .await;

        let connector = BridgeConnector::new(url, Duration::from_secs(5));
        let mut conn = connector.connect(Path::new("/tmp/auth")).await.unwrap();

        assert_eq!(
            conn.events.recv().await.unwrap(),
            ConnectionEvent::LinkChallenge("2@abc".into())
        );
        assert_eq!(
            conn.events.recv().await.unwrap(),
            ConnectionEvent::Open {
                own_identity: Some("5511999999999@s.whatsapp.net".into())
            }
        );
        match conn.events.recv().await.unwrap() {
            ConnectionEvent::CredentialsUpdated(bundle) => {
                assert_eq!(bundle.get("creds.json"), Some(&b"{\"k\":1}"[..]));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match conn.events.recv().await.unwrap() {
            ConnectionEvent::Inbound(raw) => {
                assert_eq!(raw.id, "M1");
                assert_eq!(raw.text.as_deref(), Some("oi"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            conn.events.recv().await.unwrap(),
            ConnectionEvent::Closed(CloseReason::LoggedOut)
        );
        assert!(conn.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn send_waits_for_bridge_confirmation() {
        let url = spawn_fake_bridge(|mut ws| async move {
            let _login = next_json(&mut ws).await;
            let send = next_json(&mut ws).await;
            assert_eq!(send["type"], "send");
            assert_eq!(send["to"], "5511988887777@s.whatsapp.net");
            assert_eq!(send["text"], "hello");
            let reply = serde_json::json!({
                "type": "send_result",
                "request_id": send["request_id"],
                "ok": true
            });
            ws.send(Message::Text(reply.to_string().into())).await.unwrap();

            let second = next_json(&mut ws).await;
            let reject = serde_json::json!({
                "type": "send_result",
                "request_id": second["request_id"],
                "ok": false,
                "error": "not on whatsapp"
            });
            ws.send(Message::Text(reject.to_string().into())).await.unwrap();
            let _ = ws.next().await;
        })
        .await;

        let connector = BridgeConnector::new(url, Duration::from_secs(5));
        let conn = connector.connect(Path::new("/tmp/auth")).await.unwrap();

        conn.session
            .send_text("5511988887777@s.whatsapp.net", "hello")
            .await
            .unwrap();
        let err = conn
            .session
            .send_text("5511988887777@s.whatsapp.net", "again")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not on whatsapp"));
    }

    #[tokio::test]
    async fn lost_connection_reports_retryable_close_and_fails_pending() {
        let url = spawn_fake_bridge(|mut ws| async move {
            let _login = next_json(&mut ws).await;
            let _send = next_json(&mut ws).await;
            drop(ws);
        })
        .await;

        let connector = BridgeConnector::new(url, Duration::from_secs(5));
        let mut conn = connector.connect(Path::new("/tmp/auth")).await.unwrap();

        let err = conn
            .session
            .send_text("5511988887777@s.whatsapp.net", "hello")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection closed"));

        match conn.events.recv().await.unwrap() {
            ConnectionEvent::Closed(reason) => assert!(!reason.is_logged_out()),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
