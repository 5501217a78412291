//! In-process WhatsApp Web connector built on wa-rs.
//!
//! The device store is a SQLite database inside the auth directory, so the
//! credential store mirrors it like any other blob. Each `connect` builds a
//! fresh bot; its events are mapped onto [`ConnectionEvent`] in arrival order.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use wa_rs::bot::Bot;
use wa_rs::pair_code::PairCodeOptions;
use wa_rs::store::{DeviceStore as _, SqliteStore};
use wa_rs_binary::jid::{Jid, JidExt as _};
use wa_rs_core::proto_helpers::MessageExt;
use wa_rs_core::types::events::Event;
use wa_rs_tokio_transport::TokioWebSocketTransportFactory;
use wa_rs_ureq_http::UreqHttpClient;

use super::events::{CloseReason, ConnectionEvent, RawInbound};
use super::transport::{Connection, Connector, Session};
use crate::session::CredentialBundle;

/// Device store file inside the auth directory.
pub const SESSION_DB_FILE: &str = "whatsapp-session.db";

const EVENT_BUFFER: usize = 256;

pub struct WhatsAppWebConnector {
    ws_url: Option<String>,
    pair_phone: Option<String>,
}

impl WhatsAppWebConnector {
    pub fn new(ws_url: Option<String>, pair_phone: Option<String>) -> Self {
        Self { ws_url, pair_phone }
    }
}

#[async_trait]
impl Connector for WhatsAppWebConnector {
    fn name(&self) -> &str {
        "whatsapp-web"
    }

    async fn connect(&self, auth_dir: &Path) -> Result<Connection> {
        tokio::fs::create_dir_all(auth_dir)
            .await
            .with_context(|| format!("Failed to create auth directory {}", auth_dir.display()))?;
        let db_path = auth_dir.join(SESSION_DB_FILE);

        let backend = Arc::new(
            SqliteStore::new(&db_path.to_string_lossy())
                .await
                .map_err(|e| anyhow!("Failed to open device store {}: {e}", db_path.display()))?,
        );
        if backend.exists().await? {
            tracing::info!("WhatsApp Web: found existing session, loading device");
        } else {
            tracing::info!("WhatsApp Web: no existing session, a new device will be linked");
        }

        let mut transport_factory = TokioWebSocketTransportFactory::new();
        if let Some(url) = &self.ws_url {
            transport_factory = transport_factory.with_url(url.clone());
        }

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let event_tx = tx.clone();
        let mut builder = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(transport_factory)
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let tx = event_tx.clone();
                async move {
                    let mapped = match event {
                        Event::Message(msg, info) => {
                            let sender = info.source.sender.clone();
                            let mapped_phone = if sender.is_lid() {
                                client.get_phone_number_from_lid(&sender.user).await
                            } else {
                                None
                            };
                            let sender_pn = verified_phone(
                                &sender,
                                info.source.sender_alt.as_ref(),
                                mapped_phone.as_deref(),
                            );
                            ConnectionEvent::Inbound(RawInbound {
                                id: info.id.clone(),
                                remote_jid: info.source.chat.to_string(),
                                participant: info.source.is_group.then(|| sender.to_string()),
                                sender_pn,
                                from_me: info.source.is_from_me,
                                text: msg.text_content().map(str::to_string),
                                timestamp: Some(info.timestamp.timestamp()),
                                push_name: Some(info.push_name.clone())
                                    .filter(|name| !name.is_empty()),
                            })
                        }
                        Event::Connected(_) => {
                            if tx.send(ConnectionEvent::Open { own_identity: None }).await.is_err() {
                                return;
                            }
                            // The device store is written in place; sync the directory.
                            ConnectionEvent::CredentialsUpdated(CredentialBundle::new())
                        }
                        Event::LoggedOut(_) => ConnectionEvent::Closed(CloseReason::LoggedOut),
                        Event::StreamError(stream_error) => {
                            ConnectionEvent::Closed(CloseReason::Other {
                                status_code: None,
                                message: format!("stream error: {stream_error:?}"),
                            })
                        }
                        Event::PairingQrCode { code, .. } => ConnectionEvent::LinkChallenge(code),
                        Event::PairingCode { code, .. } => {
                            tracing::info!("WhatsApp Web pair code received: {code}");
                            tracing::info!(
                                "Link your phone by entering this code in WhatsApp > Linked Devices"
                            );
                            return;
                        }
                        _ => return,
                    };
                    if tx.send(mapped).await.is_err() {
                        tracing::debug!("WhatsApp Web event dropped: supervisor gone");
                    }
                }
            });

        if let Some(phone) = &self.pair_phone {
            tracing::info!("WhatsApp Web: pair-code flow enabled for configured phone number");
            builder = builder.with_pair_code(PairCodeOptions {
                phone_number: phone.clone(),
                ..Default::default()
            });
        }

        let mut bot = builder.build().await?;
        let client = bot.client();
        let bot_task = bot.run().await?;
        let abort = bot_task.abort_handle();

        // A bot that stops on its own ends the session.
        tokio::spawn(async move {
            let message = match bot_task.await {
                Ok(()) => "client task ended".to_string(),
                Err(e) if e.is_cancelled() => return,
                Err(e) => format!("client task failed: {e}"),
            };
            let reason = CloseReason::Other {
                status_code: None,
                message,
            };
            let _ = tx.send(ConnectionEvent::Closed(reason)).await;
        });

        Ok(Connection {
            session: Arc::new(WhatsAppWebSession {
                client,
                bot_task: abort,
            }),
            events,
        })
    }
}

struct WhatsAppWebSession {
    client: Arc<wa_rs::Client>,
    bot_task: AbortHandle,
}

#[async_trait]
impl Session for WhatsAppWebSession {
    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        let jid = recipient_jid(to)?;
        let outgoing = wa_rs_proto::whatsapp::Message {
            conversation: Some(text.to_string()),
            ..Default::default()
        };
        let message_id = self.client.send_message(jid, outgoing).await?;
        tracing::debug!(to, message_id = %message_id, "WhatsApp Web message sent");
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        anyhow::bail!(
            "WhatsApp Web sessions are unlinked from the phone: WhatsApp > Linked devices"
        )
    }

    async fn close(&self) {
        self.bot_task.abort();
    }
}

/// Phone-number identity of a sender, when the protocol reveals one.
///
/// A phone-number sender is its own answer; an internal id falls back to the
/// alternate identity, then to the id-to-number mapping.
fn verified_phone(sender: &Jid, sender_alt: Option<&Jid>, mapped_phone: Option<&str>) -> Option<String> {
    if !sender.is_lid() {
        return Some(sender.to_string());
    }
    sender_alt
        .filter(|alt| !alt.is_lid())
        .map(ToString::to_string)
        .or_else(|| mapped_phone.map(str::to_string))
}

fn recipient_jid(recipient: &str) -> Result<Jid> {
    let trimmed = recipient.trim();
    if trimmed.is_empty() {
        anyhow::bail!("Recipient cannot be empty");
    }

    if trimmed.contains('@') {
        return trimmed
            .parse::<Jid>()
            .map_err(|e| anyhow!("Invalid WhatsApp JID `{trimmed}`: {e}"));
    }

    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        anyhow::bail!("Recipient `{trimmed}` does not contain a valid phone number");
    }
    Ok(Jid::pn(digits))
}
