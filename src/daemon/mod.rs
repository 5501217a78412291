use crate::config::{Config, ConnectionBackend, StorageProvider};
use crate::connection::{
    BridgeConnector, Connector, ConnectionHandle, ConnectionState, ConnectionSupervisor,
    ReconnectPolicy,
};
use crate::error::RelayError;
use crate::gateway::{self, AppState};
use crate::health::HealthRegistry;
use crate::inbound::{self, BrazilMobileDigitRule, DedupWindow, InboundFilter, SenderNormalizer};
use crate::relay::{DelayWindow, OutboundRelay, ReplyScheduler, WebhookClient};
use crate::session::{CredentialStore, FilesystemStore, RemoteStore, SupabaseStore, SyncMode};
use anyhow::{Context, Result};
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const STATUS_FLUSH_SECONDS: u64 = 5;
const INBOUND_BUFFER: usize = 256;
const GATEWAY_INITIAL_BACKOFF_SECS: u64 = 1;
const GATEWAY_MAX_BACKOFF_SECS: u64 = 30;
const LOGOUT_TIMEOUT_SECS: u64 = 10;

pub async fn run(config: Config) -> Result<()> {
    let health = HealthRegistry::new();
    health.mark_component_ok("daemon");

    let auth_dir = config.auth_dir();
    let credentials = Arc::new(build_credential_store(&config)?);
    let normalizer = Arc::new(build_normalizer(&config));
    let connection = ConnectionHandle::new();
    let cancel = CancellationToken::new();

    let webhook = match config.relay.webhook_url.as_deref() {
        Some(url) => Some(WebhookClient::new(
            url,
            Duration::from_secs(config.relay.webhook_timeout_secs),
        )?),
        None => {
            tracing::warn!("No webhook configured; inbound messages will only be logged");
            None
        }
    };
    let relay = Arc::new(OutboundRelay::new(
        webhook,
        ReplyScheduler::new(Arc::new(connection.clone())),
        DelayWindow::new(
            Duration::from_secs(config.relay.min_reply_delay_secs),
            Duration::from_secs(config.relay.max_reply_delay_secs),
        ),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let connector = build_connector(&config)?;
    let supervisor = ConnectionSupervisor::new(
        connector,
        Arc::clone(&credentials),
        connection.clone(),
        inbound_tx,
        auth_dir.clone(),
        reconnect_policy(&config),
    )
    .clear_on_logout(config.session.clear_on_logout);

    let connection_task = {
        let health = health.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            health.mark_component_ok("connection");
            let outcome = supervisor.run(cancel).await;
            match &outcome {
                Ok(ConnectionState::LoggedOut) => {
                    health.mark_component_error("connection", RelayError::LoggedOut);
                }
                Ok(_) => health.mark_component_ok("connection"),
                Err(e) => health.mark_component_error("connection", e),
            }
            outcome
        })
    };

    let relay_tasks = TaskTracker::new();
    let filter_task = {
        let filter = InboundFilter::new(
            DedupWindow::new(config.inbound.dedup_capacity),
            build_normalizer(&config),
        );
        let relay = Arc::clone(&relay);
        let relay_tasks = relay_tasks.clone();
        let cancel = cancel.clone();
        tokio::spawn(inbound::run_filter(filter, inbound_rx, cancel, move |msg| {
            let relay = Arc::clone(&relay);
            relay_tasks.spawn(async move {
                relay.relay(msg).await;
            });
        }))
    };

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(
        state_file_path(&config),
        health.clone(),
        connection.clone(),
    )];
    {
        let state = AppState {
            connection: connection.clone(),
            normalizer,
            health: health.clone(),
        };
        let host = config.gateway.host.clone();
        let port = config.gateway.port;
        let gateway_cancel = cancel.clone();
        handles.push(spawn_component_supervisor(
            "gateway",
            health.clone(),
            cancel.clone(),
            GATEWAY_INITIAL_BACKOFF_SECS,
            GATEWAY_MAX_BACKOFF_SECS,
            move || {
                let state = state.clone();
                let host = host.clone();
                let cancel = gateway_cancel.clone();
                async move { gateway::run_gateway(&host, port, state, cancel).await }
            },
        ));
    }

    println!("📨 wa-relay started");
    println!("   Client:   {}", config.client_id);
    println!("   Gateway:  http://{}:{}", config.gateway.host, config.gateway.port);
    println!("   Bridge:   {}", config.connection.bridge_url);
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    health.mark_component_error("daemon", "shutdown requested");
    cancel.cancel();

    let final_state = match connection_task.await {
        Ok(Ok(state)) => state,
        Ok(Err(e)) => {
            tracing::warn!("Connection supervisor failed: {e:#}");
            ConnectionState::Disconnected
        }
        Err(e) => {
            tracing::warn!("Connection supervisor panicked: {e}");
            ConnectionState::Disconnected
        }
    };
    let _ = filter_task.await;
    relay_tasks.close();
    relay_tasks.wait().await;
    relay.shutdown().await;

    if final_state == ConnectionState::LoggedOut && config.session.clear_on_logout {
        tracing::info!("Credentials were torn down after logout; skipping final sync");
    } else {
        final_sync(&credentials, &auth_dir).await;
    }

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

async fn final_sync(credentials: &CredentialStore, auth_dir: &std::path::Path) {
    if !auth_dir.exists() {
        return;
    }
    match credentials.sync_from(auth_dir, None).await {
        Ok(report) => tracing::info!(
            uploaded = report.uploaded.len(),
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "Final credential sync finished"
        ),
        Err(e) => tracing::warn!("Final credential sync failed: {e:#}"),
    }
}

/// Upload the local bundle once.
pub async fn sync_once(config: &Config, full: bool) -> Result<()> {
    let credentials = build_credential_store(config)?;
    let mode = if full { SyncMode::Full } else { credentials.mode() };
    let report = credentials
        .sync_with_mode(&config.auth_dir(), None, mode)
        .await?;
    println!(
        "Uploaded {} blob(s), {} unchanged, {} failed",
        report.uploaded.len(),
        report.unchanged,
        report.failed.len()
    );
    if !report.failed.is_empty() {
        anyhow::bail!("Failed to upload: {}", report.failed.join(", "));
    }
    Ok(())
}

/// Restore the remote bundle into the local auth directory once.
pub async fn fetch_once(config: &Config) -> Result<()> {
    let credentials = build_credential_store(config)?;
    let auth_dir = config.auth_dir();
    if credentials.fetch_into(&auth_dir).await? {
        println!("Restored credentials into {}", auth_dir.display());
    } else {
        println!(
            "No remote credentials for client '{}'; a new link will be required",
            config.client_id
        );
    }
    Ok(())
}

/// Unlink the device (best effort) and delete local and remote credentials.
pub async fn logout(config: &Config) -> Result<()> {
    let auth_dir = config.auth_dir();
    let connector = build_connector(config)?;
    let unlinked = tokio::time::timeout(Duration::from_secs(LOGOUT_TIMEOUT_SECS), async {
        let connection = connector.connect(&auth_dir).await?;
        connection.session.logout().await?;
        connection.session.close().await;
        anyhow::Ok(())
    })
    .await;
    match unlinked {
        Ok(Ok(())) => println!("Device unlinked"),
        Ok(Err(e)) => tracing::warn!("Could not unlink through {}: {e:#}", connector.name()),
        Err(_) => tracing::warn!("Timed out unlinking through {}", connector.name()),
    }

    let credentials = build_credential_store(config)?;
    credentials.teardown(&auth_dir).await?;
    println!("Credentials for client '{}' removed", config.client_id);
    Ok(())
}

pub fn build_connector(config: &Config) -> Result<Arc<dyn Connector>> {
    match config.connection.backend {
        ConnectionBackend::Bridge => Ok(Arc::new(BridgeConnector::new(
            config.connection.bridge_url.clone(),
            Duration::from_secs(config.connection.send_timeout_secs),
        ))),
        #[cfg(feature = "whatsapp-web")]
        ConnectionBackend::WhatsappWeb => Ok(Arc::new(
            crate::connection::WhatsAppWebConnector::new(
                config.connection.ws_url.clone(),
                config.connection.pair_phone.clone(),
            ),
        )),
        #[cfg(not(feature = "whatsapp-web"))]
        ConnectionBackend::WhatsappWeb => anyhow::bail!(
            "The whatsapp-web connection backend requires the 'whatsapp-web' feature. \
             Enable with: cargo build --features whatsapp-web"
        ),
    }
}

pub fn build_credential_store(config: &Config) -> Result<CredentialStore> {
    let remote: Arc<dyn RemoteStore> = match config.storage.provider {
        StorageProvider::Supabase => {
            let url = config
                .storage
                .url
                .as_deref()
                .ok_or(RelayError::MissingConfig("storage.url (SUPABASE_URL)"))?;
            let key = config
                .storage
                .api_key
                .as_deref()
                .ok_or(RelayError::MissingConfig("storage.api_key (SUPABASE_KEY)"))?;
            Arc::new(
                SupabaseStore::new(url, key, &config.storage.bucket)
                    .context("Failed to configure Supabase storage")?,
            )
        }
        StorageProvider::Filesystem => {
            let root = config
                .storage
                .root
                .clone()
                .ok_or(RelayError::MissingConfig("storage.root"))?;
            Arc::new(FilesystemStore::new(root))
        }
    };
    Ok(CredentialStore::new(
        remote,
        config.client_id.trim(),
        config.storage.sync_mode,
    ))
}

pub fn build_normalizer(config: &Config) -> SenderNormalizer {
    let normalizer = SenderNormalizer::new();
    if config.inbound.brazil_mobile_digit {
        normalizer.with_rule(Box::new(BrazilMobileDigitRule))
    } else {
        normalizer
    }
}

pub fn reconnect_policy(config: &Config) -> ReconnectPolicy {
    ReconnectPolicy::new(
        Duration::from_millis(config.connection.initial_backoff_ms),
        Duration::from_millis(config.connection.max_backoff_ms),
        config.connection.backoff_multiplier,
        config.connection.jitter_ratio,
    )
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

fn spawn_state_writer(
    path: PathBuf,
    health: HealthRegistry,
    connection: ConnectionHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            interval.tick().await;
            let mut json = health.snapshot_json();
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "written_at".into(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
                obj.insert("connection".into(), serde_json::json!(connection.state()));
            }
            let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
            if let Err(e) = tokio::fs::write(&path, data).await {
                tracing::debug!(path = %path.display(), "Failed to write daemon state file: {e}");
            }
        }
    })
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    health: HealthRegistry,
    cancel: CancellationToken,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            health.mark_component_ok(name);
            match run_component().await {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => {
                    health.mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    // Clean exit: reset backoff since the component ran successfully
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    health.mark_component_error(name, format!("{e:#}"));
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            health.bump_component_restart(name);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(backoff)) => {}
            }
            // Double backoff AFTER sleeping so first error uses initial_backoff
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config {
            config_path: tmp.path().join("config.toml"),
            ..Config::default()
        };
        config.storage.provider = StorageProvider::Filesystem;
        config.storage.root = Some(tmp.path().join("store"));
        config
    }

    #[test]
    fn bridge_backend_builds_bridge_connector() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.connection.backend = ConnectionBackend::Bridge;
        assert_eq!(build_connector(&config).unwrap().name(), "bridge");
    }

    #[test]
    #[cfg(not(feature = "whatsapp-web"))]
    fn whatsapp_web_backend_needs_feature() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.connection.backend = ConnectionBackend::WhatsappWeb;
        let err = build_connector(&config).err().unwrap();
        assert!(err.to_string().contains("--features whatsapp-web"));
    }

    #[test]
    #[cfg(feature = "whatsapp-web")]
    fn whatsapp_web_backend_builds_native_connector() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.connection.backend = ConnectionBackend::WhatsappWeb;
        assert_eq!(build_connector(&config).unwrap().name(), "whatsapp-web");
    }

    #[test]
    fn state_file_path_uses_config_directory() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);

        let path = state_file_path(&config);
        assert_eq!(path, tmp.path().join("daemon_state.json"));
    }

    #[tokio::test]
    async fn state_writer_flushes_snapshot_and_survives_write_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("daemon_state.json");
        let health = HealthRegistry::new();
        health.mark_component_ok("gateway");

        let writer = spawn_state_writer(path.clone(), health.clone(), ConnectionHandle::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let state: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(state["connection"], "disconnected");
        assert_eq!(state["components"]["gateway"]["status"], "ok");
        writer.abort();

        // Parent is a regular file, so every write fails.
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let failing = spawn_state_writer(blocker.join("state.json"), health, ConnectionHandle::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!failing.is_finished());
        failing.abort();
    }

    #[tokio::test]
    async fn supervisor_marks_error_and_restart_on_failure() {
        let health = HealthRegistry::new();
        let cancel = CancellationToken::new();
        let handle = spawn_component_supervisor(
            "daemon-test-fail",
            health.clone(),
            cancel.clone(),
            1,
            1,
            || async { anyhow::bail!("boom") },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let component = health.component("daemon-test-fail").unwrap();
        assert_eq!(component.status, "error");
        assert!(component.restart_count >= 1);
        assert!(component.last_error.unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn supervisor_marks_unexpected_exit_as_error() {
        let health = HealthRegistry::new();
        let cancel = CancellationToken::new();
        let handle = spawn_component_supervisor(
            "daemon-test-exit",
            health.clone(),
            cancel.clone(),
            1,
            1,
            || async { Ok(()) },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let component = health.component("daemon-test-exit").unwrap();
        assert_eq!(component.status, "error");
        assert!(component.restart_count >= 1);
        assert!(component
            .last_error
            .unwrap_or_default()
            .contains("component exited unexpectedly"));
    }

    #[tokio::test]
    async fn supervisor_stops_quietly_after_cancel() {
        let health = HealthRegistry::new();
        let cancel = CancellationToken::new();
        let inner = cancel.clone();
        let handle = spawn_component_supervisor(
            "daemon-test-cancel",
            health.clone(),
            cancel.clone(),
            1,
            1,
            move || {
                let inner = inner.clone();
                async move {
                    inner.cancelled().await;
                    Ok(())
                }
            },
        );

        cancel.cancel();
        handle.await.unwrap();
        let component = health.component("daemon-test-cancel").unwrap();
        assert_eq!(component.status, "ok");
        assert_eq!(component.restart_count, 0);
    }

    #[test]
    fn normalizer_rule_follows_config() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        assert_eq!(build_normalizer(&config).rule_names().len(), 1);
        config.inbound.brazil_mobile_digit = false;
        assert!(build_normalizer(&config).rule_names().is_empty());
    }

    #[test]
    fn supabase_without_credentials_is_missing_config() {
        let config = Config::default();
        let err = build_credential_store(&config).err().unwrap();
        assert!(err.downcast_ref::<RelayError>().is_some_and(RelayError::is_fatal));
    }

    #[tokio::test]
    async fn sync_then_fetch_round_trips_through_filesystem_store() {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(&tmp);
        config.session.auth_dir = Some(tmp.path().join("auth"));
        std::fs::create_dir_all(tmp.path().join("auth")).unwrap();
        std::fs::write(tmp.path().join("auth").join("creds.json"), b"{\"me\":1}").unwrap();

        sync_once(&config, false).await.unwrap();
        assert!(tmp.path().join("store/default/creds.json").exists());

        std::fs::remove_dir_all(tmp.path().join("auth")).unwrap();
        fetch_once(&config).await.unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("auth").join("creds.json")).unwrap(),
            b"{\"me\":1}"
        );
    }
}
