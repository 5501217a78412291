use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::RelayError;
use crate::session::SyncMode;

/// Environment variable that selects the config directory.
pub const CONFIG_DIR_ENV: &str = "WA_RELAY_CONFIG_DIR";
const CONFIG_FILE: &str = "config.toml";

// ── Top-level config ─────────────────────────────────────────────

/// Relay configuration, loaded from `<config_dir>/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Path to config.toml - computed from the config dir, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Namespace of this relay's credentials in the remote store.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub inbound: InboundConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_client_id() -> String {
    "default".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(CONFIG_FILE),
            client_id: default_client_id(),
            storage: StorageConfig::default(),
            session: SessionConfig::default(),
            connection: ConnectionConfig::default(),
            relay: RelayConfig::default(),
            inbound: InboundConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

// ── Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Supabase Storage bucket (default).
    #[default]
    Supabase,
    /// A directory on disk, for single-host deployments and tests.
    Filesystem,
}

/// Remote credential store (`[storage]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    /// Supabase project URL.
    #[serde(default)]
    pub url: Option<String>,
    /// Supabase service key.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Root directory for the filesystem provider.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub sync_mode: SyncMode,
}

fn default_bucket() -> String {
    "whatsapp-sessions".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            url: None,
            api_key: None,
            bucket: default_bucket(),
            root: None,
            sync_mode: SyncMode::default(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Local credential directory (`[session]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    /// Working copy of the credential bundle (default: `<config_dir>/auth`).
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,
    /// Delete local and remote credentials when the device is unlinked.
    #[serde(default)]
    pub clear_on_logout: bool,
}

// ── Connection ───────────────────────────────────────────────────

/// Which protocol client opens sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionBackend {
    /// In-process wa-rs client (requires the `whatsapp-web` build feature).
    WhatsappWeb,
    /// Out-of-process client reached over a JSON WebSocket.
    Bridge,
}

impl Default for ConnectionBackend {
    fn default() -> Self {
        if cfg!(feature = "whatsapp-web") {
            Self::WhatsappWeb
        } else {
            Self::Bridge
        }
    }
}

impl std::str::FromStr for ConnectionBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whatsapp-web" | "whatsapp_web" | "web" => Ok(Self::WhatsappWeb),
            "bridge" => Ok(Self::Bridge),
            other => anyhow::bail!("unknown connection backend `{other}` (expected whatsapp-web or bridge)"),
        }
    }
}

/// Protocol client and reconnect policy (`[connection]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub backend: ConnectionBackend,
    /// WebSocket URL of the protocol bridge (`bridge` backend).
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    /// WhatsApp Web socket override (`whatsapp-web` backend).
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Phone number for pair-code linking instead of a QR scan
    /// (`whatsapp-web` backend), e.g. `"5511987654321"`.
    #[serde(default)]
    pub pair_phone: Option<String>,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 1.0 gives a fixed delay.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// How long a send waits for the bridge to confirm.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:3010".into()
}

fn default_initial_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_send_timeout_secs() -> u64 {
    30
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backend: ConnectionBackend::default(),
            bridge_url: default_bridge_url(),
            ws_url: None,
            pair_phone: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ratio: default_jitter_ratio(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

// ── Relay ────────────────────────────────────────────────────────

/// Webhook and reply timing (`[relay]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RelayConfig {
    /// Automation endpoint. Messages are only logged when unset.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_min_reply_delay_secs")]
    pub min_reply_delay_secs: u64,
    #[serde(default = "default_max_reply_delay_secs")]
    pub max_reply_delay_secs: u64,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

fn default_min_reply_delay_secs() -> u64 {
    10
}

fn default_max_reply_delay_secs() -> u64 {
    20
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            min_reply_delay_secs: default_min_reply_delay_secs(),
            max_reply_delay_secs: default_max_reply_delay_secs(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────

/// Inbound filtering (`[inbound]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InboundConfig {
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Insert the missing mobile `9` in 12-digit Brazilian numbers.
    #[serde(default = "default_true")]
    pub brazil_mobile_digit: bool,
}

fn default_dedup_capacity() -> usize {
    crate::inbound::DEFAULT_DEDUP_CAPACITY
}

fn default_true() -> bool {
    true
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            brazil_mobile_digit: true,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

/// HTTP surface (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Bind host (default: 0.0.0.0)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Bind port (default: 3000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "0.0.0.0".into()
}

fn default_gateway_port() -> u16 {
    3000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".wa-relay"))
}

/// Config directory: explicit argument, then `WA_RELAY_CONFIG_DIR`, then `~/.wa-relay`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir.trim())),
        _ => default_config_dir(),
    }
}

impl Config {
    /// Load `config.toml`, writing defaults first if it does not exist.
    pub async fn load_or_init(config_dir: Option<&Path>) -> Result<Self> {
        let config_dir = resolve_config_dir(config_dir)?;
        let config_path = config_dir.join(CONFIG_FILE);

        fs::create_dir_all(&config_dir)
            .await
            .with_context(|| format!("Failed to create config directory {}", config_dir.display()))?;

        let initialized = if config_path.exists() {
            false
        } else {
            let config = Config {
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.save().await?;

            // Restrict permissions on newly created config file (may contain API keys)
            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            true
        };

        let contents = fs::read_to_string(&config_path)
            .await
            .context("Failed to read config file")?;
        let mut config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            client_id = %config.client_id,
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Local credential directory.
    pub fn auth_dir(&self) -> PathBuf {
        self.session
            .auth_dir
            .clone()
            .unwrap_or_else(|| self.config_dir().join("auth"))
    }

    /// Validate configuration values that would cause runtime failures.
    ///
    /// Missing remote store credentials are a [`RelayError::MissingConfig`].
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            anyhow::bail!("client_id must not be empty");
        }
        if !crate::session::bundle::is_valid_blob_name(self.client_id.trim()) {
            anyhow::bail!("client_id must be a single path segment without leading '.'");
        }

        // Storage
        match self.storage.provider {
            StorageProvider::Supabase => {
                if is_blank(self.storage.url.as_deref()) {
                    return Err(RelayError::MissingConfig("storage.url (SUPABASE_URL)").into());
                }
                if is_blank(self.storage.api_key.as_deref()) {
                    return Err(RelayError::MissingConfig("storage.api_key (SUPABASE_KEY)").into());
                }
                if self.storage.bucket.trim().is_empty() {
                    anyhow::bail!("storage.bucket must not be empty");
                }
            }
            StorageProvider::Filesystem => {
                if self.storage.root.is_none() {
                    return Err(RelayError::MissingConfig("storage.root").into());
                }
            }
        }

        // Connection
        let is_ws = |url: &str| url.starts_with("ws://") || url.starts_with("wss://");
        if self.connection.backend == ConnectionBackend::Bridge && !is_ws(&self.connection.bridge_url) {
            anyhow::bail!("connection.bridge_url must start with ws:// or wss://");
        }
        if let Some(url) = self.connection.ws_url.as_deref() {
            if !is_ws(url) {
                anyhow::bail!("connection.ws_url must start with ws:// or wss://");
            }
        }
        if let Some(phone) = self.connection.pair_phone.as_deref() {
            if phone.is_empty() || !phone.chars().all(|c| c.is_ascii_digit()) {
                anyhow::bail!("connection.pair_phone must be digits only, country code first");
            }
        }
        if self.connection.initial_backoff_ms == 0 {
            anyhow::bail!("connection.initial_backoff_ms must be greater than 0");
        }
        if self.connection.max_backoff_ms < self.connection.initial_backoff_ms {
            anyhow::bail!("connection.max_backoff_ms must be >= connection.initial_backoff_ms");
        }
        if !self.connection.backoff_multiplier.is_finite() || self.connection.backoff_multiplier < 1.0
        {
            anyhow::bail!("connection.backoff_multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.connection.jitter_ratio) {
            anyhow::bail!("connection.jitter_ratio must be within [0.0, 1.0]");
        }
        if self.connection.send_timeout_secs == 0 {
            anyhow::bail!("connection.send_timeout_secs must be greater than 0");
        }

        // Relay
        if self.relay.min_reply_delay_secs >= self.relay.max_reply_delay_secs {
            anyhow::bail!("relay.min_reply_delay_secs must be less than relay.max_reply_delay_secs");
        }
        if self.relay.webhook_timeout_secs == 0 {
            anyhow::bail!("relay.webhook_timeout_secs must be greater than 0");
        }
        if let Some(url) = self.relay.webhook_url.as_deref() {
            reqwest::Url::parse(url).with_context(|| format!("relay.webhook_url is invalid: {url}"))?;
        }

        // Inbound
        if self.inbound.dedup_capacity == 0 {
            anyhow::bail!("inbound.dedup_capacity must be greater than 0");
        }

        // Gateway
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(client_id) = env_first(&["WA_RELAY_CLIENT_ID", "CLIENT_ID"]) {
            self.client_id = client_id;
        }

        if let Some(url) = env_first(&["WA_RELAY_STORAGE_URL", "SUPABASE_URL"]) {
            self.storage.url = Some(url);
        }
        if let Some(key) = env_first(&["WA_RELAY_STORAGE_KEY", "SUPABASE_KEY"]) {
            self.storage.api_key = Some(key);
        }
        if let Some(bucket) = env_first(&["WA_RELAY_STORAGE_BUCKET"]) {
            self.storage.bucket = bucket;
        }
        if let Some(mode) = env_first(&["WA_RELAY_SYNC_MODE"]) {
            match mode.parse::<SyncMode>() {
                Ok(mode) => self.storage.sync_mode = mode,
                Err(e) => tracing::warn!("Ignoring WA_RELAY_SYNC_MODE: {e}"),
            }
        }

        if let Some(url) = env_first(&["WA_RELAY_WEBHOOK_URL", "WEBHOOK_URL"]) {
            self.relay.webhook_url = Some(url);
        }
        if let Some(backend) = env_first(&["WA_RELAY_CONNECTION_BACKEND"]) {
            match backend.parse::<ConnectionBackend>() {
                Ok(backend) => self.connection.backend = backend,
                Err(e) => tracing::warn!("Ignoring WA_RELAY_CONNECTION_BACKEND: {e}"),
            }
        }
        if let Some(url) = env_first(&["WA_RELAY_BRIDGE_URL"]) {
            self.connection.bridge_url = url;
        }
        if let Some(url) = env_first(&["WHATSAPP_WS_URL"]) {
            self.connection.ws_url = Some(url);
        }
        if let Some(phone) = env_first(&["WA_RELAY_PAIR_PHONE"]) {
            self.connection.pair_phone = Some(phone);
        }
        if let Some(dir) = env_first(&["WA_RELAY_AUTH_DIR"]) {
            self.session.auth_dir = Some(PathBuf::from(dir));
        }

        if let Some(port) = env_first(&["WA_RELAY_PORT", "PORT"]) {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!("Ignoring invalid PORT value: {port}"),
            }
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE);

        crate::util::write_atomic(parent_dir, file_name, toml_str.as_bytes()).await?;
        Ok(())
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

fn env_first(names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}
