pub mod schema;

pub use schema::{
    resolve_config_dir, Config, ConnectionBackend, ConnectionConfig, GatewayConfig, InboundConfig, RelayConfig,
    SessionConfig, StorageConfig, StorageProvider, CONFIG_DIR_ENV,
};
