use clap::Parser;
use mcp_bundle_gateway::bundle_resolver::{BundleResolver, StaticBundleStore};
use mcp_bundle_gateway::config::{Cli, ConfigManager};
use mcp_bundle_gateway::crypto::EncryptionKey;
use mcp_bundle_gateway::error::GatewayError;
use mcp_bundle_gateway::gateway::{self, GatewayState};
use mcp_bundle_gateway::pool::ConnectorPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_bundle_gateway::init_tracing();

    let cli = Cli::parse();
    let manager = ConfigManager::new(cli.config.clone());
    let config = cli.apply(manager.load()?);

    if let Err(e) = ConfigManager::validate(&config) {
        return Err(GatewayError::Fatal(format!("invalid configuration: {e}")).into());
    }

    tracing::info!(
        host = %config.host,
        port = config.port,
        dev_mode = config.dev_mode,
        "mcp-bundle-gateway starting"
    );

    let secret = std::env::var("MCP_BUNDLE_GATEWAY_SECRET").unwrap_or_else(|_| {
        tracing::warn!(
            "MCP_BUNDLE_GATEWAY_SECRET not set, using an ephemeral key \
             (stored credentials will not decrypt across restarts)"
        );
        uuid::Uuid::new_v4().to_string()
    });
    let key = EncryptionKey::from_secret(&secret);
    let store = StaticBundleStore::new();
    let wildcard_token = config
        .allow_wildcard_token
        .then(|| config.wildcard_token.clone())
        .flatten();
    let resolver = Arc::new(BundleResolver::new(store, key, wildcard_token));

    let state = GatewayState {
        resolver,
        pool: Arc::new(ConnectorPool::new()),
        sessions: Arc::new(RwLock::new(HashMap::new())),
        config: config.clone(),
    };

    gateway::serve(config, state).await
}
