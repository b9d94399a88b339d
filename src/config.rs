use crate::namespace::HashMode;
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrent_sessions: usize,
    pub idle_timeout_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 256,
            idle_timeout_ms: 5 * 60 * 1000,
        }
    }
}

/// Gateway configuration. Loaded from a JSON file on disk and overridden by
/// CLI flags, mirroring the teacher's `AppConfig`/`ConfigManager` split —
/// just with a bearer-auth gateway's knobs instead of a desktop app's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub server_version: String,
    pub concurrency: ConcurrencyConfig,
    pub upstream_timeout_ms: u64,
    pub allow_wildcard_token: bool,
    pub wildcard_token: Option<String>,
    pub hash_mode: HashMode,
    pub namespace_threshold: usize,
    /// Disables SSRF protection for local development against
    /// loopback/private upstreams. Never set in production.
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            server_name: "mcp-bundle-gateway".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            concurrency: ConcurrencyConfig::default(),
            upstream_timeout_ms: 30_000,
            allow_wildcard_token: false,
            wildcard_token: None,
            hash_mode: HashMode::default(),
            namespace_threshold: 64,
            dev_mode: false,
        }
    }
}

/// Manages loading and saving the JSON config file.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    /// Load config from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> Result<AppConfig> {
        if !self.config_path.exists() {
            tracing::info!("config file not found, using defaults");
            return Ok(AppConfig::default());
        }

        let data = std::fs::read_to_string(&self.config_path)
            .context("failed to read config file")?;

        let config: AppConfig =
            serde_json::from_str(&data).context("failed to parse config file")?;

        tracing::info!(path = %self.config_path.display(), "loaded config");
        Ok(config)
    }

    pub fn save(&self, config: &AppConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }

        let data = serde_json::to_string_pretty(config).context("failed to serialize config")?;
        std::fs::write(&self.config_path, data).context("failed to write config file")?;

        tracing::info!(path = %self.config_path.display(), "saved config");
        Ok(())
    }

    pub fn validate(config: &AppConfig) -> Result<(), String> {
        if config.port < 1024 {
            return Err("port must be >= 1024".to_string());
        }
        if config.upstream_timeout_ms == 0 {
            return Err("upstream_timeout_ms must be > 0".to_string());
        }
        if config.allow_wildcard_token && config.wildcard_token.is_none() {
            return Err("allow_wildcard_token requires wildcard_token to be set".to_string());
        }
        if config.namespace_threshold == 0 {
            return Err("namespace_threshold must be > 0".to_string());
        }
        Ok(())
    }
}

/// CLI overrides layered on top of the config file, per the corpus'
/// `clap`-derive convention.
#[derive(Debug, Parser)]
#[command(name = "mcp-bundle-gateway", version, about = "Multiplexing gateway for MCP servers")]
pub struct Cli {
    /// Path to the JSON config file.
    #[arg(long, default_value = "mcp-bundle-gateway.json")]
    pub config: PathBuf,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Disables SSRF protection against loopback/private upstream URLs.
    #[arg(long)]
    pub dev: bool,
}

impl Cli {
    pub fn apply(&self, mut config: AppConfig) -> AppConfig {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.dev {
            config.dev_mode = true;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ConfigManager::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn rejects_privileged_port() {
        let mut config = AppConfig::default();
        config.port = 80;
        assert!(ConfigManager::validate(&config).is_err());
    }

    #[test]
    fn wildcard_requires_token() {
        let mut config = AppConfig::default();
        config.allow_wildcard_token = true;
        assert!(ConfigManager::validate(&config).is_err());
    }
}
