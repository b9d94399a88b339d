pub mod auth;
pub mod bundle_resolver;
pub mod config;
pub mod crypto;
pub mod error;
pub mod gateway;
pub mod model;
pub mod namespace;
pub mod notification;
pub mod permissions;
pub mod pool;
pub mod session;
pub mod upstream;

/// Initializes structured logging. Respects `RUST_LOG`, defaulting to
/// `info`, the same convention the desktop incarnation of this codebase
/// used for its own `tracing_subscriber` setup.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
