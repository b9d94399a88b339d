use thiserror::Error;

/// Errors raised by the gateway's domain logic. Aggregate operations never
/// let one of these escape an MCP handler — they are logged and the
/// operation degrades to a partial or empty result (see `session.rs`).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid or unknown bundle token")]
    InvalidToken,

    #[error("bundle not found")]
    BundleNotFound,

    #[error("failed to decrypt credential: {0}")]
    DecryptionFailed(String),

    #[error("upstream URL rejected: {0}")]
    SsrfRejected(String),

    #[error("failed to connect to upstream '{namespace}': {source}")]
    UpstreamConnectFailed {
        namespace: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream '{0}' timed out")]
    UpstreamTimeout(String),

    #[error("permission denied: {kind} \"{name}\" is not allowed for this MCP")]
    PermissionDenied { kind: &'static str, name: String },

    #[error("could not parse namespace from \"{0}\"")]
    NamespaceParseError(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// JSON-RPC error code, for the handful of error kinds that are
    /// surfaced as protocol-level errors rather than structured results.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            GatewayError::InvalidToken => -32001,
            GatewayError::BundleNotFound => -32002,
            GatewayError::DecryptionFailed(_) => -32003,
            GatewayError::SsrfRejected(_) => -32004,
            GatewayError::UpstreamConnectFailed { .. } => -32005,
            GatewayError::UpstreamTimeout(_) => -32006,
            GatewayError::PermissionDenied { .. } => -32007,
            GatewayError::NamespaceParseError(_) => -32600,
            GatewayError::Fatal(_) => -32000,
        }
    }

    /// HTTP status for errors that occur during connection establishment
    /// (the only point at which this gateway speaks plain HTTP semantics).
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::InvalidToken => 401,
            GatewayError::BundleNotFound => 404,
            GatewayError::DecryptionFailed(_) => 500,
            GatewayError::Fatal(_) => 500,
            _ => 500,
        }
    }

    /// Renders as the human-readable text the spec requires inside
    /// `isError: true` `CallToolResult`/equivalent structured results.
    pub fn as_tool_error_text(&self) -> String {
        self.to_string()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
