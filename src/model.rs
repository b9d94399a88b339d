use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

/// Identity of a registered upstream MCP, resolved before any credential
/// lookup so a namespace string can never be substituted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct McpId(pub Uuid);

impl std::fmt::Display for McpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an upstream's credentials are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStrategy {
    /// Upstream requires no credentials.
    None,
    /// Use the MCP's stored master credential, shared by every token.
    Master,
    /// Use a credential bound to the specific `(tokenId, mcpId)` pair.
    UserSet,
}

/// Tagged credential variant. Never smuggled as an untyped map — the
/// resolver decrypts straight into one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthMaterial {
    None,
    Bearer {
        token: String,
    },
    Basic {
        user: String,
        pass: String,
    },
    ApiKey {
        header_name: String,
        value: String,
    },
    OAuth2 {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    },
    Mtls {
        client_cert: String,
        client_key: String,
        ca_bundle: Option<String>,
    },
}

/// Allow-list policy for one kind (tools, resources, or prompts).
/// `None` (the field absent on the wire) means allow-all; `Some(vec![])`
/// means deny-all; `Some(["*"])` is a degenerate allow-all expressed as a
/// pattern so it flows through the same matcher as everything else.
pub type AllowList = Option<Vec<String>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    pub tools: AllowList,
    pub resources: AllowList,
    pub prompts: AllowList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionKind {
    Tool,
    Resource,
    Prompt,
}

impl PermissionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionKind::Tool => "tool",
            PermissionKind::Resource => "resource",
            PermissionKind::Prompt => "prompt",
        }
    }
}

/// One upstream MCP as configured within a bundle. Namespace uniqueness
/// and syntax are enforced at bundle load, not here.
#[derive(Debug, Clone)]
pub struct UpstreamSpec {
    pub mcp_id: McpId,
    pub namespace: String,
    pub url: String,
    pub stateless: bool,
    pub auth_strategy: AuthStrategy,
    pub auth: AuthMaterial,
    pub permissions: PermissionSet,
}

/// Immutable per-resolution snapshot returned by the bundle resolver.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub bundle_id: String,
    pub name: String,
    pub upstreams: Vec<UpstreamSpec>,
}

/// Append-only record of something that happened to a session or upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DomainEvent {
    SessionEstablished {
        session_id: String,
        bundle_id: String,
        #[serde(with = "time_serde")]
        occurred_at: SystemTime,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
        #[serde(with = "time_serde")]
        occurred_at: SystemTime,
    },
    UpstreamConnected {
        session_id: String,
        namespace: String,
        #[serde(with = "time_serde")]
        occurred_at: SystemTime,
    },
    UpstreamDisconnected {
        session_id: String,
        namespace: String,
        #[serde(with = "time_serde")]
        occurred_at: SystemTime,
    },
}

mod time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let dt: chrono::DateTime<chrono::Utc> = (*t).into();
        dt.to_rfc3339().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let s = String::deserialize(d)?;
        let dt = chrono::DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)?;
        Ok(dt.into())
    }
}

/// Server-advertised capability flags, per MCP 2024-revision `serverCapabilities`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerCapabilityFlags {
    pub tools: bool,
    pub tools_list_changed: bool,
    pub resources: bool,
    pub resources_list_changed: bool,
    pub resource_templates: bool,
    pub prompts: bool,
    pub prompts_list_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}
