use crate::crypto::{constant_time_eq, hash_token, decrypt, EncryptionKey};
use crate::error::GatewayError;
use crate::model::{AuthMaterial, AuthStrategy, Bundle, McpId, PermissionSet, UpstreamSpec};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid or unknown bundle token")]
    InvalidToken,
    #[error("bundle not found")]
    BundleNotFound,
}

/// One registered upstream MCP, as the external persistence layer (out of
/// scope here) would hand it to the resolver.
#[derive(Debug, Clone)]
pub struct McpRecord {
    pub mcp_id: McpId,
    pub namespace: String,
    pub url: String,
    pub stateless: bool,
    /// The MCP's own intrinsic auth configuration, independent of any
    /// bundle membership's `auth_strategy` — this is what the wildcard
    /// path must consult, since it has no membership row to ask.
    pub auth_strategy: AuthStrategy,
    /// `None` when no master credential has been configured for this MCP.
    pub master_credential_encrypted: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub mcp_id: McpId,
    pub auth_strategy: AuthStrategy,
    pub permissions: PermissionSet,
}

#[derive(Debug, Clone)]
pub struct BundleRecord {
    pub bundle_id: String,
    pub name: String,
    pub memberships: Vec<MembershipRow>,
}

#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token_hash: String,
    pub bundle_id: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Everything the resolver needs from the persistence layer the spec
/// places out of scope. A real deployment implements this against a
/// relational store; this crate ships only `StaticBundleStore`.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn find_token(&self, token_hash: &str) -> Option<TokenRecord>;
    async fn find_bundle(&self, bundle_id: &str) -> Option<BundleRecord>;
    async fn find_mcp(&self, mcp_id: McpId) -> Option<McpRecord>;
    /// Credential bound to `(tokenId, mcpId)` for USER_SET upstreams.
    /// Keyed by token hash since the resolver never holds a raw token id.
    async fn find_user_credential(&self, token_hash: &str, mcp_id: McpId) -> Option<String>;
    /// All MCPs registered in the system, for the wildcard-token path.
    async fn all_mcps(&self) -> Vec<McpRecord>;
}

pub struct BundleResolver<S: BundleStore> {
    store: S,
    key: EncryptionKey,
    wildcard_token: Option<String>,
}

impl<S: BundleStore> BundleResolver<S> {
    pub fn new(store: S, key: EncryptionKey, wildcard_token: Option<String>) -> Self {
        Self {
            store,
            key,
            wildcard_token,
        }
    }

    /// §4.1 Bundle Resolver algorithm.
    pub async fn resolve(&self, token: &str) -> Result<Bundle, ResolveError> {
        if let Some(wildcard) = &self.wildcard_token {
            if constant_time_eq(token, wildcard) {
                return Ok(self.resolve_wildcard().await);
            }
        }

        let token_hash = hash_token(token);
        let record = self
            .store
            .find_token(&token_hash)
            .await
            .ok_or(ResolveError::InvalidToken)?;

        if record.revoked_at.is_some() {
            return Err(ResolveError::InvalidToken);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at < Utc::now() {
                return Err(ResolveError::InvalidToken);
            }
        }

        let bundle_record = self
            .store
            .find_bundle(&record.bundle_id)
            .await
            .ok_or(ResolveError::BundleNotFound)?;

        let mut upstreams = Vec::new();
        for membership in &bundle_record.memberships {
            let Some(mcp) = self.store.find_mcp(membership.mcp_id).await else {
                continue;
            };
            if !crate::namespace::is_valid_namespace(&mcp.namespace) {
                tracing::warn!(namespace = %mcp.namespace, mcp_id = %membership.mcp_id, "rejecting malformed namespace at bundle load");
                continue;
            }

            let auth = match membership.auth_strategy {
                AuthStrategy::None => AuthMaterial::None,
                AuthStrategy::Master => self.materialise_master(&mcp).await,
                AuthStrategy::UserSet => {
                    match self
                        .store
                        .find_user_credential(&token_hash, membership.mcp_id)
                        .await
                    {
                        None => continue, // excluded, not an error
                        Some(encoded) => match decrypt(&self.key, &encoded) {
                            Ok(material) => deserialise_material(&material),
                            Err(e) => {
                                let err = GatewayError::DecryptionFailed(e.to_string());
                                tracing::error!(mcp_id = %membership.mcp_id, error = %err, "{err}");
                                continue;
                            }
                        },
                    }
                }
            };

            upstreams.push(UpstreamSpec {
                mcp_id: membership.mcp_id,
                namespace: mcp.namespace,
                url: mcp.url,
                stateless: mcp.stateless,
                auth_strategy: membership.auth_strategy,
                auth,
                permissions: membership.permissions.clone(),
            });
        }

        tracing::info!(
            bundle_id = %bundle_record.bundle_id,
            token_prefix = %token_prefix(token),
            upstream_count = upstreams.len(),
            "resolved bundle"
        );

        Ok(Bundle {
            bundle_id: bundle_record.bundle_id,
            name: bundle_record.name,
            upstreams,
        })
    }

    async fn materialise_master(&self, mcp: &McpRecord) -> AuthMaterial {
        match &mcp.master_credential_encrypted {
            None => AuthMaterial::None,
            Some(encoded) => match decrypt(&self.key, encoded) {
                Ok(material) => deserialise_material(&material),
                Err(e) => {
                    let err = GatewayError::DecryptionFailed(e.to_string());
                    tracing::error!(mcp_id = %mcp.mcp_id, error = %err, "{err}");
                    AuthMaterial::None
                }
            },
        }
    }

    async fn resolve_wildcard(&self) -> Bundle {
        let mut upstreams = Vec::new();
        for mcp in self.store.all_mcps().await {
            // Scenario 5: every MCP whose authStrategy is NONE, or MASTER
            // with a non-null master credential. USER_SET MCPs have no
            // per-token identity to bind to here and are always omitted.
            let eligible = match mcp.auth_strategy {
                AuthStrategy::None => true,
                AuthStrategy::Master => mcp.master_credential_encrypted.is_some(),
                AuthStrategy::UserSet => false,
            };
            if !eligible {
                tracing::info!(namespace = %mcp.namespace, auth_strategy = ?mcp.auth_strategy, "skipping upstream for wildcard bundle");
                continue;
            }
            if !crate::namespace::is_valid_namespace(&mcp.namespace) {
                tracing::warn!(namespace = %mcp.namespace, "rejecting malformed namespace at bundle load");
                continue;
            }

            let auth = self.materialise_master(&mcp).await;

            upstreams.push(UpstreamSpec {
                mcp_id: mcp.mcp_id,
                namespace: mcp.namespace,
                url: mcp.url,
                stateless: mcp.stateless,
                auth_strategy: if matches!(auth, AuthMaterial::None) {
                    AuthStrategy::None
                } else {
                    AuthStrategy::Master
                },
                auth,
                permissions: PermissionSet::default(),
            });
        }

        Bundle {
            bundle_id: "wildcard".to_string(),
            name: "Wildcard Access - All MCPs".to_string(),
            upstreams,
        }
    }
}

fn token_prefix(token: &str) -> String {
    token.chars().take(10).collect()
}

fn deserialise_material(raw: &str) -> AuthMaterial {
    serde_json::from_str(raw).unwrap_or(AuthMaterial::None)
}

/// In-memory `BundleStore` for the wildcard-token path and tests. Real
/// deployments implement `BundleStore` against a relational store.
#[derive(Default)]
pub struct StaticBundleStore {
    pub tokens: Vec<TokenRecord>,
    pub bundles: Vec<BundleRecord>,
    pub mcps: Vec<McpRecord>,
    pub user_credentials: std::collections::HashMap<(String, McpId), String>,
}

impl StaticBundleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BundleStore for StaticBundleStore {
    async fn find_token(&self, token_hash: &str) -> Option<TokenRecord> {
        self.tokens.iter().find(|t| t.token_hash == token_hash).cloned()
    }

    async fn find_bundle(&self, bundle_id: &str) -> Option<BundleRecord> {
        self.bundles.iter().find(|b| b.bundle_id == bundle_id).cloned()
    }

    async fn find_mcp(&self, mcp_id: McpId) -> Option<McpRecord> {
        self.mcps.iter().find(|m| m.mcp_id == mcp_id).cloned()
    }

    async fn find_user_credential(&self, token_hash: &str, mcp_id: McpId) -> Option<String> {
        self.user_credentials
            .get(&(token_hash.to_string(), mcp_id))
            .cloned()
    }

    async fn all_mcps(&self) -> Vec<McpRecord> {
        self.mcps.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcp(ns: &str) -> McpRecord {
        McpRecord {
            mcp_id: McpId(Uuid::new_v4()),
            namespace: ns.into(),
            url: "https://example.com/mcp".into(),
            stateless: true,
            auth_strategy: AuthStrategy::None,
            master_credential_encrypted: None,
        }
    }

    #[tokio::test]
    async fn wildcard_token_returns_none_and_master_upstreams() {
        let mut store = StaticBundleStore::new();
        store.mcps.push(mcp("github"));
        let resolver = BundleResolver::new(
            store,
            EncryptionKey::from_secret("secret"),
            Some("mcpb_wildcard".into()),
        );

        let bundle = resolver.resolve("mcpb_wildcard").await.unwrap();
        assert_eq!(bundle.bundle_id, "wildcard");
        assert_eq!(bundle.upstreams.len(), 1);
    }

    #[tokio::test]
    async fn wildcard_token_omits_user_set_and_unconfigured_master_mcps() {
        let mut store = StaticBundleStore::new();
        store.mcps.push(mcp("none-ok"));
        let mut user_set = mcp("user-set");
        user_set.auth_strategy = AuthStrategy::UserSet;
        store.mcps.push(user_set);
        let mut bare_master = mcp("master-unconfigured");
        bare_master.auth_strategy = AuthStrategy::Master;
        store.mcps.push(bare_master);
        let mut configured_master = mcp("master-ok");
        configured_master.auth_strategy = AuthStrategy::Master;
        configured_master.master_credential_encrypted = Some("deadbeef:deadbeef:deadbeef".into());
        store.mcps.push(configured_master);

        let resolver = BundleResolver::new(
            store,
            EncryptionKey::from_secret("secret"),
            Some("mcpb_wildcard".into()),
        );

        let bundle = resolver.resolve("mcpb_wildcard").await.unwrap();
        let namespaces: Vec<_> = bundle.upstreams.iter().map(|u| u.namespace.as_str()).collect();
        assert!(namespaces.contains(&"none-ok"));
        assert!(namespaces.contains(&"master-ok"));
        assert!(!namespaces.contains(&"user-set"));
        assert!(!namespaces.contains(&"master-unconfigured"));
    }

    #[tokio::test]
    async fn malformed_namespace_is_excluded_from_bundle() {
        let mut store = StaticBundleStore::new();
        let mut bad = mcp("has__double_underscore");
        bad.namespace = "has__double_underscore".into();
        let mut good = mcp("fine");
        good.namespace = "fine".into();
        store.mcps.push(bad.clone());
        store.mcps.push(good.clone());

        store.bundles.push(BundleRecord {
            bundle_id: "b1".into(),
            name: "test".into(),
            memberships: vec![
                MembershipRow {
                    mcp_id: bad.mcp_id,
                    auth_strategy: AuthStrategy::None,
                    permissions: PermissionSet::default(),
                },
                MembershipRow {
                    mcp_id: good.mcp_id,
                    auth_strategy: AuthStrategy::None,
                    permissions: PermissionSet::default(),
                },
            ],
        });
        let token_hash = hash_token("mcpb_test");
        store.tokens.push(TokenRecord {
            token_hash,
            bundle_id: "b1".into(),
            revoked_at: None,
            expires_at: None,
        });

        let resolver = BundleResolver::new(store, EncryptionKey::from_secret("secret"), None);
        let bundle = resolver.resolve("mcpb_test").await.unwrap();
        let namespaces: Vec<_> = bundle.upstreams.iter().map(|u| u.namespace.as_str()).collect();
        assert_eq!(namespaces, vec!["fine"]);
    }

    #[tokio::test]
    async fn unknown_token_is_invalid() {
        let store = StaticBundleStore::new();
        let resolver = BundleResolver::new(store, EncryptionKey::from_secret("secret"), None);
        let err = resolver.resolve("mcpb_nope").await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidToken));
    }
}
