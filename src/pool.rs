use crate::upstream::connection::UpstreamConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key identifying a stateless upstream regardless of which bundle/session
/// references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub namespace: String,
    pub url: String,
}

/// Process-wide pool of connectors for `stateless == true` upstreams.
/// Outlives every session; only process shutdown or explicit admin
/// eviction (out of scope here) removes an entry. Must be explicitly
/// constructed at startup and threaded through — never ambient/static.
#[derive(Default)]
pub struct ConnectorPool {
    connectors: RwLock<HashMap<PoolKey, Arc<UpstreamConnection>>>,
}

impl ConnectorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, namespace: &str, url: &str) -> Option<Arc<UpstreamConnection>> {
        let key = PoolKey {
            namespace: namespace.to_string(),
            url: url.to_string(),
        };
        self.connectors.read().await.get(&key).cloned()
    }

    pub async fn has(&self, namespace: &str, url: &str) -> bool {
        self.get(namespace, url).await.is_some()
    }

    pub async fn set(&self, namespace: &str, url: &str, connector: Arc<UpstreamConnection>) {
        let key = PoolKey {
            namespace: namespace.to_string(),
            url: url.to_string(),
        };
        self.connectors.write().await.insert(key, connector);
    }

    pub async fn is_pooled(&self, namespace: &str, url: &str) -> bool {
        self.has(namespace, url).await
    }

    pub async fn len(&self) -> usize {
        self.connectors.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthMaterial, AuthStrategy, UpstreamSpec};
    use uuid::Uuid;

    fn spec(ns: &str, url: &str) -> UpstreamSpec {
        UpstreamSpec {
            mcp_id: crate::model::McpId(Uuid::new_v4()),
            namespace: ns.into(),
            url: url.into(),
            stateless: true,
            auth_strategy: AuthStrategy::None,
            auth: AuthMaterial::None,
            permissions: Default::default(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let pool = ConnectorPool::new();
        assert!(!pool.has("files", "https://x").await);

        let connector = Arc::new(UpstreamConnection::new(spec("files", "https://x")));
        pool.set("files", "https://x", connector.clone()).await;

        assert!(pool.has("files", "https://x").await);
        assert!(pool.is_pooled("files", "https://x").await);
        assert_eq!(pool.len().await, 1);
    }
}
