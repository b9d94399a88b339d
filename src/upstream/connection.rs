use crate::auth::{build_connect_auth, ConnectAuth};
use crate::error::GatewayError;
use crate::model::{AuthMaterial, ConnectionState, ServerCapabilityFlags, UpstreamSpec};
use crate::upstream::cache::ListCache;
use crate::upstream::ssrf::validate_upstream_url;
use crate::upstream::{RequestOptions, UpstreamConnector};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
};
use rmcp::service::{NotificationContext, RunningService};
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Tools,
    Resources,
    ResourceTemplates,
    Prompts,
}

type ChangeListener = Arc<dyn Fn(ListKind) + Send + Sync>;
type SharedCache<V> = Arc<Mutex<ListCache<V>>>;

/// Forwards `*/list_changed` notifications from the rmcp client session
/// back to the connector so it can invalidate its caches and notify the
/// notification coordinator. Stands in for the teacher's bare `()` client
/// handler, which never needed to observe server-initiated notifications.
/// Invalidation always happens here, independent of whether a listener is
/// attached — the coordinator only decides what gets forwarded downstream.
#[derive(Clone)]
struct GatewayClientHandler {
    tools_cache: SharedCache<Vec<rmcp::model::Tool>>,
    resources_cache: SharedCache<Vec<rmcp::model::Resource>>,
    resource_templates_cache: SharedCache<Vec<rmcp::model::ResourceTemplate>>,
    prompts_cache: SharedCache<Vec<rmcp::model::Prompt>>,
    on_change: Arc<Mutex<Option<ChangeListener>>>,
}

impl GatewayClientHandler {
    async fn fire(&self, kind: ListKind) {
        match kind {
            ListKind::Tools => self.tools_cache.lock().await.invalidate_all(),
            ListKind::Resources => {
                self.resources_cache.lock().await.invalidate_all();
                self.resource_templates_cache.lock().await.invalidate_all();
            }
            ListKind::ResourceTemplates => {
                self.resource_templates_cache.lock().await.invalidate_all()
            }
            ListKind::Prompts => self.prompts_cache.lock().await.invalidate_all(),
        }
        if let Some(cb) = self.on_change.lock().await.clone() {
            cb(kind);
        }
    }
}

impl ClientHandler for GatewayClientHandler {
    async fn on_tool_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.fire(ListKind::Tools).await;
    }

    async fn on_resource_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.fire(ListKind::Resources).await;
    }

    async fn on_prompt_list_changed(&self, _context: NotificationContext<RoleClient>) {
        self.fire(ListKind::Prompts).await;
    }
}

/// Real MCP client connector for a single upstream. Adapted from the
/// teacher's `mcp/connection.rs::McpConnection`, generalised to the
/// tagged `AuthMaterial` auth model, SSRF validation, capability gating,
/// and list caching the gateway spec requires.
pub struct UpstreamConnection {
    spec: UpstreamSpec,
    dev_mode: bool,
    state: Mutex<ConnectionState>,
    service: Mutex<Option<RunningService<RoleClient, GatewayClientHandler>>>,
    handler: GatewayClientHandler,
    capabilities: RwLock<ServerCapabilityFlags>,
    tools_cache: SharedCache<Vec<rmcp::model::Tool>>,
    resources_cache: SharedCache<Vec<rmcp::model::Resource>>,
    resource_templates_cache: SharedCache<Vec<rmcp::model::ResourceTemplate>>,
    prompts_cache: SharedCache<Vec<rmcp::model::Prompt>>,
    reconnect_attempts: AtomicU32,
    last_health_check: Mutex<Option<Instant>>,
    connected: AtomicBool,
}

impl UpstreamConnection {
    pub fn new(spec: UpstreamSpec) -> Self {
        Self::with_dev_mode(spec, false)
    }

    pub fn with_dev_mode(spec: UpstreamSpec, dev_mode: bool) -> Self {
        let tools_cache = Arc::new(Mutex::new(ListCache::new()));
        let resources_cache = Arc::new(Mutex::new(ListCache::new()));
        let resource_templates_cache = Arc::new(Mutex::new(ListCache::new()));
        let prompts_cache = Arc::new(Mutex::new(ListCache::new()));

        let handler = GatewayClientHandler {
            tools_cache: tools_cache.clone(),
            resources_cache: resources_cache.clone(),
            resource_templates_cache: resource_templates_cache.clone(),
            prompts_cache: prompts_cache.clone(),
            on_change: Arc::new(Mutex::new(None)),
        };

        Self {
            spec,
            dev_mode,
            state: Mutex::new(ConnectionState::Disconnected),
            service: Mutex::new(None),
            handler,
            capabilities: RwLock::new(ServerCapabilityFlags::default()),
            tools_cache,
            resources_cache,
            resource_templates_cache,
            prompts_cache,
            reconnect_attempts: AtomicU32::new(0),
            last_health_check: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &UpstreamSpec {
        &self.spec
    }

    /// Registers the callback the notification coordinator attaches on
    /// `attachUpstream`.
    pub async fn set_change_listener(&self, listener: ChangeListener) {
        *self.handler.on_change.lock().await = Some(listener);
    }

    pub async fn clear_change_listener(&self) {
        *self.handler.on_change.lock().await = None;
    }

    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.lock().await;
        tracing::info!(
            namespace = %self.spec.namespace,
            from = ?*state,
            to = ?new_state,
            "upstream connection state transition"
        );
        *state = new_state;
        self.connected
            .store(new_state == ConnectionState::Connected, Ordering::Relaxed);
        if new_state == ConnectionState::Connected {
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
    }

    /// Steps 1-5 of the §4.2 Connect procedure.
    pub async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;

        if let Err(e) = validate_upstream_url(&self.spec.url, self.dev_mode) {
            self.set_state(ConnectionState::Disconnected).await;
            return Err(GatewayError::SsrfRejected(e).into());
        }

        let auth = build_connect_auth(&self.spec.auth)?;

        let result = self.open_transport(auth).await;

        match result {
            Ok(()) => {
                if let Err(e) = self.fetch_capabilities().await {
                    tracing::warn!(namespace = %self.spec.namespace, error = %e, "connected but failed to fetch capabilities");
                }
                *self.last_health_check.lock().await = Some(Instant::now());
                self.set_state(ConnectionState::Connected).await;
                Ok(())
            }
            Err(e) => {
                tracing::error!(namespace = %self.spec.namespace, error = %format!("{e:#}"), "upstream connect failed");
                self.set_state(ConnectionState::Disconnected).await;
                Err(GatewayError::UpstreamConnectFailed {
                    namespace: self.spec.namespace.clone(),
                    source: e,
                }
                .into())
            }
        }
    }

    /// Upstreams are HTTP/SSE-only per spec (an upstream is "an external MCP
    /// server reachable via HTTP/SSE"); there is no stdio-upstream path
    /// here, unlike the stdio MCP clients this gateway itself bridges to
    /// (see `bin/mcp-gateway-bridge.rs`).
    async fn open_transport(&self, auth: ConnectAuth) -> Result<()> {
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
        use rmcp::transport::StreamableHttpClientTransport;

        let mut client_builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90));

        match &auth {
            ConnectAuth::Headers(headers) => {
                client_builder = client_builder.default_headers(headers.clone());
            }
            ConnectAuth::Mtls(identity) => {
                let pem = format!("{}\n{}", identity.client_cert, identity.client_key);
                let cert_identity = reqwest::Identity::from_pem(pem.as_bytes())
                    .context("mtls client_cert/client_key is not a valid PEM identity")?;
                client_builder = client_builder.identity(cert_identity);
                if let Some(ca_bundle) = &identity.ca_bundle {
                    let root_cert = reqwest::Certificate::from_pem(ca_bundle.as_bytes())
                        .context("mtls ca_bundle is not a valid PEM certificate")?;
                    client_builder = client_builder.add_root_certificate(root_cert);
                }
            }
        }

        let client = client_builder.build().context("failed to build HTTP client")?;
        let config = StreamableHttpClientTransportConfig::with_uri(self.spec.url.as_str());
        let transport = StreamableHttpClientTransport::with_client(client, config);

        let service = self
            .handler
            .clone()
            .serve(transport)
            .await
            .context("failed to initialize HTTP MCP client")?;

        *self.service.lock().await = Some(service);
        Ok(())
    }

    async fn fetch_capabilities(&self) -> Result<()> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;

        let info = service.peer_info();
        let mut flags = ServerCapabilityFlags::default();
        if let Some(info) = info {
            let caps = &info.capabilities;
            if let Some(tools) = &caps.tools {
                flags.tools = true;
                flags.tools_list_changed = tools.list_changed.unwrap_or(false);
            }
            if let Some(resources) = &caps.resources {
                flags.resources = true;
                flags.resource_templates = true;
                flags.resources_list_changed = resources.list_changed.unwrap_or(false);
            }
            if let Some(prompts) = &caps.prompts {
                flags.prompts = true;
                flags.prompts_list_changed = prompts.list_changed.unwrap_or(false);
            }
        }
        *self.capabilities.write().await = flags;
        Ok(())
    }

    /// Health monitor tick: one MCP ping with a 10s timeout. Call this
    /// from a periodic task owned by the session (see `session.rs`).
    pub async fn health_check(&self) -> Result<()> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, service.list_tools(Default::default()))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))?
            .context("health ping failed")?;

        *self.last_health_check.lock().await = Some(Instant::now());
        Ok(())
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn increment_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// `delay = min(30s, 1s * 2^attempts)`.
    pub fn backoff_delay(attempts: u32) -> Duration {
        let secs = 1u64.saturating_shl(attempts.min(30));
        Duration::from_secs(secs.min(30))
    }
}

#[async_trait]
impl UpstreamConnector for UpstreamConnection {
    fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    fn url(&self) -> &str {
        &self.spec.url
    }

    async fn connect(&self) -> Result<()> {
        UpstreamConnection::connect(self).await
    }

    async fn disconnect(&self) {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            let cancel = service.cancel();
            match tokio::time::timeout(DISCONNECT_TIMEOUT, cancel).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(namespace = %self.spec.namespace, error = %e, "disconnect error"),
                Err(_) => tracing::debug!(namespace = %self.spec.namespace, "disconnect timed out"),
            }
        }
        self.tools_cache.lock().await.invalidate_all();
        self.resources_cache.lock().await.invalidate_all();
        self.resource_templates_cache.lock().await.invalidate_all();
        self.prompts_cache.lock().await.invalidate_all();
        self.set_state(ConnectionState::Disconnected).await;
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn capabilities(&self) -> ServerCapabilityFlags {
        *self.capabilities.read().await
    }

    async fn list_tools(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListToolsResult> {
        if !self.capabilities().await.tools {
            return Ok(ListToolsResult { tools: vec![], next_cursor: None });
        }
        let key = cache_key(&params)?;
        if let Some(cached) = self.tools_cache.lock().await.get(&key) {
            return Ok(ListToolsResult {
                tools: cached,
                next_cursor: None,
            });
        }

        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.list_tools(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;

        self.tools_cache.lock().await.set(key, result.tools.clone());
        Ok(result)
    }

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        opts: RequestOptions,
    ) -> Result<CallToolResult> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.call_tool(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;
        Ok(result)
    }

    async fn list_resources(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListResourcesResult> {
        if !self.capabilities().await.resources {
            return Ok(ListResourcesResult { resources: vec![], next_cursor: None });
        }
        let key = cache_key(&params)?;
        if let Some(cached) = self.resources_cache.lock().await.get(&key) {
            return Ok(ListResourcesResult {
                resources: cached,
                next_cursor: None,
            });
        }

        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.list_resources(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;

        self.resources_cache
            .lock()
            .await
            .set(key, result.resources.clone());
        Ok(result)
    }

    async fn read_resource(
        &self,
        params: ReadResourceRequestParam,
        opts: RequestOptions,
    ) -> Result<ReadResourceResult> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.read_resource(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;
        Ok(result)
    }

    async fn list_resource_templates(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListResourceTemplatesResult> {
        if !self.capabilities().await.resource_templates {
            return Ok(ListResourceTemplatesResult { resource_templates: vec![], next_cursor: None });
        }
        let key = cache_key(&params)?;
        if let Some(cached) = self.resource_templates_cache.lock().await.get(&key) {
            return Ok(ListResourceTemplatesResult {
                resource_templates: cached,
                next_cursor: None,
            });
        }

        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.list_resource_templates(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;

        self.resource_templates_cache
            .lock()
            .await
            .set(key, result.resource_templates.clone());
        Ok(result)
    }

    async fn list_prompts(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListPromptsResult> {
        if !self.capabilities().await.prompts {
            return Ok(ListPromptsResult { prompts: vec![], next_cursor: None });
        }
        let key = cache_key(&params)?;
        if let Some(cached) = self.prompts_cache.lock().await.get(&key) {
            return Ok(ListPromptsResult {
                prompts: cached,
                next_cursor: None,
            });
        }

        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.list_prompts(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;

        self.prompts_cache.lock().await.set(key, result.prompts.clone());
        Ok(result)
    }

    async fn get_prompt(
        &self,
        params: GetPromptRequestParam,
        opts: RequestOptions,
    ) -> Result<GetPromptResult> {
        let service_lock = self.service.lock().await;
        let service = service_lock.as_ref().ok_or_else(|| anyhow!("not connected"))?;
        let result = tokio::time::timeout(opts.timeout, service.get_prompt(params))
            .await
            .map_err(|_| GatewayError::UpstreamTimeout(self.spec.namespace.clone()))??;
        Ok(result)
    }
}

fn cache_key(params: &PaginatedRequestParam) -> Result<String> {
    Ok(serde_json::to_string(params)?)
}

/// Whether `auth_strategy` materialised real credentials, used by the
/// bundle resolver to decide whether MASTER-auth upstreams are eligible
/// for the wildcard bundle.
pub fn has_material_credentials(auth: &AuthMaterial) -> bool {
    !matches!(auth, AuthMaterial::None)
}
