use crate::error::GatewayError;
use crate::model::{Bundle, DomainEvent, PermissionKind, ServerCapabilityFlags, UpstreamSpec};
use crate::namespace::{HashMode, NamespaceResolver};
use crate::notification::{ChangeKind, NotificationCoordinator};
use crate::pool::ConnectorPool;
use crate::upstream::connection::{UpstreamConnection, HEALTH_CHECK_INTERVAL};
use crate::upstream::{RequestOptions, UpstreamConnector, UpstreamGuard};
use anyhow::{anyhow, Result};
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, Prompt, ReadResourceRequestParam, ReadResourceResult, Resource,
    ResourceTemplate, Tool,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_MONITOR_TICK: Duration = Duration::from_secs(60);
const MAX_EVENT_QUEUE: usize = 256;

/// One upstream as attached to a live session: the real (or pooled)
/// connector, a namespace-and-permission filtering layer, and whether the
/// connector is owned by the process-wide pool (and therefore must not be
/// disconnected when the session closes).
struct AttachedUpstream {
    connector: Arc<UpstreamConnection>,
    guard: UpstreamGuard,
    pooled: bool,
}

/// Configuration knobs a session is built with; split out of `Session`
/// itself so gateway.rs can hold one shared value across sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub upstream_timeout: Duration,
    pub hash_mode: HashMode,
    pub namespace_threshold: usize,
    /// Mirrors `AppConfig::dev_mode` — allows upstream URLs that resolve to
    /// private/loopback addresses past the SSRF gate (§4.2 step 1).
    pub dev_mode: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            hash_mode: HashMode::default(),
            namespace_threshold: 64,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Terminated,
}

/// Aggregate root for one authenticated MCP connection. Owns every attached
/// upstream, the per-session namespace resolver, the debounced notification
/// coordinator, and the idle/health monitor tasks. Created by the bundle
/// resolver's output via `Session::establish`, destroyed via `close`.
pub struct Session {
    pub id: String,
    pub bundle_id: String,
    pub created_at: SystemTime,
    last_activity_at: Mutex<Instant>,
    state: RwLock<SessionState>,
    config: SessionConfig,
    pool: Arc<ConnectorPool>,
    upstreams: RwLock<HashMap<String, AttachedUpstream>>,
    resolver: Arc<Mutex<NamespaceResolver>>,
    coordinator: Arc<NotificationCoordinator>,
    outbound: Mutex<mpsc::UnboundedReceiver<ChangeKind>>,
    events: Mutex<VecDeque<DomainEvent>>,
    resumption_tokens: Arc<StdMutex<HashMap<(String, &'static str), String>>>,
    monitors: Mutex<Vec<CancellationToken>>,
    closed: AtomicBool,
}

impl Session {
    /// Attaches every upstream in `bundle` and starts the idle/health
    /// monitor tasks. Partial upstream-connect failures are logged and
    /// skipped rather than failing the whole session (§4.2/§7).
    pub async fn establish(
        id: String,
        bundle: Bundle,
        pool: Arc<ConnectorPool>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (coordinator, outbound) = NotificationCoordinator::default_debounce();
        let resolver = Arc::new(Mutex::new(NamespaceResolver::new(
            "__",
            config.hash_mode,
            config.namespace_threshold,
        )));

        let session = Arc::new(Self {
            id: id.clone(),
            bundle_id: bundle.bundle_id.clone(),
            created_at: SystemTime::now(),
            last_activity_at: Mutex::new(Instant::now()),
            state: RwLock::new(SessionState::Active),
            config,
            pool,
            upstreams: RwLock::new(HashMap::new()),
            resolver,
            coordinator,
            outbound: Mutex::new(outbound),
            events: Mutex::new(VecDeque::new()),
            resumption_tokens: Arc::new(StdMutex::new(HashMap::new())),
            monitors: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        session
            .push_event(DomainEvent::SessionEstablished {
                session_id: id.clone(),
                bundle_id: bundle.bundle_id.clone(),
                occurred_at: SystemTime::now(),
            })
            .await;

        for spec in bundle.upstreams {
            if let Err(e) = session.attach_upstream(spec.clone()).await {
                tracing::warn!(
                    session_id = %id,
                    namespace = %spec.namespace,
                    error = %e,
                    "failed to attach upstream at session establishment"
                );
            }
        }

        session.clone().spawn_idle_monitor();
        session.clone().spawn_health_monitor();

        session
    }

    async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == SessionState::Active
    }

    async fn touch(&self) {
        *self.last_activity_at.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_activity_at.lock().await.elapsed()
    }

    async fn push_event(&self, event: DomainEvent) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_EVENT_QUEUE {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub async fn drain_events(&self) -> Vec<DomainEvent> {
        self.events.lock().await.drain(..).collect()
    }

    /// Attaches one upstream: rejects if the namespace is already present
    /// or the session is terminated, reuses a pooled connector for
    /// stateless upstreams, connects otherwise, and registers the
    /// notification coordinator.
    pub async fn attach_upstream(&self, spec: UpstreamSpec) -> Result<()> {
        if !self.is_active().await {
            return Err(anyhow!("cannot attach an upstream to a terminated session"));
        }
        if self.upstreams.read().await.contains_key(&spec.namespace) {
            return Err(anyhow!(
                "namespace '{}' is already attached to this session",
                spec.namespace
            ));
        }

        let namespace = spec.namespace.clone();
        let permissions = spec.permissions.clone();

        let connector = if spec.stateless {
            if let Some(pooled) = self.pool.get(&spec.namespace, &spec.url).await {
                pooled
            } else {
                let fresh = Arc::new(UpstreamConnection::with_dev_mode(spec.clone(), self.config.dev_mode));
                fresh.connect().await?;
                self.pool
                    .set(&spec.namespace, &spec.url, fresh.clone())
                    .await;
                fresh
            }
        } else {
            let fresh = Arc::new(UpstreamConnection::with_dev_mode(spec.clone(), self.config.dev_mode));
            fresh.connect().await?;
            fresh
        };

        let pooled = self.pool.is_pooled(&spec.namespace, &spec.url).await;
        self.coordinator.attach(&namespace, &connector).await;

        self.upstreams.write().await.insert(
            namespace.clone(),
            AttachedUpstream {
                connector,
                guard: UpstreamGuard::new(permissions),
                pooled,
            },
        );

        self.push_event(DomainEvent::UpstreamConnected {
            session_id: self.id.clone(),
            namespace,
            occurred_at: SystemTime::now(),
        })
        .await;
        self.touch().await;
        Ok(())
    }

    /// Builds per-call options for `(namespace, operation)`: the last
    /// resumption token recorded for that pair is supplied up front, and a
    /// callback is wired to record whatever token the upstream hands back,
    /// so the *next* call of the same kind on the same upstream can resume
    /// (§4.5 "Resumption tokens").
    fn request_opts(&self, namespace: &str, operation: &'static str) -> RequestOptions {
        let mut opts = RequestOptions::new(self.config.upstream_timeout);
        opts.resumption_token = self.resumption_token(namespace, operation);

        let tokens = self.resumption_tokens.clone();
        let namespace = namespace.to_string();
        opts.on_resumption_token = Some(Arc::new(move |token: String| {
            tokens
                .lock()
                .unwrap()
                .insert((namespace.clone(), operation), token);
        }));
        opts
    }

    /// Aggregated `tools/list` across every attached upstream. Per-upstream
    /// failures degrade that upstream to an empty contribution rather than
    /// failing the whole call (§7 partial-success aggregation).
    pub async fn list_tools(&self) -> ListToolsResult {
        self.touch().await;
        let mut tools: Vec<Tool> = Vec::new();
        let upstreams = self.upstreams.read().await;
        for (namespace, attached) in upstreams.iter() {
            if denies_all(&attached.guard.permissions.tools) {
                continue;
            }
            match attached
                .connector
                .list_tools(PaginatedRequestParam::default(), self.request_opts(namespace, "tools/list"))
                .await
            {
                Ok(result) => {
                    let mut resolver = self.resolver.lock().await;
                    for tool in result.tools {
                        if !attached.guard.engine.is_allowed(&attached.guard.permissions.tools, &tool.name) {
                            continue;
                        }
                        let namespaced = resolver.namespace_tool(namespace, &tool.name);
                        let mut renamed = tool;
                        renamed.name = namespaced.name.into();
                        tools.push(renamed);
                    }
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, error = %e, "listTools failed for upstream, degrading to empty");
                }
            }
        }
        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    /// Resolves `namespaced_name` back to `(namespace, original name)`,
    /// checks permissions, and forwards the call. Returns a structured
    /// `isError: true` result rather than a transport-level error whenever
    /// the namespace or tool is unresolvable or denied (§7).
    pub async fn call_tool(&self, namespaced_name: &str, arguments: Option<serde_json::Map<String, serde_json::Value>>) -> Result<CallToolResult> {
        self.touch().await;
        let (namespace, original_name) = {
            let resolver = self.resolver.lock().await;
            match resolver.extract_namespace_from_name(namespaced_name) {
                Some(pair) => pair,
                None => {
                    return Ok(error_result(
                        GatewayError::NamespaceParseError(namespaced_name.to_string()).as_tool_error_text(),
                    ))
                }
            }
        };

        let upstreams = self.upstreams.read().await;
        let Some(attached) = upstreams.get(&namespace) else {
            return Ok(error_result(format!("no such upstream '{namespace}'")));
        };

        attached.guard.engine.begin_call();
        if !attached.guard.engine.check(
            &attached.guard.permissions,
            PermissionKind::Tool,
            &original_name,
            &self.id,
            &namespace,
        ) {
            return Ok(error_result(
                GatewayError::PermissionDenied {
                    kind: "tool",
                    name: original_name.clone(),
                }
                .as_tool_error_text(),
            ));
        }

        let params = CallToolRequestParams {
            name: original_name.into(),
            arguments,
        };

        match attached.connector.call_tool(params, self.request_opts(&namespace, "tools/call")).await {
            Ok(result) => Ok(result),
            Err(e) => Ok(error_result(format!("upstream '{namespace}' call failed: {e}"))),
        }
    }

    pub async fn list_resources(&self) -> ListResourcesResult {
        self.touch().await;
        let mut resources: Vec<Resource> = Vec::new();
        let upstreams = self.upstreams.read().await;
        for (namespace, attached) in upstreams.iter() {
            match attached
                .connector
                .list_resources(PaginatedRequestParam::default(), self.request_opts(namespace, "resources/list"))
                .await
            {
                Ok(result) => {
                    let resolver = self.resolver.lock().await;
                    for mut resource in result.resources {
                        if !attached
                            .guard
                            .engine
                            .is_allowed(&attached.guard.permissions.resources, &resource.uri)
                        {
                            continue;
                        }
                        resource.uri = resolver.namespace_uri(namespace, &resource.uri).into();
                        resources.push(resource);
                    }
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, error = %e, "listResources failed for upstream, degrading to empty");
                }
            }
        }
        ListResourcesResult {
            resources,
            next_cursor: None,
        }
    }

    pub async fn read_resource(&self, namespaced_uri: &str) -> Result<ReadResourceResult> {
        self.touch().await;
        let (namespace, original_uri) = {
            let resolver = self.resolver.lock().await;
            resolver.extract_namespace_from_uri(namespaced_uri)
        };
        let Some(namespace) = namespace else {
            return Err(GatewayError::NamespaceParseError(namespaced_uri.to_string()).into());
        };

        let upstreams = self.upstreams.read().await;
        let attached = upstreams
            .get(&namespace)
            .ok_or_else(|| anyhow!("no such upstream '{namespace}'"))?;

        attached.guard.engine.begin_call();
        if !attached.guard.engine.check(
            &attached.guard.permissions,
            PermissionKind::Resource,
            &original_uri,
            &self.id,
            &namespace,
        ) {
            return Err(GatewayError::PermissionDenied {
                kind: "resource",
                name: original_uri.clone(),
            }
            .into());
        }

        let params = ReadResourceRequestParam {
            uri: original_uri.into(),
        };
        attached
            .connector
            .read_resource(params, self.request_opts(&namespace, "resources/read"))
            .await
    }

    pub async fn list_resource_templates(&self) -> ListResourceTemplatesResult {
        self.touch().await;
        let mut resource_templates: Vec<ResourceTemplate> = Vec::new();
        let upstreams = self.upstreams.read().await;
        for (namespace, attached) in upstreams.iter() {
            match attached
                .connector
                .list_resource_templates(PaginatedRequestParam::default(), self.request_opts(namespace, "resources/templates/list"))
                .await
            {
                Ok(result) => {
                    let resolver = self.resolver.lock().await;
                    for mut template in result.resource_templates {
                        if !attached
                            .guard
                            .engine
                            .is_allowed(&attached.guard.permissions.resources, &template.uri_template)
                        {
                            continue;
                        }
                        template.uri_template =
                            resolver.namespace_uri(namespace, &template.uri_template).into();
                        resource_templates.push(template);
                    }
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, error = %e, "listResourceTemplates failed for upstream, degrading to empty");
                }
            }
        }
        ListResourceTemplatesResult {
            resource_templates,
            next_cursor: None,
        }
    }

    pub async fn list_prompts(&self) -> ListPromptsResult {
        self.touch().await;
        let mut prompts: Vec<Prompt> = Vec::new();
        let upstreams = self.upstreams.read().await;
        for (namespace, attached) in upstreams.iter() {
            if denies_all(&attached.guard.permissions.prompts) {
                continue;
            }
            match attached
                .connector
                .list_prompts(PaginatedRequestParam::default(), self.request_opts(namespace, "prompts/list"))
                .await
            {
                Ok(result) => {
                    let resolver = self.resolver.lock().await;
                    for mut prompt in result.prompts {
                        if !attached.guard.engine.is_allowed(&attached.guard.permissions.prompts, &prompt.name) {
                            continue;
                        }
                        prompt.name = resolver.namespace_prompt(namespace, &prompt.name);
                        prompts.push(prompt);
                    }
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, error = %e, "listPrompts failed for upstream, degrading to empty");
                }
            }
        }
        ListPromptsResult {
            prompts,
            next_cursor: None,
        }
    }

    pub async fn get_prompt(&self, namespaced_name: &str, arguments: Option<serde_json::Map<String, serde_json::Value>>) -> Result<GetPromptResult> {
        self.touch().await;
        let (namespace, original_name) = {
            let resolver = self.resolver.lock().await;
            resolver
                .extract_namespace_from_name(namespaced_name)
                .ok_or_else(|| anyhow::Error::from(GatewayError::NamespaceParseError(namespaced_name.to_string())))?
        };

        let upstreams = self.upstreams.read().await;
        let attached = upstreams
            .get(&namespace)
            .ok_or_else(|| anyhow!("no such upstream '{namespace}'"))?;

        attached.guard.engine.begin_call();
        if !attached.guard.engine.check(
            &attached.guard.permissions,
            PermissionKind::Prompt,
            &original_name,
            &self.id,
            &namespace,
        ) {
            return Err(GatewayError::PermissionDenied {
                kind: "prompt",
                name: original_name.clone(),
            }
            .into());
        }

        let params = GetPromptRequestParam {
            name: original_name,
            arguments,
        };
        attached
            .connector
            .get_prompt(params, self.request_opts(&namespace, "prompts/get"))
            .await
    }

    pub async fn capabilities_for(&self, namespace: &str) -> Option<ServerCapabilityFlags> {
        let upstreams = self.upstreams.read().await;
        match upstreams.get(namespace) {
            Some(attached) => Some(attached.connector.capabilities().await),
            None => None,
        }
    }

    /// Records a resumption token for `(namespace, operation)`, so the
    /// next call of the same kind on the same upstream can resume a
    /// stream the client disconnected from mid-flight.
    pub fn set_resumption_token(&self, namespace: &str, operation: &'static str, token: String) {
        self.resumption_tokens
            .lock()
            .unwrap()
            .insert((namespace.to_string(), operation), token);
    }

    pub fn resumption_token(&self, namespace: &str, operation: &'static str) -> Option<String> {
        self.resumption_tokens
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), operation))
            .cloned()
    }

    fn spawn_idle_monitor(self: Arc<Self>) {
        let token = CancellationToken::new();
        let child = token.clone();
        let session = self.clone();
        tokio::spawn(async move {
            session.monitors.lock().await.push(token);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_MONITOR_TICK) => {}
                }
                if !session.is_active().await {
                    break;
                }
                if session.idle_for().await >= session.config.idle_timeout {
                    tracing::info!(session_id = %session.id, "session idle timeout reached, closing");
                    session.clone().close("idle timeout").await;
                    break;
                }
            }
        });
    }

    fn spawn_health_monitor(self: Arc<Self>) {
        let token = CancellationToken::new();
        let child = token.clone();
        let session = self.clone();
        tokio::spawn(async move {
            session.monitors.lock().await.push(token);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                }
                if !session.is_active().await {
                    break;
                }
                let upstreams = session.upstreams.read().await;
                for (namespace, attached) in upstreams.iter() {
                    if let Err(e) = attached.connector.health_check().await {
                        tracing::warn!(namespace = %namespace, error = %e, "health check failed, scheduling reconnect");
                        let attempts = attached.connector.increment_reconnect_attempts();
                        if attempts <= crate::upstream::connection::MAX_RECONNECT_ATTEMPTS {
                            let delay = UpstreamConnection::backoff_delay(attempts);
                            let connector = attached.connector.clone();
                            let namespace = namespace.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                if let Err(e) = connector.connect().await {
                                    tracing::error!(namespace = %namespace, error = %e, "reconnect attempt failed");
                                }
                            });
                        } else {
                            tracing::error!(namespace = %namespace, "exhausted reconnect attempts");
                        }
                    }
                }
            }
        });
    }

    /// Drains at most one pending outbound notification, for the gateway
    /// to forward as an MCP `list_changed` notification on the downstream
    /// transport. Never blocks.
    pub async fn try_next_notification(&self) -> Option<ChangeKind> {
        self.outbound.lock().await.try_recv().ok()
    }

    /// Idempotent. Marks the session terminated, stops the monitor tasks,
    /// detaches the notification coordinator, disconnects every
    /// non-pooled upstream, and clears the namespace resolver and
    /// resumption-token tables (§4.6 close sequence).
    pub async fn close(self: Arc<Self>, reason: &str) {
        {
            let mut state = self.state.write().await;
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Terminated;
        }

        for token in self.monitors.lock().await.drain(..) {
            token.cancel();
        }

        let connectors: HashMap<String, Arc<UpstreamConnection>> = {
            let upstreams = self.upstreams.read().await;
            upstreams
                .iter()
                .map(|(ns, a)| (ns.clone(), a.connector.clone()))
                .collect()
        };
        self.coordinator.detach_all(&connectors).await;

        let mut upstreams = self.upstreams.write().await;
        for (namespace, attached) in upstreams.drain() {
            if attached.pooled {
                continue;
            }
            attached.connector.disconnect().await;
            self.push_event(DomainEvent::UpstreamDisconnected {
                session_id: self.id.clone(),
                namespace,
                occurred_at: SystemTime::now(),
            })
            .await;
        }
        drop(upstreams);

        self.resumption_tokens.lock().unwrap().clear();
        self.push_event(DomainEvent::SessionTerminated {
            session_id: self.id.clone(),
            reason: reason.to_string(),
            occurred_at: SystemTime::now(),
        })
        .await;

        tracing::info!(session_id = %self.id, reason, "session closed");
    }
}

fn error_result(message: String) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message)])
}

/// Short-circuit for an upstream whose allow-list is `Some(vec![])`
/// (deny-all), so a denied upstream is skipped before issuing the
/// upstream `list` call at all.
fn denies_all(policy: &crate::model::AllowList) -> bool {
    matches!(policy, Some(patterns) if patterns.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthMaterial, AuthStrategy, PermissionSet};

    fn spec(ns: &str) -> UpstreamSpec {
        UpstreamSpec {
            mcp_id: crate::model::McpId(uuid::Uuid::new_v4()),
            namespace: ns.into(),
            url: "https://example.invalid/mcp".into(),
            stateless: false,
            auth_strategy: AuthStrategy::None,
            auth: AuthMaterial::None,
            permissions: PermissionSet::default(),
        }
    }

    #[tokio::test]
    async fn establish_with_no_upstreams_starts_active_and_empty() {
        let bundle = Bundle {
            bundle_id: "b1".into(),
            name: "empty".into(),
            upstreams: vec![],
        };
        let pool = Arc::new(ConnectorPool::new());
        let session = Session::establish("s1".into(), bundle, pool, SessionConfig::default()).await;
        assert!(session.is_active().await);
        let tools = session.list_tools().await;
        assert!(tools.tools.is_empty());
        session.clone().close("test").await;
        assert!(!session.is_active().await);
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let bundle = Bundle {
            bundle_id: "b1".into(),
            name: "empty".into(),
            upstreams: vec![],
        };
        let pool = Arc::new(ConnectorPool::new());
        let session = Session::establish("s1".into(), bundle, pool, SessionConfig::default()).await;
        session.clone().close("first").await;
        session.clone().close("second").await;
        let events = session.drain_events().await;
        let terminations = events
            .iter()
            .filter(|e| matches!(e, DomainEvent::SessionTerminated { .. }))
            .count();
        assert_eq!(terminations, 1);
    }

    #[tokio::test]
    async fn attach_to_terminated_session_is_rejected() {
        let bundle = Bundle {
            bundle_id: "b1".into(),
            name: "empty".into(),
            upstreams: vec![],
        };
        let pool = Arc::new(ConnectorPool::new());
        let session = Session::establish("s1".into(), bundle, pool, SessionConfig::default()).await;
        session.clone().close("test").await;
        let err = session.attach_upstream(spec("files")).await.unwrap_err();
        assert!(err.to_string().contains("terminated"));
    }
}
