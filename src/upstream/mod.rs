pub mod cache;
pub mod connection;
pub mod ssrf;

use crate::model::ServerCapabilityFlags;
use crate::permissions::PermissionEngine;
use anyhow::Result;
use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, ReadResourceRequestParam, ReadResourceResult,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call options threaded through to the transport: a timeout, a
/// cancellation signal, and the resumption-token plumbing. Modelled as a
/// plain record rather than global state, per the design notes.
#[derive(Clone)]
pub struct RequestOptions {
    pub timeout: std::time::Duration,
    pub cancellation_token: CancellationToken,
    pub resumption_token: Option<String>,
    pub on_resumption_token: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl RequestOptions {
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            timeout,
            cancellation_token: CancellationToken::new(),
            resumption_token: None,
            on_resumption_token: None,
        }
    }
}

/// Capability set satisfied by one real implementation
/// (`connection::UpstreamConnection`) and by the session's filtering
/// wrapper. The session only ever sees the latter.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    fn namespace(&self) -> &str;
    fn url(&self) -> &str;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);
    async fn is_connected(&self) -> bool;
    async fn capabilities(&self) -> ServerCapabilityFlags;

    async fn list_tools(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListToolsResult>;

    async fn call_tool(
        &self,
        params: CallToolRequestParams,
        opts: RequestOptions,
    ) -> Result<CallToolResult>;

    async fn list_resources(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListResourcesResult>;

    async fn read_resource(
        &self,
        params: ReadResourceRequestParam,
        opts: RequestOptions,
    ) -> Result<ReadResourceResult>;

    async fn list_resource_templates(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListResourceTemplatesResult>;

    async fn list_prompts(
        &self,
        params: PaginatedRequestParam,
        opts: RequestOptions,
    ) -> Result<ListPromptsResult>;

    async fn get_prompt(
        &self,
        params: GetPromptRequestParam,
        opts: RequestOptions,
    ) -> Result<GetPromptResult>;
}

/// A permission engine scoped to one upstream's three allow-lists, paired
/// with the connector it guards. Built once per attached upstream.
pub struct UpstreamGuard {
    pub permissions: crate::model::PermissionSet,
    pub engine: PermissionEngine,
}

impl UpstreamGuard {
    pub fn new(permissions: crate::model::PermissionSet) -> Self {
        Self {
            permissions,
            engine: PermissionEngine::new(),
        }
    }
}
