use crate::bundle_resolver::{BundleResolver, ResolveError, StaticBundleStore};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::pool::ConnectorPool;
use crate::session::{Session, SessionConfig};
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Sessions keyed by the `Mcp-Session-Id` this gateway hands back on the
/// first request of a connection. One bearer token may open many
/// concurrent sessions; each gets its own attached upstreams.
type SessionRegistry = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// The gateway ships only `StaticBundleStore` (the persistence layer is out
/// of scope per the spec); a real deployment would make this generic over
/// `BundleStore` the way `bundle_resolver` itself already is.
#[derive(Clone)]
pub struct GatewayState {
    pub resolver: Arc<BundleResolver<StaticBundleStore>>,
    pub pool: Arc<ConnectorPool>,
    pub sessions: SessionRegistry,
    pub config: AppConfig,
}

/// Builds the axum router: a health endpoint, and the three MCP Streamable
/// HTTP verbs on `/mcp`, mirroring the teacher's `proxy/server.rs` shape —
/// dispatch-by-method-string rather than `rmcp`'s server-side typed
/// handler, generalized to per-bearer-token multi-tenant sessions.
pub fn build_router(state: GatewayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/mcp",
            get(mcp_stream).post(mcp_post).delete(mcp_delete),
        )
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: AppConfig, state: GatewayState) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = build_router(state.clone());

    tracing::info!(%addr, "starting mcp bundle gateway");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: GatewayState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining sessions");

    let sessions: Vec<Arc<Session>> = state.sessions.read().await.values().cloned().collect();
    for session in sessions {
        session.close("gateway shutdown").await;
    }
}

#[derive(Clone)]
struct AuthenticatedBundle {
    bundle: crate::model::Bundle,
}

/// Resolves the bearer token to a bundle and stores it in request
/// extensions for the handlers below. Mirrors the teacher's CORS-then-auth
/// layering, with the bearer check itself grounded in the pack's
/// `api_key_auth_middleware` shape (extract `Authorization: Bearer …`,
/// 401 on anything else).
async fn bearer_auth(
    State(state): State<GatewayState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return unauthorized(&GatewayError::InvalidToken);
    };

    match state.resolver.resolve(&token).await {
        Ok(bundle) => {
            request
                .extensions_mut()
                .insert(AuthenticatedBundle { bundle });
            next.run(request).await
        }
        Err(ResolveError::InvalidToken) => unauthorized(&GatewayError::InvalidToken),
        Err(ResolveError::BundleNotFound) => unauthorized(&GatewayError::BundleNotFound),
    }
}

/// Renders a `GatewayError` as the 401 the bearer-auth layer returns.
/// `http_status()` is ignored here deliberately — every auth failure is a
/// 401 regardless of the error's "natural" status, matching the teacher's
/// single `unauthorized()` shape — but the message text and JSON-RPC code
/// come from the shared `GatewayError` taxonomy so auth and dispatch errors
/// read the same way to a client.
fn unauthorized(err: &GatewayError) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"mcp-bundle-gateway\"")],
        Json(json!({ "error": err.to_string(), "code": err.jsonrpc_code() })),
    )
        .into_response()
}

async fn health_check(State(state): State<GatewayState>) -> impl IntoResponse {
    let sessions = state.sessions.read().await.len();
    Json(json!({
        "status": "ok",
        "active_sessions": sessions,
        "pooled_connectors": state.pool.len().await,
    }))
}

/// Finds or establishes the session for this request: reuses the one named
/// by `Mcp-Session-Id` if it is still active, otherwise attaches a fresh
/// session from the resolved bundle.
async fn session_for(
    state: &GatewayState,
    bundle: &crate::model::Bundle,
    mcp_session_id: Option<&str>,
) -> (String, Arc<Session>) {
    if let Some(id) = mcp_session_id {
        if let Some(session) = state.sessions.read().await.get(id) {
            if session.is_active().await {
                return (id.to_string(), session.clone());
            }
        }
    }

    let id = Uuid::new_v4().to_string();
    let session = Session::establish(
        id.clone(),
        bundle.clone(),
        state.pool.clone(),
        SessionConfig {
            idle_timeout: Duration::from_millis(state.config.concurrency.idle_timeout_ms),
            upstream_timeout: Duration::from_millis(state.config.upstream_timeout_ms),
            hash_mode: state.config.hash_mode,
            namespace_threshold: state.config.namespace_threshold,
            dev_mode: state.config.dev_mode,
        },
    )
    .await;
    state.sessions.write().await.insert(id.clone(), session.clone());
    (id, session)
}

/// POST /mcp — the main JSON-RPC endpoint. Accepts a single request object
/// or a batch array, per the Streamable HTTP transport.
async fn mcp_post(
    State(state): State<GatewayState>,
    request: Request,
) -> Result<Response, StatusCode> {
    let bundle = request
        .extensions()
        .get::<AuthenticatedBundle>()
        .ok_or(StatusCode::UNAUTHORIZED)?
        .bundle
        .clone();

    let mcp_session_id = request
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let body = axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: Value = serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let (session_id, session) =
        session_for(&state, &bundle, mcp_session_id.as_deref()).await;

    let mut response = if let Some(requests) = payload.as_array() {
        let mut responses = Vec::new();
        for req in requests {
            if let Some(resp) = handle_single_request(&session, req).await {
                responses.push(resp);
            }
        }
        if responses.is_empty() {
            StatusCode::ACCEPTED.into_response()
        } else {
            Json(Value::Array(responses)).into_response()
        }
    } else {
        match handle_single_request(&session, &payload).await {
            Some(resp) => Json(resp).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        }
    };

    response
        .headers_mut()
        .insert("mcp-session-id", session_id.parse().unwrap());
    Ok(response)
}

/// GET /mcp — server-initiated notifications as an SSE stream. Debounced
/// `list_changed` events collapse into a single event here, per the
/// notification coordinator.
async fn mcp_stream(
    State(state): State<GatewayState>,
    request: Request,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let mcp_session_id = request
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::BAD_REQUEST)?
        .to_string();

    let session = state
        .sessions
        .read()
        .await
        .get(&mcp_session_id)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;

    let poll = stream::unfold(session, |session| async move {
        loop {
            if !session.is_active().await {
                return None;
            }
            if let Some(kind) = session.try_next_notification().await {
                let payload = json!({
                    "jsonrpc": "2.0",
                    "method": kind.method(),
                });
                return Some((Ok(Event::default().data(payload.to_string())), session));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    });

    Ok(Sse::new(poll).keep_alive(KeepAlive::default()))
}

/// DELETE /mcp — explicit session termination.
async fn mcp_delete(State(state): State<GatewayState>, request: Request) -> StatusCode {
    let mcp_session_id = request
        .headers()
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(id) = mcp_session_id else {
        return StatusCode::BAD_REQUEST;
    };

    let session = state.sessions.write().await.remove(&id);
    match session {
        Some(session) => {
            session.close("client requested termination").await;
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Dispatches a single JSON-RPC request object to the session's typed
/// operations. Returns `None` for notifications (no `id`), matching the
/// teacher's `handle_single_request`.
async fn handle_single_request(session: &Arc<Session>, request: &Value) -> Option<Value> {
    let method = request.get("method")?.as_str()?;
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let id = request.get("id").cloned();
    id.as_ref()?;

    let result = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "subscribe": false, "listChanged": true },
                "prompts": { "listChanged": true }
            },
            "serverInfo": {
                "name": "mcp-bundle-gateway",
                "version": env!("CARGO_PKG_VERSION")
            }
        })),
        "tools/list" => serde_json::to_value(session.list_tools().await).map_err(|e| e.to_string()),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").and_then(Value::as_object).cloned();
            match session.call_tool(name, arguments).await {
                Ok(result) => serde_json::to_value(result).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        "resources/list" => {
            serde_json::to_value(session.list_resources().await).map_err(|e| e.to_string())
        }
        "resources/read" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            match session.read_resource(uri).await {
                Ok(result) => serde_json::to_value(result).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        "resources/templates/list" => {
            serde_json::to_value(session.list_resource_templates().await).map_err(|e| e.to_string())
        }
        "prompts/list" => {
            serde_json::to_value(session.list_prompts().await).map_err(|e| e.to_string())
        }
        "prompts/get" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params.get("arguments").and_then(Value::as_object).cloned();
            match session.get_prompt(name, arguments).await {
                Ok(result) => serde_json::to_value(result).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        other => Err(format!("method not found: {other}")),
    };

    Some(match result {
        Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
        Err(message) => {
            let code = if message.starts_with("method not found") {
                -32601
            } else {
                -32000
            };
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message }
            })
        }
    })
}
