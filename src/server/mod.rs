mod rpc;
mod tools;

use crate::branch::BranchEngine;
use crate::bus::EventBus;
use crate::collections::Tenant;
use crate::config::LimitsConfig;
use crate::domain::{CheckpointService, RemediationService, SkillService};
use crate::error::{Error, Result};
use crate::registry::SessionRegistry;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use rpc::{RpcRequest, RpcResponse, ToolCallParams};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared server state: the core services plus the per-owner back-pressure
/// ledger.
pub struct AppState {
    pub engine: Arc<BranchEngine>,
    pub checkpoints: Arc<CheckpointService>,
    pub remediations: Arc<RemediationService>,
    pub skills: Arc<SkillService>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<SessionRegistry>,
    pub limits: LimitsConfig,
    inflight: DashMap<String, usize>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<BranchEngine>,
        checkpoints: Arc<CheckpointService>,
        remediations: Arc<RemediationService>,
        skills: Arc<SkillService>,
        bus: Arc<EventBus>,
        registry: Arc<SessionRegistry>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            engine,
            checkpoints,
            remediations,
            skills,
            bus,
            registry,
            limits,
            inflight: DashMap::new(),
        }
    }
}

/// Decrements the owner's inflight count when the call finishes, however
/// it finishes.
struct InflightGuard {
    state: Arc<AppState>,
    owner: String,
}

impl std::fmt::Debug for InflightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightGuard")
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if let Some(mut entry) = self.state.inflight.get_mut(&self.owner) {
            *entry = entry.saturating_sub(1);
        }
    }
}

fn acquire_inflight(state: &Arc<AppState>, owner: &str) -> Result<InflightGuard> {
    {
        let mut entry = state.inflight.entry(owner.to_string()).or_insert(0);
        if *entry >= state.limits.per_owner_inflight {
            return Err(Error::ResourceExhausted(format!(
                "{} tool calls already in flight for this owner; retry shortly",
                *entry
            )));
        }
        *entry += 1;
    }
    Ok(InflightGuard {
        state: state.clone(),
        owner: owner.to_string(),
    })
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp/tools/list", get(tools_list_handler))
        .route("/mcp/tools/call", post(tools_call_handler))
        .route("/mcp/sse", get(sse_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    info!("contextd listening on http://127.0.0.1:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    // Cooperative teardown, outermost first: the dispatcher has stopped
    // accepting calls, in-flight session locks have drained, registry
    // state stays resumable in the vector store.
    info!(
        "dispatcher stopped; {} session(s) left resumable",
        state.registry.session_count()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": chrono::Utc::now().to_rfc3339(),
        "sessions": state.registry.session_count(),
    }))
}

async fn tools_list_handler() -> Json<Value> {
    Json(tools::tool_list())
}

#[derive(Debug, Deserialize)]
struct CallOptions {
    /// `?stream=true` switches the response to SSE framing.
    #[serde(default)]
    stream: bool,
}

#[derive(Debug)]
struct PreparedCall {
    tool: String,
    args: Value,
    tenant: Tenant,
    session_id: String,
}

async fn tools_call_handler(
    State(state): State<Arc<AppState>>,
    Query(options): Query<CallOptions>,
    headers: HeaderMap,
    Json(req): Json<RpcRequest>,
) -> Response {
    let id = req.id.clone();
    let call = match prepare_call(&headers, req) {
        Ok(call) => call,
        Err(e) => return rpc_error_response(id, &e),
    };
    if options.stream {
        stream_call(state, call, id).into_response()
    } else {
        run_and_respond(state, call, id).await
    }
}

/// Authenticate (owner hash), validate the envelope, resolve tenancy.
fn prepare_call(headers: &HeaderMap, req: RpcRequest) -> Result<PreparedCall> {
    if req.method != "tools/call" {
        return Err(Error::invalid_argument(format!(
            "unsupported method {:?}",
            req.method
        )));
    }
    let params: ToolCallParams = serde_json::from_value(req.params)
        .map_err(|e| Error::invalid_argument(format!("invalid params: {e}")))?;
    let principal = headers
        .get("x-owner")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("local");
    let project_path = tools::opt_str(&params.arguments, "project_path")
        .ok_or_else(|| Error::invalid_argument("missing required project_path"))?;
    let tenant = Tenant::resolve(principal, &project_path)?;
    let session_id = tools::opt_str(&params.arguments, "session_id")
        .unwrap_or_else(|| "default".to_string());
    Ok(PreparedCall {
        tool: params.name,
        args: params.arguments,
        tenant,
        session_id,
    })
}

async fn run_and_respond(state: Arc<AppState>, call: PreparedCall, id: Value) -> Response {
    let cancel = CancellationToken::new();
    match execute_tool(&state, &call, &cancel).await {
        Ok(result) => {
            let (result, header) = attach_context_state(&state, &call, result).await;
            let mut response = Json(RpcResponse::result(id, result)).into_response();
            if let Some(value) = header {
                response.headers_mut().insert("X-Context-State", value);
            }
            response
        }
        Err(e) => rpc_error_response(id, &e),
    }
}

/// Back-pressure, deadline, and the retry-once policy for idempotent
/// reads that fail internally.
async fn execute_tool(
    state: &Arc<AppState>,
    call: &PreparedCall,
    cancel: &CancellationToken,
) -> Result<Value> {
    let _guard = acquire_inflight(state, &call.tenant.owner_id)?;
    let deadline = Duration::from_secs(state.limits.tool_deadline_seconds.max(1));

    let first = tokio::time::timeout(
        deadline,
        tools::dispatch(state, &call.tool, &call.args, &call.tenant, &call.session_id, cancel),
    )
    .await
    .map_err(|_| Error::internal(format!("{} deadline exceeded", call.tool)))?;

    match first {
        Err(e) if e.is_retryable() && tools::is_read_only(&call.tool) => {
            tracing::warn!("retrying read-only tool {} after: {e}", call.tool);
            tokio::time::timeout(
                deadline,
                tools::dispatch(
                    state,
                    &call.tool,
                    &call.args,
                    &call.tenant,
                    &call.session_id,
                    cancel,
                ),
            )
            .await
            .map_err(|_| Error::internal(format!("{} deadline exceeded", call.tool)))?
        }
        other => other,
    }
}

/// Every tool result carries the session's context state, both in the
/// payload and as the `X-Context-State` header.
async fn attach_context_state(
    state: &Arc<AppState>,
    call: &PreparedCall,
    mut result: Value,
) -> (Value, Option<HeaderValue>) {
    let Ok(context_state) = state
        .engine
        .context_state_or_default(&call.tenant, &call.session_id)
        .await
    else {
        return (result, None);
    };
    let Ok(cs_json) = serde_json::to_value(&context_state) else {
        return (result, None);
    };
    if let Some(obj) = result.as_object_mut() {
        obj.entry("context_state").or_insert(cs_json.clone());
    }
    let header = serde_json::to_string(&cs_json)
        .ok()
        .and_then(|s| HeaderValue::from_str(&s).ok());
    (result, header)
}

fn rpc_error_response(id: Value, err: &Error) -> Response {
    if matches!(err, Error::TenancyMismatch(_)) {
        tracing::warn!("{err}");
    }
    Json(RpcResponse::error(id, err)).into_response()
}

/// SSE framing for one streamed tool call: `progress` → `complete` |
/// `error`. Client disconnect drops the stream, which cancels the token
/// and propagates into the core at its next boundary.
fn stream_call(
    state: Arc<AppState>,
    call: PreparedCall,
    id: Value,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<SseEvent>(16);
    let cancel = CancellationToken::new();
    let disconnect_guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        let started = SseEvent::default().event("progress").data(
            json!({ "op": call.tool, "pct": 0.0, "msg": "started" }).to_string(),
        );
        let _ = tx.send(started).await;

        match execute_tool(&state, &call, &cancel).await {
            Ok(result) => {
                let (result, _) = attach_context_state(&state, &call, result).await;
                let body = serde_json::to_value(RpcResponse::result(id, result))
                    .unwrap_or(Value::Null);
                let _ = tx
                    .send(SseEvent::default().event("complete").data(body.to_string()))
                    .await;
            }
            Err(e) => {
                let _ = tx
                    .send(
                        SseEvent::default().event("error").data(
                            json!({ "code": e.rpc_code(), "message": e.to_string() }).to_string(),
                        ),
                    )
                    .await;
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(move |event| {
        // The guard lives inside the stream: dropping the response body
        // cancels the in-flight call.
        let _keep_alive = &disconnect_guard;
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct SseOptions {
    /// Optional subject pattern, e.g. `branch.>` or `secrets.detected.>`.
    subject: Option<String>,
}

/// Event-bus firehose for UI and debugging subscribers, optionally
/// narrowed to a subject pattern. Lagging subscribers silently drop
/// messages — at-most-once, like the bus.
async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Query(options): Query<SseOptions>,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| {
        let event = msg.ok()?;
        if let Some(pattern) = &options.subject {
            if !crate::bus::subject_matches(pattern, &event.subject) {
                return None;
            }
        }
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(SseEvent::default().event("bus").data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AutoCheckpointConfig, BranchingConfig, LimitsConfig, SecretScrubbingConfig,
    };
    use crate::embeddings::{EmbeddingGateway, MockEmbeddings};
    use crate::collections::CollectionManager;
    use crate::scrub::ScrubberCache;
    use crate::vectorstore::MemoryVectorStore;

    fn app_state(limits: LimitsConfig) -> Arc<AppState> {
        let cm = Arc::new(CollectionManager::new(
            Arc::new(MemoryVectorStore::new()),
            16,
        ));
        let gateway = Arc::new(EmbeddingGateway::new(
            Arc::new(MockEmbeddings { dim: 16 }),
            64,
            Duration::from_secs(60),
        ));
        let bus = Arc::new(EventBus::new(64));
        let registry = Arc::new(SessionRegistry::new());
        let scrubbers = Arc::new(ScrubberCache::new(SecretScrubbingConfig::default()));
        let checkpoints = Arc::new(CheckpointService::new(
            cm.clone(),
            gateway.clone(),
            bus.clone(),
            scrubbers.clone(),
        ));
        let remediations = Arc::new(RemediationService::new(
            cm.clone(),
            gateway.clone(),
            bus.clone(),
            scrubbers.clone(),
        ));
        let skills = Arc::new(SkillService::new(
            cm.clone(),
            gateway.clone(),
            bus.clone(),
            scrubbers.clone(),
        ));
        let engine = Arc::new(BranchEngine::new(
            registry.clone(),
            cm,
            gateway,
            bus.clone(),
            scrubbers,
            checkpoints.clone(),
            BranchingConfig::default(),
            AutoCheckpointConfig::default(),
            SecretScrubbingConfig::default(),
        ));
        Arc::new(AppState::new(
            engine,
            checkpoints,
            remediations,
            skills,
            bus,
            registry,
            limits,
        ))
    }

    fn prepared(tool: &str, args: Value) -> PreparedCall {
        PreparedCall {
            tool: tool.to_string(),
            args,
            tenant: Tenant::resolve("alice", "/w/a").unwrap(),
            session_id: "sess-1".to_string(),
        }
    }

    #[test]
    fn test_inflight_ceiling() {
        let state = app_state(LimitsConfig {
            per_owner_inflight: 2,
            ..Default::default()
        });
        let g1 = acquire_inflight(&state, "owner-a").unwrap();
        let _g2 = acquire_inflight(&state, "owner-a").unwrap();
        assert!(matches!(
            acquire_inflight(&state, "owner-a").unwrap_err(),
            Error::ResourceExhausted(_)
        ));
        // Other owners are unaffected.
        assert!(acquire_inflight(&state, "owner-b").is_ok());
        // Releasing a slot unblocks the owner.
        drop(g1);
        assert!(acquire_inflight(&state, "owner-a").is_ok());
    }

    #[test]
    fn test_prepare_call_validation() {
        let headers = HeaderMap::new();
        let bad_method = RpcRequest {
            jsonrpc: "2.0".into(),
            id: json!(1),
            method: "resources/list".into(),
            params: json!({}),
        };
        assert!(matches!(
            prepare_call(&headers, bad_method).unwrap_err(),
            Error::InvalidArgument(_)
        ));

        let missing_path = RpcRequest {
            jsonrpc: "2.0".into(),
            id: json!(1),
            method: "tools/call".into(),
            params: json!({"name": "context_branch", "arguments": {}}),
        };
        assert!(matches!(
            prepare_call(&headers, missing_path).unwrap_err(),
            Error::InvalidArgument(_)
        ));

        let ok = RpcRequest {
            jsonrpc: "2.0".into(),
            id: json!(1),
            method: "tools/call".into(),
            params: json!({
                "name": "context_branch",
                "arguments": {"project_path": "/w/a", "session_id": "s1"}
            }),
        };
        let call = prepare_call(&headers, ok).unwrap();
        assert_eq!(call.tool, "context_branch");
        assert_eq!(call.session_id, "s1");
    }

    #[tokio::test]
    async fn test_execute_tool_end_to_end() {
        let state = app_state(LimitsConfig::default());
        let cancel = CancellationToken::new();

        let call = prepared(
            "context_branch",
            json!({"description": "work", "prompt": "do it", "project_path": "/w/a"}),
        );
        let result = execute_tool(&state, &call, &cancel).await.unwrap();
        assert!(result["branch_id"].as_str().unwrap().starts_with("br-"));

        let call = prepared(
            "context_return",
            json!({"message": "done", "project_path": "/w/a"}),
        );
        let result = execute_tool(&state, &call, &cancel).await.unwrap();
        assert_eq!(result["context_state"]["branch_depth"], 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_invalid_argument() {
        let state = app_state(LimitsConfig::default());
        let cancel = CancellationToken::new();
        let call = prepared("context_teleport", json!({}));
        assert!(matches!(
            execute_tool(&state, &call, &cancel).await.unwrap_err(),
            Error::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_context_state_attached_to_results() {
        let state = app_state(LimitsConfig::default());
        let cancel = CancellationToken::new();
        let call = prepared(
            "checkpoint_save",
            json!({
                "name": "cp",
                "summary": "did things",
                "project_path": "/w/a",
                "session_id": "sess-1",
            }),
        );
        let result = execute_tool(&state, &call, &cancel).await.unwrap();
        let (result, header) = attach_context_state(&state, &call, result).await;
        assert_eq!(result["context_state"]["session_id"], "sess-1");
        assert!(header.is_some());
    }
}
