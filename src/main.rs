use anyhow::Context;
use nexus_hook_dispatcher::{
    EngineConfig, HookEngine, HookPatch, MatchOptions, NewHook, SystemClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Value,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Serialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(serde_json::json!({
            "success": true,
            "data": data,
            "message": null
        })),
        error: None,
        id,
    }
}

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

type OpResult = Result<Value, String>;

// ─── Shared app state ────────────────────────────────────────────────────────

struct AppState {
    engine: Option<Arc<HookEngine>>,
    data_dir: PathBuf,
}

impl AppState {
    fn new() -> Self {
        Self {
            engine: None,
            data_dir: PathBuf::from("."),
        }
    }
}

async fn engine(state: &Arc<RwLock<AppState>>) -> Result<Arc<HookEngine>, String> {
    state
        .read()
        .await
        .engine
        .clone()
        .ok_or_else(|| "engine not initialized".to_string())
}

// ─── Entry point ─────────────────────────────────────────────────────────────

fn init_tracing() {
    // stdout carries JSON-RPC; all diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let state: Arc<RwLock<AppState>> = Arc::new(RwLock::new(AppState::new()));

    let state_clone = state.clone();
    let handle = tokio::runtime::Handle::current();

    // Stdin loop on a blocking thread to avoid blocking the async runtime.
    let stdin_loop = tokio::task::spawn_blocking(move || {
        let stdin = io::stdin();
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut line = String::new();

        loop {
            line.clear();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                _ => {}
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(e) => {
                    let resp =
                        err_response(Value::Number(0.into()), -32700, format!("Parse error: {e}"));
                    emit_line(&mut out, &resp);
                    continue;
                }
            };

            let is_shutdown = request.method == "shutdown";

            let response = handle.block_on(handle_request(&request, &state_clone));
            emit_line(&mut out, &response);

            if is_shutdown {
                break;
            }
        }
    });

    if let Err(e) = stdin_loop.await {
        tracing::error!(error = %e, "stdin loop terminated abnormally");
    }

    // Host closed stdin without a shutdown call.
    let engine = state.write().await.engine.take();
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
}

fn emit_line(out: &mut impl Write, resp: &JsonRpcResponse) {
    let line = serde_json::to_string(resp).expect("serialize response");
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

// ─── Request dispatch ─────────────────────────────────────────────────────────

async fn handle_request(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    match req.method.as_str() {
        "initialize" => handle_initialize(req, state).await,
        "shutdown" => handle_shutdown(req, state).await,
        "execute" => handle_execute(req, state).await,
        m if m.starts_with("resources.") => handle_resources(req, state).await,
        _ => err_response(req.id.clone(), -32601, format!("Unknown method: {}", req.method)),
    }
}

fn open_engine(data_dir: &Path, overrides: Option<&Value>) -> anyhow::Result<HookEngine> {
    let config = EngineConfig::load(Some(data_dir), overrides)
        .context("failed to load hook engine configuration")?;
    HookEngine::open(data_dir, config, Arc::new(SystemClock))
        .with_context(|| format!("failed to open hook state in {}", data_dir.display()))
}

async fn handle_initialize(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let data_dir = req
        .params
        .get("data_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    // The previous engine must stop writing before its files are reloaded.
    let previous = state.write().await.engine.take();
    if let Some(previous) = previous {
        previous.shutdown().await;
    }

    let engine = match open_engine(&data_dir, req.params.get("config")) {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!(error = ?e, "initialize failed");
            return err_response(req.id.clone(), -32603, format!("{e:#}"));
        }
    };
    engine.start();

    {
        let mut st = state.write().await;
        st.data_dir = data_dir;
        st.engine = Some(engine);
    }

    raw_response(req.id.clone(), serde_json::json!({ "ready": true }))
}

async fn handle_shutdown(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let engine = state.write().await.engine.take();
    if let Some(engine) = engine {
        engine.shutdown().await;
    }
    raw_response(req.id.clone(), serde_json::json!({}))
}

// ─── Execute handler ──────────────────────────────────────────────────────────

async fn handle_execute(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let operation = req
        .params
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let input = req
        .params
        .get("input")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let result = match operation {
        "get_server_info" => op_get_server_info(state).await,
        "list_events" => op_list_events(state).await,
        "list_hooks" => op_list_hooks(state).await,
        "get_hook" => op_get_hook(&input, state).await,
        "create_hook" => resource_create(&input, state).await,
        "update_hook" => op_update_hook(&input, state).await,
        "delete_hook" => op_delete_hook(&input, state).await,
        "activate_hook" => op_set_active(&input, state, true).await,
        "deactivate_hook" => op_set_active(&input, state, false).await,
        "get_delivery_logs" => op_get_delivery_logs(&input, state).await,
        "get_delivery" => op_get_delivery(&input, state).await,
        "get_hook_stats" => op_get_hook_stats(&input, state).await,
        "test_hook" => op_test_hook(&input, state).await,
        "trigger_event" => op_trigger_event(&input, state).await,
        "run_sweep" => op_run_sweep(state).await,
        _ => Err(format!("Unknown operation: {operation}")),
    };

    match result {
        Ok(data) => ok_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

// ─── Resources handler ────────────────────────────────────────────────────────

async fn handle_resources(req: &JsonRpcRequest, state: &Arc<RwLock<AppState>>) -> JsonRpcResponse {
    let resource_method = req.method.strip_prefix("resources.").unwrap_or("");
    let resource_type = req
        .params
        .get("resource_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    if resource_type != "hooks" {
        return err_response(
            req.id.clone(),
            -32602,
            format!("Unknown resource type: {resource_type}"),
        );
    }

    let id = req.params.get("id").and_then(|v| v.as_str()).unwrap_or("");
    let data = req
        .params
        .get("data")
        .cloned()
        .unwrap_or(Value::Object(Default::default()));

    let result = match resource_method {
        "list" => resource_list(state).await,
        "get" => resource_get(id, state).await,
        "create" => resource_create(&data, state).await,
        "update" => resource_update(id, &data, state).await,
        "delete" => resource_delete(id, state).await,
        _ => Err(format!("Unknown resource method: {resource_method}")),
    };

    match result {
        Ok(data) => raw_response(req.id.clone(), data),
        Err(msg) => err_response(req.id.clone(), -32000, msg),
    }
}

// ─── Input helpers ────────────────────────────────────────────────────────────

fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, String> {
    input
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing required field: {field}"))
}

fn to_json<T: Serialize>(value: &T) -> OpResult {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn parse_input<T: serde::de::DeserializeOwned>(input: &Value) -> Result<T, String> {
    serde_json::from_value(input.clone()).map_err(|e| format!("invalid input: {e}"))
}

// ─── Operations ───────────────────────────────────────────────────────────────

async fn op_get_server_info(state: &Arc<RwLock<AppState>>) -> OpResult {
    let data_dir = state.read().await.data_dir.clone();
    let engine = engine(state).await?;
    Ok(serde_json::json!({
        "data_dir": data_dir.display().to_string(),
        "hook_count": engine.list_hooks().await.len(),
        "sweeper_running": engine.is_running(),
        "config": engine.config(),
    }))
}

async fn op_list_events(state: &Arc<RwLock<AppState>>) -> OpResult {
    let engine = engine(state).await?;
    Ok(serde_json::json!({ "events": engine.supported_events() }))
}

async fn op_list_hooks(state: &Arc<RwLock<AppState>>) -> OpResult {
    let engine = engine(state).await?;
    let hooks = engine.list_hooks().await;
    Ok(serde_json::json!({ "hooks": hooks, "count": hooks.len() }))
}

async fn op_get_hook(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    resource_get(require_str(input, "hook_id")?, state).await
}

async fn op_update_hook(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let id = require_str(input, "hook_id")?;
    resource_update(id, input, state).await
}

async fn op_delete_hook(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    resource_delete(require_str(input, "hook_id")?, state).await
}

async fn op_set_active(input: &Value, state: &Arc<RwLock<AppState>>, active: bool) -> OpResult {
    let id = require_str(input, "hook_id")?;
    let engine = engine(state).await?;
    let result = if active {
        engine.activate_hook(id).await
    } else {
        engine.deactivate_hook(id).await
    };
    let hook = result.map_err(|e| e.to_string())?;
    to_json(&hook)
}

async fn op_get_delivery_logs(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let hook_id = input.get("hook_id").and_then(|v| v.as_str());
    let limit = input
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|n| n as usize);
    let engine = engine(state).await?;
    let logs = engine.delivery_logs(hook_id, limit).await;
    Ok(serde_json::json!({ "deliveries": logs, "count": logs.len() }))
}

async fn op_get_delivery(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let id = require_str(input, "delivery_id")?;
    let engine = engine(state).await?;
    let log = engine.get_delivery(id).await.map_err(|e| e.to_string())?;
    to_json(&log)
}

async fn op_get_hook_stats(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let id = require_str(input, "hook_id")?;
    let engine = engine(state).await?;
    let stats = engine.hook_stats(id).await.map_err(|e| e.to_string())?;
    to_json(&stats)
}

async fn op_test_hook(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let id = require_str(input, "hook_id")?;
    let engine = engine(state).await?;
    let outcome = engine.test_hook(id).await.map_err(|e| e.to_string())?;
    to_json(&outcome)
}

async fn op_trigger_event(input: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let event = require_str(input, "event")?;
    let data = input.get("data").cloned().unwrap_or(Value::Null);
    let options: MatchOptions = parse_input(input)?;

    let engine = engine(state).await?;
    // Fire-and-forget: the dispatch handle is dropped, deliveries keep running.
    let dispatch = engine.trigger(event, data, options).await;
    Ok(serde_json::json!({ "scheduled": dispatch.hook_count() }))
}

async fn op_run_sweep(state: &Arc<RwLock<AppState>>) -> OpResult {
    let engine = engine(state).await?;
    let report = engine.sweep_once().await;
    to_json(&report)
}

// ─── Resource CRUD ────────────────────────────────────────────────────────────

async fn resource_list(state: &Arc<RwLock<AppState>>) -> OpResult {
    let engine = engine(state).await?;
    let items = engine.list_hooks().await;
    let total = items.len();
    Ok(serde_json::json!({ "items": items, "total": total }))
}

async fn resource_get(id: &str, state: &Arc<RwLock<AppState>>) -> OpResult {
    let engine = engine(state).await?;
    let hook = engine.get_hook(id).await.map_err(|e| e.to_string())?;
    to_json(&hook)
}

async fn resource_create(data: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let new: NewHook = parse_input(data)?;
    let engine = engine(state).await?;
    let created = engine.create_hook(new).await.map_err(|e| e.to_string())?;
    to_json(&created)
}

async fn resource_update(id: &str, data: &Value, state: &Arc<RwLock<AppState>>) -> OpResult {
    let patch: HookPatch = parse_input(data)?;
    let engine = engine(state).await?;
    let updated = engine.update_hook(id, patch).await.map_err(|e| e.to_string())?;
    to_json(&updated)
}

async fn resource_delete(id: &str, state: &Arc<RwLock<AppState>>) -> OpResult {
    let engine = engine(state).await?;
    if engine.delete_hook(id).await.map_err(|e| e.to_string())? {
        Ok(serde_json::json!({ "deleted": true }))
    } else {
        Err(format!("hook not found: {id}"))
    }
}
