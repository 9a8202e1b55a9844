//! Monitoring server running inside a strategy process.
//!
//! Serves read-only JSON views of the [`ViewRegistry`] over HTTP/1.1 on a
//! Unix-domain socket at `<socket-dir>/<instance-id>.sock` (mode 0600, parent
//! directory 0700).

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::paths::socket_path;
use super::profiler::ExecutionProfiler;
use super::registry::ViewRegistry;
use super::views::{AssetsView, ExecutionsView, TradesView};
use crate::error::{PloyError, Result};

/// Trades returned by `/api/trades` without a `limit`
pub const DEFAULT_TRADES_LIMIT: usize = 50;
/// Samples returned by `/profiling/executions` without a `limit`
pub const DEFAULT_EXECUTIONS_LIMIT: usize = 50;

const SOCKET_MODE: u32 = 0o600;
const DIRECTORY_MODE: u32 = 0o700;

/// Shared state for the monitoring handlers
pub struct MonitorState {
    pub registry: Arc<dyn ViewRegistry>,
    pub profiler: Option<Arc<ExecutionProfiler>>,
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    finished: Option<oneshot::Receiver<()>>,
}

pub struct MonitoringServer {
    instance_id: String,
    socket_path: PathBuf,
    registry: Arc<dyn ViewRegistry>,
    profiler: Option<Arc<ExecutionProfiler>>,
    lifecycle: Mutex<Lifecycle>,
}

impl MonitoringServer {
    pub fn new(
        instance_id: impl Into<String>,
        socket_dir: impl AsRef<Path>,
        registry: Arc<dyn ViewRegistry>,
    ) -> Result<Self> {
        let instance_id = instance_id.into();
        if instance_id.trim().is_empty() {
            return Err(PloyError::Validation(
                "monitoring server requires an instance id".into(),
            ));
        }
        if instance_id.contains('/') {
            return Err(PloyError::Validation(format!(
                "instance id '{instance_id}' must not contain '/'"
            )));
        }

        Ok(Self {
            socket_path: socket_path(socket_dir.as_ref(), &instance_id),
            instance_id,
            registry,
            profiler: None,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn with_profiler(mut self, profiler: Arc<ExecutionProfiler>) -> Self {
        self.profiler = Some(profiler);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Router serving all monitoring endpoints
    pub fn router(&self) -> Router {
        create_router(Arc::new(MonitorState {
            registry: Arc::clone(&self.registry),
            profiler: self.profiler.clone(),
        }))
    }

    /// Bind the socket and serve until [`stop`](Self::stop) is called or the
    /// transport fails
    pub async fn start(&self) -> Result<()> {
        let (token, done_tx) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if lifecycle.shutdown.is_some() {
                return Err(PloyError::AlreadyStarted(self.instance_id.clone()));
            }
            let token = CancellationToken::new();
            let (done_tx, done_rx) = oneshot::channel();
            lifecycle.shutdown = Some(token.clone());
            lifecycle.finished = Some(done_rx);
            (token, done_tx)
        };

        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = Lifecycle::default();
                return Err(e);
            }
        };

        info!(
            instance_id = %self.instance_id,
            socket = %self.socket_path.display(),
            "Monitoring server listening"
        );

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await;
        let _ = done_tx.send(());

        result.map_err(|e| PloyError::transport(&self.instance_id, format!("monitoring server error: {e}")))
    }

    /// Shut the server down within `deadline` and remove the socket file
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let (token, finished) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            (lifecycle.shutdown.take(), lifecycle.finished.take())
        };

        let Some(token) = token else {
            debug!(instance_id = %self.instance_id, "Monitoring server not running");
            return Ok(());
        };
        token.cancel();

        let drained = match finished {
            Some(done) => tokio::time::timeout(deadline, done).await.is_ok(),
            None => true,
        };

        self.remove_socket();

        if drained {
            info!(instance_id = %self.instance_id, "Monitoring server stopped");
            Ok(())
        } else {
            Err(PloyError::Timeout(format!(
                "monitoring server for {} did not stop within {:?}",
                self.instance_id, deadline
            )))
        }
    }

    fn bind(&self) -> Result<UnixListener> {
        if let Some(dir) = self.socket_path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(DIRECTORY_MODE))?;
            }
        }

        // A socket left behind by a crashed run blocks bind(2)
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(socket = %self.socket_path.display(), "Removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(SOCKET_MODE),
        )?;
        Ok(listener)
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %self.socket_path.display(),
                error = %e,
                "Failed to remove monitoring socket"
            ),
        }
    }
}

pub fn create_router(state: Arc<MonitorState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/pnl", get(pnl_handler))
        .route("/api/positions", get(positions_handler))
        .route("/api/orderbook", get(orderbook_handler))
        .route("/api/trades", get(trades_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/assets", get(assets_handler))
        .route("/profiling/stats", get(profiling_stats_handler))
        .route("/profiling/executions", get(profiling_executions_handler))
        .method_not_allowed_fallback(method_not_allowed)
        .fallback(not_found)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OrderbookParams {
    asset: Option<String>,
}

/// JSON body for a view, `{}` when the source has nothing yet
fn view<T: Serialize>(value: Option<T>) -> Response {
    match value {
        Some(v) => Json(v).into_response(),
        None => Json(json!({})).into_response(),
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn not_found() -> Response {
    error(StatusCode::NOT_FOUND, "no such endpoint")
}

async fn method_not_allowed() -> Response {
    error(StatusCode::METHOD_NOT_ALLOWED, "only GET is supported")
}

/// Limit from the query string, or a 400 body when it does not parse
fn limit_or_default(
    params: std::result::Result<Query<LimitParams>, QueryRejection>,
    default: usize,
) -> std::result::Result<usize, Response> {
    match params {
        Ok(Query(params)) => Ok(params.limit.unwrap_or(default)),
        Err(rejection) => Err(error(StatusCode::BAD_REQUEST, rejection.body_text())),
    }
}

async fn health_handler(State(state): State<Arc<MonitorState>>) -> Response {
    view(state.registry.health())
}

async fn pnl_handler(State(state): State<Arc<MonitorState>>) -> Response {
    view(state.registry.pnl_view())
}

async fn positions_handler(State(state): State<Arc<MonitorState>>) -> Response {
    view(state.registry.positions_view())
}

async fn orderbook_handler(
    State(state): State<Arc<MonitorState>>,
    Query(params): Query<OrderbookParams>,
) -> Response {
    let Some(asset) = params.asset.filter(|a| !a.trim().is_empty()) else {
        return error(StatusCode::BAD_REQUEST, "missing required query parameter: asset");
    };

    if let Some(book) = state.registry.orderbook_view(&asset) {
        return Json(book).into_response();
    }

    // Known asset without a book yet is "no data", not "unknown"
    let known = state
        .registry
        .available_assets()
        .is_some_and(|assets| assets.iter().any(|a| a == &asset));
    if known {
        view::<()>(None)
    } else {
        error(StatusCode::NOT_FOUND, format!("unknown asset: {asset}"))
    }
}

async fn trades_handler(
    State(state): State<Arc<MonitorState>>,
    params: std::result::Result<Query<LimitParams>, QueryRejection>,
) -> Response {
    let limit = match limit_or_default(params, DEFAULT_TRADES_LIMIT) {
        Ok(limit) => limit,
        Err(rejected) => return rejected,
    };
    view(
        state
            .registry
            .recent_trades(limit)
            .map(|trades| TradesView { trades }),
    )
}

async fn metrics_handler(State(state): State<Arc<MonitorState>>) -> Response {
    view(state.registry.metrics())
}

async fn assets_handler(State(state): State<Arc<MonitorState>>) -> Response {
    view(
        state
            .registry
            .available_assets()
            .map(|assets| AssetsView { assets }),
    )
}

async fn profiling_stats_handler(State(state): State<Arc<MonitorState>>) -> Response {
    view(state.profiler.as_ref().and_then(|p| p.stats()))
}

async fn profiling_executions_handler(
    State(state): State<Arc<MonitorState>>,
    params: std::result::Result<Query<LimitParams>, QueryRejection>,
) -> Response {
    let limit = match limit_or_default(params, DEFAULT_EXECUTIONS_LIMIT) {
        Ok(limit) => limit,
        Err(rejected) => return rejected,
    };
    view(state.profiler.as_ref().map(|p| ExecutionsView {
        executions: p.recent(limit),
    }))
}
