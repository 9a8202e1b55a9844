//! Client half of the monitoring socket, used by the controlling program

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

use super::paths::{instance_id_from_path, socket_path};
use super::views::{
    AssetsView, ExecutionSample, ExecutionsView, HealthView, MetricsView, OrderbookView, PnlView,
    PositionsView, ProfilingStats, Trade, TradesView,
};
use crate::error::{PloyError, Result};

/// Default per-query timeout
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Issues typed queries against running strategy instances
#[derive(Debug, Clone)]
pub struct MonitoringQuerier {
    socket_dir: PathBuf,
    timeout: Duration,
}

impl MonitoringQuerier {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Instance ids with a socket in the socket directory, sorted
    pub async fn list_instances(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.socket_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_socket = entry
                .file_type()
                .await
                .map(|t| t.is_socket())
                .unwrap_or(false);
            if !is_socket {
                continue;
            }
            if let Some(id) = instance_id_from_path(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn query_health(&self, instance_id: &str) -> Result<HealthView> {
        self.get_json(instance_id, "/health").await
    }

    pub async fn query_pnl(&self, instance_id: &str) -> Result<PnlView> {
        self.get_json(instance_id, "/api/pnl").await
    }

    pub async fn query_positions(&self, instance_id: &str) -> Result<PositionsView> {
        self.get_json(instance_id, "/api/positions").await
    }

    pub async fn query_orderbook(&self, instance_id: &str, asset: &str) -> Result<OrderbookView> {
        let uri = format!("/api/orderbook?asset={}", urlencoding::encode(asset));
        match self.get_json(instance_id, &uri).await {
            Err(PloyError::QueryStatus { status: 404, .. }) => {
                Err(PloyError::AssetNotFound(asset.to_string()))
            }
            other => other,
        }
    }

    pub async fn query_trades(&self, instance_id: &str, limit: Option<usize>) -> Result<Vec<Trade>> {
        let uri = match limit {
            Some(limit) => format!("/api/trades?limit={limit}"),
            None => "/api/trades".to_string(),
        };
        let view: TradesView = self.get_json(instance_id, &uri).await?;
        Ok(view.trades)
    }

    pub async fn query_metrics(&self, instance_id: &str) -> Result<MetricsView> {
        self.get_json(instance_id, "/api/metrics").await
    }

    pub async fn query_assets(&self, instance_id: &str) -> Result<Vec<String>> {
        let view: AssetsView = self.get_json(instance_id, "/api/assets").await?;
        Ok(view.assets)
    }

    pub async fn query_profiling_stats(&self, instance_id: &str) -> Result<ProfilingStats> {
        self.get_json(instance_id, "/profiling/stats").await
    }

    pub async fn query_executions(
        &self,
        instance_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ExecutionSample>> {
        let uri = match limit {
            Some(limit) => format!("/profiling/executions?limit={limit}"),
            None => "/profiling/executions".to_string(),
        };
        let view: ExecutionsView = self.get_json(instance_id, &uri).await?;
        Ok(view.executions)
    }

    async fn get_json<T: DeserializeOwned>(&self, instance_id: &str, uri: &str) -> Result<T> {
        // Ids name a file inside the socket directory and nothing else
        if instance_id.is_empty() || instance_id.contains('/') {
            return Err(PloyError::InstanceNotFound(instance_id.to_string()));
        }
        let socket = socket_path(&self.socket_dir, instance_id);
        // Fail fast instead of surfacing a connect error for a dead instance
        if !socket.exists() {
            return Err(PloyError::InstanceNotFound(instance_id.to_string()));
        }

        let body = tokio::time::timeout(self.timeout, send_get(instance_id, &socket, uri))
            .await
            .map_err(|_| {
                PloyError::Timeout(format!(
                    "query {uri} to instance {instance_id} timed out after {:?}",
                    self.timeout
                ))
            })??;

        Ok(serde_json::from_slice(&body)?)
    }
}

async fn send_get(instance_id: &str, socket: &Path, uri: &str) -> Result<Bytes> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| PloyError::transport(instance_id, format!("connect failed: {e}")))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| PloyError::transport(instance_id, format!("handshake failed: {e}")))?;

    let id = instance_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(instance_id = %id, error = %e, "Monitoring connection closed with error");
        }
    });

    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .header(hyper::header::HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .map_err(|e| PloyError::Internal(format!("invalid monitoring request {uri}: {e}")))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| PloyError::transport(instance_id, format!("request failed: {e}")))?;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| PloyError::transport(instance_id, format!("read failed: {e}")))?
        .to_bytes();

    if !status.is_success() {
        return Err(PloyError::QueryStatus {
            instance_id: instance_id.to_string(),
            status: status.as_u16(),
        });
    }

    Ok(body)
}
