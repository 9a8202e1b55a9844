//! Strategy-side runtime
//!
//! Entry point of the `run-strategy` subcommand the supervisor re-invokes the
//! binary with. It exposes the monitoring socket, publishes a heartbeat health
//! view and waits for SIGINT/SIGTERM.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::default_socket_dir;
use crate::error::{PloyError, Result};
use crate::monitoring::{
    ComponentHealth, ExecutionProfiler, HealthStatus, HealthView, MonitoringServer,
    SharedViewRegistry,
};

/// Subcommand the strategy process is launched with
pub const RUN_STRATEGY_SUBCOMMAND: &str = "run-strategy";
/// Flag carrying the strategy name
pub const STRATEGY_FLAG: &str = "--strategy";

pub const ENV_INSTANCE_ID: &str = "PLOY_INSTANCE_ID";
pub const ENV_STRATEGY_SOURCE: &str = "PLOY_STRATEGY_SOURCE";
pub const ENV_SOCKET_DIR: &str = "PLOY_SOCKET_DIR";

/// Interval between health view refreshes
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Where and as whom a strategy process runs
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub instance_id: String,
    pub strategy: String,
    pub source_path: PathBuf,
    pub socket_dir: PathBuf,
}

impl RuntimeContext {
    /// Resolve the context from the environment set by the spawner
    pub fn from_env(strategy: impl Into<String>) -> Result<Self> {
        Self::resolve(
            strategy,
            std::env::var(ENV_INSTANCE_ID).ok(),
            std::env::var_os(ENV_STRATEGY_SOURCE).map(PathBuf::from),
            std::env::var_os(ENV_SOCKET_DIR).map(PathBuf::from),
        )
    }

    /// Defaults for a manual run. The source falls back to
    /// `./strategies/<name>`.
    pub fn resolve(
        strategy: impl Into<String>,
        instance_id: Option<String>,
        source_path: Option<PathBuf>,
        socket_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let strategy = strategy.into();
        if strategy.trim().is_empty() {
            return Err(PloyError::Validation("strategy name must not be empty".into()));
        }

        let instance_id = instance_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let source_path = source_path
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(".").join("strategies").join(&strategy));
        let socket_dir = socket_dir.unwrap_or_else(default_socket_dir);

        Ok(Self {
            instance_id,
            strategy,
            source_path,
            socket_dir,
        })
    }
}

/// Run a strategy process until it is told to stop
pub async fn run_strategy(ctx: RuntimeContext, shutdown_deadline: Duration) -> Result<()> {
    let started = Instant::now();
    info!(
        instance_id = %ctx.instance_id,
        strategy = %ctx.strategy,
        pid = std::process::id(),
        "Strategy runtime starting"
    );

    let source_ok = ctx.source_path.is_dir();
    if !source_ok {
        warn!(path = %ctx.source_path.display(), "Strategy source directory not found");
    }

    let registry = Arc::new(SharedViewRegistry::new());
    let profiler = Arc::new(ExecutionProfiler::default());
    let server = Arc::new(
        MonitoringServer::new(&ctx.instance_id, &ctx.socket_dir, registry.clone())?
            .with_profiler(profiler.clone()),
    );

    let mut serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.start().await })
    };

    let stop = CancellationToken::new();
    let heartbeat = tokio::spawn(publish_heartbeat(
        ctx.clone(),
        source_ok,
        started,
        registry,
        profiler,
        stop.clone(),
    ));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, stopping strategy"),
        _ = sigterm.recv() => info!("Received SIGTERM, stopping strategy"),
        joined = &mut serving => {
            // The server died on its own: nothing left to monitor us through
            stop.cancel();
            return match joined {
                Ok(Ok(())) => Err(PloyError::Internal("monitoring server exited unexpectedly".into())),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(PloyError::Internal(format!("monitoring server task failed: {e}"))),
            };
        }
    }

    stop.cancel();
    if let Err(e) = heartbeat.await {
        warn!(error = %e, "Heartbeat task failed");
    }

    server.stop(shutdown_deadline).await?;
    match serving.await {
        Ok(result) => result?,
        Err(e) => return Err(PloyError::Internal(format!("monitoring server task failed: {e}"))),
    }

    info!(
        instance_id = %ctx.instance_id,
        uptime_secs = started.elapsed().as_secs(),
        "Strategy runtime stopped"
    );
    Ok(())
}

async fn publish_heartbeat(
    ctx: RuntimeContext,
    source_ok: bool,
    started: Instant,
    registry: Arc<SharedViewRegistry>,
    profiler: Arc<ExecutionProfiler>,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick = Instant::now();
        let source = if source_ok {
            ComponentHealth {
                name: "strategy_source".into(),
                status: HealthStatus::Healthy,
                message: None,
            }
        } else {
            ComponentHealth {
                name: "strategy_source".into(),
                status: HealthStatus::Degraded,
                message: Some("strategy source directory not found".into()),
            }
        };

        registry.set_health(HealthView {
            status: if source_ok {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            strategy: ctx.strategy.clone(),
            instance_id: ctx.instance_id.clone(),
            uptime_seconds: started.elapsed().as_secs(),
            last_heartbeat: Some(Utc::now()),
            components: vec![source],
        });
        registry.increment_counter("heartbeats", 1);
        profiler.record("heartbeat", tick.elapsed(), true);
    }
    debug!(instance_id = %ctx.instance_id, "Heartbeat stopped");
}
