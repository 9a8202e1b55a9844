//! Live introspection of running strategy instances
//!
//! - `server`: runs inside the strategy process, serves views over a Unix socket
//! - `client`: runs in the controlling program, issues typed queries
//! - `registry`: the view source boundary plus a shared in-memory implementation
//! - `profiler`: execution timing behind the profiling endpoints

pub mod client;
pub mod paths;
pub mod profiler;
pub mod registry;
pub mod server;
pub mod views;

pub use client::{MonitoringQuerier, DEFAULT_QUERY_TIMEOUT};
pub use paths::socket_path;
pub use profiler::ExecutionProfiler;
pub use registry::{SharedViewRegistry, ViewRegistry};
pub use server::{MonitoringServer, DEFAULT_TRADES_LIMIT};
pub use views::{
    ComponentHealth, ExecutionSample, HealthStatus, HealthView, MetricsView, OpenOrder,
    OrderbookView, PnlView, Position, PositionsView, PriceLevel, ProfilingStats, Side, Trade,
};
