#[cfg(not(unix))]
compile_error!("ploy-live supervises processes with Unix signals and sockets; only Unix targets are supported");

pub mod cli;
pub mod config;
pub mod error;
pub mod instance;
pub mod monitoring;
pub mod runtime;

pub use config::SupervisorConfig;
pub use error::{PloyError, Result};
pub use instance::{
    Instance, InstanceManager, InstanceStatus, ManagerConfig, ProcessSpawner, StateStore,
    StrategyRef,
};
pub use monitoring::{
    ExecutionProfiler, MonitoringQuerier, MonitoringServer, SharedViewRegistry, ViewRegistry,
};
