use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::PloyError;

/// Lifecycle status of a strategy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Crashed,
    Restarting,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Crashed => "crashed",
            InstanceStatus::Restarting => "restarting",
        }
    }

    /// `running` and `restarting` own a live process
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Restarting)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = PloyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(InstanceStatus::Running),
            "stopped" => Ok(InstanceStatus::Stopped),
            "crashed" => Ok(InstanceStatus::Crashed),
            "restarting" => Ok(InstanceStatus::Restarting),
            other => Err(PloyError::Validation(format!(
                "unknown instance status '{other}' (expected running, stopped, crashed or restarting)"
            ))),
        }
    }
}

/// Reference to a strategy, enough to launch it again without outside help
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRef {
    /// Strategy name, e.g. `momentum`
    pub name: String,
    /// Strategy source directory
    pub source_path: PathBuf,
}

impl StrategyRef {
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
        }
    }

    /// Conventional layout: `<working-root>/strategies/<name>`
    pub fn conventional(name: impl Into<String>, working_root: &std::path::Path) -> Self {
        let name = name.into();
        let source_path = working_root.join("strategies").join(&name);
        Self { name, source_path }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(PloyError::Validation("strategy name must not be empty".into()));
        }
        if self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            return Err(PloyError::Validation(format!(
                "strategy name '{}' must be a plain identifier",
                self.name
            )));
        }
        Ok(())
    }
}

/// Persisted record of one strategy run.
///
/// Holds only serializable fields; the live process handle and the monitor's
/// cancellation token are kept next to it in the manager's table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub strategy: StrategyRef,
    /// Directory the strategy process runs in
    pub working_root: PathBuf,
    /// OS process id, 0 when no process is attached
    pub pid: u32,
    pub status: InstanceStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub last_error: String,
}

impl Instance {
    pub(crate) fn new(id: String, strategy: StrategyRef, working_root: PathBuf) -> Self {
        Self {
            id,
            strategy,
            working_root,
            pid: 0,
            status: InstanceStatus::Running,
            started_at: Utc::now(),
            last_check: None,
            restart_count: 0,
            last_error: String::new(),
        }
    }

    pub fn strategy_name(&self) -> &str {
        &self.strategy.name
    }

    /// Seconds since start, only meaningful while active
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    pub(crate) fn mark_stopped(&mut self) {
        self.status = InstanceStatus::Stopped;
        self.pid = 0;
    }

    pub(crate) fn mark_crashed(&mut self, error: impl Into<String>) {
        self.status = InstanceStatus::Crashed;
        self.pid = 0;
        self.last_error = error.into();
    }
}
