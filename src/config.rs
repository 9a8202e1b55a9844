use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Subdirectory under the user's home directory holding supervisor state
const HOME_SUBDIR: &str = ".ploy";

/// Supervisor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Persisted instance table
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Root of the per-strategy log directories
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Directory holding one monitoring socket per instance
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    /// Wait after SIGINT before escalating to SIGKILL
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Interval between liveness checks
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Monitoring query timeout
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Overall deadline for `shutdown`
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Binary to re-invoke for `run-strategy` (defaults to the current executable)
    #[serde(default)]
    pub strategy_program: Option<PathBuf>,
}

fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(HOME_SUBDIR)
}

fn default_state_file() -> PathBuf {
    home_dir().join("instances.json")
}

fn default_log_dir() -> PathBuf {
    home_dir().join("logs")
}

/// `XDG_RUNTIME_DIR/ploy/sockets`, falling back to `/tmp/ploy/sockets`
pub fn default_socket_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("ploy")
        .join("sockets")
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_monitor_interval_secs() -> u64 {
    5
}

fn default_query_timeout_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            log_dir: default_log_dir(),
            socket_dir: default_socket_dir(),
            grace_period_secs: default_grace_period_secs(),
            monitor_interval_secs: default_monitor_interval_secs(),
            query_timeout_secs: default_query_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            strategy_program: None,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("supervisor.toml")).required(false))
            // Override with environment variables (PLOY_SUPERVISOR__SOCKET_DIR, etc.)
            .add_source(
                Environment::with_prefix("PLOY_SUPERVISOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.grace_period_secs == 0 {
            errors.push("grace_period_secs must be positive".to_string());
        }
        if self.monitor_interval_secs == 0 {
            errors.push("monitor_interval_secs must be positive".to_string());
        }
        if self.query_timeout_secs == 0 {
            errors.push("query_timeout_secs must be positive".to_string());
        }
        if self.shutdown_timeout_secs == 0 {
            errors.push("shutdown_timeout_secs must be positive".to_string());
        }
        if self.state_file.as_os_str().is_empty() {
            errors.push("state_file must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
