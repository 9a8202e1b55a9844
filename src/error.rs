use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the strategy supervisor
#[derive(Error, Debug)]
pub enum PloyError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Lifecycle conflicts
    #[error("Strategy '{strategy}' is already running (instance {instance_id})")]
    AlreadyRunning {
        strategy: String,
        instance_id: String,
    },

    #[error("Monitoring server for instance {0} already started")]
    AlreadyStarted(String),

    // Lookup failures
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("No running instance for strategy '{0}'")]
    NoRunningInstance(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    // Process control errors
    #[error("Process failure for instance {instance_id} (strategy '{strategy}'): {reason}")]
    ProcessFailure {
        instance_id: String,
        strategy: String,
        reason: String,
    },

    // Timeouts
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Shutdown deadline exceeded with {pending} instance(s) still stopping")]
    ShutdownTimeout { pending: usize },

    #[error("Shutdown finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Shutdown(Vec<String>),

    // Monitoring transport errors
    #[error("Transport error for instance {instance_id}: {reason}")]
    Transport { instance_id: String, reason: String },

    #[error("Instance {instance_id} returned status {status}")]
    QueryStatus { instance_id: String, status: u16 },

    // Persistence errors
    #[error("Failed to persist state to {}: {reason}", .path.display())]
    Persistence { path: PathBuf, reason: String },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl PloyError {
    /// Errors that may clear up on retry (socket races, instance restarting)
    pub fn is_transient(&self) -> bool {
        matches!(self, PloyError::Transport { .. } | PloyError::Timeout(_))
    }

    /// Lookup failures: unknown instance, strategy or asset
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PloyError::InstanceNotFound(_)
                | PloyError::NoRunningInstance(_)
                | PloyError::AssetNotFound(_)
        )
    }

    pub(crate) fn process(
        instance_id: impl Into<String>,
        strategy: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        PloyError::ProcessFailure {
            instance_id: instance_id.into(),
            strategy: strategy.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transport(instance_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        PloyError::Transport {
            instance_id: instance_id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for PloyError
pub type Result<T> = std::result::Result<T, PloyError>;
