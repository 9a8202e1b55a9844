//! Strategy instance supervision
//!
//! - `types`: the persisted instance record and its status machine
//! - `spawner`: builds the OS process for a strategy
//! - `process`: signals and liveness probes
//! - `state_store`: atomic JSON persistence of the instance table
//! - `manager`: lifecycle operations and background monitors

pub mod manager;
pub mod process;
pub mod spawner;
pub mod state_store;
pub mod types;

pub use manager::{InstanceManager, ManagerConfig, ReloadReport};
pub use spawner::{LogPaths, ProcessSpawner, StrategyProcess};
pub use state_store::{PersistedState, StateStore};
pub use types::{Instance, InstanceStatus, StrategyRef};
