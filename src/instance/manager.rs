//! Instance Manager
//!
//! Owns the table of strategy instances:
//! - Start/stop/kill/restart strategy processes
//! - One background liveness monitor per active instance
//! - Persist every mutation through the [`StateStore`]
//! - Reconcile persisted state after the controlling program restarts
//!
//! The table sits behind a single `RwLock`. Signals and process waits always
//! happen after the lock is released, with the process handle moved out of
//! the table, so a slow stop never blocks unrelated calls.

use chrono::Utc;
use nix::errno::Errno;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::process::{self, ProcessHandle};
use super::spawner::{LogPaths, ProcessSpawner};
use super::state_store::StateStore;
use super::types::{Instance, InstanceStatus, StrategyRef};
use crate::config::SupervisorConfig;
use crate::error::{PloyError, Result};

/// How long to wait for a process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Timing for the instance manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Wait after SIGINT before escalating to SIGKILL (default: 10s)
    pub grace_period: Duration,
    /// Interval between liveness checks (default: 5s)
    pub monitor_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

impl From<&SupervisorConfig> for ManagerConfig {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            grace_period: config.grace_period(),
            monitor_interval: config.monitor_interval(),
        }
    }
}

/// Outcome of [`InstanceManager::load_running`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Instances whose process was still alive and is monitored again
    pub reattached: Vec<String>,
    /// Instances whose process vanished while nobody was watching
    pub crashed: Vec<String>,
}

/// Live table entry: the persisted record plus process-local handles
struct TrackedInstance {
    record: Instance,
    process: Option<ProcessHandle>,
    lifetime: Option<CancellationToken>,
}

impl TrackedInstance {
    fn detached(record: Instance) -> Self {
        Self {
            record,
            process: None,
            lifetime: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Graceful,
    Force,
}

enum ExitOutcome {
    /// Exited in response to our signal
    Exited,
    /// Was already gone when we looked
    AlreadyGone(String),
}

struct ManagerInner {
    config: ManagerConfig,
    spawner: ProcessSpawner,
    store: StateStore,
    instances: RwLock<HashMap<String, TrackedInstance>>,
    /// Serializes snapshot+write so the file always reflects the latest table
    persist_lock: Mutex<()>,
    /// Parent of every instance lifetime scope
    root: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // Monitors hold weak references; release them promptly
        self.root.cancel();
    }
}

/// Supervises strategy processes
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

impl InstanceManager {
    pub fn new(config: ManagerConfig, spawner: ProcessSpawner, store: StateStore) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                spawner,
                store,
                instances: RwLock::new(HashMap::new()),
                persist_lock: Mutex::new(()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Build a manager from supervisor configuration
    pub fn from_config(config: &SupervisorConfig) -> Result<Self> {
        let spawner = match &config.strategy_program {
            Some(program) => ProcessSpawner::new(program, &config.log_dir, &config.socket_dir),
            None => ProcessSpawner::current_exe(&config.log_dir, &config.socket_dir)?,
        };
        Ok(Self::new(
            ManagerConfig::from(config),
            spawner,
            StateStore::new(&config.state_file),
        ))
    }

    pub fn state_path(&self) -> &Path {
        self.inner.store.path()
    }

    pub fn log_paths(&self, strategy: &str) -> LogPaths {
        self.inner.spawner.log_paths(strategy)
    }

    /// Launch a new instance of `strategy`
    pub async fn start(&self, strategy: StrategyRef, working_root: impl Into<PathBuf>) -> Result<Instance> {
        strategy.validate()?;
        self.start_with(strategy, working_root.into(), 0).await
    }

    async fn start_with(
        &self,
        strategy: StrategyRef,
        working_root: PathBuf,
        restart_count: u32,
    ) -> Result<Instance> {
        let id = Uuid::new_v4().to_string();

        // Reserve the strategy name so concurrent starts cannot both pass the check
        {
            let mut table = self.inner.instances.write().await;
            if let Some(existing) = table
                .values()
                .find(|t| t.record.strategy.name == strategy.name && t.record.status.is_active())
            {
                return Err(PloyError::AlreadyRunning {
                    strategy: strategy.name.clone(),
                    instance_id: existing.record.id.clone(),
                });
            }
            let mut record = Instance::new(id.clone(), strategy.clone(), working_root.clone());
            record.restart_count = restart_count;
            table.insert(id.clone(), TrackedInstance::detached(record));
        }

        let (child, pid) = match self.launch(&id, &strategy, &working_root) {
            Ok(launched) => launched,
            Err(e) => {
                // The reservation never owned a process
                self.inner.instances.write().await.remove(&id);
                error!(instance_id = %id, strategy = %strategy.name, error = %e, "Failed to start strategy");
                return Err(e);
            }
        };

        let lifetime = self.inner.root.child_token();
        let instance = {
            let mut table = self.inner.instances.write().await;
            let tracked = table
                .get_mut(&id)
                .ok_or_else(|| PloyError::InstanceNotFound(id.clone()))?;
            let now = Utc::now();
            tracked.record.pid = pid;
            tracked.record.started_at = now;
            tracked.record.last_check = Some(now);
            tracked.process = Some(ProcessHandle::Owned(child));
            tracked.lifetime = Some(lifetime.clone());
            tracked.record.clone()
        };

        self.spawn_monitor(id.clone(), lifetime);
        info!(
            instance_id = %id,
            strategy = %strategy.name,
            pid,
            restart_count,
            "Strategy instance started"
        );

        // The process runs regardless; the error must still name it
        if let Err(e) = self.save_state().await {
            error!(instance_id = %id, pid, error = %e, "Started instance was not persisted");
            return Err(match e {
                PloyError::Persistence { path, reason } => PloyError::Persistence {
                    path,
                    reason: format!("instance {id} (pid {pid}) started but not saved: {reason}"),
                },
                other => other,
            });
        }
        Ok(instance)
    }

    fn launch(&self, id: &str, strategy: &StrategyRef, working_root: &Path) -> Result<(Child, u32)> {
        let mut process = self.inner.spawner.build(id, strategy, working_root)?;
        let pid = process.launch()?;
        self.inner.spawner.attach_monitor(&process)?;
        let child = process
            .into_child()
            .ok_or_else(|| PloyError::process(id, &strategy.name, "launched process has no handle"))?;
        Ok((child, pid))
    }

    /// Graceful stop: SIGINT, wait for the grace period, then SIGKILL
    pub async fn stop(&self, id: &str) -> Result<Instance> {
        self.terminate(id, Termination::Graceful).await
    }

    /// Immediate SIGKILL
    pub async fn kill(&self, id: &str) -> Result<Instance> {
        self.terminate(id, Termination::Force).await
    }

    /// Stop the active instance of a strategy by name
    pub async fn stop_by_strategy_name(&self, name: &str) -> Result<Instance> {
        let id = self
            .find_active(name)
            .await
            .ok_or_else(|| PloyError::NoRunningInstance(name.to_string()))?;
        self.stop(&id).await
    }

    async fn find_active(&self, name: &str) -> Option<String> {
        let table = self.inner.instances.read().await;
        table
            .values()
            .find(|t| t.record.strategy.name == name && t.record.status.is_active())
            .map(|t| t.record.id.clone())
    }

    async fn terminate(&self, id: &str, mode: Termination) -> Result<Instance> {
        let (mut handle, pid, strategy) = {
            let mut table = self.inner.instances.write().await;
            let tracked = table
                .get_mut(id)
                .ok_or_else(|| PloyError::InstanceNotFound(id.to_string()))?;

            if tracked.record.status.is_terminal() {
                debug!(instance_id = %id, status = %tracked.record.status, "Instance already terminated");
                return Ok(tracked.record.clone());
            }

            let handle = tracked.process.take().ok_or_else(|| {
                PloyError::process(
                    id,
                    &tracked.record.strategy.name,
                    "no process handle (start or stop already in progress)",
                )
            })?;
            if let Some(lifetime) = tracked.lifetime.take() {
                lifetime.cancel();
            }
            (handle, tracked.record.pid, tracked.record.strategy.name.clone())
        };

        info!(instance_id = %id, strategy = %strategy, pid, ?mode, "Stopping strategy instance");

        let outcome = match mode {
            Termination::Graceful => self.interrupt_and_wait(id, &strategy, pid, &mut handle).await,
            Termination::Force => kill_and_wait(id, &strategy, pid, &mut handle).await,
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(instance_id = %id, error = %e, "Failed to stop strategy instance");
                self.reattach(id, handle).await;
                return Err(e);
            }
        };

        let instance = {
            let mut table = self.inner.instances.write().await;
            let tracked = table
                .get_mut(id)
                .ok_or_else(|| PloyError::InstanceNotFound(id.to_string()))?;
            match outcome {
                ExitOutcome::Exited => tracked.record.mark_stopped(),
                ExitOutcome::AlreadyGone(exit) => {
                    warn!(instance_id = %id, pid, exit = %exit, "Process was already gone at stop");
                    tracked
                        .record
                        .mark_crashed(format!("process {pid} {exit} before stop was requested"));
                }
            }
            tracked.record.clone()
        };

        info!(instance_id = %id, status = %instance.status, "Strategy instance terminated");
        self.save_state().await?;
        Ok(instance)
    }

    async fn interrupt_and_wait(
        &self,
        id: &str,
        strategy: &str,
        pid: u32,
        handle: &mut ProcessHandle,
    ) -> Result<ExitOutcome> {
        if let Some(exit) = handle.check_exit() {
            return Ok(ExitOutcome::AlreadyGone(exit));
        }

        match process::interrupt(pid) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(ExitOutcome::AlreadyGone("no longer exists".into())),
            Err(e) => return Err(PloyError::process(id, strategy, format!("SIGINT failed: {e}"))),
        }

        let grace = self.inner.config.grace_period;
        if handle.wait_exit(grace).await {
            return Ok(ExitOutcome::Exited);
        }

        warn!(
            instance_id = %id,
            pid,
            grace_secs = grace.as_secs_f64(),
            "Grace period elapsed, escalating to SIGKILL"
        );
        kill_and_wait(id, strategy, pid, handle).await
    }

    /// Put a process back under monitoring after a failed stop
    async fn reattach(&self, id: &str, handle: ProcessHandle) {
        let lifetime = self.inner.root.child_token();
        {
            let mut table = self.inner.instances.write().await;
            let Some(tracked) = table.get_mut(id) else {
                return;
            };
            tracked.process = Some(handle);
            tracked.lifetime = Some(lifetime.clone());
            if tracked.record.status == InstanceStatus::Restarting {
                tracked.record.status = InstanceStatus::Running;
            }
        }
        self.spawn_monitor(id.to_string(), lifetime);
    }

    /// Stop the instance, then start its strategy again from the stored
    /// reference. Returns the new instance.
    pub async fn restart(&self, id: &str) -> Result<Instance> {
        let (strategy, working_root, restart_count) = {
            let mut table = self.inner.instances.write().await;
            let tracked = table
                .get_mut(id)
                .ok_or_else(|| PloyError::InstanceNotFound(id.to_string()))?;
            if tracked.record.status == InstanceStatus::Running {
                tracked.record.status = InstanceStatus::Restarting;
            }
            (
                tracked.record.strategy.clone(),
                tracked.record.working_root.clone(),
                tracked.record.restart_count,
            )
        };

        info!(instance_id = %id, strategy = %strategy.name, "Restarting strategy instance");
        self.stop(id).await?;
        self.start_with(strategy, working_root, restart_count + 1).await
    }

    pub async fn get(&self, id: &str) -> Result<Instance> {
        let table = self.inner.instances.read().await;
        table
            .get(id)
            .map(|t| t.record.clone())
            .ok_or_else(|| PloyError::InstanceNotFound(id.to_string()))
    }

    /// All instances, oldest first, optionally filtered by status
    pub async fn list(&self, status: Option<InstanceStatus>) -> Vec<Instance> {
        let table = self.inner.instances.read().await;
        let mut instances: Vec<Instance> = table
            .values()
            .filter(|t| status.map_or(true, |s| t.record.status == s))
            .map(|t| t.record.clone())
            .collect();
        instances.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    /// Reconcile persisted state with the processes that actually exist
    pub async fn load_running(&self) -> Result<ReloadReport> {
        let persisted = self.inner.store.load().await?;
        let mut report = ReloadReport::default();
        let mut monitors = Vec::new();

        {
            let mut table = self.inner.instances.write().await;
            for record in persisted {
                if table.contains_key(&record.id) {
                    continue;
                }

                let id = record.id.clone();
                let mut tracked = TrackedInstance::detached(record);
                if tracked.record.status.is_active() {
                    let pid = tracked.record.pid;
                    if process::pid_exists(pid) {
                        let lifetime = self.inner.root.child_token();
                        tracked.record.status = InstanceStatus::Running;
                        tracked.record.last_check = Some(Utc::now());
                        tracked.process = Some(ProcessHandle::Attached(pid));
                        tracked.lifetime = Some(lifetime.clone());
                        monitors.push((id.clone(), lifetime));
                        info!(instance_id = %id, pid, "Re-attached to running strategy instance");
                        report.reattached.push(id.clone());
                    } else {
                        tracked.record.mark_crashed(format!(
                            "process {pid} no longer exists after supervisor restart"
                        ));
                        warn!(instance_id = %id, pid, "Strategy instance vanished while unsupervised");
                        report.crashed.push(id.clone());
                    }
                }
                table.insert(id, tracked);
            }
        }

        for (id, lifetime) in monitors {
            self.spawn_monitor(id, lifetime);
        }

        self.save_state().await?;
        Ok(report)
    }

    /// Persist the current table
    pub async fn save_state(&self) -> Result<()> {
        let _persist = self.inner.persist_lock.lock().await;
        let snapshot = {
            let table = self.inner.instances.read().await;
            let mut records: Vec<Instance> = table.values().map(|t| t.record.clone()).collect();
            records.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
            records
        };

        self.inner.store.save(&snapshot).await.map_err(|e| {
            error!(path = %self.inner.store.path().display(), error = %e, "Failed to persist instance state");
            e
        })
    }

    /// Stop every active instance concurrently within one overall deadline
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let ids: Vec<String> = {
            let table = self.inner.instances.read().await;
            table
                .values()
                .filter(|t| t.record.status.is_active())
                .map(|t| t.record.id.clone())
                .collect()
        };

        if ids.is_empty() {
            debug!("Shutdown: no active instances");
            return Ok(());
        }

        info!(count = ids.len(), timeout_secs = timeout.as_secs_f64(), "Stopping all strategy instances");

        let mut pending = ids.len();
        let mut stops = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            stops.spawn(async move {
                let result = manager.stop(&id).await;
                (id, result)
            });
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut failures = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, stops.join_next()).await {
                Ok(Some(Ok((_, Ok(_))))) => pending -= 1,
                Ok(Some(Ok((id, Err(e))))) => {
                    pending -= 1;
                    failures.push(format!("{id}: {e}"));
                }
                Ok(Some(Err(e))) => {
                    pending -= 1;
                    failures.push(format!("stop task failed: {e}"));
                }
                Ok(None) => break,
                Err(_) => {
                    // Let in-flight stops finish on their own
                    stops.detach_all();
                    error!(pending, "Shutdown deadline exceeded");
                    return Err(PloyError::ShutdownTimeout { pending });
                }
            }
        }

        if failures.is_empty() {
            info!("All strategy instances stopped");
            Ok(())
        } else {
            Err(PloyError::Shutdown(failures))
        }
    }

    fn spawn_monitor(&self, id: String, lifetime: CancellationToken) {
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.config.monitor_interval;
        tokio::spawn(monitor_instance(inner, id, lifetime, interval));
    }
}

async fn kill_and_wait(
    id: &str,
    strategy: &str,
    pid: u32,
    handle: &mut ProcessHandle,
) -> Result<ExitOutcome> {
    match process::force_kill(pid) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            // Reap it if it was our child
            handle.wait_exit(Duration::ZERO).await;
            return Ok(ExitOutcome::AlreadyGone("no longer exists".into()));
        }
        Err(e) => return Err(PloyError::process(id, strategy, format!("SIGKILL failed: {e}"))),
    }

    if handle.wait_exit(KILL_WAIT).await {
        Ok(ExitOutcome::Exited)
    } else {
        Err(PloyError::process(
            id,
            strategy,
            format!("process {pid} still alive {KILL_WAIT:?} after SIGKILL"),
        ))
    }
}

/// Background liveness monitor for one instance
async fn monitor_instance(
    inner: Weak<ManagerInner>,
    id: String,
    lifetime: CancellationToken,
    interval: Duration,
) {
    debug!(instance_id = %id, "Monitor started");
    loop {
        tokio::select! {
            _ = lifetime.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = InstanceManager { inner };

        let crashed = {
            let mut table = manager.inner.instances.write().await;
            // Stop/Kill cancel under this same lock; re-check now that we hold it
            if lifetime.is_cancelled() {
                break;
            }
            let Some(tracked) = table.get_mut(&id) else {
                break;
            };
            if tracked.record.status != InstanceStatus::Running {
                break;
            }
            let Some(handle) = tracked.process.as_mut() else {
                break;
            };

            match handle.check_exit() {
                None => {
                    tracked.record.last_check = Some(Utc::now());
                    false
                }
                Some(exit) => {
                    let pid = tracked.record.pid;
                    tracked
                        .record
                        .mark_crashed(format!("process {pid} {exit} without a stop request"));
                    tracked.process = None;
                    tracked.lifetime = None;
                    warn!(instance_id = %id, pid, exit = %exit, "Strategy instance crashed");
                    true
                }
            }
        };

        // Periodic save: failures are logged, the monitor keeps running
        if let Err(e) = manager.save_state().await {
            warn!(instance_id = %id, error = %e, "Monitor failed to persist state");
        }

        if crashed {
            break;
        }
    }
    debug!(instance_id = %id, "Monitor exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    /// Exits promptly on SIGINT
    const COOPERATIVE: &str = "exec sleep 30";
    /// Ignores SIGINT; only SIGKILL stops it
    const STUBBORN: &str = "trap '' INT; while true; do sleep 1; done";

    struct Harness {
        dir: tempfile::TempDir,
        manager: InstanceManager,
    }

    fn harness(script: &str, grace: Duration, interval: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let spawner = ProcessSpawner::new("sh", dir.path().join("logs"), dir.path().join("sockets"))
            .with_leading_args(["-c", script]);
        let store = StateStore::new(dir.path().join("state").join("instances.json"));
        let manager = InstanceManager::new(
            ManagerConfig {
                grace_period: grace,
                monitor_interval: interval,
            },
            spawner,
            store,
        );
        Harness { dir, manager }
    }

    fn strategy(h: &Harness, name: &str) -> StrategyRef {
        StrategyRef::conventional(name, h.dir.path())
    }

    async fn persisted(h: &Harness) -> Vec<Instance> {
        StateStore::new(h.manager.state_path()).load().await.unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_conflicts() {
        let h = harness(COOPERATIVE, Duration::from_secs(2), Duration::from_secs(5));
        let first = h.manager.start(strategy(&h, "momentum"), h.dir.path()).await.unwrap();
        assert_eq!(first.status, InstanceStatus::Running);
        assert!(first.pid > 0);

        let err = h
            .manager
            .start(strategy(&h, "momentum"), h.dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PloyError::AlreadyRunning { ref instance_id, .. } if *instance_id == first.id));

        let all = h.manager.list(None).await;
        assert_eq!(all.iter().filter(|i| i.strategy.name == "momentum").count(), 1);

        h.manager.kill(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_clears_pid_and_persists() {
        let h = harness(COOPERATIVE, Duration::from_secs(5), Duration::from_secs(5));
        let started = h.manager.start(strategy(&h, "momentum"), h.dir.path()).await.unwrap();

        let stopped = h.manager.stop(&started.id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(stopped.pid, 0);
        assert!(!process::pid_exists(started.pid));

        let on_disk = persisted(&h).await;
        assert_eq!(on_disk.len(), 1);
        assert_eq!(on_disk[0].status, InstanceStatus::Stopped);
        assert_eq!(on_disk[0].pid, 0);

        // Stopping again is a no-op
        let again = h.manager.stop(&started.id).await.unwrap();
        assert_eq!(again.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_after_grace() {
        let h = harness(STUBBORN, Duration::from_millis(300), Duration::from_secs(5));
        let started = h.manager.start(strategy(&h, "stubborn"), h.dir.path()).await.unwrap();
        // Give sh time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let begin = std::time::Instant::now();
        let stopped = h.manager.stop(&started.id).await.unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(300));
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert!(!process::pid_exists(started.pid));
    }

    #[tokio::test]
    async fn test_kill_is_immediate() {
        let h = harness(STUBBORN, Duration::from_secs(30), Duration::from_secs(5));
        let started = h.manager.start(strategy(&h, "stubborn"), h.dir.path()).await.unwrap();

        let begin = std::time::Instant::now();
        let killed = h.manager.kill(&started.id).await.unwrap();
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(killed.status, InstanceStatus::Stopped);
        assert_eq!(killed.pid, 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_and_names() {
        let h = harness(COOPERATIVE, Duration::from_secs(1), Duration::from_secs(5));
        assert!(matches!(
            h.manager.stop("nope").await,
            Err(PloyError::InstanceNotFound(_))
        ));
        assert!(matches!(
            h.manager.kill("nope").await,
            Err(PloyError::InstanceNotFound(_))
        ));
        assert!(matches!(
            h.manager.get("nope").await,
            Err(PloyError::InstanceNotFound(_))
        ));
        assert!(matches!(
            h.manager.stop_by_strategy_name("momentum").await,
            Err(PloyError::NoRunningInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_by_strategy_name() {
        let h = harness(COOPERATIVE, Duration::from_secs(5), Duration::from_secs(5));
        let started = h.manager.start(strategy(&h, "split_arb"), h.dir.path()).await.unwrap();
        let stopped = h.manager.stop_by_strategy_name("split_arb").await.unwrap();
        assert_eq!(stopped.id, started.id);
        assert_eq!(stopped.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_crash_detected_by_monitor() {
        let h = harness(COOPERATIVE, Duration::from_secs(5), Duration::from_millis(200));
        let started = h.manager.start(strategy(&h, "momentum"), h.dir.path()).await.unwrap();

        kill(Pid::from_raw(started.pid as i32), Signal::SIGKILL).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let crashed = h.manager.list(Some(InstanceStatus::Crashed)).await;
        assert_eq!(crashed.len(), 1);
        assert_eq!(crashed[0].id, started.id);
        assert_eq!(crashed[0].pid, 0);
        assert!(!crashed[0].last_error.is_empty());

        let on_disk = persisted(&h).await;
        assert_eq!(on_disk[0].status, InstanceStatus::Crashed);

        // A crashed strategy may be started again
        let again = h.manager.start(strategy(&h, "momentum"), h.dir.path()).await.unwrap();
        h.manager.kill(&again.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_uses_stored_reference() {
        let h = harness(COOPERATIVE, Duration::from_secs(5), Duration::from_secs(5));
        let first = h.manager.start(strategy(&h, "momentum"), h.dir.path()).await.unwrap();

        let second = h.manager.restart(&first.id).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.strategy, first.strategy);
        assert_eq!(second.restart_count, 1);
        assert_eq!(second.status, InstanceStatus::Running);

        let old = h.manager.get(&first.id).await.unwrap();
        assert_eq!(old.status, InstanceStatus::Stopped);

        h.manager.kill(&second.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_running_reconciles_and_is_idempotent() {
        let h = harness(COOPERATIVE, Duration::from_secs(5), Duration::from_secs(5));

        // A process that outlives the "previous" supervisor
        let survivor = tokio::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let survivor_pid = survivor.id().unwrap();
        // Reap in the background so the pid disappears once it exits
        let reaper = tokio::spawn(async move {
            let mut survivor = survivor;
            survivor.wait().await
        });

        let mut alive = Instance::new(
            "alive".into(),
            strategy(&h, "momentum"),
            h.dir.path().to_path_buf(),
        );
        alive.pid = survivor_pid;
        let mut dead = Instance::new(
            "dead".into(),
            strategy(&h, "split_arb"),
            h.dir.path().to_path_buf(),
        );
        dead.pid = i32::MAX as u32;
        let mut finished = Instance::new(
            "finished".into(),
            strategy(&h, "sports"),
            h.dir.path().to_path_buf(),
        );
        finished.mark_stopped();

        StateStore::new(h.manager.state_path())
            .save(&[alive, dead, finished])
            .await
            .unwrap();

        let report = h.manager.load_running().await.unwrap();
        assert_eq!(report.reattached, vec!["alive".to_string()]);
        assert_eq!(report.crashed, vec!["dead".to_string()]);

        let dead = h.manager.get("dead").await.unwrap();
        assert_eq!(dead.status, InstanceStatus::Crashed);
        assert!(dead.last_error.contains("no longer exists"));
        assert_eq!(h.manager.get("alive").await.unwrap().status, InstanceStatus::Running);
        assert_eq!(h.manager.get("finished").await.unwrap().status, InstanceStatus::Stopped);

        let before = h.manager.list(None).await;
        let second = h.manager.load_running().await.unwrap();
        assert_eq!(second, ReloadReport::default());
        assert_eq!(h.manager.list(None).await, before);

        let stopped = h.manager.stop("alive").await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        reaper.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_load_running_rejects_out_of_range_pid() {
        let h = harness(COOPERATIVE, Duration::from_secs(5), Duration::from_secs(5));

        // A hand-edited table: u32::MAX would be -1 as a raw pid
        let mut corrupt = Instance::new(
            "corrupt".into(),
            strategy(&h, "momentum"),
            h.dir.path().to_path_buf(),
        );
        corrupt.pid = u32::MAX;
        StateStore::new(h.manager.state_path())
            .save(&[corrupt])
            .await
            .unwrap();

        let report = h.manager.load_running().await.unwrap();
        assert!(report.reattached.is_empty());
        assert_eq!(report.crashed, vec!["corrupt".to_string()]);

        let record = h.manager.get("corrupt").await.unwrap();
        assert_eq!(record.status, InstanceStatus::Crashed);
        assert_eq!(record.pid, 0);

        // Terminal: a stop is a no-op and signals nothing
        let stopped = h.manager.stop("corrupt").await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Crashed);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_in_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        // The state file's parent is a regular file: every save fails
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let spawner = ProcessSpawner::new("sh", dir.path().join("logs"), dir.path().join("sockets"))
            .with_leading_args(["-c", COOPERATIVE]);
        let manager = InstanceManager::new(
            ManagerConfig {
                grace_period: Duration::from_secs(5),
                monitor_interval: Duration::from_secs(5),
            },
            spawner,
            StateStore::new(blocker.join("instances.json")),
        );

        let err = manager
            .start(StrategyRef::new("momentum", dir.path()), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PloyError::Persistence { .. }));

        let running = manager.list(Some(InstanceStatus::Running)).await;
        assert_eq!(running.len(), 1);
        assert!(err.to_string().contains(&running[0].id), "{err}");
        assert!(manager.kill(&running[0].id).await.is_err());
        assert_eq!(manager.get(&running[0].id).await.unwrap().status, InstanceStatus::Stopped);
    }
}
