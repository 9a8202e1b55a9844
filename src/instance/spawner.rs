//! Strategy process construction
//!
//! Strategies run as a re-invocation of the controlling binary:
//!
//! ```text
//! <program> [leading args] run-strategy --strategy <name>
//! ```
//!
//! The child is placed in its own process group so it survives the exit of
//! the program that started it, and its stdout/stderr are appended to
//! `<log-root>/<strategy>/{stdout,stderr}.log`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

use super::types::StrategyRef;
use crate::error::{PloyError, Result};
use crate::runtime::{
    ENV_INSTANCE_ID, ENV_SOCKET_DIR, ENV_STRATEGY_SOURCE, RUN_STRATEGY_SUBCOMMAND, STRATEGY_FLAG,
};

/// Per-strategy log file locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// A built, not yet started strategy process
#[derive(Debug)]
pub struct StrategyProcess {
    instance_id: String,
    strategy: String,
    command: Command,
    child: Option<Child>,
    logs: LogPaths,
}

impl StrategyProcess {
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn logs(&self) -> &LogPaths {
        &self.logs
    }

    /// Pid once launched
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Start the process; returns its pid
    pub fn launch(&mut self) -> Result<u32> {
        if self.child.is_some() {
            return Err(PloyError::process(
                &self.instance_id,
                &self.strategy,
                "process already launched",
            ));
        }

        let child = self
            .command
            .spawn()
            .map_err(|e| PloyError::process(&self.instance_id, &self.strategy, format!("spawn failed: {e}")))?;

        let pid = child.id().ok_or_else(|| {
            PloyError::process(&self.instance_id, &self.strategy, "failed to get process ID")
        })?;

        self.child = Some(child);
        Ok(pid)
    }

    /// Hand the child over to whoever monitors it
    pub fn into_child(self) -> Option<Child> {
        self.child
    }
}

/// Builds strategy process descriptions
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    leading_args: Vec<String>,
    log_root: PathBuf,
    socket_dir: PathBuf,
}

impl ProcessSpawner {
    /// Spawner that re-invokes the current executable
    pub fn current_exe(log_root: impl Into<PathBuf>, socket_dir: impl Into<PathBuf>) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, log_root, socket_dir))
    }

    pub fn new(
        program: impl Into<PathBuf>,
        log_root: impl Into<PathBuf>,
        socket_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            log_root: log_root.into(),
            socket_dir: socket_dir.into(),
        }
    }

    /// Arguments placed before the `run-strategy` contract (e.g. `-c <script>`
    /// when the program is a shell)
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn log_paths(&self, strategy: &str) -> LogPaths {
        let dir = self.log_root.join(strategy);
        LogPaths {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
            dir,
        }
    }

    /// Build the process description for one instance of `strategy`
    pub fn build(
        &self,
        instance_id: &str,
        strategy: &StrategyRef,
        working_root: &Path,
    ) -> Result<StrategyProcess> {
        let logs = self.log_paths(&strategy.name);
        let log_err = |e: std::io::Error| {
            PloyError::process(
                instance_id,
                &strategy.name,
                format!("cannot prepare log directory {}: {e}", logs.dir.display()),
            )
        };

        fs::create_dir_all(&logs.dir).map_err(log_err)?;
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logs.stdout)
            .map_err(log_err)?;
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logs.stderr)
            .map_err(log_err)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg(RUN_STRATEGY_SUBCOMMAND)
            .arg(STRATEGY_FLAG)
            .arg(&strategy.name)
            .env(ENV_INSTANCE_ID, instance_id)
            .env(ENV_STRATEGY_SOURCE, &strategy.source_path)
            .env(ENV_SOCKET_DIR, &self.socket_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            // Own process group: a Ctrl+C or exit of the controller must not
            // take the strategy down with it
            .process_group(0)
            .kill_on_drop(false);

        if working_root.is_dir() {
            command.current_dir(working_root);
        }

        debug!(
            instance_id,
            strategy = %strategy.name,
            program = %self.program.display(),
            "Built strategy process"
        );

        Ok(StrategyProcess {
            instance_id: instance_id.to_string(),
            strategy: strategy.name.clone(),
            command,
            child: None,
            logs,
        })
    }

    /// Acknowledge that a launched process is now under monitoring
    pub fn attach_monitor(&self, process: &StrategyProcess) -> Result<u32> {
        let pid = process.pid().ok_or_else(|| {
            PloyError::process(
                &process.instance_id,
                &process.strategy,
                "cannot attach monitor before the process is launched",
            )
        })?;
        debug!(instance_id = %process.instance_id, pid, "Monitor attached");
        Ok(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_spawner(root: &Path, script: &str) -> ProcessSpawner {
        ProcessSpawner::new("sh", root.join("logs"), root.join("sockets"))
            .with_leading_args(["-c", script])
    }

    #[tokio::test]
    async fn test_build_creates_log_dir_and_passes_contract_args() {
        let dir = tempfile::tempdir().unwrap();
        // `sh -c script $0 $1 $2`: echo the contract arguments and environment
        let spawner = shell_spawner(
            dir.path(),
            "echo \"$0 $1 $2\"; echo \"id=$PLOY_INSTANCE_ID\"",
        );
        let strategy = StrategyRef::new("momentum", dir.path().join("strategies/momentum"));

        let mut process = spawner.build("inst-1", &strategy, dir.path()).unwrap();
        assert!(process.logs().dir.is_dir());

        process.launch().unwrap();
        let mut child = process.into_child().unwrap();
        assert!(child.wait().await.unwrap().success());

        let out = std::fs::read_to_string(spawner.log_paths("momentum").stdout).unwrap();
        assert!(out.contains("run-strategy --strategy momentum"));
        assert!(out.contains("id=inst-1"));
    }

    #[tokio::test]
    async fn test_logs_are_appended_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = shell_spawner(dir.path(), "echo line");
        let strategy = StrategyRef::new("momentum", dir.path());

        for id in ["a", "b"] {
            let mut process = spawner.build(id, &strategy, dir.path()).unwrap();
            process.launch().unwrap();
            process.into_child().unwrap().wait().await.unwrap();
        }

        let out = std::fs::read_to_string(spawner.log_paths("momentum").stdout).unwrap();
        assert_eq!(out.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_attach_monitor_requires_launch() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = shell_spawner(dir.path(), "exit 0");
        let strategy = StrategyRef::new("momentum", dir.path());

        let mut process = spawner.build("inst-2", &strategy, dir.path()).unwrap();
        assert!(spawner.attach_monitor(&process).is_err());

        let pid = process.launch().unwrap();
        assert_eq!(spawner.attach_monitor(&process).unwrap(), pid);
        process.into_child().unwrap().wait().await.unwrap();
    }

    #[test]
    fn test_build_fails_when_log_dir_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the log root should be
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, "not a directory").unwrap();

        let spawner = ProcessSpawner::new("sh", &blocker, dir.path().join("sockets"));
        let strategy = StrategyRef::new("momentum", dir.path());
        let err = spawner.build("inst-3", &strategy, dir.path()).unwrap_err();
        assert!(matches!(err, PloyError::ProcessFailure { .. }));
    }
}
