//! Strategy instance commands
//!
//! ploy-live strategy start <name>       - Start a strategy instance
//! ploy-live strategy stop <name|--id>   - Graceful stop (SIGINT, then SIGKILL)
//! ploy-live strategy kill <id>          - Immediate SIGKILL
//! ploy-live strategy restart <id>       - Stop and start again
//! ploy-live strategy list [--status]    - List instances
//! ploy-live strategy status <id>        - Show one instance
//! ploy-live strategy logs <name>        - Tail strategy logs
//! ploy-live strategy shutdown           - Stop every running instance

use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::SupervisorConfig;
use crate::instance::{Instance, InstanceManager, InstanceStatus, StrategyRef};

/// Strategy-related commands
#[derive(Subcommand, Debug)]
pub enum StrategyCommands {
    /// Start a strategy instance
    Start {
        /// Strategy name (momentum, split_arb, sports)
        name: String,

        /// Strategy source directory (default: <root>/strategies/<name>)
        #[arg(long)]
        source: Option<PathBuf>,

        /// Working root the strategy runs in (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Gracefully stop an instance by strategy name or id
    Stop {
        /// Strategy name
        #[arg(required_unless_present = "id", conflicts_with = "id")]
        name: Option<String>,

        /// Instance id
        #[arg(long)]
        id: Option<String>,
    },

    /// Kill an instance immediately
    Kill {
        /// Instance id
        id: String,
    },

    /// Restart an instance with the same strategy
    Restart {
        /// Instance id
        id: String,
    },

    /// List instances
    List {
        /// Only show instances with this status (running, stopped, crashed, restarting)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show details of one instance
    Status {
        /// Instance id
        id: String,
    },

    /// View strategy logs
    Logs {
        /// Strategy name
        name: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        tail: usize,

        /// Show stderr instead of stdout
        #[arg(long)]
        stderr: bool,
    },

    /// Stop every running instance
    Shutdown {
        /// Overall deadline in seconds (default: shutdown_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

impl StrategyCommands {
    pub async fn run(self, config: &SupervisorConfig) -> Result<()> {
        let manager = InstanceManager::from_config(config)?;
        // Pick up instances started by earlier invocations
        let report = manager
            .load_running()
            .await
            .context("Failed to load instance state")?;
        for id in &report.crashed {
            println!("\x1b[33m⚠ Instance {} crashed while unsupervised\x1b[0m", id);
        }

        match self {
            Self::Start { name, source, root } => start_strategy(&manager, name, source, root).await,
            Self::Stop { name, id } => stop_strategy(&manager, name, id).await,
            Self::Kill { id } => kill_instance(&manager, &id).await,
            Self::Restart { id } => restart_instance(&manager, &id).await,
            Self::List { status } => list_instances(&manager, status.as_deref()).await,
            Self::Status { id } => show_status(&manager, &id).await,
            Self::Logs { name, tail, stderr } => show_logs(&manager, &name, tail, stderr),
            Self::Shutdown { timeout } => {
                let timeout = timeout
                    .map(std::time::Duration::from_secs)
                    .unwrap_or_else(|| config.shutdown_timeout());
                shutdown_all(&manager, timeout).await
            }
        }
    }
}

/// Start a strategy
async fn start_strategy(
    manager: &InstanceManager,
    name: String,
    source: Option<PathBuf>,
    root: Option<PathBuf>,
) -> Result<()> {
    let root = match root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };
    let strategy = match source {
        Some(source) => StrategyRef::new(name, source),
        None => StrategyRef::conventional(name, &root),
    };

    info!("Starting strategy: {}", strategy.name);
    let instance = manager.start(strategy, &root).await?;
    let logs = manager.log_paths(&instance.strategy.name);

    println!("\n\x1b[36m╔══════════════════════════════════════════════════════════════╗\x1b[0m");
    println!("\x1b[36m║  Started Strategy: {:<42}║\x1b[0m", instance.strategy.name);
    println!("\x1b[36m╚══════════════════════════════════════════════════════════════╝\x1b[0m\n");
    println!("  Instance: {}", instance.id);
    println!("  PID:      {}", instance.pid);
    println!("  Source:   {}", instance.strategy.source_path.display());
    println!("  Stdout:   {}", logs.stdout.display());
    println!("  Stderr:   {}", logs.stderr.display());
    println!("\n  Use 'ploy-live monitor health {}' to query it", instance.id);

    Ok(())
}

/// Stop a running strategy
async fn stop_strategy(manager: &InstanceManager, name: Option<String>, id: Option<String>) -> Result<()> {
    let instance = match (id, name) {
        (Some(id), _) => manager.stop(&id).await?,
        (None, Some(name)) => manager.stop_by_strategy_name(&name).await?,
        (None, None) => anyhow::bail!("Either a strategy name or --id is required"),
    };
    print_terminated(&instance);
    Ok(())
}

async fn kill_instance(manager: &InstanceManager, id: &str) -> Result<()> {
    let instance = manager.kill(id).await?;
    print_terminated(&instance);
    Ok(())
}

async fn restart_instance(manager: &InstanceManager, id: &str) -> Result<()> {
    let instance = manager.restart(id).await?;
    println!(
        "\x1b[32m✓ Strategy '{}' restarted as {} (PID: {}, restarts: {})\x1b[0m",
        instance.strategy.name, instance.id, instance.pid, instance.restart_count
    );
    Ok(())
}

async fn list_instances(manager: &InstanceManager, status: Option<&str>) -> Result<()> {
    let filter = status.map(str::parse::<InstanceStatus>).transpose()?;
    let instances = manager.list(filter).await;

    println!("\n{}", "=".repeat(78));
    println!("  STRATEGY INSTANCES");
    println!("{}\n", "=".repeat(78));

    if instances.is_empty() {
        println!("  \x1b[90m(no instances)\x1b[0m\n");
        return Ok(());
    }

    println!(
        "  {:<36} {:<12} {:<12} {:<8} {}",
        "ID", "STRATEGY", "STATUS", "PID", "UPTIME"
    );
    println!("  {}", "-".repeat(76));

    for instance in &instances {
        let (color, pid, uptime) = if instance.status.is_active() {
            ("\x1b[32m", instance.pid.to_string(), format_uptime(instance.uptime_secs()))
        } else if instance.status == InstanceStatus::Crashed {
            ("\x1b[31m", "-".to_string(), "-".to_string())
        } else {
            ("\x1b[90m", "-".to_string(), "-".to_string())
        };
        println!(
            "  {:<36} {:<12} {}{:<12}\x1b[0m {:<8} {}",
            instance.id, instance.strategy.name, color, instance.status, pid, uptime
        );
    }
    println!();

    Ok(())
}

async fn show_status(manager: &InstanceManager, id: &str) -> Result<()> {
    let instance = manager.get(id).await?;
    let logs = manager.log_paths(&instance.strategy.name);

    println!("{}", serde_json::to_string_pretty(&instance)?);
    println!("\n  Stdout: {}", logs.stdout.display());
    println!("  Stderr: {}", logs.stderr.display());
    Ok(())
}

fn show_logs(manager: &InstanceManager, name: &str, tail: usize, stderr: bool) -> Result<()> {
    let logs = manager.log_paths(name);
    let path = if stderr { logs.stderr } else { logs.stdout };

    if !path.exists() {
        println!("\x1b[33m⚠ No log file found for '{}'\x1b[0m", name);
        println!("  Expected: {}", path.display());
        return Ok(());
    }

    for line in tail_lines(&path, tail)? {
        println!("{}", line);
    }
    Ok(())
}

async fn shutdown_all(manager: &InstanceManager, timeout: std::time::Duration) -> Result<()> {
    let active = manager
        .list(None)
        .await
        .into_iter()
        .filter(|i| i.status.is_active())
        .count();
    println!("Stopping {} running instance(s)...", active);

    manager.shutdown(timeout).await?;
    println!("\x1b[32m✓ All strategy instances stopped\x1b[0m");
    Ok(())
}

fn print_terminated(instance: &Instance) {
    match instance.status {
        InstanceStatus::Crashed => println!(
            "\x1b[33m⚠ Strategy '{}' ({}) had already exited: {}\x1b[0m",
            instance.strategy.name, instance.id, instance.last_error
        ),
        _ => println!(
            "\x1b[32m✓ Strategy '{}' ({}) stopped\x1b[0m",
            instance.strategy.name, instance.id
        ),
    }
}

/// Last `n` lines of a text file
fn tail_lines(path: &Path, n: usize) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

fn format_uptime(secs: i64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m", h, m)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();
        assert_eq!(tail_lines(&path, 2).unwrap(), vec!["c", "d"]);
        assert_eq!(tail_lines(&path, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(125), "2m05s");
        assert_eq!(format_uptime(7260), "2h01m");
    }
}
