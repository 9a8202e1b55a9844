//! ploy-live CLI - strategy instance supervision
//!
//! Commands:
//! - `ploy-live strategy` - Start, stop and inspect strategy instances
//! - `ploy-live monitor` - Query live views of running instances
//! - `ploy-live run-strategy` - Strategy process entry (used by the supervisor)

pub mod monitor;
pub mod strategy;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::SupervisorConfig;
use crate::runtime::{self, RuntimeContext};

/// Live strategy instance supervisor
#[derive(Parser, Debug)]
#[command(name = "ploy-live")]
#[command(author, version, about = "Run, supervise and inspect live trading strategies")]
pub struct Cli {
    /// Directory holding supervisor.toml
    #[arg(long, global = true, env = "PLOY_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage strategy instances
    #[command(subcommand)]
    Strategy(strategy::StrategyCommands),

    /// Query running strategy instances
    #[command(subcommand)]
    Monitor(monitor::MonitorCommands),

    /// Run a strategy in this process (launched by the supervisor)
    #[command(name = "run-strategy", hide = true)]
    RunStrategy {
        /// Strategy name
        #[arg(long)]
        strategy: String,
    },
}

impl Cli {
    /// True when this invocation is a strategy process rather than a user command
    pub fn is_strategy_process(&self) -> bool {
        matches!(self.command, Commands::RunStrategy { .. })
    }

    pub fn load_config(&self) -> Result<SupervisorConfig> {
        let config = SupervisorConfig::load_from(&self.config_dir).with_context(|| {
            format!("Failed to load configuration from {}", self.config_dir.display())
        })?;
        if let Err(problems) = config.validate() {
            anyhow::bail!("Invalid configuration: {}", problems.join("; "));
        }
        Ok(config)
    }

    pub async fn run(self, config: SupervisorConfig) -> Result<()> {
        match self.command {
            Commands::Strategy(cmd) => cmd.run(&config).await,
            Commands::Monitor(cmd) => cmd.run(&config).await,
            Commands::RunStrategy { strategy } => {
                let ctx = RuntimeContext::from_env(strategy)?;
                runtime::run_strategy(ctx, config.shutdown_timeout()).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run_strategy_contract() {
        let cli = Cli::try_parse_from(["ploy-live", "run-strategy", "--strategy", "momentum"]).unwrap();
        assert!(cli.is_strategy_process());
        assert!(matches!(cli.command, Commands::RunStrategy { ref strategy } if strategy == "momentum"));
    }

    #[test]
    fn test_cli_parses_strategy_and_monitor() {
        let cli = Cli::try_parse_from(["ploy-live", "strategy", "stop", "--id", "abc"]).unwrap();
        assert!(!cli.is_strategy_process());

        let cli = Cli::try_parse_from([
            "ploy-live", "monitor", "orderbook", "abc", "--asset", "BTC-UP",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Monitor(_)));

        // stop needs a name or an id
        assert!(Cli::try_parse_from(["ploy-live", "strategy", "stop"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
