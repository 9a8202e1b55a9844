//! Monitoring query commands
//!
//! Each command talks to one instance's monitoring socket and prints the view
//! as JSON.

use anyhow::Result;
use clap::Subcommand;
use futures::future::join_all;
use serde::Serialize;

use crate::config::SupervisorConfig;
use crate::monitoring::{MonitoringQuerier, DEFAULT_TRADES_LIMIT};

#[derive(Subcommand, Debug)]
pub enum MonitorCommands {
    /// List instances with a monitoring socket
    Instances,

    /// Health view
    Health { id: String },

    /// PnL view
    Pnl { id: String },

    /// Positions, open orders and recent trades
    Positions { id: String },

    /// Order book of one asset
    Orderbook {
        id: String,

        /// Asset identifier
        #[arg(long)]
        asset: String,
    },

    /// Recent trades, newest first
    Trades {
        id: String,

        #[arg(long, default_value_t = DEFAULT_TRADES_LIMIT)]
        limit: usize,
    },

    /// Counters and gauges
    Metrics { id: String },

    /// Assets with an order book
    Assets { id: String },

    /// Execution timing statistics
    Stats { id: String },

    /// Recent execution samples
    Executions {
        id: String,

        #[arg(long)]
        limit: Option<usize>,
    },
}

impl MonitorCommands {
    pub async fn run(self, config: &SupervisorConfig) -> Result<()> {
        let querier =
            MonitoringQuerier::new(&config.socket_dir).with_timeout(config.query_timeout());

        match self {
            Self::Instances => list_instances(&querier).await,
            Self::Health { id } => print_json(&querier.query_health(&id).await?),
            Self::Pnl { id } => print_json(&querier.query_pnl(&id).await?),
            Self::Positions { id } => print_json(&querier.query_positions(&id).await?),
            Self::Orderbook { id, asset } => {
                print_json(&querier.query_orderbook(&id, &asset).await?)
            }
            Self::Trades { id, limit } => print_json(&querier.query_trades(&id, Some(limit)).await?),
            Self::Metrics { id } => print_json(&querier.query_metrics(&id).await?),
            Self::Assets { id } => print_json(&querier.query_assets(&id).await?),
            Self::Stats { id } => print_json(&querier.query_profiling_stats(&id).await?),
            Self::Executions { id, limit } => {
                print_json(&querier.query_executions(&id, limit).await?)
            }
        }
    }
}

async fn list_instances(querier: &MonitoringQuerier) -> Result<()> {
    let ids = querier.list_instances().await?;
    if ids.is_empty() {
        println!(
            "\x1b[90m(no monitoring sockets in {})\x1b[0m",
            querier.socket_dir().display()
        );
        return Ok(());
    }

    // Best effort: a socket may belong to an instance that is going away
    let health = join_all(ids.iter().map(|id| querier.query_health(id))).await;

    println!("  {:<36} {:<12} {}", "ID", "STRATEGY", "HEALTH");
    println!("  {}", "-".repeat(60));
    for (id, result) in ids.iter().zip(health) {
        match result {
            Ok(health) => println!(
                "  {:<36} {:<12} {:?}",
                id, health.strategy, health.status
            ),
            Err(e) => println!("  {:<36} {:<12} \x1b[31m{}\x1b[0m", id, "-", e),
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
