use anyhow::Result;
use clap::Parser;
use ploy_live::cli::Cli;

mod main_runtime;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    if cli.is_strategy_process() {
        main_runtime::init_strategy_logging();
    } else {
        main_runtime::init_logging(&config.log_dir);
    }

    if let Err(e) = cli.run(config).await {
        tracing::error!("{e:#}");
        println!("\x1b[31m✗ {e}\x1b[0m");
        return Err(e);
    }
    Ok(())
}
