mod cli;
mod commands;

use std::process;

use anyhow::Result;
use clap::Parser;
use rendershard::config::AppConfig;
use rendershard::logging::{VERBOSE_LOG_FILTER, init_logging};
use tracing::{debug, error};

use crate::cli::Args;
use crate::commands::CommandExecutor;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            let mut config = AppConfig::from_file(path)?;
            config.apply_env(|key| std::env::var(key).ok());
            config.validate()?;
            config
        }
        None => AppConfig::from_env()?,
    };
    let logging = init_logging(&config.logging)?;
    // Overrides RUST_LOG as well.
    if args.verbose {
        logging.set_filter(VERBOSE_LOG_FILTER)?;
    }
    debug!(filter = %logging.get_filter(), "Logging initialized");

    let executor = CommandExecutor::new(&args, config);
    let command = args.command;
    let result = executor.execute(command).await;
    executor.shutdown().await;
    result
}
