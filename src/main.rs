use agent_hive::cli::{self, Cli};
use agent_hive::config::HiveConfig;
use agent_hive::observability::store_metrics;
use agent_hive::telemetry::init_telemetry;
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    HiveConfig::load_env_file()?;
    let config = HiveConfig::load_from(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    let output = tokio::runtime::Runtime::new()?.block_on(cli::run(&cli, &config));
    store_metrics().log_stats();

    println!("{}", output.render(cli.json)?);
    Ok(if output.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
