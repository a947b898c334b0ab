use clap::Parser;
use tracing::warn;

use simple_storage::{
    config::{init_tracing, DriverArgs, HostOptions},
    driver,
};

/// Deploys a SimpleStorage counter, reads it, writes the configured values
/// and reads it back after each confirmation.
#[derive(Parser)]
#[command(name = "simple-storage-deploy", version)]
struct Options {
    #[command(flatten)]
    host: HostOptions,

    #[command(flatten)]
    driver: DriverArgs,
}

async fn run(options: Options) -> anyhow::Result<()> {
    let host = options.host.connect().await?;
    let report = driver::run(&host, &options.driver.into()).await?;
    println!("{report}");
    if !report.is_consistent() {
        warn!(final_value = %report.final_value(), "reads did not match the written values");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    let options = Options::parse();
    if let Err(err) = run(options).await {
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}
