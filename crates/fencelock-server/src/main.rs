//! Main entry point for the Fencelock server.
//!
//! Boots every configured region in-process, waits for their leaders and
//! serves the lock console on stdin/stdout.

use std::time::Duration;

use clap::Parser;
use fencelock_server::{
    Cli, Configuration, console,
    startup::{self, LocalDeployment},
};
use tokio::io::BufReader;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let configuration = Configuration::load(&cli)?;

    let _logging_guard = startup::init_logging(&configuration.logging_config())?;
    fencelock_server::metrics::init_metrics();

    let deployment = LocalDeployment::start(&configuration, Duration::from_secs(30)).await?;
    info!(
        region = %deployment.home_region(),
        regions = deployment.regions().len(),
        "Fencelock started"
    );

    let session = console::run(
        &deployment,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    );
    tokio::select! {
        result = session => {
            if let Err(e) = result {
                error!("Console error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    deployment.shutdown();
    Ok(())
}
