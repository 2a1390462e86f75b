use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::info;

use waypost::cli::{Cli, Commands};
use waypost::status::StatusSummary;
use waypost::{ServiceConfig, ServiceDaemon, Services};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig {
        database_url: cli.database_url.clone(),
        outbox_path: cli.outbox_path.clone(),
        ..ServiceConfig::default()
    };

    match cli.command {
        Commands::Run => {
            let services = Services::build(&config).await?;
            let daemon = ServiceDaemon::start(&services, &config);

            signal::ctrl_c().await?;
            info!("interrupt received, shutting down");
            daemon.shutdown().await?;
        }

        Commands::Status => {
            let services = Services::build(&config).await?;
            let summary = StatusSummary::collect(&services).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::SyncNow => {
            let services = Services::build(&config).await?;
            match services.engine.drain().await? {
                Some(report) => {
                    println!("drained: {} applied, {} failed", report.applied, report.failed)
                }
                None => println!("another drain is already in progress"),
            }
        }
    }

    Ok(())
}
