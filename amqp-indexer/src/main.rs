use std::process::ExitCode;

use tracing::{error, info};

use amqp_indexer::logging::init_tracing;
use amqp_indexer::{Dependencies, IndexingError, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine, the process environment still applies.
    dotenv::dotenv().ok();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            init_tracing(false);
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(settings.json_logs);

    match run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "AMQP indexer failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(settings: Settings) -> Result<(), IndexingError> {
    let dependencies = Dependencies::new(settings).await?;
    let river = dependencies.river;

    river.start();
    info!("AMQP indexer running, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    info!("Received shutdown signal");
    river.close();
    river.join().await;

    let stats = river.ack_stats();
    info!(
        acked = stats.acked,
        failed = stats.failed,
        discarded = stats.discarded,
        "AMQP indexer stopped"
    );
    Ok(())
}
