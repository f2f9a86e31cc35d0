use std::{env, sync::Arc, time::Duration};

use anyhow::anyhow;
use tokio::signal;

use docarchive::{
    build_state, config::AppConfig, extract::CliPdfEngine, handlers_for, init_tracing,
    parse_stages, Worker,
};

/// Pipeline workers share one connection each for reservations and writes.
const WORKER_POOL_SIZE: u32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let stages = parse_stages(env::var("WORKER_STAGES").ok().as_deref()).map_err(|err| anyhow!(err))?;
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = WORKER_POOL_SIZE,
        stages = ?stages,
        ocr_work_dir = %config.ocr.work_dir.display(),
        "loaded configuration"
    );

    let state = Arc::new(build_state(config, WORKER_POOL_SIZE).await?);
    let handlers = handlers_for(&state, &stages, Arc::new(CliPdfEngine::new()));
    let worker = Worker::new(state, handlers, Duration::from_secs(2));

    tokio::select! {
        _ = worker.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    Ok(())
}
