use std::net::SocketAddr;

use anyhow::Context;
use tokio::{net::TcpListener, signal};

use docarchive::{build_state, config::AppConfig, init_tracing, routes, run_migrations};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "api",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        s3_bucket = %config.s3_bucket,
        elasticsearch_index = %config.elasticsearch_index,
        "loaded configuration"
    );

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port)
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let pool_size = config.database_max_pool_size;
    let state = build_state(config, pool_size).await?;

    {
        let mut conn = state
            .pool
            .get()
            .context("failed to get database connection for migrations")?;
        run_migrations(&mut conn)?;
    }

    let app = routes::create_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
            tracing::info!("api received shutdown signal");
        })
        .await
        .context("server error")?;

    Ok(())
}
