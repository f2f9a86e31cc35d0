pub mod access;
pub mod auth;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod events;
pub mod extract;
pub mod models;
pub mod permissions;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod search;
pub mod state;
pub mod storage;
pub mod workers;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use diesel::pg::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing_subscriber::EnvFilter;

pub use workers::{handlers_for, parse_stages, EventHandler, EventOutcome, Worker};

use crate::{
    config::AppConfig, events::PgEventBus, search::ElasticsearchIndex, state::AppState,
};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub fn run_migrations(conn: &mut PgConnection) -> Result<()> {
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("failed to run migrations: {err}"))?;
    Ok(())
}

/// Wires the production adapters: S3 storage, the Postgres topic log and
/// Elasticsearch.
pub async fn build_state(config: AppConfig, pool_size: u32) -> Result<AppState> {
    let pool = db::init_pool_with_size(&config.database_url, pool_size)
        .context("failed to create database pool")?;
    let storage = s3::build_storage(&config).await?;
    let events = PgEventBus::new(pool.clone());
    let search = ElasticsearchIndex::new(
        config.elasticsearch_url.clone(),
        config.elasticsearch_index.clone(),
    );

    Ok(AppState::new(
        pool,
        config,
        Arc::new(storage),
        Arc::new(events),
        Arc::new(search),
    ))
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
