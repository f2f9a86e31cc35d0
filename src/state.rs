use std::sync::Arc;

use diesel::pg::PgConnection;
use tokio::task;

use crate::{
    config::AppConfig,
    db::{PgPool, PgPooledConnection},
    error::{AppError, AppResult},
    events::EventBus,
    search::SearchIndex,
    storage::ObjectStorage,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub events: Arc<dyn EventBus>,
    pub search: Arc<dyn SearchIndex>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        events: Arc<dyn EventBus>,
        search: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            events,
            search,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }

    /// Runs blocking diesel work on the blocking pool with a pooled connection.
    pub async fn with_conn<F, T>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut PgConnection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = self.clone();
        task::spawn_blocking(move || {
            let mut conn = state.db()?;
            f(&mut conn)
        })
        .await?
    }
}
