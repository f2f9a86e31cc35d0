use axum::extract::{Json, Query, State};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::{
    access,
    auth::Caller,
    error::{AppError, AppResult},
    permissions::DOC_READ,
    search::{SearchError, SearchQuery, SearchResults, MAX_PAGE_SIZE},
    state::AppState,
};

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub folder_id: Option<Uuid>,
    pub filename: Option<String>,
    #[serde(default)]
    pub all_versions: bool,
    pub from: Option<u32>,
    pub size: Option<u32>,
}

impl SearchParams {
    fn into_query(self) -> AppResult<SearchQuery> {
        let q = self.q.as_deref().map(str::trim).unwrap_or_default();
        if q.is_empty() {
            return Err(AppError::bad_request("q is required"));
        }
        Ok(SearchQuery {
            q: q.to_string(),
            folder_id: self.folder_id,
            filename: self
                .filename
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty()),
            all_versions: self.all_versions,
            from: self.from.unwrap_or(0),
            size: self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
        })
    }
}

pub async fn search(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResults>> {
    let query = params.into_query()?;

    let roles = caller.roles.clone();
    let folder_id = query.folder_id;
    state
        .with_conn(move |conn| match folder_id {
            None => {
                if access::has_global_bypass(conn, &roles)? {
                    Ok(())
                } else {
                    Err(AppError::bad_request(
                        "folderId is required (or user must have ACCESS_ALL_FOLDERS)",
                    ))
                }
            }
            Some(folder_id) => {
                access::load_folder(conn, folder_id)?;
                access::require_permission(conn, folder_id, &roles, DOC_READ)
            }
        })
        .await?;

    let unavailable = |err: SearchError| {
        warn!(error = %err, "search backend error");
        AppError::service_unavailable(format!("search unavailable: {err}"))
    };
    if !state.search.index_exists().await.map_err(unavailable)? {
        return Ok(Json(SearchResults::default()));
    }
    let results = state.search.search(&query).await.map_err(unavailable)?;
    Ok(Json(results))
}
