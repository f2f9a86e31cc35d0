use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{auth::Caller, state::AppState};

pub mod documents;
pub mod folders;
pub mod health;
pub mod roles;
pub mod search;

fn cors_layer(allowed_origin: Option<&str>) -> CorsLayer {
    let allow_origin = match allowed_origin {
        Some(origins) => {
            let headers: Vec<HeaderValue> = origins
                .split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .filter_map(|value| match value.parse::<HeaderValue>() {
                    Ok(header) => Some(header),
                    Err(_) => {
                        warn!(origin = %value, "ignoring invalid CORS allowed origin");
                        None
                    }
                })
                .collect();
            AllowOrigin::list(headers)
        }
        None => AllowOrigin::mirror_request(),
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn create_router(state: AppState) -> Router<()> {
    let cors = cors_layer(state.config.cors_allowed_origin.as_deref());

    let folders_routes = Router::new()
        .route("/", post(folders::create_folder))
        .route("/root", get(folders::get_root))
        .route(
            "/:id",
            get(folders::get_folder)
                .patch(folders::rename_folder)
                .delete(folders::delete_folder),
        )
        .route("/:id/move", post(folders::move_folder))
        .route("/:id/restore", post(folders::restore_folder))
        .route("/:id/children", get(folders::list_children))
        .route(
            "/:id/grants",
            get(folders::list_grants).put(folders::replace_grants),
        )
        .route("/:id/effective-grants", get(folders::effective_grants))
        .route("/:id/my-access", get(folders::my_access))
        .route(
            "/:id/documents",
            get(folders::list_documents).post(folders::create_document),
        );

    let documents_routes = Router::new()
        .route(
            "/:id",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route("/:id/restore", post(documents::restore_document))
        .route(
            "/:id/versions",
            get(documents::list_versions).post(documents::create_version),
        );

    let versions_routes = Router::new()
        .route("/:id/commit", post(documents::commit_version))
        .route("/:id/ocr", get(documents::ocr_status))
        .route("/:id/ocr/retry", post(documents::retry_ocr))
        .route("/:id/pages", get(documents::list_pages))
        .route("/:id/download", get(documents::download_version));

    let roles_routes = Router::new()
        .route("/", get(roles::list_roles).post(roles::create_role))
        .route("/:id/permissions", put(roles::replace_role_permissions))
        .route(
            "/:id/operational-roles/:operational_role/permissions",
            put(roles::replace_operational_permissions),
        );

    let permissions_routes = Router::new().route(
        "/",
        get(roles::list_permissions).post(roles::create_permission),
    );

    let protected_routes = Router::new()
        .nest("/api/folders", folders_routes)
        .nest("/api/documents", documents_routes)
        .nest("/api/versions", versions_routes)
        .nest("/api/roles", roles_routes)
        .nest("/api/permissions", permissions_routes)
        .route("/api/search", get(search::search))
        .layer(middleware::from_extractor::<Caller>());

    Router::new()
        .merge(protected_routes)
        .route("/api/health", get(health::health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
