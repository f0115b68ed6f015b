pub mod api;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

#[doc(hidden)]
pub mod test_support;

use crate::config::IntakeConfig;
use crate::services::intake::IntakeService;
use axum::{
    Router,
    middleware::from_fn,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::sessions::create_session,
        api::handlers::sessions::get_session,
        api::handlers::sessions::finalize_session,
        api::handlers::sessions::cancel_session,
        api::handlers::sessions::declare_file,
        api::handlers::sessions::get_file,
        api::handlers::sessions::list_missing,
        api::handlers::sessions::put_chunk,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            api::handlers::sessions::CreateSessionRequest,
            api::handlers::sessions::CancelResponse,
            models::LimitOverrides,
            models::SessionLimits,
            models::SessionState,
            models::SessionCreated,
            models::SessionStatusView,
            models::FileDeclaration,
            models::FileStatus,
            models::FileStatusView,
            models::Verdict,
            models::ChunkAck,
            models::MissingChunks,
            models::FinalizeReport,
            models::QualityReport,
            models::QualityTier,
            models::QualityMeasurements,
            models::ComponentScores,
            models::DuplicateCandidate,
            models::DuplicateMethod,
            error::Issue,
            error::IssueCode,
        )
    ),
    tags(
        (name = "sessions", description = "Upload session lifecycle"),
        (name = "files", description = "File declarations, chunks and status"),
        (name = "system", description = "Health")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<IntakeService>,
    pub config: IntakeConfig,
}

pub fn create_app(state: AppState) -> Router {
    // Room for the chunk plus any framing the client adds
    let body_limit = state.config.max_chunk_size as usize + 64 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route("/sessions", post(api::handlers::sessions::create_session))
        .route(
            "/sessions/:id",
            get(api::handlers::sessions::get_session)
                .delete(api::handlers::sessions::cancel_session),
        )
        .route(
            "/sessions/:id/finalize",
            post(api::handlers::sessions::finalize_session),
        )
        .route(
            "/sessions/:id/files/:file_id",
            post(api::handlers::sessions::declare_file).get(api::handlers::sessions::get_file),
        )
        .route(
            "/sessions/:id/files/:file_id/missing",
            get(api::handlers::sessions::list_missing),
        )
        .route(
            "/sessions/:id/files/:file_id/chunks/:index",
            put(api::handlers::sessions::put_chunk)
                .layer(axum::extract::DefaultBodyLimit::max(body_limit)),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors)
        .with_state(state)
}
