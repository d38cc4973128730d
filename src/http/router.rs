use super::handlers;
use super::types::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/orders/:id", get(handlers::get_order))
        .route("/orders/:id/generate", post(handlers::generate))
        .route("/orders/:id/dispatch", post(handlers::dispatch))
        .route("/admin/orders/:id/force-complete", post(handlers::force_complete))
        .route("/admin/orders/:id/force-fail", post(handlers::force_fail))
        .route("/admin/orders/:id/mark-failed", post(handlers::mark_failed))
        .route("/admin/cleanup", post(handlers::cleanup))
        .route(
            "/admin/auto-dispatch",
            get(handlers::get_auto_dispatch).put(handlers::set_auto_dispatch),
        )
        .route("/artifacts/:filename", get(handlers::artifact))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
