use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

use crate::api::handlers::{self, AppState};
use crate::logic::CrudEngine;
use crate::store::traits::GraphStore;

pub fn create_router<S: GraphStore + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Session lifecycle
        .route(
            "/sessions",
            get(handlers::list_sessions::<S>).post(handlers::create_session::<S>),
        )
        .route(
            "/sessions/:sid",
            get(handlers::get_session::<S>).delete(handlers::delete_session::<S>),
        )
        .route("/sessions/:sid/describe", get(handlers::describe_session::<S>))
        .route("/sessions/:sid/reload", post(handlers::reload_model::<S>))
        // Whole-model export / import
        .route(
            "/sessions/:sid/model",
            get(handlers::export_model::<S>).put(handlers::import_model::<S>),
        )
        // Generic CRUD
        .route(
            "/sessions/:sid/model/:class",
            get(handlers::list_instances::<S>).post(handlers::create_instance::<S>),
        )
        .route(
            "/sessions/:sid/model/:class/:id",
            get(handlers::get_instance::<S>)
                .put(handlers::update_instance::<S>)
                .delete(handlers::delete_instance::<S>),
        )
        .route(
            "/sessions/:sid/model/:class/:id/:feature",
            put(handlers::update_feature::<S>)
                .post(handlers::append_to_feature::<S>)
                .delete(handlers::clear_feature::<S>),
        )
        .route(
            "/sessions/:sid/model/:class/:id/:feature/:item",
            axum::routing::delete(handlers::remove_element::<S>),
        )
}

/// The full application: routes, body limit and state.
pub fn build_app<S: GraphStore + 'static>(engine: Arc<CrudEngine<S>>, max_body_bytes: usize) -> Router {
    create_router::<S>()
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(engine)
}
