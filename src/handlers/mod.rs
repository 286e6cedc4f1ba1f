mod indexes;
mod keys;
mod query;

pub use indexes::list_indexes;
pub use keys::{get_count, get_keys, get_match};
pub use query::{get_all, get_cont, get_query, head_all, head_query};

use crate::engine::BioIndex;
use axum::{Router, routing::get};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BioIndex>,
}

/// All `/api` routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/indexes", get(list_indexes))
        .route("/api/query/:index", get(get_query).head(head_query))
        .route("/api/all/:index", get(get_all).head(head_all))
        .route("/api/cont", get(get_cont))
        .route("/api/count/:index", get(get_count))
        .route("/api/keys/:index", get(get_keys))
        .route("/api/match/:index", get(get_match))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
