// src/routes.rs
use std::time::Duration;

use axum::{
    http::{header::CONTENT_TYPE, HeaderName, HeaderValue, Method},
    routing::get,
    Router,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::handlers;
use crate::session::SESSION_TOKEN_HEADER;
use crate::state::AppState;

pub fn create_routes(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/polls", get(handlers::list_polls).post(handlers::create_poll))
        .route("/polls/{id}", get(handlers::get_poll).delete(handlers::delete_poll))
        .route("/polls/{id}/results", get(handlers::poll_results))
        .route("/polls/{id}/live", get(handlers::live_results))
        .route("/votes", get(handlers::list_votes).post(handlers::vote));

    let cors = cors_layer(state.config.cors_allow_origin.as_deref());

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allow_origin: Option<&str>) -> CorsLayer {
    let origin = match allow_origin.map(HeaderValue::from_str) {
        Some(Ok(origin)) => AllowOrigin::exact(origin),
        Some(Err(e)) => {
            warn!(error = %e, "Invalid CORS_ALLOW_ORIGIN, allowing any origin");
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static(SESSION_TOKEN_HEADER)])
        .max_age(Duration::from_secs(60 * 60))
}
