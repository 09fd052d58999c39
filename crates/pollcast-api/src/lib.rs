pub mod error;
pub mod middleware;
pub mod routes;

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use pollcast_core::AppState;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// HTTP routes. The vote route sits behind the shared rate limiter.
pub fn build_router(state: &AppState) -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/auth/anon", post(routes::auth::anonymous))
        .route("/poll", post(routes::polls::create_poll))
        .route("/poll/{id}", get(routes::polls::get_poll))
        .route(
            "/poll/{id}/vote",
            post(routes::polls::cast_vote).route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::rate_limit,
            )),
        )
        .route("/poll/{id}/close", post(routes::polls::close_poll))
        .route("/poll/{id}/subscribers", get(routes::polls::subscribers))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
