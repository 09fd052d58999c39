mod handler;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use pollcast_core::{AppConfig, AppState};

/// Inbound frames are tiny JSON control messages.
const MAX_MESSAGE_SIZE: usize = 16 * 1024;

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

/// Local front-end dev servers.
const DEV_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
];

/// Browser upgrades must come from a dev server, the public URL, a
/// configured origin, or the host being connected to. Clients that send no
/// `Origin` are not browsers and pass.
fn origin_allowed(config: &AppConfig, origin: Option<&str>, host: Option<&str>) -> bool {
    let Some(origin) = origin.map(canonical_origin) else {
        return true;
    };
    let listed = DEV_ORIGINS
        .into_iter()
        .chain(config.public_url.as_deref())
        .chain(config.allowed_origins.iter().map(String::as_str))
        .any(|candidate| canonical_origin(candidate) == origin);
    listed || host.is_some_and(|host| authority(&origin) == host.trim().to_ascii_lowercase())
}

fn canonical_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// `host[:port]` of an origin.
fn authority(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    rest.split('/').next().unwrap_or_default()
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn ws_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let origin = header_str(&headers, header::ORIGIN);
    if !origin_allowed(&state.config, origin, header_str(&headers, header::HOST)) {
        tracing::debug!("ws: rejected upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .max_frame_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handler::handle_connection(socket, state))
        .into_response()
}
