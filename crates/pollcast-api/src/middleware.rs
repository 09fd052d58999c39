use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use pollcast_core::{auth, rate_limit, AppState};
use std::net::SocketAddr;

use crate::error::ApiError;

pub struct AuthUser {
    pub user_id: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // Missing credentials are 401; credentials that fail validation are 403.
        let token = bearer_token(&parts.headers).ok_or(ApiError::Unauthorized)?;
        let claims = auth::validate_token(token, &state.config.jwt_secret)
            .map_err(|_| ApiError::Forbidden)?;
        Ok(AuthUser {
            user_id: claims.user_id,
        })
    }
}

/// Admission gate for vote casting. Limits per identity when the request
/// carries a valid token, per remote address otherwise.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let user_id = bearer_token(request.headers())
        .and_then(|token| auth::validate_token(token, &state.config.jwt_secret).ok())
        .map(|claims| claims.user_id);
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let key = rate_limit::identity_key(user_id.as_deref(), remote);

    match state.rate_limiter.admit(&key).await {
        Ok(()) => next.run(request).await,
        Err(e) => ApiError::from(e).into_response(),
    }
}
