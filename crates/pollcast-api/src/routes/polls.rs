use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use pollcast_core::{polls, votes, AppState};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVoteRequest {
    pub option_index: i64,
}

pub async fn create_poll(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreatePollRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let poll = polls::create_poll(
        &state.db,
        &body.question,
        &body.options,
        body.expires_at,
        Some(&auth.user_id),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!(poll))))
}

pub async fn get_poll(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(poll_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let results = polls::get_results(&state.db, &poll_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(json!(results)))
}

pub async fn cast_vote(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(poll_id): Path<String>,
    Json(body): Json<CastVoteRequest>,
) -> Result<Json<Value>, ApiError> {
    let cast =
        votes::cast_vote_and_publish(&state, &poll_id, &auth.user_id, body.option_index).await?;
    Ok(Json(json!({
        "success": true,
        "vote": cast.vote,
    })))
}

pub async fn close_poll(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(poll_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    polls::close_poll(&state, &poll_id, &auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn subscribers(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(poll_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let local = state.registry.local_subscriber_count(&poll_id);
    let cluster = state.registry.cluster_subscribers(&poll_id).await?.len();
    Ok(Json(json!({
        "pollId": poll_id,
        "local": local,
        "cluster": cluster,
    })))
}
