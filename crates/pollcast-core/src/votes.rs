use chrono::Utc;
use std::future::Future;
use pollcast_db::votes::{CastOutcome, NewVote};
use pollcast_db::{DbError, DbPool};
use pollcast_models::Vote;
use uuid::Uuid;

use crate::error::CoreError;
use crate::{observability, polls, AppState};

#[derive(Debug, Clone)]
pub struct CastVote {
    /// The voter's stored vote: the new one, or the one cast earlier.
    pub vote: Vote,
    /// `false` when the voter had already voted and nothing changed.
    pub newly_cast: bool,
}

/// Record `voter`'s choice on a poll, at most once per voter.
///
/// Repeat casts are idempotent: they return the original vote untouched,
/// whatever option they name. The store transaction runs on its own task,
/// so dropping the returned future (a client hanging up mid-request) cannot
/// cut the transaction short.
pub async fn cast_vote(
    pool: &DbPool,
    poll_id: &str,
    voter: &str,
    option_index: i64,
) -> Result<CastVote, CoreError> {
    let pool = pool.clone();
    let poll_id = poll_id.to_string();
    let voter = voter.to_string();
    tokio::spawn(async move {
        let outcome = cast_with_retry(&poll_id, option_index, || {
            attempt_cast(pool.clone(), poll_id.clone(), voter.clone(), option_index)
        })
        .await;
        outcome
    })
    .await
    .map_err(|e| CoreError::Internal(format!("vote task failed: {e}")))?
}

/// One run of the store transaction with a fresh vote id.
async fn attempt_cast(
    pool: DbPool,
    poll_id: String,
    voter: String,
    option_index: i64,
) -> Result<CastOutcome, DbError> {
    let id = Uuid::new_v4().to_string();
    let vote = NewVote {
        id: &id,
        poll_id: &poll_id,
        user_id: &voter,
        option_index,
    };
    let now_ms = Utc::now().timestamp_millis();
    pollcast_db::votes::cast_vote(&pool, &vote, now_ms).await
}

/// Map transaction outcomes to a cast result. A uniqueness conflict means a
/// concurrent cast from the same voter won the race: `attempt` runs once
/// more and reports the winner's row. A second conflict is returned as is.
async fn cast_with_retry<F, Fut>(
    poll_id: &str,
    option_index: i64,
    mut attempt: F,
) -> Result<CastVote, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CastOutcome, DbError>>,
{
    let mut retried = false;
    loop {
        match attempt().await {
            Ok(CastOutcome::Inserted(row)) => {
                observability::vote_cast();
                tracing::debug!(poll_id = %poll_id, option_index, "votes: cast");
                return Ok(CastVote {
                    vote: row.into_vote(),
                    newly_cast: true,
                });
            }
            Ok(CastOutcome::Existing(row)) => {
                return Ok(CastVote {
                    vote: row.into_vote(),
                    newly_cast: false,
                });
            }
            Ok(CastOutcome::PollUnavailable) => return Err(CoreError::NotFoundOrClosed),
            Ok(CastOutcome::InvalidOption) => return Err(CoreError::InvalidOption),
            Err(DbError::Conflict) if !retried => {
                tracing::debug!(poll_id = %poll_id, "votes: concurrent cast detected, retrying");
                retried = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Cast a vote and, when it is new, publish the poll's fresh tally.
pub async fn cast_vote_and_publish(
    state: &AppState,
    poll_id: &str,
    voter: &str,
    option_index: i64,
) -> Result<CastVote, CoreError> {
    let cast = cast_vote(&state.db, poll_id, voter, option_index).await?;
    publish_if_new(state, poll_id, &cast).await;
    Ok(cast)
}

async fn publish_if_new(state: &AppState, poll_id: &str, cast: &CastVote) {
    if !cast.newly_cast {
        return;
    }
    match polls::get_results(&state.db, poll_id).await {
        Ok(Some(results)) => state.publisher.publish_vote_update(poll_id, &results).await,
        Ok(None) => {}
        Err(e) => tracing::warn!(poll_id = %poll_id, "votes: tally for update failed: {e}"),
    }
}
