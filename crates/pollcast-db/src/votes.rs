use crate::{from_millis, polls, DbError, DbPool};
use pollcast_models::Vote;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoteRow {
    pub id: String,
    pub poll_id: String,
    pub user_id: String,
    pub option_index: i64,
    pub created_at: i64,
}

impl VoteRow {
    pub fn into_vote(self) -> Vote {
        Vote {
            id: self.id,
            poll_id: self.poll_id,
            user_id: self.user_id,
            option_index: self.option_index,
            created_at: from_millis(self.created_at),
        }
    }
}

pub struct NewVote<'a> {
    pub id: &'a str,
    pub poll_id: &'a str,
    pub user_id: &'a str,
    pub option_index: i64,
}

#[derive(Debug, Clone)]
pub enum CastOutcome {
    /// A new vote row was committed.
    Inserted(VoteRow),
    /// The voter already had a vote on this poll; nothing was written.
    Existing(VoteRow),
    /// Poll missing, closed, or expired.
    PollUnavailable,
    InvalidOption,
}

pub async fn get_vote(
    conn: &mut SqliteConnection,
    poll_id: &str,
    user_id: &str,
) -> Result<Option<VoteRow>, DbError> {
    let row = sqlx::query_as::<_, VoteRow>(
        "SELECT id, poll_id, user_id, option_index, created_at
         FROM votes WHERE poll_id = ?1 AND user_id = ?2",
    )
    .bind(poll_id)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

pub async fn insert_vote(
    conn: &mut SqliteConnection,
    vote: &NewVote<'_>,
    created_at: i64,
) -> Result<VoteRow, DbError> {
    sqlx::query_as::<_, VoteRow>(
        "INSERT INTO votes (id, poll_id, user_id, option_index, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING id, poll_id, user_id, option_index, created_at",
    )
    .bind(vote.id)
    .bind(vote.poll_id)
    .bind(vote.user_id)
    .bind(vote.option_index)
    .bind(created_at)
    .fetch_one(&mut *conn)
    .await
    .map_err(DbError::from_write)
}

/// Run the cast-vote protocol in one transaction.
///
/// The transaction takes the write lock up front (`BEGIN IMMEDIATE`) so the
/// poll check, the existing-vote lookup and the insert observe one consistent
/// snapshot, even when other server processes share the database file. Only
/// an insert commits; every other outcome rolls back. A uniqueness violation
/// on insert rolls back and surfaces as [`DbError::Conflict`].
pub async fn cast_vote(
    pool: &DbPool,
    vote: &NewVote<'_>,
    now_ms: i64,
) -> Result<CastOutcome, DbError> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let outcome = cast_vote_in_tx(&mut *conn, vote, now_ms).await;
    let commit = matches!(outcome, Ok(CastOutcome::Inserted(_)));
    let finish = if commit { "COMMIT" } else { "ROLLBACK" };

    if let Err(err) = sqlx::query(finish).execute(&mut *conn).await {
        if commit {
            // A failed COMMIT leaves the transaction open.
            if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                tracing::warn!("votes: rollback after failed commit: {rollback_err}");
            }
            return Err(DbError::Sqlx(err));
        }
        tracing::warn!("votes: rollback failed: {err}");
    }

    outcome
}

async fn cast_vote_in_tx(
    conn: &mut SqliteConnection,
    vote: &NewVote<'_>,
    now_ms: i64,
) -> Result<CastOutcome, DbError> {
    let Some(poll) = polls::get_open_poll(conn, vote.poll_id, now_ms).await? else {
        return Ok(CastOutcome::PollUnavailable);
    };

    if vote.option_index < 0 || vote.option_index >= poll.option_count() as i64 {
        return Ok(CastOutcome::InvalidOption);
    }

    if let Some(existing) = get_vote(conn, vote.poll_id, vote.user_id).await? {
        return Ok(CastOutcome::Existing(existing));
    }

    let row = insert_vote(conn, vote, now_ms).await?;
    Ok(CastOutcome::Inserted(row))
}

/// Per-option counts for one poll, as `(option_index, count)` pairs.
pub async fn tally_votes(pool: &DbPool, poll_id: &str) -> Result<Vec<(i64, i64)>, DbError> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT option_index, COUNT(*)
         FROM votes
         WHERE poll_id = ?1
         GROUP BY option_index",
    )
    .bind(poll_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
