use crate::{from_millis, DbError, DbPool};
use pollcast_models::Poll;
use sqlx::types::Json;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PollRow {
    pub id: String,
    pub question: String,
    pub options: Json<Vec<String>>,
    pub created_at: i64,
    pub expires_at: i64,
    pub is_active: bool,
    pub created_by: Option<String>,
}

impl PollRow {
    pub fn option_count(&self) -> usize {
        self.options.0.len()
    }

    pub fn into_poll(self) -> Poll {
        Poll {
            id: self.id,
            question: self.question,
            options: self.options.0,
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
            is_active: self.is_active,
            created_by: self.created_by,
        }
    }
}

pub struct NewPoll<'a> {
    pub id: &'a str,
    pub question: &'a str,
    pub options: &'a [String],
    pub created_at: i64,
    pub expires_at: i64,
    pub created_by: Option<&'a str>,
}

pub async fn create_poll(pool: &DbPool, poll: &NewPoll<'_>) -> Result<PollRow, DbError> {
    let row = sqlx::query_as::<_, PollRow>(
        "INSERT INTO polls (id, question, options, created_at, expires_at, is_active, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
         RETURNING id, question, options, created_at, expires_at, is_active, created_by",
    )
    .bind(poll.id)
    .bind(poll.question)
    .bind(Json(poll.options))
    .bind(poll.created_at)
    .bind(poll.expires_at)
    .bind(poll.created_by)
    .fetch_one(pool)
    .await
    .map_err(DbError::from_write)?;
    Ok(row)
}

pub async fn get_poll(pool: &DbPool, id: &str) -> Result<Option<PollRow>, DbError> {
    let row = sqlx::query_as::<_, PollRow>(
        "SELECT id, question, options, created_at, expires_at, is_active, created_by
         FROM polls WHERE id = ?1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Load a poll only if it still accepts votes at `now_ms`.
pub async fn get_open_poll(
    conn: &mut SqliteConnection,
    id: &str,
    now_ms: i64,
) -> Result<Option<PollRow>, DbError> {
    let row = sqlx::query_as::<_, PollRow>(
        "SELECT id, question, options, created_at, expires_at, is_active, created_by
         FROM polls
         WHERE id = ?1 AND is_active = 1 AND expires_at > ?2",
    )
    .bind(id)
    .bind(now_ms)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

/// Mark a poll inactive. Returns `false` when no poll has that id.
pub async fn close_poll(pool: &DbPool, id: &str) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE polls SET is_active = 0 WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
