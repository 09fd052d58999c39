use pollcast_bus::BusError;
use pollcast_db::DbError;
use thiserror::Error;

/// `Database` and `Bus` are transient store failures: nothing was committed
/// and the whole operation is safe to retry.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found")]
    NotFound,
    /// Missing, inactive and expired polls are deliberately indistinguishable.
    #[error("poll not found or closed")]
    NotFoundOrClosed,
    #[error("invalid option")]
    InvalidOption,
    #[error("forbidden")]
    Forbidden,
    #[error("invalid token")]
    InvalidToken,
    #[error("rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("internal error: {0}")]
    Internal(String),
}
