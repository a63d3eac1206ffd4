use sqlx::{mssql::MssqlConnection, Connection, Row};
use thiserror::Error;

/// A DB failure, classified by what the loop that hit it must do.
#[derive(Debug, Error)]
pub enum DbError {
    /// The session is gone. The holder drops it (never tries to close it)
    /// and reconnects after `SLEEP_ON_DISCONNECT`.
    #[error("database connection lost: {0}")]
    Disconnected(#[source] sqlx::Error),
    /// Anything else: log it and carry on with the next iteration.
    #[error("database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => Self::Disconnected(err),
            _ => Self::Other(err),
        }
    }
}

/// One claimed row of the request queue.
#[derive(Clone, Debug)]
pub struct QueueRow {
    pub id: i32,
    pub type_id: i32,
    pub priority: i32,
    pub query: String,
}

/// Open a dedicated session. The producer and the consumer each own one;
/// they are never shared.
pub async fn connect(url: &str) -> Result<MssqlConnection, DbError> {
    MssqlConnection::connect(url).await.map_err(DbError::from)
}

/// Claim up to `max_count` rows. The procedure atomically marks the
/// returned rows as ours; every one of them must eventually be answered via
/// [`set_request_response`] or restored by [`reset_processing_queue`] on
/// the next boot.
pub async fn get_request_queue(
    conn: &mut MssqlConnection,
    max_count: i32,
) -> Result<Vec<QueueRow>, DbError> {
    // Fetched eagerly so the statement is finished before we potentially
    // block on a full queue.
    let rows = sqlx::query("EXEC etran.GetRequestQueue @MaxCount = @p1")
        .bind(max_count)
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| {
            Ok(QueueRow {
                id: row.try_get("ID")?,
                type_id: row.try_get("TypeID")?,
                priority: row.try_get("Priority")?,
                query: row.try_get("Query")?,
            })
        })
        .collect()
}

/// Persist the answer for a claimed row and unclaim it.
pub async fn set_request_response(
    conn: &mut MssqlConnection,
    request_id: i32,
    is_error: bool,
    response: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "EXEC etran.SetRequestResponse @RequestID = @p1, @IsError = @p2, @Response = @p3",
    )
    .bind(request_id)
    .bind(is_error)
    .bind(response)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Return rows claimed by a previous run but never answered to the pool.
/// Called once at boot over a dedicated short-lived session; the in-memory
/// queues do not survive restarts.
pub async fn reset_processing_queue(url: &str) -> Result<(), DbError> {
    let mut conn = connect(url).await?;
    sqlx::query("EXEC etran.ResetProcessingQueue")
        .execute(&mut conn)
        .await?;
    conn.close().await.map_err(DbError::from)
}
