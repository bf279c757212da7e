//! Durable job store backed by a PostgreSQL table.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;

use crate::job::Job;

/// Errors that can originate from sqlx, wrapped to provide context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("job {0} does not exist")]
    NotFound(i64),
}

/// A job to be inserted. Status starts as `pending`; the id and the creation
/// timestamp are assigned by the database.
pub struct NewJob {
    pub name: String,
    pub job_type: String,
    pub payload: Option<serde_json::Value>,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The durable store interface.
///
/// The submission service owns `insert` and `delete`; the worker owns every
/// status write after `pending`. Kept as a trait so router and worker tests
/// can run against an in-memory implementation.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job with status `pending`, returning the stored row.
    async fn insert(&self, new: NewJob) -> StoreResult<Job>;

    /// Fetch one job by id.
    async fn get(&self, id: i64) -> StoreResult<Job>;

    /// List all jobs, most recently created first.
    async fn list(&self) -> StoreResult<Vec<Job>>;

    /// Move a job to `processing` before the first handler attempt.
    async fn mark_processing(&self, id: i64) -> StoreResult<()>;

    /// Move a job to `completed`. A `None` response preserves a result a
    /// handler already persisted through `update_response`.
    async fn mark_completed(&self, id: i64, response: Option<String>) -> StoreResult<()>;

    /// Move a job to `failed`. The response column is left untouched.
    async fn mark_failed(&self, id: i64) -> StoreResult<()>;

    /// Overwrite the result column. Used by handlers that persist their
    /// result before the worker advances the status.
    async fn update_response(&self, id: i64, response: &str) -> StoreResult<()>;

    /// Remove a job row. Deleting a missing row is not an error; this is the
    /// reconciliation path when queue publication fails after insert.
    async fn delete(&self, id: i64) -> StoreResult<()>;
}

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, new: NewJob) -> StoreResult<Job> {
        let job: Job = sqlx::query_as(
            r#"
INSERT INTO jobs (name, status, type, payload)
VALUES ($1, 'pending'::job_status, $2, $3)
RETURNING *
            "#,
        )
        .bind(&new.name)
        .bind(&new.job_type)
        .bind(new.payload.map(sqlx::types::Json))
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(job)
    }

    async fn get(&self, id: i64) -> StoreResult<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self) -> StoreResult<Vec<Job>> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn mark_processing(&self, id: i64) -> StoreResult<()> {
        update_status(&self.pool, id, "processing", None).await
    }

    async fn mark_completed(&self, id: i64, response: Option<String>) -> StoreResult<()> {
        update_status(&self.pool, id, "completed", Some(response)).await
    }

    async fn mark_failed(&self, id: i64) -> StoreResult<()> {
        update_status(&self.pool, id, "failed", None).await
    }

    async fn update_response(&self, id: i64, response: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE jobs SET response = $2 WHERE id = $1")
            .bind(id)
            .bind(response)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }
}

/// Single-statement status advance. `response` is three-valued: not updated
/// at all, updated-if-null (worker completion after a handler already wrote
/// it), or overwritten.
async fn update_status(
    pool: &PgPool,
    id: i64,
    status: &str,
    response: Option<Option<String>>,
) -> StoreResult<()> {
    let query = match response {
        None => "UPDATE jobs SET status = $2::job_status WHERE id = $1".to_owned(),
        Some(_) => {
            "UPDATE jobs SET status = $2::job_status, response = COALESCE($3, response) WHERE id = $1"
                .to_owned()
        }
    };

    let mut q = sqlx::query(&query).bind(id).bind(status);
    if let Some(response) = response {
        q = q.bind(response);
    }

    let result = q
        .execute(pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(id));
    }
    Ok(())
}
