//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::CoreError;

use super::{JobRecord, NewJob, Persistence, ResourceRecord, TaskRecord, check_data_key};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/ecloud.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// In-memory database with migrations applied. A single connection keeps
    /// every query on the same database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_resource(&self, resource: &ResourceRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO resources (id, kind, name, properties, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.id)
        .bind(&resource.kind)
        .bind(&resource.name)
        .bind(&resource.properties)
        .bind(resource.created_at)
        .bind(resource.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_resource(&self, resource_id: &str) -> Result<Option<ResourceRecord>, CoreError> {
        let record = sqlx::query_as::<_, ResourceRecord>(
            r#"
            SELECT id, kind, name, properties, created_at, updated_at
            FROM resources
            WHERE id = ?
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn update_resource(&self, resource: &ResourceRecord) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET name = ?, properties = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&resource.name)
        .bind(&resource.properties)
        .bind(Utc::now())
        .bind(&resource.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ResourceNotFound {
                resource_id: resource.id.clone(),
            });
        }

        Ok(())
    }

    async fn delete_resource(&self, resource_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM resources WHERE id = ?")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, resource_id, resource_type, name, task_type, status,
                               failure_reason, data, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.resource_id)
        .bind(&task.resource_type)
        .bind(&task.name)
        .bind(&task.task_type)
        .bind(&task.status)
        .bind(&task.failure_reason)
        .bind(&task.data)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, resource_id, resource_type, name, task_type, status,
                   failure_reason, data, created_at, updated_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn latest_task(&self, resource_id: &str) -> Result<Option<TaskRecord>, CoreError> {
        let record = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, resource_id, resource_type, name, task_type, status,
                   failure_reason, data, created_at, updated_at
            FROM tasks
            WHERE resource_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn count_tasks(&self, resource_id: &str) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE resource_id = ?")
            .bind(resource_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn list_tasks(
        &self,
        resource_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TaskRecord>, CoreError> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT id, resource_id, resource_type, name, task_type, status,
                   failure_reason, data, created_at, updated_at
            FROM tasks
            WHERE resource_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(resource_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn complete_task(&self, task_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'complete', updated_at = ?
            WHERE id = ? AND status = 'in-progress'
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', failure_reason = ?, updated_at = ?
            WHERE id = ? AND status IN ('in-progress', 'failed')
            "#,
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn merge_task_data(
        &self,
        task_id: &str,
        key: &str,
        value: &Value,
    ) -> Result<(), CoreError> {
        check_data_key(key)?;
        let encoded = serde_json::to_string(value)?;
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET data = json_set(COALESCE(data, '{}'), '$."' || ? || '"', json(?)),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(key)
        .bind(encoded)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }

        Ok(())
    }

    async fn enqueue_job(&self, job: &NewJob) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO job_queue (task_id, steps, position, attempts, available_at, created_at)
            VALUES (?, ?, ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&job.task_id)
        .bind(Json(&job.steps))
        .bind(job.position)
        .bind(job.available_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRecord>, CoreError> {
        let claim_token = Uuid::new_v4().to_string();
        let mut records = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE job_queue
            SET locked_until = ?, claim_token = ?
            WHERE id IN (
                SELECT id FROM job_queue
                WHERE available_at <= ?
                  AND (locked_until IS NULL OR locked_until <= ?)
                ORDER BY available_at ASC, id ASC
                LIMIT ?
            )
            RETURNING id, task_id, steps, position, attempts, available_at, locked_until,
                      claim_token, created_at
            "#,
        )
        .bind(lease_until)
        .bind(&claim_token)
        .bind(now)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        records.sort_by(|a, b| (a.available_at, a.id).cmp(&(b.available_at, b.id)));
        Ok(records)
    }

    async fn renew_job_lease(
        &self,
        job: &JobRecord,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE job_queue SET locked_until = ? WHERE id = ? AND claim_token = ?",
        )
        .bind(lease_until)
        .bind(job.id)
        .bind(&job.claim_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn advance_job(
        &self,
        job: &JobRecord,
        next: Option<&NewJob>,
    ) -> Result<bool, CoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM job_queue WHERE id = ? AND claim_token = ?")
            .bind(job.id)
            .bind(&job.claim_token)
            .execute(&mut *tx)
            .await?;

        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(next) = next {
            sqlx::query(
                r#"
                INSERT INTO job_queue (task_id, steps, position, attempts, available_at, created_at)
                VALUES (?, ?, ?, 0, ?, ?)
                "#,
            )
            .bind(&next.task_id)
            .bind(Json(&next.steps))
            .bind(next.position)
            .bind(next.available_at)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn release_job(
        &self,
        job: &JobRecord,
        attempts: i32,
        available_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET attempts = ?, available_at = ?, locked_until = NULL, claim_token = NULL
            WHERE id = ? AND claim_token = ?
            "#,
        )
        .bind(attempts)
        .bind(available_at)
        .bind(job.id)
        .bind(&job.claim_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_job(&self, job: &JobRecord) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = ? AND claim_token = ?")
            .bind(job.id)
            .bind(&job.claim_token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_jobs(&self, task_id: &str) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_queue WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
