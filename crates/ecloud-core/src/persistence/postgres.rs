// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Job claiming uses `FOR UPDATE SKIP LOCKED` so any number of workers across
//! processes can poll the same queue.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::CoreError;

use super::{JobRecord, NewJob, Persistence, ResourceRecord, TaskRecord, check_data_key};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    // ========================================================================
    // Resources
    // ========================================================================

    async fn insert_resource(&self, resource: &ResourceRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO resources (id, kind, name, properties, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
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
            WHERE id = $1
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
            SET name = $1, properties = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(&resource.name)
        .bind(&resource.properties)
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
        let result = sqlx::query("DELETE FROM resources WHERE id = $1")
            .bind(resource_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    async fn insert_task(&self, task: &TaskRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, resource_id, resource_type, name, task_type, status,
                               failure_reason, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
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
            WHERE id = $1
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
            WHERE resource_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn count_tasks(&self, resource_id: &str) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE resource_id = $1")
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
            WHERE resource_id = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2 OFFSET $3
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
            SET status = 'complete', updated_at = NOW()
            WHERE id = $1 AND status = 'in-progress'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', failure_reason = $1, updated_at = NOW()
            WHERE id = $2 AND status IN ('in-progress', 'failed')
            "#,
        )
        .bind(reason)
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

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET data = COALESCE(data, '{}'::jsonb) || jsonb_build_object($1::text, $2::jsonb),
                updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(key)
        .bind(Json(value))
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

    // ========================================================================
    // Job queue
    // ========================================================================

    async fn enqueue_job(&self, job: &NewJob) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO job_queue (task_id, steps, position, attempts, available_at)
            VALUES ($1, $2, $3, 0, $4)
            RETURNING id
            "#,
        )
        .bind(&job.task_id)
        .bind(Json(&job.steps))
        .bind(job.position)
        .bind(job.available_at)
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
            SET locked_until = $1, claim_token = $2
            WHERE id IN (
                SELECT id FROM job_queue
                WHERE available_at <= $3
                  AND (locked_until IS NULL OR locked_until <= $3)
                ORDER BY available_at ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_id, steps, position, attempts, available_at, locked_until,
                      claim_token, created_at
            "#,
        )
        .bind(lease_until)
        .bind(&claim_token)
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
            "UPDATE job_queue SET locked_until = $1 WHERE id = $2 AND claim_token = $3",
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

        let deleted = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND claim_token = $2")
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
                INSERT INTO job_queue (task_id, steps, position, attempts, available_at)
                VALUES ($1, $2, $3, 0, $4)
                "#,
            )
            .bind(&next.task_id)
            .bind(Json(&next.steps))
            .bind(next.position)
            .bind(next.available_at)
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
            SET attempts = $1, available_at = $2, locked_until = NULL, claim_token = NULL
            WHERE id = $3 AND claim_token = $4
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
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1 AND claim_token = $2")
            .bind(job.id)
            .bind(&job.claim_token)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_jobs(&self, task_id: &str) -> Result<i64, CoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_queue WHERE task_id = $1")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    async fn health_check_db(&self) -> Result<bool, CoreError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::StepSpec;
    use crate::resource::ResourceKind;
    use crate::task::generate_task_id;
    use chrono::Duration;
    use serde_json::json;

    static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

    // Helper to get a test database pool
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.ok()?;
        MIGRATOR.run(&pool).await.ok()?;
        Some(pool)
    }

    fn in_progress_task(resource_id: &str) -> TaskRecord {
        let now = Utc::now();
        TaskRecord {
            id: generate_task_id(),
            resource_id: resource_id.to_string(),
            resource_type: "network".to_string(),
            name: "sync_create".to_string(),
            task_type: "create".to_string(),
            status: "in-progress".to_string(),
            failure_reason: None,
            data: Json(json!({})),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_task_transitions_and_data() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);
        let resource_id = ResourceKind::Network.generate_id();
        let task = in_progress_task(&resource_id);

        persistence.insert_task(&task).await.unwrap();
        persistence
            .merge_task_data(&task.id, "segment_path", &json!("/infra/segments/x"))
            .await
            .unwrap();
        assert!(persistence.complete_task(&task.id).await.unwrap());
        assert!(!persistence.fail_task(&task.id, "too late").await.unwrap());

        let loaded = persistence.latest_task(&resource_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, "complete");
        assert_eq!(
            loaded.data_value("segment_path"),
            Some(&json!("/infra/segments/x"))
        );

        sqlx::query("DELETE FROM tasks WHERE resource_id = $1")
            .bind(&resource_id)
            .execute(persistence.pool())
            .await
            .ok();
    }

    #[tokio::test]
    async fn test_claim_skips_leased_jobs() {
        let Some(pool) = test_pool().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let persistence = PostgresPersistence::new(pool);
        let resource_id = ResourceKind::Router.generate_id();
        let task = in_progress_task(&resource_id);
        persistence.insert_task(&task).await.unwrap();

        let now = Utc::now();
        let job_id = persistence
            .enqueue_job(&NewJob {
                task_id: task.id.clone(),
                steps: vec![StepSpec::new("only")],
                position: 0,
                available_at: now - Duration::seconds(1),
            })
            .await
            .unwrap();

        let claimed = persistence
            .claim_due_jobs(now, now + Duration::seconds(60), 1000)
            .await
            .unwrap();
        let job = claimed
            .into_iter()
            .find(|job| job.id == job_id)
            .expect("due job should be claimed");
        assert!(job.claim_token.is_some());

        let again = persistence
            .claim_due_jobs(now, now + Duration::seconds(60), 1000)
            .await
            .unwrap();
        assert!(again.iter().all(|job| job.id != job_id));

        assert!(persistence.advance_job(&job, None).await.unwrap());
        assert!(!persistence.delete_job(&job).await.unwrap());
        assert_eq!(persistence.count_jobs(&task.id).await.unwrap(), 0);

        sqlx::query("DELETE FROM tasks WHERE resource_id = $1")
            .bind(&resource_id)
            .execute(persistence.pool())
            .await
            .ok();
    }
}
