//! Durable job table backing the dispatch queue.
//!
//! A job is `pending` until its `run_at` passes, `processing` while a worker
//! holds its lease, then `completed` or `failed`. Expired leases are handed
//! back to `pending`, so delivery to the worker is at-least-once.

use sqlx::SqliteConnection;

use parley_core::DispatchJob;

use crate::error::Result;
use crate::models::QueuedJob;
use crate::repository::{ParleyDb, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Milliseconds before the job becomes visible to the worker.
    pub delay_ms: i64,
    pub max_attempts: i64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            max_attempts: 3,
        }
    }
}

pub(crate) async fn insert_job(
    conn: &mut SqliteConnection,
    job: &DispatchJob,
    options: &EnqueueOptions,
    now: i64,
) -> Result<i64> {
    let payload = serde_json::to_string(job)?;
    let run_at = now + options.delay_ms.max(0);

    let result = sqlx::query(
        r#"INSERT INTO jobs (tenant_id, campaign_id, payload, status, attempts, max_attempts, run_at, created_at, updated_at)
           VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?)"#,
    )
    .bind(&job.tenant_id)
    .bind(job.campaign_id.as_deref())
    .bind(payload)
    .bind(options.max_attempts.max(1))
    .bind(run_at)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

impl ParleyDb {
    pub async fn enqueue_job(&self, job: &DispatchJob, options: &EnqueueOptions) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        insert_job(&mut conn, job, options, now_millis()).await
    }

    /// Lease the oldest job whose `run_at` has passed.
    ///
    /// A scheduled campaign flips to `processing` when its first job is claimed.
    pub async fn claim_next_job(&self, lease_ms: i64) -> Result<Option<QueuedJob>> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query_as::<_, QueuedJob>(
            "SELECT * FROM jobs WHERE status = 'pending' AND run_at <= ? ORDER BY run_at, id LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = candidate else {
            tx.commit().await?;
            return Ok(None);
        };

        let locked_until = now + lease_ms;
        let claimed = sqlx::query(
            "UPDATE jobs SET status = 'processing', locked_until = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(locked_until)
        .bind(now)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        if let Some(campaign_id) = &job.campaign_id {
            sqlx::query(
                "UPDATE campaigns SET status = 'processing', updated_at = ?
                 WHERE id = ? AND status = 'scheduled'",
            )
            .bind(now)
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Some(QueuedJob {
            status: "processing".to_string(),
            locked_until: Some(locked_until),
            updated_at: now,
            ..job
        }))
    }

    /// Return jobs whose lease expired (worker crashed mid-job) to `pending`.
    pub async fn requeue_expired_jobs(&self) -> Result<u64> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', locked_until = NULL, updated_at = ?
             WHERE status = 'processing' AND locked_until IS NOT NULL AND locked_until < ?",
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<QueuedJob>> {
        Ok(sqlx::query_as::<_, QueuedJob>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn jobs_for_campaign(&self, campaign_id: &str) -> Result<Vec<QueuedJob>> {
        Ok(
            sqlx::query_as::<_, QueuedJob>("SELECT * FROM jobs WHERE campaign_id = ? ORDER BY id")
                .bind(campaign_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Jobs of a tenant that may still consume a credit.
    pub async fn outstanding_jobs(&self, tenant_id: &str) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        count_outstanding(&mut conn, tenant_id).await
    }
}

pub(crate) async fn count_outstanding(conn: &mut SqliteConnection, tenant_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM jobs WHERE tenant_id = ? AND status IN ('pending', 'processing')",
    )
    .bind(tenant_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}
