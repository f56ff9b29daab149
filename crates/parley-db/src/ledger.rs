//! Outcome recording for delivery attempts, and credit grants.
//!
//! Every attempt writes exactly one message record. Credits are debited only
//! for a sent message. Campaign counters move once per job, on its terminal
//! outcome, and the campaign settles when every job has one.

use sqlx::SqliteConnection;

use parley_core::{DispatchJob, MessageStatus};

use crate::error::{DbError, Result};
use crate::messages::{MessageRow, insert_message};
use crate::models::QueuedJob;
use crate::repository::{ParleyDb, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Put the job back to `pending`, visible again at `run_at`.
    Retry { run_at: i64 },
    /// Out of attempts; the job is failed for good.
    Exhausted,
}

/// A captured payment that buys a plan.
#[derive(Debug, Clone)]
pub struct CreditGrant {
    pub tenant_id: String,
    pub payment_id: String,
    pub plan_id: String,
    pub credits: i64,
    pub validity_days: i64,
}

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

impl ParleyDb {
    /// Returns the id of the written message record.
    pub async fn record_delivery_sent(&self, job: &QueuedJob, payload: &DispatchJob) -> Result<i64> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE tenants SET credits = credits - 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(&job.tenant_id)
            .execute(&mut *tx)
            .await?;

        if let Some(campaign_id) = &job.campaign_id {
            sqlx::query(
                "UPDATE campaigns SET sent_count = sent_count + 1, updated_at = ?
                 WHERE id = ? AND sent_count + failed_count < total_messages",
            )
            .bind(now)
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
            settle_campaign(&mut tx, campaign_id, now).await?;
        }

        let message_id = insert_message(
            &mut tx,
            MessageRow {
                job_id: job.id,
                job: payload,
                status: MessageStatus::Sent,
                error_message: None,
                sent_at: Some(now),
            },
            now,
        )
        .await?;

        sqlx::query(
            "UPDATE jobs SET status = 'completed', attempts = attempts + 1, locked_until = NULL,
             last_error = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(message_id)
    }

    /// Returns the id of the written message record.
    pub async fn record_delivery_failed(
        &self,
        job: &QueuedJob,
        payload: &DispatchJob,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<i64> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let message_id = insert_message(
            &mut tx,
            MessageRow {
                job_id: job.id,
                job: payload,
                status: MessageStatus::Failed,
                error_message: Some(error),
                sent_at: None,
            },
            now,
        )
        .await?;

        match disposition {
            FailureDisposition::Retry { run_at } => {
                sqlx::query(
                    "UPDATE jobs SET status = 'pending', attempts = attempts + 1, run_at = ?,
                     locked_until = NULL, last_error = ?, updated_at = ? WHERE id = ?",
                )
                .bind(run_at)
                .bind(error)
                .bind(now)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;
            }
            FailureDisposition::Exhausted => {
                sqlx::query(
                    "UPDATE jobs SET status = 'failed', attempts = attempts + 1,
                     locked_until = NULL, last_error = ?, updated_at = ? WHERE id = ?",
                )
                .bind(error)
                .bind(now)
                .bind(job.id)
                .execute(&mut *tx)
                .await?;

                if let Some(campaign_id) = &job.campaign_id {
                    sqlx::query(
                        "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = ?
                         WHERE id = ? AND sent_count + failed_count < total_messages",
                    )
                    .bind(now)
                    .bind(campaign_id)
                    .execute(&mut *tx)
                    .await?;
                    settle_campaign(&mut tx, campaign_id, now).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(message_id)
    }

    /// Fail a job whose payload cannot be delivered at all (unreadable).
    /// No message record is written since there is nothing to describe.
    pub async fn record_job_discarded(&self, job: &QueuedJob, error: &str) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE jobs SET status = 'failed', attempts = attempts + 1, locked_until = NULL,
             last_error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(job.id)
        .execute(&mut *tx)
        .await?;

        if let Some(campaign_id) = &job.campaign_id {
            sqlx::query(
                "UPDATE campaigns SET failed_count = failed_count + 1, updated_at = ?
                 WHERE id = ? AND sent_count + failed_count < total_messages",
            )
            .bind(now)
            .bind(campaign_id)
            .execute(&mut *tx)
            .await?;
            settle_campaign(&mut tx, campaign_id, now).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Apply a plan purchase. A payment id is applied at most once; returns
    /// `false` for a duplicate.
    pub async fn grant_credits(&self, grant: &CreditGrant) -> Result<bool> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tenants WHERE id = ?")
            .bind(&grant.tenant_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DbError::TenantNotFound(grant.tenant_id.clone()));
        }

        let recorded = sqlx::query(
            r#"INSERT OR IGNORE INTO processed_payments (payment_id, tenant_id, plan_id, credits, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&grant.payment_id)
        .bind(&grant.tenant_id)
        .bind(&grant.plan_id)
        .bind(grant.credits)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if recorded.rows_affected() == 0 {
            tx.commit().await?;
            tracing::info!(payment_id = %grant.payment_id, "Duplicate payment ignored");
            return Ok(false);
        }

        sqlx::query(
            "UPDATE tenants SET credits = credits + ?, plan_id = ?, plan_expiry = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(grant.credits)
        .bind(&grant.plan_id)
        .bind(now + grant.validity_days * DAY_MS)
        .bind(now)
        .bind(&grant.tenant_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(
            tenant_id = %grant.tenant_id,
            payment_id = %grant.payment_id,
            credits = grant.credits,
            "Credits granted"
        );
        Ok(true)
    }
}

/// Close a campaign once every job has a terminal outcome.
async fn settle_campaign(conn: &mut SqliteConnection, campaign_id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE campaigns
         SET status = CASE WHEN sent_count > 0 THEN 'completed' ELSE 'failed' END, updated_at = ?
         WHERE id = ? AND sent_count + failed_count >= total_messages
           AND status IN ('pending', 'scheduled', 'processing')",
    )
    .bind(now)
    .bind(campaign_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
