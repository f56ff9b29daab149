use sqlx::SqliteConnection;

use parley_core::{DispatchJob, MessageStatus};

use crate::error::Result;
use crate::models::MessageRecord;
use crate::repository::ParleyDb;

/// Fields of a message record written at send-attempt time.
pub(crate) struct MessageRow<'a> {
    pub job_id: i64,
    pub job: &'a DispatchJob,
    pub status: MessageStatus,
    pub error_message: Option<&'a str>,
    pub sent_at: Option<i64>,
}

pub(crate) async fn insert_message(
    conn: &mut SqliteConnection,
    row: MessageRow<'_>,
    now: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"INSERT INTO messages (tenant_id, campaign_id, job_id, recipient, content, status, error_message, sent_at, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&row.job.tenant_id)
    .bind(row.job.campaign_id.as_deref())
    .bind(row.job_id)
    .bind(&row.job.recipient)
    .bind(&row.job.text)
    .bind(row.status.as_str())
    .bind(row.error_message)
    .bind(row.sent_at)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

impl ParleyDb {
    pub async fn get_message(&self, id: i64) -> Result<Option<MessageRecord>> {
        Ok(sqlx::query_as::<_, MessageRecord>("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Single sends (no campaign), most recent first.
    pub async fn single_message_history(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        Ok(sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE tenant_id = ? AND campaign_id IS NULL
             ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn campaign_messages(&self, campaign_id: &str) -> Result<Vec<MessageRecord>> {
        Ok(sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE campaign_id = ? ORDER BY id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn messages_for_job(&self, job_id: i64) -> Result<Vec<MessageRecord>> {
        Ok(
            sqlx::query_as::<_, MessageRecord>("SELECT * FROM messages WHERE job_id = ? ORDER BY id")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?,
        )
    }
}
