use parley_core::DispatchJob;

use crate::error::{DbError, Result};
use crate::models::{Campaign, Enqueued, NewCampaign};
use crate::queue::{EnqueueOptions, count_outstanding, insert_job};
use crate::repository::{ParleyDb, now_millis};

impl ParleyDb {
    /// Accept a send request: check the tenant's credits, create the campaign
    /// (if any) and fan out one job per entry of `jobs`, all in one
    /// transaction. Nothing is written when the check fails.
    ///
    /// Credits already claimed by outstanding jobs count as spent.
    pub async fn enqueue_with_credit_check(
        &self,
        tenant_id: &str,
        campaign: Option<&NewCampaign>,
        jobs: &[DispatchJob],
        options: &EnqueueOptions,
    ) -> Result<Enqueued> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64,)> = sqlx::query_as("SELECT credits FROM tenants WHERE id = ?")
            .bind(tenant_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some((credits,)) = row else {
            return Err(DbError::TenantNotFound(tenant_id.to_string()));
        };

        let outstanding = count_outstanding(&mut tx, tenant_id).await?;
        let available = credits - outstanding;
        let required = jobs.len().max(1) as i64;
        if available < required {
            return Err(DbError::InsufficientCredits {
                required,
                available,
            });
        }

        if let Some(campaign) = campaign {
            sqlx::query(
                r#"INSERT INTO campaigns (id, tenant_id, name, message, media_ref, status, total_messages, sent_count, failed_count, scheduled_at, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)"#,
            )
            .bind(&campaign.id)
            .bind(&campaign.tenant_id)
            .bind(&campaign.name)
            .bind(&campaign.message)
            .bind(campaign.media_ref.as_deref())
            .bind(campaign.status.as_str())
            .bind(jobs.len() as i64)
            .bind(campaign.scheduled_at)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let mut job_ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            job_ids.push(insert_job(&mut tx, job, options, now).await?);
        }

        let campaign = match campaign {
            Some(campaign) => Some(
                sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?")
                    .bind(&campaign.id)
                    .fetch_one(&mut *tx)
                    .await?,
            ),
            None => None,
        };

        tx.commit().await?;

        Ok(Enqueued { campaign, job_ids })
    }

    pub async fn get_campaign(&self, id: &str) -> Result<Campaign> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::CampaignNotFound(id.to_string()))
    }

    /// Most recent campaigns first.
    pub async fn campaign_history(&self, tenant_id: &str, limit: i64) -> Result<Vec<Campaign>> {
        Ok(sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE tenant_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::db_with_tenant;
    use parley_core::CampaignStatus;

    fn new_campaign(id: &str, status: CampaignStatus) -> NewCampaign {
        NewCampaign {
            id: id.into(),
            tenant_id: "t1".into(),
            name: "launch".into(),
            message: "hi".into(),
            media_ref: None,
            status,
            scheduled_at: None,
        }
    }

    fn jobs(campaign_id: Option<&str>, recipients: &[&str]) -> Vec<DispatchJob> {
        recipients
            .iter()
            .map(|r| DispatchJob {
                tenant_id: "t1".into(),
                campaign_id: campaign_id.map(str::to_string),
                recipient: r.to_string(),
                text: "hi".into(),
                media_url: None,
                file_path: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn campaign_and_jobs_are_created_together() {
        let db = db_with_tenant(5).await;
        let campaign = new_campaign("c1", CampaignStatus::Processing);

        let enqueued = db
            .enqueue_with_credit_check(
                "t1",
                Some(&campaign),
                &jobs(Some("c1"), &["1", "2", "3"]),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();

        let stored = enqueued.campaign.unwrap();
        assert_eq!(stored.total_messages, 3);
        assert_eq!(stored.status().unwrap(), CampaignStatus::Processing);
        assert_eq!(enqueued.job_ids.len(), 3);
        assert_eq!(db.jobs_for_campaign("c1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn insufficient_credits_write_nothing() {
        let db = db_with_tenant(2).await;
        let campaign = new_campaign("c1", CampaignStatus::Processing);

        let err = db
            .enqueue_with_credit_check(
                "t1",
                Some(&campaign),
                &jobs(Some("c1"), &["1", "2", "3"]),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DbError::InsufficientCredits { required: 3, available: 2 }
        ));
        assert!(matches!(
            db.get_campaign("c1").await,
            Err(DbError::CampaignNotFound(_))
        ));
        assert_eq!(db.outstanding_jobs("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outstanding_jobs_reserve_credits() {
        let db = db_with_tenant(3).await;
        db.enqueue_with_credit_check("t1", None, &jobs(None, &["1", "2"]), &EnqueueOptions::default())
            .await
            .unwrap();

        let err = db
            .enqueue_with_credit_check("t1", None, &jobs(None, &["3", "4"]), &EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InsufficientCredits { required: 2, available: 1 }
        ));
    }

    #[tokio::test]
    async fn zero_credits_reject_a_single_send() {
        let db = db_with_tenant(0).await;
        let err = db
            .enqueue_with_credit_check("t1", None, &jobs(None, &["1"]), &EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InsufficientCredits { required: 1, available: 0 }));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_limited() {
        let db = db_with_tenant(100).await;
        for id in ["c1", "c2", "c3"] {
            db.enqueue_with_credit_check(
                "t1",
                Some(&new_campaign(id, CampaignStatus::Processing)),
                &jobs(Some(id), &["1"]),
                &EnqueueOptions::default(),
            )
            .await
            .unwrap();
        }

        let history = db.campaign_history("t1", 2).await.unwrap();
        let ids: Vec<_> = history.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c3", "c2"]);
    }
}
