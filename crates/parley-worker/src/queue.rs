//! Dispatch queue on top of the job table: enqueueing with credit checks,
//! leasing, and the retry policy for failed attempts.

use std::sync::Arc;
use std::time::Duration;

use parley_core::DispatchJob;
use parley_db::{
    EnqueueOptions, Enqueued, FailureDisposition, NewCampaign, ParleyDb, QueuedJob, now_millis,
};

use crate::config::DeliveryConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.retry_base_ms),
            max: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: i64) -> Duration {
        let exponent = (attempt.max(1) - 1).min(31) as u32;
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// What happens to `job` after its current attempt failed.
    pub fn disposition(&self, job: &QueuedJob, permanent: bool, now: i64) -> FailureDisposition {
        let attempt = job.attempts + 1;
        if permanent || attempt >= job.max_attempts.min(self.max_attempts) {
            return FailureDisposition::Exhausted;
        }
        FailureDisposition::Retry {
            run_at: now + self.backoff(attempt).as_millis() as i64,
        }
    }
}

pub struct DispatchQueue {
    db: Arc<ParleyDb>,
    config: DeliveryConfig,
    retry: RetryPolicy,
}

impl DispatchQueue {
    pub fn new(db: Arc<ParleyDb>, config: DeliveryConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            db,
            config,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn options(&self, delay_ms: i64) -> EnqueueOptions {
        EnqueueOptions {
            delay_ms,
            max_attempts: self.retry.max_attempts,
        }
    }

    /// Enqueue without any precondition check.
    pub async fn enqueue(&self, job: &DispatchJob, delay_ms: i64) -> Result<i64> {
        Ok(self.db.enqueue_job(job, &self.options(delay_ms)).await?)
    }

    /// Enqueue a request's jobs (and its campaign) if the tenant can pay for them.
    pub async fn enqueue_paid(
        &self,
        tenant_id: &str,
        campaign: Option<&NewCampaign>,
        jobs: &[DispatchJob],
        delay_ms: i64,
    ) -> Result<Enqueued> {
        Ok(self
            .db
            .enqueue_with_credit_check(tenant_id, campaign, jobs, &self.options(delay_ms))
            .await?)
    }

    pub async fn claim(&self) -> Result<Option<QueuedJob>> {
        Ok(self.db.claim_next_job(self.config.lease_ms).await?)
    }

    /// Hand expired leases back to the queue.
    pub async fn recover(&self) -> Result<u64> {
        Ok(self.db.requeue_expired_jobs().await?)
    }

    pub async fn complete(&self, job: &QueuedJob, payload: &DispatchJob) -> Result<()> {
        self.db.record_delivery_sent(job, payload).await?;
        Ok(())
    }

    pub async fn fail(
        &self,
        job: &QueuedJob,
        payload: &DispatchJob,
        error: &str,
        permanent: bool,
    ) -> Result<FailureDisposition> {
        let disposition = self.retry.disposition(job, permanent, now_millis());
        self.db
            .record_delivery_failed(job, payload, error, disposition)
            .await?;
        Ok(disposition)
    }

    pub async fn discard(&self, job: &QueuedJob, error: &str) -> Result<()> {
        self.db.record_job_discarded(job, error).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(attempts: i64, max_attempts: i64) -> QueuedJob {
        QueuedJob {
            id: 1,
            tenant_id: "t1".into(),
            campaign_id: None,
            payload: "{}".into(),
            status: "processing".into(),
            attempts,
            max_attempts,
            run_at: 0,
            locked_until: None,
            last_error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::from_config(&DeliveryConfig::default());
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(7), Duration::from_secs(300));
        assert_eq!(policy.backoff(100), Duration::from_secs(300));
    }

    #[test]
    fn third_failure_is_final() {
        let policy = RetryPolicy::from_config(&DeliveryConfig::default());
        assert_eq!(
            policy.disposition(&queued(0, 3), false, 1000),
            FailureDisposition::Retry { run_at: 6000 }
        );
        assert_eq!(
            policy.disposition(&queued(1, 3), false, 1000),
            FailureDisposition::Retry { run_at: 11_000 }
        );
        assert_eq!(
            policy.disposition(&queued(2, 3), false, 1000),
            FailureDisposition::Exhausted
        );
    }

    #[test]
    fn permanent_failures_skip_retries() {
        let policy = RetryPolicy::from_config(&DeliveryConfig::default());
        assert_eq!(
            policy.disposition(&queued(0, 3), true, 0),
            FailureDisposition::Exhausted
        );
    }
}
