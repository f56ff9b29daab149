//! Entry points for the API layer: tenant bookkeeping, sessions, send and
//! campaign requests, credits and history.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use parley_core::{AccountStatus, CampaignStatus, DispatchJob, SessionStatus, to_user_jid};
use parley_db::{Campaign, CreditGrant, MessageRecord, NewCampaign, ParleyDb, Tenant, now_millis};

use crate::config::DeliveryConfig;
use crate::error::{Result, WorkerError};
use crate::lifecycle::{ConnectOutcome, SessionManager};
use crate::queue::DispatchQueue;

pub const CAMPAIGN_HISTORY_LIMIT: i64 = 50;
pub const MESSAGE_HISTORY_LIMIT: i64 = 100;
/// Balance a tenant must exceed to get API access.
pub const API_KEY_MIN_CREDITS: i64 = 100;

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub tenant_id: String,
    pub recipient: String,
    pub text: String,
    pub media_url: Option<String>,
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CampaignRequest {
    pub tenant_id: String,
    pub name: String,
    pub recipients: Vec<String>,
    pub text: String,
    pub media_url: Option<String>,
    pub file_path: Option<PathBuf>,
    /// Unix milliseconds.
    pub scheduled_at: Option<i64>,
    /// Takes precedence over `scheduled_at`.
    pub delay_ms: Option<i64>,
}

pub struct ParleyService {
    db: Arc<ParleyDb>,
    sessions: SessionManager,
    queue: DispatchQueue,
}

impl ParleyService {
    pub fn new(db: Arc<ParleyDb>, sessions: SessionManager, delivery: DeliveryConfig) -> Self {
        Self {
            queue: DispatchQueue::new(Arc::clone(&db), delivery),
            db,
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn create_tenant(&self, tenant_id: &str, name: &str) -> Result<Tenant> {
        if tenant_id.trim().is_empty() {
            return Err(WorkerError::Validation("tenant id is required".into()));
        }
        Ok(self.db.create_tenant(tenant_id, name).await?)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        Ok(self.db.get_tenant(tenant_id).await?)
    }

    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.db.list_tenants().await?)
    }

    pub async fn set_account_status(&self, tenant_id: &str, status: AccountStatus) -> Result<()> {
        Ok(self.db.set_account_status(tenant_id, status).await?)
    }

    pub async fn connect(&self, tenant_id: &str) -> Result<ConnectOutcome> {
        Ok(self.sessions.connect_session(tenant_id).await?)
    }

    pub async fn status(&self, tenant_id: &str) -> Result<SessionStatus> {
        Ok(self.sessions.get_status(tenant_id).await?)
    }

    pub async fn disconnect(&self, tenant_id: &str) -> Result<()> {
        Ok(self.sessions.disconnect_session(tenant_id).await?)
    }

    /// Queue one message. Returns the job id.
    pub async fn enqueue_send(&self, request: SendRequest) -> Result<i64> {
        self.active_tenant(&request.tenant_id).await?;

        let recipient = request.recipient.trim();
        if to_user_jid(recipient).is_none() {
            return Err(WorkerError::Validation(format!(
                "invalid recipient: {:?}",
                request.recipient
            )));
        }
        require_content(&request.text, &request.media_url, &request.file_path)?;
        self.require_connected(&request.tenant_id).await?;

        let job = DispatchJob {
            tenant_id: request.tenant_id.clone(),
            campaign_id: None,
            recipient: recipient.to_string(),
            text: request.text,
            media_url: request.media_url,
            file_path: request.file_path,
        };

        let enqueued = self
            .queue
            .enqueue_paid(&request.tenant_id, None, std::slice::from_ref(&job), 0)
            .await?;
        let job_id = enqueued.job_ids.first().copied().unwrap_or_default();

        info!(tenant_id = %request.tenant_id, job_id, "Message queued");
        Ok(job_id)
    }

    /// Create a campaign and queue one job per distinct recipient.
    pub async fn enqueue_campaign(&self, request: CampaignRequest) -> Result<Campaign> {
        self.active_tenant(&request.tenant_id).await?;

        if request.name.trim().is_empty() {
            return Err(WorkerError::Validation("campaign name is required".into()));
        }
        require_content(&request.text, &request.media_url, &request.file_path)?;
        let recipients = distinct_recipients(&request.recipients)?;

        let delay_ms = match (request.delay_ms, request.scheduled_at) {
            (Some(delay), _) => delay.max(0),
            (None, Some(at)) => (at - now_millis()).max(0),
            (None, None) => 0,
        };
        let status = if delay_ms > 0 {
            CampaignStatus::Scheduled
        } else {
            self.require_connected(&request.tenant_id).await?;
            CampaignStatus::Processing
        };

        let campaign_id = uuid::Uuid::new_v4().to_string();
        let media_ref = request
            .file_path
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| request.media_url.clone());

        let campaign = NewCampaign {
            id: campaign_id.clone(),
            tenant_id: request.tenant_id.clone(),
            name: request.name.trim().to_string(),
            message: request.text.clone(),
            media_ref,
            status,
            scheduled_at: (delay_ms > 0).then(|| now_millis() + delay_ms),
        };

        let jobs: Vec<DispatchJob> = recipients
            .into_iter()
            .map(|recipient| DispatchJob {
                tenant_id: request.tenant_id.clone(),
                campaign_id: Some(campaign_id.clone()),
                recipient,
                text: request.text.clone(),
                media_url: request.media_url.clone(),
                file_path: request.file_path.clone(),
            })
            .collect();

        let enqueued = self
            .queue
            .enqueue_paid(&request.tenant_id, Some(&campaign), &jobs, delay_ms)
            .await?;

        info!(
            tenant_id = %request.tenant_id,
            campaign_id,
            recipients = jobs.len(),
            delay_ms,
            "Campaign queued"
        );

        match enqueued.campaign {
            Some(campaign) => Ok(campaign),
            None => Ok(self.db.get_campaign(&campaign_id).await?),
        }
    }

    /// Returns `false` when the payment was already applied.
    pub async fn grant_credits(&self, grant: &CreditGrant) -> Result<bool> {
        if grant.credits <= 0 {
            return Err(WorkerError::Validation("credits must be positive".into()));
        }
        Ok(self.db.grant_credits(grant).await?)
    }

    pub async fn campaign_history(&self, tenant_id: &str) -> Result<Vec<Campaign>> {
        Ok(self
            .db
            .campaign_history(tenant_id, CAMPAIGN_HISTORY_LIMIT)
            .await?)
    }

    /// Single sends only; campaign messages are reached through their campaign.
    pub async fn message_history(&self, tenant_id: &str) -> Result<Vec<MessageRecord>> {
        Ok(self
            .db
            .single_message_history(tenant_id, MESSAGE_HISTORY_LIMIT)
            .await?)
    }

    pub async fn campaign_messages(&self, campaign_id: &str) -> Result<Vec<MessageRecord>> {
        Ok(self.db.campaign_messages(campaign_id).await?)
    }

    /// Issue an API key, or return the existing one.
    pub async fn issue_api_key(&self, tenant_id: &str) -> Result<String> {
        let tenant = self.db.get_tenant(tenant_id).await?;
        if let Some(key) = tenant.api_key {
            return Ok(key);
        }
        if tenant.credits <= API_KEY_MIN_CREDITS {
            return Err(WorkerError::ApiKeyNotEligible {
                credits: tenant.credits,
                min: API_KEY_MIN_CREDITS,
            });
        }

        let candidate = format!("pk_{}", uuid::Uuid::new_v4().simple());
        Ok(self.db.set_api_key_if_absent(tenant_id, &candidate).await?)
    }

    pub async fn tenant_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        Ok(self.db.tenant_by_api_key(api_key).await?)
    }

    async fn active_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        let tenant = self.db.get_tenant(tenant_id).await?;
        if tenant.account_status()? != AccountStatus::Active {
            return Err(WorkerError::TenantInactive(tenant_id.to_string()));
        }
        Ok(tenant)
    }

    async fn require_connected(&self, tenant_id: &str) -> Result<()> {
        if self.sessions.get_status(tenant_id).await? != SessionStatus::Connected {
            return Err(WorkerError::SessionNotConnected(tenant_id.to_string()));
        }
        Ok(())
    }
}

fn require_content(
    text: &str,
    media_url: &Option<String>,
    file_path: &Option<PathBuf>,
) -> Result<()> {
    if text.trim().is_empty() && media_url.is_none() && file_path.is_none() {
        return Err(WorkerError::Validation("message text or media is required".into()));
    }
    Ok(())
}

/// Trimmed recipients in request order, one per distinct address.
fn distinct_recipients(recipients: &[String]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut distinct = Vec::new();

    for raw in recipients {
        let recipient = raw.trim();
        if recipient.is_empty() {
            continue;
        }
        let jid = to_user_jid(recipient)
            .ok_or_else(|| WorkerError::Validation(format!("invalid recipient: {raw:?}")))?;
        if seen.insert(jid) {
            distinct.push(recipient.to_string());
        }
    }

    if distinct.is_empty() {
        return Err(WorkerError::Validation("at least one recipient is required".into()));
    }
    Ok(distinct)
}
