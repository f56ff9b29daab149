use serde::{Deserialize, Serialize};

use parley_core::{
    AccountStatus, CampaignStatus, DispatchJob, JobStatus, MessageStatus, SessionStatus,
    UnknownStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub plan_id: Option<String>,
    pub plan_expiry: Option<i64>,
    pub session_status: String,
    pub account_status: String,
    pub api_key: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Tenant {
    pub fn session_status(&self) -> Result<SessionStatus, UnknownStatus> {
        self.session_status.parse()
    }

    pub fn account_status(&self) -> Result<AccountStatus, UnknownStatus> {
        self.account_status.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub message: String,
    pub media_ref: Option<String>,
    pub status: String,
    pub total_messages: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    pub scheduled_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Campaign {
    pub fn status(&self) -> Result<CampaignStatus, UnknownStatus> {
        self.status.parse()
    }
}

/// Input for a new campaign row.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub message: String,
    pub media_ref: Option<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRecord {
    pub id: i64,
    pub tenant_id: String,
    pub campaign_id: Option<String>,
    pub job_id: Option<i64>,
    pub recipient: String,
    pub content: String,
    pub status: String,
    pub error_message: Option<String>,
    pub sent_at: Option<i64>,
    pub created_at: i64,
}

impl MessageRecord {
    pub fn status(&self) -> Result<MessageStatus, UnknownStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueuedJob {
    pub id: i64,
    pub tenant_id: String,
    pub campaign_id: Option<String>,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_at: i64,
    pub locked_until: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl QueuedJob {
    pub fn job(&self) -> serde_json::Result<DispatchJob> {
        serde_json::from_str(&self.payload)
    }

    pub fn status(&self) -> Result<JobStatus, UnknownStatus> {
        self.status.parse()
    }
}

/// Result of accepting a send or campaign request.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub campaign: Option<Campaign>,
    pub job_ids: Vec<i64>,
}
