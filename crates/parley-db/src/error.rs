use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Invalid stored value: {0}")]
    InvalidValue(#[from] parley_core::UnknownStatus),

    #[error("Could not resolve data directory")]
    NoDataDir,
}

pub type Result<T> = std::result::Result<T, DbError>;
