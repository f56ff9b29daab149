use thiserror::Error;

use parley_core::TransportError;
use parley_db::DbError;

/// Failures of the connection lifecycle, reported to whoever asked for a connection.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session already active for tenant {0}")]
    AlreadyActive(String),

    #[error("Timed out waiting for a QR code")]
    QrTimeout,

    #[error("Failed to open connection: {0}")]
    Init(#[from] TransportError),

    #[error("Credential storage error: {0}")]
    Credentials(#[from] std::io::Error),

    #[error("Failed to render QR code: {0}")]
    QrRender(String),

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

/// Why a single delivery attempt failed.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("WhatsApp session not ready")]
    SessionNotReady,

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DeliveryError {
    /// Retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, DeliveryError::InvalidRecipient(_))
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Database error: {0}")]
    Db(DbError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Insufficient credits: {required} required, {available} available")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("WhatsApp session is not connected for tenant {0}")]
    SessionNotConnected(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Tenant {0} is not active")]
    TenantInactive(String),

    #[error("API access requires more than {min} credits, tenant has {credits}")]
    ApiKeyNotEligible { credits: i64, min: i64 },
}

impl From<DbError> for WorkerError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::TenantNotFound(id) => WorkerError::TenantNotFound(id),
            DbError::InsufficientCredits {
                required,
                available,
            } => WorkerError::InsufficientCredits {
                required,
                available,
            },
            other => WorkerError::Db(other),
        }
    }
}

impl From<parley_core::UnknownStatus> for WorkerError {
    fn from(err: parley_core::UnknownStatus) -> Self {
        WorkerError::Db(DbError::InvalidValue(err))
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;
