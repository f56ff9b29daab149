use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::{CredentialSet, CredentialUpdate};
use crate::job::OutboundContent;

/// Status code the network uses for an explicit logout.
pub const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub status_code: Option<u16>,
    pub message: String,
}

impl DisconnectReason {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn logged_out() -> Self {
        Self::new(Some(LOGGED_OUT_STATUS), "logged out")
    }

    pub fn is_logged_out(&self) -> bool {
        self.status_code == Some(LOGGED_OUT_STATUS)
    }
}

/// Typed events a live connection reports for its tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    QrIssued { qr: String },
    Opened { phone_number: Option<String> },
    Closed { reason: DisconnectReason },
    CredentialsUpdated { files: CredentialUpdate },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Rejected(String),

    #[error("transport timed out")]
    Timeout,
}

/// Opens persistent connections to the messaging network.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection for `tenant_id` using the stored credentials (empty
    /// for a fresh pairing). Lifecycle events are delivered on `events` until
    /// the connection closes.
    async fn open(
        &self,
        tenant_id: &str,
        credentials: CredentialSet,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, jid: &str, content: &OutboundContent) -> Result<(), TransportError>;

    /// Unlink the device. The network answers with a logged-out close.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Drop the connection, keeping credentials valid.
    async fn close(&self);
}
