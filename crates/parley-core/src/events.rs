use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::job::OutboundContent;

/// Credential files of one tenant, keyed by file name.
pub type CredentialSet = BTreeMap<String, String>;

/// Changed credential files. `None` means the file was removed.
pub type CredentialUpdate = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BridgeCommand {
    StartSession { tenant_id: String, auth_state: CredentialSet },
    StopSession { tenant_id: String },
    Logout { tenant_id: String },
    SendMessage { tenant_id: String, to: String, content: OutboundContent },
    Shutdown,
}

impl BridgeCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeCommand::StartSession { .. } => "StartSession",
            BridgeCommand::StopSession { .. } => "StopSession",
            BridgeCommand::Logout { .. } => "Logout",
            BridgeCommand::SendMessage { .. } => "SendMessage",
            BridgeCommand::Shutdown => "Shutdown",
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            BridgeCommand::StartSession { tenant_id, .. }
            | BridgeCommand::StopSession { tenant_id }
            | BridgeCommand::Logout { tenant_id }
            | BridgeCommand::SendMessage { tenant_id, .. } => Some(tenant_id),
            BridgeCommand::Shutdown => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BridgeEvent {
    Ready { tenant_id: Option<String> },
    QrCode { tenant_id: String, qr: String },
    Connected { tenant_id: String, phone_number: Option<String> },
    Disconnected { tenant_id: String, status_code: Option<u16>, reason: String },

    AuthStateUpdated { tenant_id: String, files: CredentialUpdate },

    Error { tenant_id: Option<String>, error: String },

    CommandResult { command_id: String, success: bool, error: Option<String> },
}

impl BridgeEvent {
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            BridgeEvent::Ready { tenant_id } | BridgeEvent::Error { tenant_id, .. } => {
                tenant_id.as_deref()
            }
            BridgeEvent::QrCode { tenant_id, .. }
            | BridgeEvent::Connected { tenant_id, .. }
            | BridgeEvent::Disconnected { tenant_id, .. }
            | BridgeEvent::AuthStateUpdated { tenant_id, .. } => Some(tenant_id),
            BridgeEvent::CommandResult { .. } => None,
        }
    }
}
