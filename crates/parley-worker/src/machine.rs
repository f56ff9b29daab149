//! Pure transition logic for a tenant's connection.
//!
//! The lifecycle manager feeds every [`SessionEvent`] of a live connection
//! through [`transition`] and then carries out the returned effects in order.
//! Nothing here touches the network, the registry or the database.

use std::time::Duration;

use parley_core::{CredentialUpdate, SessionEvent, SessionStatus};

use crate::config::SessionConfig;

/// State of a registered handle. A handle that is gone has no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Initializing,
    QrPending,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Render and cache the QR payload on the handle.
    CacheQr(String),
    /// Mark the handle ready and clear its QR code.
    MarkReady { phone_number: Option<String> },
    PersistStatus(SessionStatus),
    SaveCredentials(CredentialUpdate),
    RemoveHandle,
    WipeCredentials,
    ScheduleReconnect { delay: Duration, attempt: u32 },
    ResetReconnects,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// `None` once the handle is removed.
    pub next: Option<HandleState>,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            base: Duration::from_millis(config.reconnect_base_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
            max_attempts: config.reconnect_max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor).min(self.max))
    }
}

/// `reconnect_attempts` is the number of consecutive automatic reconnects
/// already made for this tenant.
pub fn transition(
    state: HandleState,
    event: &SessionEvent,
    reconnect_attempts: u32,
    policy: &ReconnectPolicy,
) -> Transition {
    match event {
        SessionEvent::QrIssued { qr } => Transition {
            next: Some(HandleState::QrPending),
            effects: vec![
                Effect::CacheQr(qr.clone()),
                Effect::PersistStatus(SessionStatus::QrPending),
            ],
        },
        SessionEvent::Opened { phone_number } => Transition {
            next: Some(HandleState::Ready),
            effects: vec![
                Effect::MarkReady {
                    phone_number: phone_number.clone(),
                },
                Effect::PersistStatus(SessionStatus::Connected),
                Effect::ResetReconnects,
            ],
        },
        SessionEvent::CredentialsUpdated { files } => Transition {
            next: Some(state),
            effects: vec![Effect::SaveCredentials(files.clone())],
        },
        SessionEvent::Closed { reason } if reason.is_logged_out() => Transition {
            next: None,
            effects: vec![
                Effect::RemoveHandle,
                Effect::WipeCredentials,
                Effect::PersistStatus(SessionStatus::Disconnected),
                Effect::ResetReconnects,
            ],
        },
        SessionEvent::Closed { .. } => {
            let attempt = reconnect_attempts + 1;
            let effects = match policy.delay_for(attempt) {
                Some(delay) => vec![
                    Effect::RemoveHandle,
                    Effect::PersistStatus(SessionStatus::Disconnected),
                    Effect::ScheduleReconnect { delay, attempt },
                ],
                None => vec![
                    Effect::RemoveHandle,
                    Effect::PersistStatus(SessionStatus::Error),
                    Effect::ResetReconnects,
                ],
            };
            Transition {
                next: None,
                effects,
            }
        }
    }
}
