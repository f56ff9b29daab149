use std::time::Duration;

use serde::Deserialize;

/// Connection lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How many times `connect` looks for a QR code or an open connection.
    pub qr_poll_attempts: u32,
    pub qr_poll_interval_ms: u64,
    /// First automatic reconnect delay; doubles per consecutive attempt.
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: u32,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qr_poll_attempts: 30,
            qr_poll_interval_ms: 2000,
            reconnect_base_ms: 3000,
            reconnect_max_ms: 60_000,
            reconnect_max_attempts: 5,
            event_buffer: 64,
        }
    }
}

impl SessionConfig {
    pub fn qr_poll_interval(&self) -> Duration {
        Duration::from_millis(self.qr_poll_interval_ms)
    }
}

/// Delivery worker and retry tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Bounds of the random pause after every processed job.
    pub pacing_min_ms: u64,
    pub pacing_max_ms: u64,
    /// Wait between queue polls while nothing is due.
    pub idle_poll_ms: u64,
    pub lease_ms: i64,
    pub max_attempts: i64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            pacing_min_ms: 4000,
            pacing_max_ms: 10_000,
            idle_poll_ms: 1000,
            lease_ms: 5 * 60 * 1000,
            max_attempts: 3,
            retry_base_ms: 5000,
            retry_max_ms: 5 * 60 * 1000,
        }
    }
}

impl DeliveryConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}
