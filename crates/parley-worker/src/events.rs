/// Notifications for whoever drives the worker (CLI, API layer).
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    QrCode { tenant_id: String, qr: String },
    Connected { tenant_id: String, phone_number: Option<String> },
    Disconnected { tenant_id: String, reason: String },
    LoggedOut { tenant_id: String },
    ReconnectScheduled { tenant_id: String, attempt: u32, delay_ms: u64 },
    SessionFailed { tenant_id: String, error: String },
    MessageSent { tenant_id: String, job_id: i64, recipient: String },
    MessageFailed { tenant_id: String, job_id: i64, error: String, will_retry: bool },
}
