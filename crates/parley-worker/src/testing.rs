//! In-process connector double and fixtures for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use parley_core::{
    Connection, Connector, CredentialSet, DisconnectReason, OutboundContent, SessionEvent,
    SessionStatus, TransportError,
};
use parley_db::{CreditGrant, ParleyDb};

use crate::config::{DeliveryConfig, SessionConfig};
use crate::credentials::CredentialStore;
use crate::delivery::DeliveryWorker;
use crate::lifecycle::SessionManager;
use crate::queue::DispatchQueue;
use crate::service::ParleyService;

#[derive(Default)]
pub(crate) struct FakeState {
    pub opened: Vec<String>,
    pub senders: HashMap<String, mpsc::Sender<SessionEvent>>,
    pub sent: Vec<(String, String, OutboundContent)>,
    pub logouts: Vec<String>,
    pub closed: Vec<String>,
    pub fail_open: bool,
    /// Open without ever emitting an event.
    pub silent: bool,
    pub fail_send: Option<String>,
    pub fail_logout: bool,
}

/// Pairs with a QR code unless `creds.json` is among the credentials, in
/// which case the connection opens straight away.
#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    pub(crate) fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn open_count(&self, tenant_id: &str) -> usize {
        self.state().opened.iter().filter(|t| *t == tenant_id).count()
    }

    pub(crate) fn sent(&self) -> Vec<(String, String, OutboundContent)> {
        self.state().sent.clone()
    }

    /// Deliver `event` on the tenant's latest connection.
    pub(crate) async fn emit(&self, tenant_id: &str, event: SessionEvent) {
        let sender = self.state().senders.get(tenant_id).cloned().unwrap();
        sender.send(event).await.unwrap();
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        tenant_id: &str,
        credentials: CredentialSet,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        tokio::task::yield_now().await;

        let (fail, silent, count) = {
            let mut state = self.state();
            state.opened.push(tenant_id.to_string());
            (state.fail_open, state.silent, state.opened.len())
        };
        if fail {
            return Err(TransportError::Unavailable("network down".into()));
        }
        self.state()
            .senders
            .insert(tenant_id.to_string(), events.clone());

        let first = if credentials.contains_key("creds.json") {
            SessionEvent::Opened {
                phone_number: Some("15550000".into()),
            }
        } else {
            SessionEvent::QrIssued {
                qr: format!("qr-{tenant_id}-{count}"),
            }
        };
        if !silent {
            events.send(first).await.unwrap();
        }

        Ok(Arc::new(FakeConnection {
            tenant_id: tenant_id.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

pub(crate) struct FakeConnection {
    tenant_id: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnection {
    pub(crate) fn detached(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: Arc::default(),
        }
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send(&self, jid: &str, content: &OutboundContent) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.fail_send {
            return Err(TransportError::Rejected(reason.clone()));
        }
        state
            .sent
            .push((self.tenant_id.clone(), jid.to_string(), content.clone()));
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        let sender = {
            let mut state = self.state.lock().unwrap();
            state.logouts.push(self.tenant_id.clone());
            if state.fail_logout {
                return Err(TransportError::Unavailable("socket closed".into()));
            }
            state.senders.get(&self.tenant_id).cloned()
        };
        if let Some(sender) = sender {
            let _ = sender
                .send(SessionEvent::Closed {
                    reason: DisconnectReason::logged_out(),
                })
                .await;
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed.push(self.tenant_id.clone());
    }
}

pub(crate) fn fast_session_config() -> SessionConfig {
    SessionConfig {
        qr_poll_attempts: 100,
        qr_poll_interval_ms: 10,
        reconnect_base_ms: 10,
        reconnect_max_ms: 40,
        reconnect_max_attempts: 2,
        event_buffer: 16,
    }
}

pub(crate) fn unpaced_delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        pacing_min_ms: 0,
        pacing_max_ms: 0,
        idle_poll_ms: 10,
        ..DeliveryConfig::default()
    }
}

pub(crate) struct Fixture {
    pub db: Arc<ParleyDb>,
    pub connector: FakeConnector,
    pub sessions: SessionManager,
    pub service: ParleyService,
    pub worker: DeliveryWorker,
    _dir: TempDir,
}

impl Fixture {
    /// Tenant `t1` with the given balance and no session.
    pub(crate) async fn new(credits: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ParleyDb::in_memory().await.unwrap());
        let connector = FakeConnector::default();
        let sessions = SessionManager::new(
            Arc::clone(&db),
            Arc::new(connector.clone()),
            CredentialStore::new(dir.path().join("auth")),
            fast_session_config(),
        );
        let service = ParleyService::new(
            Arc::clone(&db),
            sessions.clone(),
            unpaced_delivery_config(),
        );
        let worker = DeliveryWorker::new(
            DispatchQueue::new(Arc::clone(&db), unpaced_delivery_config()),
            sessions.registry(),
            unpaced_delivery_config(),
        );

        db.create_tenant("t1", "Acme").await.unwrap();
        if credits > 0 {
            db.grant_credits(&CreditGrant {
                tenant_id: "t1".into(),
                payment_id: "seed".into(),
                plan_id: "starter".into(),
                credits,
                validity_days: 30,
            })
            .await
            .unwrap();
        }

        Self {
            db,
            connector,
            sessions,
            service,
            worker,
            _dir: dir,
        }
    }

    pub(crate) async fn store_credentials(&self, tenant_id: &str) {
        let mut files = parley_core::CredentialUpdate::new();
        files.insert("creds.json".into(), Some("{\"registered\":true}".into()));
        self.sessions
            .credentials()
            .save(tenant_id, &files)
            .await
            .unwrap();
    }

    /// Pair `tenant_id` through the QR flow and wait until it is connected.
    pub(crate) async fn connect(&self, tenant_id: &str) {
        self.service.connect(tenant_id).await.unwrap();
        self.connector
            .emit(
                tenant_id,
                SessionEvent::Opened {
                    phone_number: None,
                },
            )
            .await;
        wait_for_status(&self.sessions, tenant_id, SessionStatus::Connected).await;
    }
}

pub(crate) async fn wait_for_status(
    sessions: &SessionManager,
    tenant_id: &str,
    expected: SessionStatus,
) {
    for _ in 0..300 {
        if sessions.get_status(tenant_id).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{tenant_id} never reached {expected}");
}

pub(crate) async fn wait_for_stored_status(db: &ParleyDb, tenant_id: &str, expected: SessionStatus) {
    for _ in 0..300 {
        let tenant = db.get_tenant(tenant_id).await.unwrap();
        if tenant.session_status().unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{tenant_id} never stored {expected}");
}

pub(crate) async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held");
}
