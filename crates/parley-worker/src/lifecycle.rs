//! Opens, restores, tears down and reconnects per-tenant connections.
//!
//! Each opened connection gets an event task that runs its events through
//! [`transition`] and applies the effects. Failures inside that task are
//! logged and never leave it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_core::{Connection, Connector, SessionEvent, SessionStatus};
use parley_db::ParleyDb;

use crate::config::SessionConfig;
use crate::credentials::CredentialStore;
use crate::error::SessionError;
use crate::events::WorkerEvent;
use crate::machine::{Effect, HandleState, ReconnectPolicy, transition};
use crate::qr::render_qr_data_url;
use crate::registry::{QrChallenge, SessionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Scan this to pair the device.
    QrCode(QrChallenge),
    /// Stored credentials were accepted; no pairing needed.
    Connected,
}

#[derive(Clone)]
pub struct SessionManager {
    db: Arc<ParleyDb>,
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn Connector>,
    credentials: Arc<CredentialStore>,
    config: SessionConfig,
    policy: ReconnectPolicy,
    /// Consecutive automatic reconnects per tenant.
    reconnects: Arc<Mutex<HashMap<String, u32>>>,
    events: Option<mpsc::Sender<WorkerEvent>>,
    closing: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        db: Arc<ParleyDb>,
        connector: Arc<dyn Connector>,
        credentials: CredentialStore,
        config: SessionConfig,
    ) -> Self {
        Self {
            db,
            registry: Arc::new(SessionRegistry::new()),
            connector,
            credentials: Arc::new(credentials),
            policy: ReconnectPolicy::from_config(&config),
            config,
            reconnects: Arc::new(Mutex::new(HashMap::new())),
            events: None,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Shared with the delivery worker, which only reads it.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Open a connection for the tenant unless one exists or is being opened.
    /// Returns whether a new connection was opened. On error nothing is left
    /// registered.
    pub async fn initialize_client(&self, tenant_id: &str) -> Result<bool, SessionError> {
        Ok(self.open_client(tenant_id).await?.is_some())
    }

    /// Generation of the newly attached connection, if one was opened.
    async fn open_client(&self, tenant_id: &str) -> Result<Option<u64>, SessionError> {
        let Some(generation) = self.registry.begin_initializing(tenant_id).await else {
            debug!(tenant_id, "Client already present or initializing");
            return Ok(None);
        };

        info!(tenant_id, "Initializing client");
        let opened = async {
            let credentials = self.credentials.load(tenant_id).await?;
            let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
            let connection = self.connector.open(tenant_id, credentials, tx).await?;
            Ok::<_, SessionError>((connection, rx))
        }
        .await;

        let (connection, rx) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.registry.abort_initializing(tenant_id, generation).await;
                error!(tenant_id, "Client initialization failed: {}", e);
                return Err(e);
            }
        };

        if !self
            .registry
            .attach(tenant_id, generation, Arc::clone(&connection))
            .await
        {
            debug!(tenant_id, "Initialization cancelled, closing connection");
            connection.close().await;
            return Ok(None);
        }

        let manager = self.clone();
        let tenant = tenant_id.to_string();
        tokio::spawn(async move { manager.run_events(tenant, generation, rx).await });

        Ok(Some(generation))
    }

    /// Start pairing. Fails with `AlreadyActive` when the tenant has a
    /// connection; otherwise waits for a QR code or an open connection.
    /// On `QrTimeout` the connection is closed and the tenant is free again.
    pub async fn connect_session(&self, tenant_id: &str) -> Result<ConnectOutcome, SessionError> {
        if self.registry.is_active(tenant_id).await {
            return Err(SessionError::AlreadyActive(tenant_id.to_string()));
        }
        self.db.get_tenant(tenant_id).await?;
        self.reconnects().remove(tenant_id);

        let Some(generation) = self.open_client(tenant_id).await? else {
            return Err(SessionError::AlreadyActive(tenant_id.to_string()));
        };

        for _ in 0..self.config.qr_poll_attempts {
            if let Some(snapshot) = self.registry.snapshot(tenant_id).await {
                if snapshot.state == HandleState::Ready {
                    return Ok(ConnectOutcome::Connected);
                }
                if let Some(qr) = snapshot.qr {
                    return Ok(ConnectOutcome::QrCode(qr));
                }
            }
            tokio::time::sleep(self.config.qr_poll_interval()).await;
        }

        warn!(tenant_id, "No QR code within the polling window");
        if let Some(handle) = self.registry.remove_generation(tenant_id, generation).await {
            handle.connection.close().await;
            self.db
                .set_session_status(tenant_id, SessionStatus::Disconnected)
                .await?;
        }
        Err(SessionError::QrTimeout)
    }

    /// Live state wins over the stored one.
    pub async fn get_status(&self, tenant_id: &str) -> Result<SessionStatus, SessionError> {
        if let Some(snapshot) = self.registry.snapshot(tenant_id).await {
            if snapshot.state == HandleState::Ready {
                return Ok(SessionStatus::Connected);
            }
            if snapshot.qr.is_some() {
                return Ok(SessionStatus::QrPending);
            }
        }

        let tenant = self.db.get_tenant(tenant_id).await?;
        Ok(tenant.session_status().unwrap_or_default())
    }

    /// Log out and forget the tenant's session. Logout failures are ignored;
    /// calling this on a disconnected tenant succeeds.
    pub async fn disconnect_session(&self, tenant_id: &str) -> Result<(), SessionError> {
        let handle = self.registry.remove(tenant_id).await;
        self.reconnects().remove(tenant_id);

        if let Some(handle) = handle {
            if let Err(e) = handle.connection.logout().await {
                warn!(tenant_id, "Logout failed, continuing: {}", e);
            }
            handle.connection.close().await;
        }

        self.credentials.wipe(tenant_id).await?;
        self.db
            .set_session_status(tenant_id, SessionStatus::Disconnected)
            .await?;

        info!(tenant_id, "Session disconnected");
        self.emit(WorkerEvent::LoggedOut {
            tenant_id: tenant_id.to_string(),
        });
        Ok(())
    }

    /// Reopen every tenant with complete stored credentials. Incomplete
    /// credential directories are deleted. Returns how many were started.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let tenants = self.credentials.clean_broken().await?;
        let mut restored = 0;

        for tenant_id in tenants {
            if self.db.find_tenant(&tenant_id).await?.is_none() {
                warn!(tenant_id, "Credentials for unknown tenant, skipping");
                continue;
            }
            match self.initialize_client(&tenant_id).await {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => error!(tenant_id, "Failed to restore session: {}", e),
            }
        }

        info!(restored, "Sessions restored");
        Ok(restored)
    }

    /// Close every connection, keeping credentials for the next start.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.reconnects().clear();

        for (tenant_id, handle) in self.registry.drain().await {
            handle.connection.close().await;
            if let Err(e) = self
                .db
                .set_session_status(&tenant_id, SessionStatus::Disconnected)
                .await
            {
                warn!(tenant_id, "Failed to persist status on shutdown: {}", e);
            }
        }
        info!("Session manager stopped");
    }

    async fn run_events(
        &self,
        tenant_id: String,
        generation: u64,
        mut rx: mpsc::Receiver<SessionEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            let Some(state) = self.registry.state(&tenant_id, generation).await else {
                debug!(tenant_id, generation, "Event for a replaced connection, stopping");
                break;
            };

            let attempts = self.reconnects().get(&tenant_id).copied().unwrap_or(0);
            let step = transition(state, &event, attempts, &self.policy);

            for effect in step.effects {
                if let Err(e) = self.apply(&tenant_id, generation, effect).await {
                    error!(tenant_id, "Session event handling failed: {}", e);
                }
            }

            if step.next.is_none() {
                break;
            }
        }
    }

    async fn apply(&self, tenant_id: &str, generation: u64, effect: Effect) -> Result<(), SessionError> {
        match effect {
            Effect::CacheQr(payload) => {
                let image =
                    render_qr_data_url(&payload).map_err(|e| SessionError::QrRender(e.to_string()))?;
                let qr = QrChallenge {
                    payload: payload.clone(),
                    image,
                };
                if self.registry.set_qr(tenant_id, generation, qr).await {
                    info!(tenant_id, "QR code issued");
                    self.emit(WorkerEvent::QrCode {
                        tenant_id: tenant_id.to_string(),
                        qr: payload,
                    });
                }
            }
            Effect::MarkReady { phone_number } => {
                if self
                    .registry
                    .mark_ready(tenant_id, generation, phone_number.clone())
                    .await
                {
                    info!(tenant_id, "Connection open");
                    self.emit(WorkerEvent::Connected {
                        tenant_id: tenant_id.to_string(),
                        phone_number,
                    });
                }
            }
            Effect::PersistStatus(status) => {
                self.db.set_session_status(tenant_id, status).await?;
                if status == SessionStatus::Error {
                    self.emit(WorkerEvent::SessionFailed {
                        tenant_id: tenant_id.to_string(),
                        error: "reconnect attempts exhausted".to_string(),
                    });
                }
            }
            Effect::SaveCredentials(files) => {
                self.credentials.save(tenant_id, &files).await?;
            }
            Effect::RemoveHandle => {
                if let Some(handle) = self.registry.remove_generation(tenant_id, generation).await {
                    // closing waits on the bridge, which may be blocked on this loop
                    tokio::spawn(async move { handle.connection.close().await });
                    info!(tenant_id, "Connection closed");
                    self.emit(WorkerEvent::Disconnected {
                        tenant_id: tenant_id.to_string(),
                        reason: "connection closed".to_string(),
                    });
                }
            }
            Effect::WipeCredentials => {
                info!(tenant_id, "Logged out, removing credentials");
                self.credentials.wipe(tenant_id).await?;
                self.emit(WorkerEvent::LoggedOut {
                    tenant_id: tenant_id.to_string(),
                });
            }
            Effect::ScheduleReconnect { delay, attempt } => {
                self.schedule_reconnect(tenant_id, delay, attempt);
            }
            Effect::ResetReconnects => {
                self.reconnects().remove(tenant_id);
            }
        }
        Ok(())
    }

    fn schedule_reconnect(&self, tenant_id: &str, delay: Duration, attempt: u32) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        self.reconnects().insert(tenant_id.to_string(), attempt);

        let delay_ms = delay.as_millis() as u64;
        info!(tenant_id, attempt, delay_ms, "Reconnect scheduled");
        self.emit(WorkerEvent::ReconnectScheduled {
            tenant_id: tenant_id.to_string(),
            attempt,
            delay_ms,
        });

        let manager = self.clone();
        let tenant = tenant_id.to_string();
        tokio::spawn(async move { manager.reconnect(tenant, delay, attempt).await });
    }

    async fn reconnect(&self, tenant_id: String, delay: Duration, attempt: u32) {
        tokio::time::sleep(delay).await;

        // an explicit connect or disconnect in the meantime supersedes this attempt
        let current = self.reconnects().get(&tenant_id).copied();
        if current != Some(attempt) || self.closing.load(Ordering::SeqCst) {
            return;
        }

        let Err(e) = self.initialize_client(&tenant_id).await else {
            return;
        };
        warn!(tenant_id, attempt, "Reconnect failed: {}", e);

        let next = attempt + 1;
        if let Some(delay) = self.policy.delay_for(next) {
            self.schedule_reconnect(&tenant_id, delay, next);
            return;
        }

        self.reconnects().remove(&tenant_id);
        error!(tenant_id, "Reconnect attempts exhausted");
        if let Err(e) = self
            .db
            .set_session_status(&tenant_id, SessionStatus::Error)
            .await
        {
            error!(tenant_id, "Failed to persist session error: {}", e);
        }
        self.emit(WorkerEvent::SessionFailed {
            tenant_id,
            error: e.to_string(),
        });
    }

    fn reconnects(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.reconnects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events
            && events.try_send(event).is_err()
        {
            debug!("Worker event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, wait_for_status, wait_for_stored_status, wait_until};
    use parley_core::DisconnectReason;

    #[tokio::test]
    async fn parallel_connects_open_one_connection() {
        let fx = Fixture::new(0).await;

        let (a, b, c) = tokio::join!(
            fx.sessions.connect_session("t1"),
            fx.sessions.connect_session("t1"),
            fx.sessions.connect_session("t1"),
        );
        let results = [a, b, c];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, SessionError::AlreadyActive(_)))
        );
        assert_eq!(fx.connector.open_count("t1"), 1);
        assert_eq!(fx.sessions.registry().len().await, 1);
    }

    #[tokio::test]
    async fn scanned_qr_connects_and_clears_challenge() {
        let fx = Fixture::new(0).await;

        let outcome = fx.sessions.connect_session("t1").await.unwrap();
        let ConnectOutcome::QrCode(qr) = outcome else {
            panic!("expected a QR code, got {outcome:?}");
        };
        assert_eq!(qr.payload, "qr-t1-1");
        assert!(qr.image.starts_with("data:image/svg+xml;base64,"));
        assert_eq!(
            fx.sessions.get_status("t1").await.unwrap(),
            SessionStatus::QrPending
        );
        wait_for_stored_status(&fx.db, "t1", SessionStatus::QrPending).await;

        fx.connector
            .emit("t1", SessionEvent::Opened { phone_number: None })
            .await;
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;

        let snapshot = fx.sessions.registry().snapshot("t1").await.unwrap();
        assert!(snapshot.qr.is_none());
        wait_for_stored_status(&fx.db, "t1", SessionStatus::Connected).await;
    }

    #[tokio::test]
    async fn stored_credentials_connect_without_qr() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;

        assert_eq!(
            fx.sessions.connect_session("t1").await.unwrap(),
            ConnectOutcome::Connected
        );
        assert!(matches!(
            fx.sessions.connect_session("t1").await,
            Err(SessionError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn credential_updates_are_persisted() {
        let fx = Fixture::new(0).await;
        fx.sessions.connect_session("t1").await.unwrap();

        let mut files = parley_core::CredentialUpdate::new();
        files.insert("creds.json".into(), Some("{}".into()));
        fx.connector
            .emit("t1", SessionEvent::CredentialsUpdated { files })
            .await;
        fx.connector
            .emit("t1", SessionEvent::Opened { phone_number: None })
            .await;
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;

        assert!(fx.sessions.credentials().is_complete("t1").await);
    }

    #[tokio::test]
    async fn failed_open_leaves_nothing_registered() {
        let fx = Fixture::new(0).await;
        fx.connector.state().fail_open = true;

        assert!(matches!(
            fx.sessions.connect_session("t1").await,
            Err(SessionError::Init(_))
        ));
        assert!(!fx.sessions.registry().is_active("t1").await);

        fx.connector.state().fail_open = false;
        assert!(fx.sessions.connect_session("t1").await.is_ok());
    }

    #[tokio::test]
    async fn qr_timeout_frees_the_tenant() {
        let fx = Fixture::new(0).await;
        fx.connector.state().silent = true;

        assert!(matches!(
            fx.sessions.connect_session("t1").await,
            Err(SessionError::QrTimeout)
        ));
        assert!(!fx.sessions.registry().is_active("t1").await);
        assert_eq!(fx.connector.state().closed, vec!["t1".to_string()]);
        assert_eq!(
            fx.sessions.get_status("t1").await.unwrap(),
            SessionStatus::Disconnected
        );

        fx.connector.state().silent = false;
        let outcome = fx.sessions.connect_session("t1").await.unwrap();
        assert!(matches!(outcome, ConnectOutcome::QrCode(_)));
        assert_eq!(fx.connector.open_count("t1"), 2);
    }

    #[tokio::test]
    async fn unknown_tenant_cannot_connect() {
        let fx = Fixture::new(0).await;
        assert!(matches!(
            fx.sessions.connect_session("ghost").await,
            Err(SessionError::Db(_))
        ));
        assert_eq!(fx.connector.open_count("ghost"), 0);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let fx = Fixture::new(0).await;

        fx.sessions.disconnect_session("t1").await.unwrap();
        fx.sessions.disconnect_session("t1").await.unwrap();

        assert_eq!(
            fx.sessions.get_status("t1").await.unwrap(),
            SessionStatus::Disconnected
        );
        assert!(fx.connector.state().logouts.is_empty());
    }

    #[tokio::test]
    async fn disconnect_survives_failed_logout() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;
        fx.sessions.connect_session("t1").await.unwrap();
        fx.connector.state().fail_logout = true;

        fx.sessions.disconnect_session("t1").await.unwrap();

        assert!(!fx.sessions.registry().is_active("t1").await);
        assert!(!fx.sessions.credentials().tenant_dir("t1").exists());
        assert_eq!(
            fx.sessions.get_status("t1").await.unwrap(),
            SessionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn logout_wipes_credentials_and_next_connect_pairs_again() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;
        assert_eq!(
            fx.sessions.connect_session("t1").await.unwrap(),
            ConnectOutcome::Connected
        );

        fx.sessions.disconnect_session("t1").await.unwrap();
        assert_eq!(fx.connector.state().logouts, vec!["t1".to_string()]);
        assert!(!fx.sessions.credentials().tenant_dir("t1").exists());

        let outcome = fx.sessions.connect_session("t1").await.unwrap();
        assert!(matches!(outcome, ConnectOutcome::QrCode(_)));
    }

    #[tokio::test]
    async fn remote_logout_does_not_reconnect() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;
        fx.sessions.connect_session("t1").await.unwrap();
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;

        fx.connector
            .emit(
                "t1",
                SessionEvent::Closed {
                    reason: DisconnectReason::logged_out(),
                },
            )
            .await;
        wait_for_status(&fx.sessions, "t1", SessionStatus::Disconnected).await;
        wait_until(|| !fx.sessions.credentials().tenant_dir("t1").exists()).await;
        wait_until(|| fx.connector.state().closed == vec!["t1".to_string()]).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.connector.open_count("t1"), 1);
    }

    #[tokio::test]
    async fn dropped_connection_reconnects() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;
        fx.sessions.connect_session("t1").await.unwrap();
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;

        fx.connector
            .emit(
                "t1",
                SessionEvent::Closed {
                    reason: DisconnectReason::new(Some(428), "connection lost"),
                },
            )
            .await;

        wait_until(|| fx.connector.open_count("t1") == 2).await;
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;
        assert!(fx.sessions.credentials().is_complete("t1").await);
    }

    #[tokio::test]
    async fn reconnects_give_up_with_error_status() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;
        fx.sessions.connect_session("t1").await.unwrap();
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;

        fx.connector.state().fail_open = true;
        fx.connector
            .emit(
                "t1",
                SessionEvent::Closed {
                    reason: DisconnectReason::new(Some(500), "stream errored"),
                },
            )
            .await;

        wait_for_status(&fx.sessions, "t1", SessionStatus::Error).await;
        // initial open plus the two allowed reconnects
        assert_eq!(fx.connector.open_count("t1"), 3);
        assert!(fx.sessions.credentials().is_complete("t1").await);
        assert!(!fx.sessions.registry().is_active("t1").await);
    }

    #[tokio::test]
    async fn restore_reopens_complete_sessions_and_drops_broken_ones() {
        let fx = Fixture::new(0).await;
        fx.db.create_tenant("t2", "Beta").await.unwrap();
        fx.store_credentials("t1").await;
        fx.store_credentials("ghost").await;

        let mut partial = parley_core::CredentialUpdate::new();
        partial.insert("app-state-sync.json".into(), Some("{}".into()));
        fx.sessions.credentials().save("t2", &partial).await.unwrap();

        assert_eq!(fx.sessions.restore_sessions().await.unwrap(), 1);
        wait_for_status(&fx.sessions, "t1", SessionStatus::Connected).await;
        assert!(!fx.sessions.credentials().tenant_dir("t2").exists());
        assert_eq!(fx.connector.open_count("ghost"), 0);
    }

    #[tokio::test]
    async fn restore_keeps_tenant_ids_that_are_not_path_safe() {
        let fx = Fixture::new(0).await;
        fx.db.create_tenant("Acme Corp", "Acme").await.unwrap();
        fx.db.create_tenant("a/b", "Slash").await.unwrap();
        fx.store_credentials("Acme Corp").await;
        fx.store_credentials("a/b").await;

        assert_eq!(fx.sessions.restore_sessions().await.unwrap(), 2);
        assert_eq!(fx.connector.open_count("Acme Corp"), 1);
        assert_eq!(fx.connector.open_count("a/b"), 1);
        wait_for_status(&fx.sessions, "Acme Corp", SessionStatus::Connected).await;
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_but_keeps_credentials() {
        let fx = Fixture::new(0).await;
        fx.store_credentials("t1").await;
        fx.sessions.connect_session("t1").await.unwrap();

        fx.sessions.shutdown().await;

        assert!(fx.sessions.registry().is_empty().await);
        assert!(fx.sessions.credentials().is_complete("t1").await);
    }
}
