use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use parley_core::{
    BridgeCommand, Connection, Connector, CredentialSet, OutboundContent, SessionEvent,
    TransportError,
};

use crate::bridge::BridgeProcess;

/// Opens tenant connections through the bridge process.
pub struct BridgeConnector {
    bridge: Arc<BridgeProcess>,
}

impl BridgeConnector {
    pub fn new(bridge: Arc<BridgeProcess>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn open(
        &self,
        tenant_id: &str,
        credentials: CredentialSet,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let token = self.bridge.subscribe(tenant_id, events).await;

        let started = self
            .bridge
            .request(BridgeCommand::StartSession {
                tenant_id: tenant_id.to_string(),
                auth_state: credentials,
            })
            .await;

        if let Err(err) = started {
            self.bridge.unsubscribe(tenant_id, token).await;
            return Err(err.into());
        }

        Ok(Arc::new(BridgeConnection {
            bridge: Arc::clone(&self.bridge),
            tenant_id: tenant_id.to_string(),
            token,
        }))
    }
}

struct BridgeConnection {
    bridge: Arc<BridgeProcess>,
    tenant_id: String,
    token: u64,
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn send(&self, jid: &str, content: &OutboundContent) -> Result<(), TransportError> {
        self.bridge
            .request(BridgeCommand::SendMessage {
                tenant_id: self.tenant_id.clone(),
                to: jid.to_string(),
                content: content.clone(),
            })
            .await
            .map_err(TransportError::from)
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.bridge
            .request(BridgeCommand::Logout {
                tenant_id: self.tenant_id.clone(),
            })
            .await
            .map_err(TransportError::from)
    }

    async fn close(&self) {
        let stopped = self
            .bridge
            .request(BridgeCommand::StopSession {
                tenant_id: self.tenant_id.clone(),
            })
            .await;
        if let Err(err) = stopped {
            debug!(tenant_id = %self.tenant_id, "StopSession failed: {}", err);
        }
        self.bridge.unsubscribe(&self.tenant_id, self.token).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bridge::tests::Harness;
    use parley_core::BridgeEvent;

    #[tokio::test]
    async fn open_sends_stored_credentials_and_routes_events() {
        let mut harness = Harness::new(Duration::from_secs(5)).await;
        let connector = BridgeConnector::new(Arc::clone(&harness.bridge));
        let (events_tx, mut events_rx) = mpsc::channel(4);

        let mut credentials = CredentialSet::new();
        credentials.insert("creds.json".into(), "{}".into());

        let open = tokio::spawn(async move { connector.open("t1", credentials, events_tx).await });

        let (id, command) = harness.next_command().await;
        match command {
            BridgeCommand::StartSession {
                tenant_id,
                auth_state,
            } => {
                assert_eq!(tenant_id, "t1");
                assert!(auth_state.contains_key("creds.json"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        harness.ack(id, None).await;
        let connection = open.await.unwrap().unwrap();

        harness
            .emit(BridgeEvent::Connected {
                tenant_id: "t1".into(),
                phone_number: Some("15550001".into()),
            })
            .await;
        assert_eq!(
            events_rx.recv().await.unwrap(),
            SessionEvent::Opened {
                phone_number: Some("15550001".into())
            }
        );

        let send = tokio::spawn(async move {
            connection
                .send(
                    "15550002@s.whatsapp.net",
                    &OutboundContent::Text { text: "hi".into() },
                )
                .await
        });
        let (id, command) = harness.next_command().await;
        assert_eq!(command.name(), "SendMessage");
        harness.ack(id, Some("not on whatsapp")).await;
        assert_eq!(
            send.await.unwrap(),
            Err(TransportError::Rejected("not on whatsapp".into()))
        );
    }

    #[tokio::test]
    async fn failed_start_leaves_no_subscription() {
        let mut harness = Harness::new(Duration::from_secs(5)).await;
        let connector = BridgeConnector::new(Arc::clone(&harness.bridge));
        let (events_tx, mut events_rx) = mpsc::channel(4);

        let open = tokio::spawn(async move {
            connector
                .open("t1", CredentialSet::new(), events_tx)
                .await
                .map(|_| ())
        });
        let (id, _) = harness.next_command().await;
        harness.ack(id, Some("browser crashed")).await;
        assert!(open.await.unwrap().is_err());

        harness
            .emit(BridgeEvent::QrCode {
                tenant_id: "t1".into(),
                qr: "2@x".into(),
            })
            .await;
        // the sender was dropped with the subscription
        assert!(events_rx.recv().await.is_none());
    }
}
