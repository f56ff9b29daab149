use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use parley_core::Connection;

use crate::machine::HandleState;

/// A pairing challenge: the raw payload and a scannable image of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrChallenge {
    pub payload: String,
    /// `data:` URL of an SVG rendering.
    pub image: String,
}

pub struct SessionHandle {
    pub connection: Arc<dyn Connection>,
    pub state: HandleState,
    pub qr: Option<QrChallenge>,
    pub phone_number: Option<String>,
    generation: u64,
}

/// Point-in-time view of a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub state: HandleState,
    pub qr: Option<QrChallenge>,
    pub phone_number: Option<String>,
}

#[derive(Default)]
struct Inner {
    handles: HashMap<String, SessionHandle>,
    /// Tenants whose connection is being opened, with the generation it will get.
    initializing: HashMap<String, u64>,
    next_generation: u64,
}

/// Tenant id to live connection. A tenant is either absent, initializing, or
/// has exactly one handle; every connection gets a fresh generation so that
/// late events of a replaced connection can be told apart.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the right to open a connection for `tenant_id`. Returns the
    /// generation for the new connection, or `None` when one exists or is
    /// already being opened.
    pub async fn begin_initializing(&self, tenant_id: &str) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        if inner.handles.contains_key(tenant_id) || inner.initializing.contains_key(tenant_id) {
            return None;
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.initializing.insert(tenant_id.to_string(), generation);
        Some(generation)
    }

    pub async fn abort_initializing(&self, tenant_id: &str, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.initializing.get(tenant_id) == Some(&generation) {
            inner.initializing.remove(tenant_id);
        }
    }

    /// Register the opened connection. Fails when the claim was withdrawn in
    /// the meantime, in which case the caller owns the connection.
    pub async fn attach(
        &self,
        tenant_id: &str,
        generation: u64,
        connection: Arc<dyn Connection>,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.initializing.get(tenant_id) != Some(&generation) {
            return false;
        }
        inner.initializing.remove(tenant_id);
        inner.handles.insert(
            tenant_id.to_string(),
            SessionHandle {
                connection,
                state: HandleState::Initializing,
                qr: None,
                phone_number: None,
                generation,
            },
        );
        true
    }

    /// State of the handle, if it is still the one of `generation`.
    pub async fn state(&self, tenant_id: &str, generation: u64) -> Option<HandleState> {
        let inner = self.inner.lock().await;
        inner
            .handles
            .get(tenant_id)
            .filter(|h| h.generation == generation)
            .map(|h| h.state)
    }

    pub async fn set_qr(&self, tenant_id: &str, generation: u64, qr: QrChallenge) -> bool {
        self.update(tenant_id, generation, |handle| {
            handle.state = HandleState::QrPending;
            handle.qr = Some(qr);
        })
        .await
    }

    pub async fn mark_ready(
        &self,
        tenant_id: &str,
        generation: u64,
        phone_number: Option<String>,
    ) -> bool {
        self.update(tenant_id, generation, |handle| {
            handle.state = HandleState::Ready;
            handle.qr = None;
            handle.phone_number = phone_number;
        })
        .await
    }

    async fn update(
        &self,
        tenant_id: &str,
        generation: u64,
        apply: impl FnOnce(&mut SessionHandle),
    ) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.handles.get_mut(tenant_id) {
            Some(handle) if handle.generation == generation => {
                apply(handle);
                true
            }
            _ => false,
        }
    }

    /// Forget the tenant entirely, including a pending initialization.
    pub async fn remove(&self, tenant_id: &str) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().await;
        inner.initializing.remove(tenant_id);
        inner.handles.remove(tenant_id)
    }

    pub async fn remove_generation(&self, tenant_id: &str, generation: u64) -> Option<SessionHandle> {
        let mut inner = self.inner.lock().await;
        if inner
            .handles
            .get(tenant_id)
            .is_some_and(|h| h.generation == generation)
        {
            inner.handles.remove(tenant_id)
        } else {
            None
        }
    }

    /// A handle exists or is being opened.
    pub async fn is_active(&self, tenant_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.handles.contains_key(tenant_id) || inner.initializing.contains_key(tenant_id)
    }

    pub async fn snapshot(&self, tenant_id: &str) -> Option<HandleSnapshot> {
        let inner = self.inner.lock().await;
        inner.handles.get(tenant_id).map(|h| HandleSnapshot {
            state: h.state,
            qr: h.qr.clone(),
            phone_number: h.phone_number.clone(),
        })
    }

    /// The connection, if the tenant can send right now.
    pub async fn ready_connection(&self, tenant_id: &str) -> Option<Arc<dyn Connection>> {
        let inner = self.inner.lock().await;
        inner
            .handles
            .get(tenant_id)
            .filter(|h| h.state == HandleState::Ready)
            .map(|h| Arc::clone(&h.connection))
    }

    pub async fn drain(&self) -> Vec<(String, SessionHandle)> {
        let mut inner = self.inner.lock().await;
        inner.initializing.clear();
        inner.handles.drain().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnection;

    fn connection() -> Arc<dyn Connection> {
        Arc::new(FakeConnection::detached("t1"))
    }

    #[tokio::test]
    async fn second_claim_is_refused_until_released() {
        let registry = SessionRegistry::new();
        let generation = registry.begin_initializing("t1").await.unwrap();
        assert!(registry.begin_initializing("t1").await.is_none());
        assert!(registry.is_active("t1").await);

        registry.abort_initializing("t1", generation).await;
        assert!(!registry.is_active("t1").await);
        assert!(registry.begin_initializing("t1").await.is_some());
    }

    #[tokio::test]
    async fn attach_after_removal_is_refused() {
        let registry = SessionRegistry::new();
        let generation = registry.begin_initializing("t1").await.unwrap();
        registry.remove("t1").await;

        assert!(!registry.attach("t1", generation, connection()).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn stale_generation_cannot_touch_new_handle() {
        let registry = SessionRegistry::new();
        let old = registry.begin_initializing("t1").await.unwrap();
        registry.attach("t1", old, connection()).await;
        registry.remove("t1").await;

        let new = registry.begin_initializing("t1").await.unwrap();
        registry.attach("t1", new, connection()).await;

        assert!(!registry.mark_ready("t1", old, None).await);
        assert!(registry.remove_generation("t1", old).await.is_none());
        assert_eq!(registry.state("t1", new).await, Some(HandleState::Initializing));
    }

    #[tokio::test]
    async fn only_ready_handles_can_send() {
        let registry = SessionRegistry::new();
        let generation = registry.begin_initializing("t1").await.unwrap();
        registry.attach("t1", generation, connection()).await;

        let qr = QrChallenge {
            payload: "2@abc".into(),
            image: "data:image/svg+xml;base64,AA==".into(),
        };
        registry.set_qr("t1", generation, qr.clone()).await;
        assert!(registry.ready_connection("t1").await.is_none());
        assert_eq!(registry.snapshot("t1").await.unwrap().qr, Some(qr));

        registry.mark_ready("t1", generation, Some("1555".into())).await;
        assert!(registry.ready_connection("t1").await.is_some());
        let snapshot = registry.snapshot("t1").await.unwrap();
        assert_eq!(snapshot.state, HandleState::Ready);
        assert!(snapshot.qr.is_none());
    }
}
