//! In-memory registry of live tunnel sessions.
//!
//! The map is the source of truth for liveness; the persisted `is_active`
//! flag is best-effort and reconciled against it. Invariant: at most one
//! session per tunnel id at any instant.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::session::TunnelSession;

/// Concurrent map tunnel id → live session. Cheap to clone; all clones share
/// the same map.
#[derive(Clone, Default)]
pub struct ActiveTunnels {
    inner: Arc<RwLock<HashMap<Uuid, Arc<TunnelSession>>>>,
}

impl ActiveTunnels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session, atomically replacing any prior one. The displaced
    /// session is closed first so its in-flight exchanges fail over to the
    /// reconnecting agent's session.
    pub async fn install(&self, session: Arc<TunnelSession>) {
        let tunnel_id = session.tunnel_id();
        let displaced = self.inner.write().await.insert(tunnel_id, session);
        if let Some(old) = displaced {
            warn!(tunnel_id = %tunnel_id, "replacing live session on reconnect");
            old.close();
        }
    }

    /// Remove `session` from the map — but only if it is still the stored
    /// instance. A session that was already displaced by a reconnect must
    /// not evict its successor.
    pub async fn remove(&self, session: &Arc<TunnelSession>) {
        let mut map = self.inner.write().await;
        if let Some(current) = map.get(&session.tunnel_id()) {
            if Arc::ptr_eq(current, session) {
                map.remove(&session.tunnel_id());
            }
        }
    }

    pub async fn get(&self, tunnel_id: Uuid) -> Option<Arc<TunnelSession>> {
        self.inner.read().await.get(&tunnel_id).cloned()
    }

    /// Close and remove whatever session is live for `tunnel_id`, if any.
    /// Returns the removed session.
    pub async fn take(&self, tunnel_id: Uuid) -> Option<Arc<TunnelSession>> {
        let session = self.inner.write().await.remove(&tunnel_id);
        if let Some(ref s) = session {
            s.close();
        }
        session
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;

    use super::*;
    use crate::tunnel::session::{ForwardError, ForwardedRequest};

    fn session(tunnel_id: Uuid) -> Arc<TunnelSession> {
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(TunnelSession::new(tunnel_id, 3000, tx))
    }

    #[tokio::test]
    async fn install_replaces_and_closes_prior_session() {
        let active = ActiveTunnels::new();
        let tunnel_id = Uuid::new_v4();
        let first = session(tunnel_id);
        let second = session(tunnel_id);

        active.install(first.clone()).await;
        active.install(second.clone()).await;

        assert_eq!(active.count().await, 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&active.get(tunnel_id).await.unwrap(), &second));
    }

    #[tokio::test]
    async fn reconnect_fails_inflight_exchanges_on_displaced_session() {
        let active = ActiveTunnels::new();
        let tunnel_id = Uuid::new_v4();
        let (tx, mut writer_rx) = mpsc::channel(16);
        let first = Arc::new(TunnelSession::new(tunnel_id, 3000, tx));
        active.install(first.clone()).await;

        let waiter = {
            let first = first.clone();
            tokio::spawn(async move {
                first
                    .forward_http(ForwardedRequest {
                        method: "GET".to_string(),
                        url: "/slow".to_string(),
                        headers: HashMap::new(),
                        body: Vec::new(),
                    })
                    .await
            })
        };
        let _ = writer_rx.recv().await.unwrap();

        active.install(session(tunnel_id)).await;
        assert_eq!(waiter.await.unwrap(), Err(ForwardError::SessionClosed));
    }

    #[tokio::test]
    async fn remove_only_evicts_same_instance() {
        let active = ActiveTunnels::new();
        let tunnel_id = Uuid::new_v4();
        let stale = session(tunnel_id);
        let live = session(tunnel_id);

        active.install(stale.clone()).await;
        active.install(live.clone()).await;

        // The displaced session's teardown must not remove its successor.
        active.remove(&stale).await;
        assert!(active.get(tunnel_id).await.is_some());

        active.remove(&live).await;
        assert!(active.get(tunnel_id).await.is_none());
    }

    #[tokio::test]
    async fn take_closes_and_removes() {
        let active = ActiveTunnels::new();
        let tunnel_id = Uuid::new_v4();
        let s = session(tunnel_id);
        active.install(s.clone()).await;

        let taken = active.take(tunnel_id).await.unwrap();
        assert!(taken.is_closed());
        assert!(active.get(tunnel_id).await.is_none());
        assert!(active.take(tunnel_id).await.is_none());
    }
}
