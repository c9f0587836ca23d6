//! Session registry: the single entry point the front door talks to.
//!
//! In-process map of user to live session. Creation is idempotent: a user
//! with a session in any non-terminal state gets the existing projection
//! back, so at most one transport handshake is ever in flight per user.
//! All map mutations go through DashMap entry locking; no ambient state.

use crate::reconnect::ReconnectPolicy;
use crate::session::{LifecycleState, SessionCell, SessionDriver, SessionExit, SessionProjection};
use crate::transport::Connector;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relay_ingest::IngestPipeline;
use relay_storage::{AuthStore, UserId};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct SessionEntry {
    cell: Arc<SessionCell>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// In-process mapping of user to live session handle
pub struct SessionRegistry {
    sessions: Arc<DashMap<UserId, SessionEntry>>,
    connector: Arc<dyn Connector>,
    auth: Arc<dyn AuthStore>,
    ingest: Arc<IngestPipeline>,
    policy: ReconnectPolicy,
}

impl SessionRegistry {
    /// Create a registry wiring sessions to the given collaborators
    pub fn new(
        connector: Arc<dyn Connector>,
        auth: Arc<dyn AuthStore>,
        ingest: Arc<IngestPipeline>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            connector,
            auth,
            ingest,
            policy,
        }
    }

    /// Start a session for `user`, or return the existing one unchanged.
    ///
    /// The driver is handed off to a spawned task; the returned projection is
    /// whatever is available at call time.
    pub fn start_session(&self, user: &UserId) -> SessionProjection {
        match self.sessions.entry(user.clone()) {
            Entry::Occupied(mut occupied) => {
                let projection = occupied.get().cell.projection();
                if !projection.state.is_terminal() {
                    return projection;
                }
                // A terminal leftover gives way to a brand-new session
                let entry = self.spawn_session(user.clone());
                let projection = entry.cell.projection();
                occupied.insert(entry);
                projection
            }
            Entry::Vacant(vacant) => {
                info!("starting session for user {}", user);
                let entry = self.spawn_session(user.clone());
                let projection = entry.cell.projection();
                vacant.insert(entry);
                projection
            }
        }
    }

    fn spawn_session(&self, user: UserId) -> SessionEntry {
        let cell = Arc::new(SessionCell::new(user.clone()));
        let cancel = CancellationToken::new();

        let driver = SessionDriver {
            user: user.clone(),
            connector: Arc::clone(&self.connector),
            auth: Arc::clone(&self.auth),
            ingest: Arc::clone(&self.ingest),
            policy: self.policy,
            cell: Arc::clone(&cell),
            cancel: cancel.clone(),
        };

        let sessions = Arc::clone(&self.sessions);
        let own_cell = Arc::clone(&cell);
        let task = tokio::spawn(async move {
            if let SessionExit::Terminal(reason) = driver.run().await {
                // Self-removal, unless a replacement already took the slot
                sessions.remove_if(&user, |_, entry| Arc::ptr_eq(&entry.cell, &own_cell));
                info!("session for user {} removed from registry: {}", user, reason);
            }
        });

        SessionEntry {
            cell,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current projection for `user`, if a session exists
    pub fn get_session(&self, user: &UserId) -> Option<SessionProjection> {
        self.sessions.get(user).map(|entry| entry.cell.projection())
    }

    /// Whether `user` has an open session
    pub fn is_open(&self, user: &UserId) -> bool {
        self.get_session(user)
            .map_or(false, |projection| projection.state == LifecycleState::Open)
    }

    /// Sessions not yet terminated, pairing and reconnecting ones included
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.cell.projection().state.is_terminal())
            .count()
    }

    /// Stop `user`'s session: transport logout, registry removal, credential
    /// purge. Returns false (and does nothing) when no session exists.
    ///
    /// Cancels a pending reconnect attempt deterministically.
    pub async fn stop_session(&self, user: &UserId) -> bool {
        let Some((_, entry)) = self.sessions.remove(user) else {
            return false;
        };

        entry.cancel.cancel();
        let task = entry
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            // Let the driver finish its transport logout before the
            // credentials it may still need are purged
            if let Err(e) = task.await {
                warn!("session task for user {} ended abnormally: {}", user, e);
            }
        }

        if let Err(e) = self.auth.delete(user).await {
            warn!("failed to delete credentials for user {}: {}", user, e);
        }
        info!("stopped session for user {}", user);
        true
    }

    /// Start sessions for every user whose persisted connected flag is set.
    ///
    /// Run once at startup so a process restart resumes previously-open
    /// sessions. Returns the number of restoration attempts.
    pub async fn restore_sessions(&self) -> usize {
        let users = match self.auth.connected_users().await {
            Ok(users) => users,
            Err(e) => {
                warn!("session restoration sweep failed: {}", e);
                return 0;
            }
        };

        let count = users.len();
        for user in &users {
            info!("restoring session for user {}", user);
            self.start_session(user);
        }
        count
    }

    /// Stop every driver task without purging credentials or clearing
    /// persisted connected flags. Process shutdown is a transient
    /// disconnect, not a logout.
    pub async fn shutdown(&self) {
        let users: Vec<UserId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        info!("shutting down {} session(s)", users.len());

        for user in users {
            if let Some((_, entry)) = self.sessions.remove(&user) {
                entry.cell.set_draining();
                entry.cancel.cancel();
                let task = entry
                    .task
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        warn!("session task for user {} ended abnormally: {}", user, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::DisconnectReason;
    use crate::transport::{
        Connection, ConnectorError, DevConnector, TransportEvent, TransportHandle,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use relay_storage::{CredentialRecord, MemoryAuthStore, MemoryMessageStore};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Connector replaying one scripted event sequence per connection attempt
    struct ScriptedConnector {
        connects: AtomicUsize,
        logouts: Arc<AtomicUsize>,
        scripts: Mutex<VecDeque<Vec<TransportEvent>>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Vec<TransportEvent>>) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                logouts: Arc::new(AtomicUsize::new(0)),
                scripts: Mutex::new(scripts.into_iter().collect()),
            }
        }

        fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn logout_count(&self) -> usize {
            self.logouts.load(Ordering::SeqCst)
        }
    }

    struct ScriptedHandle {
        logouts: Arc<AtomicUsize>,
        // Keeps the event channel open until the driver drops the connection
        _event_tx: mpsc::Sender<TransportEvent>,
    }

    #[async_trait]
    impl TransportHandle for ScriptedHandle {
        async fn logout(&self) -> Result<(), ConnectorError> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(
            &self,
            _credentials: &CredentialRecord,
        ) -> Result<Connection, ConnectorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();

            let (event_tx, events) = mpsc::channel(16);
            let script_tx = event_tx.clone();
            tokio::spawn(async move {
                for event in script {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if script_tx.send(event).await.is_err() {
                        break;
                    }
                }
            });

            Ok(Connection {
                handle: Box::new(ScriptedHandle {
                    logouts: Arc::clone(&self.logouts),
                    _event_tx: event_tx,
                }),
                events,
            })
        }
    }

    /// Connector rejecting every handshake as an auth failure
    struct RejectingConnector;

    #[async_trait]
    impl Connector for RejectingConnector {
        async fn connect(
            &self,
            _credentials: &CredentialRecord,
        ) -> Result<Connection, ConnectorError> {
            Err(ConnectorError::AuthRejected("device removed".to_string()))
        }
    }

    fn registry_with(
        connector: Arc<dyn Connector>,
        auth: Arc<MemoryAuthStore>,
        policy: ReconnectPolicy,
    ) -> SessionRegistry {
        let messages = Arc::new(MemoryMessageStore::with_default_sweep());
        let ingest = Arc::new(IngestPipeline::with_default_retention(messages));
        SessionRegistry::new(connector, auth, ingest, policy)
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_concurrent_starts_open_one_transport() {
        let connector = Arc::new(ScriptedConnector::new(vec![vec![TransportEvent::Opened]]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = Arc::new(registry_with(connector.clone(), auth, ReconnectPolicy::default()));
        let user = UserId::from("u1");

        let starts: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let user = user.clone();
                tokio::spawn(async move { registry.start_session(&user) })
            })
            .collect();
        for start in starts {
            start.await.unwrap();
        }
        wait_for("session open", || registry.is_open(&user)).await;

        // Reuse, never a second handshake
        registry.start_session(&user);
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_flow_yields_artifact_then_credentials() {
        let connector = Arc::new(DevConnector::new(Duration::from_millis(50)));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(connector, auth.clone(), ReconnectPolicy::default());
        let user = UserId::from("u1");

        registry.start_session(&user);

        wait_for("pairing challenge", || {
            registry
                .get_session(&user)
                .map_or(false, |p| p.state == LifecycleState::AwaitingPairing)
        })
        .await;
        let projection = registry.get_session(&user).unwrap();
        let artifact = projection.pairing_artifact.expect("artifact while pairing");
        assert!(artifact.starts_with("data:image/svg+xml;base64,"));

        wait_for("session open", || registry.is_open(&user)).await;
        let projection = registry.get_session(&user).unwrap();
        assert!(projection.pairing_artifact.is_none());

        let record = auth.load(&user).await.unwrap();
        assert!(record.has_credentials());
        assert!(record.connected);
    }

    #[tokio::test]
    async fn test_stop_session_logs_out_and_purges_credentials() {
        let connector = Arc::new(ScriptedConnector::new(vec![vec![TransportEvent::Opened]]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(connector.clone(), auth.clone(), ReconnectPolicy::default());
        let user = UserId::from("u1");

        registry.start_session(&user);
        wait_for("session open", || registry.is_open(&user)).await;

        assert!(registry.stop_session(&user).await);
        assert!(!registry.is_open(&user));
        assert!(registry.get_session(&user).is_none());
        assert_eq!(connector.logout_count(), 1);

        // The credential record is gone; a reload materializes a fresh one
        assert!(auth.connected_users().await.unwrap().is_empty());
        assert!(!auth.load(&user).await.unwrap().has_credentials());
    }

    #[tokio::test]
    async fn test_stop_without_session_is_a_no_op() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(connector, auth.clone(), ReconnectPolicy::default());
        let user = UserId::from("u1");

        auth.save(&user, Bytes::from_static(b"creds"), HashMap::new())
            .await
            .unwrap();

        assert!(!registry.stop_session(&user).await);
        assert!(auth.load(&user).await.unwrap().has_credentials());
    }

    #[tokio::test]
    async fn test_transient_disconnect_reconnects_and_stays_active() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            vec![
                TransportEvent::Opened,
                TransportEvent::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                },
            ],
            vec![TransportEvent::Opened],
        ]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(
            connector.clone(),
            auth,
            ReconnectPolicy::new(Duration::from_millis(200)),
        );
        let user = UserId::from("u1");

        registry.start_session(&user);
        wait_for("first open", || registry.is_open(&user)).await;

        wait_for("reconnect pending", || {
            registry.get_session(&user).map_or(false, |p| {
                p.state == LifecycleState::Closing { reconnecting: true }
            })
        })
        .await;
        // Still counts as an in-flight session while waiting to reconnect
        assert_eq!(registry.active_count(), 1);
        // A start during the wait coalesces instead of opening a second transport
        registry.start_session(&user);
        assert_eq!(connector.connect_count(), 1);

        wait_for("second open", || {
            connector.connect_count() == 2 && registry.is_open(&user)
        })
        .await;
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reconnect() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            vec![
                TransportEvent::Opened,
                TransportEvent::Disconnected {
                    reason: DisconnectReason::ConnectionLost,
                },
            ],
            vec![TransportEvent::Opened],
        ]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(
            connector.clone(),
            auth,
            ReconnectPolicy::new(Duration::from_millis(200)),
        );
        let user = UserId::from("u1");

        registry.start_session(&user);
        wait_for("reconnect pending", || {
            registry.get_session(&user).map_or(false, |p| {
                p.state == LifecycleState::Closing { reconnecting: true }
            })
        })
        .await;

        assert!(registry.stop_session(&user).await);
        tokio::time::sleep(Duration::from_millis(400)).await;
        // The scheduled attempt never ran
        assert_eq!(connector.connect_count(), 1);
        assert!(registry.get_session(&user).is_none());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_server_logout_terminates_and_purges() {
        let connector = Arc::new(ScriptedConnector::new(vec![vec![
            TransportEvent::Opened,
            TransportEvent::Disconnected {
                reason: DisconnectReason::LoggedOut,
            },
        ]]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(connector, auth.clone(), ReconnectPolicy::default());
        let user = UserId::from("u1");

        auth.save(&user, Bytes::from_static(b"creds"), HashMap::new())
            .await
            .unwrap();

        registry.start_session(&user);
        wait_for("session removed", || registry.get_session(&user).is_none()).await;

        assert_eq!(registry.active_count(), 0);
        assert!(!auth.load(&user).await.unwrap().has_credentials());
    }

    #[tokio::test]
    async fn test_synchronous_auth_rejection_terminates() {
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(Arc::new(RejectingConnector), auth.clone(), ReconnectPolicy::default());
        let user = UserId::from("u1");

        auth.save(&user, Bytes::from_static(b"stale"), HashMap::new())
            .await
            .unwrap();

        registry.start_session(&user);
        wait_for("session removed", || registry.get_session(&user).is_none()).await;
        assert!(!auth.load(&user).await.unwrap().has_credentials());
    }

    #[tokio::test]
    async fn test_restore_sweep_starts_flagged_users_only() {
        let connector = Arc::new(ScriptedConnector::new(vec![
            vec![TransportEvent::Opened],
            vec![TransportEvent::Opened],
        ]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(connector, auth.clone(), ReconnectPolicy::default());

        let flagged = UserId::from("u1");
        let idle = UserId::from("u2");
        auth.save(&flagged, Bytes::from_static(b"creds"), HashMap::new())
            .await
            .unwrap();
        auth.set_connected(&flagged, true).await.unwrap();
        auth.load(&idle).await.unwrap();

        assert_eq!(registry.restore_sessions().await, 1);
        wait_for("restored session open", || registry.is_open(&flagged)).await;
        assert!(registry.get_session(&idle).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_preserves_credentials_and_flags() {
        let connector = Arc::new(ScriptedConnector::new(vec![vec![TransportEvent::Opened]]));
        let auth = Arc::new(MemoryAuthStore::new());
        let registry = registry_with(connector.clone(), auth.clone(), ReconnectPolicy::default());
        let user = UserId::from("u1");

        auth.save(&user, Bytes::from_static(b"creds"), HashMap::new())
            .await
            .unwrap();

        registry.start_session(&user);
        wait_for("session open", || registry.is_open(&user)).await;

        registry.shutdown().await;
        assert_eq!(registry.active_count(), 0);
        // No logout on the network, credentials and flag intact for restart
        assert_eq!(connector.logout_count(), 0);
        let record = auth.load(&user).await.unwrap();
        assert!(record.has_credentials());
        assert!(record.connected);
    }
}
