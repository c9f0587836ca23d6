//! Session lifecycle: one driver task per user owning the live transport.
//!
//! The driver is a reducer over transport events plus the current lifecycle
//! state. It renders pairing artifacts, persists credential rotations as
//! they arrive, forwards inbound messages to the ingestion pipeline, and on
//! disconnect consults the reconnection policy to either schedule another
//! attempt or tear the session down for good.

use crate::pairing;
use crate::reconnect::{DisconnectReason, ReconnectPolicy};
use crate::transport::{Connection, Connector, ConnectorError, TransportEvent};
use chrono::{DateTime, Utc};
use relay_ingest::IngestPipeline;
use relay_storage::{AuthStore, UserId};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one user's session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Loading auth state and performing the transport handshake
    Initializing,
    /// A pairing challenge is pending user authorization
    AwaitingPairing,
    /// Authenticated and receiving events
    Open,
    /// The connection ended; `reconnecting` once another attempt is scheduled
    Closing {
        /// Whether a reconnection attempt is pending
        reconnecting: bool,
    },
    /// Absorbing terminal state; only a fresh start creates a new session
    Terminated,
}

impl LifecycleState {
    /// Whether this state is absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Terminated)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Initializing => write!(f, "initializing"),
            LifecycleState::AwaitingPairing => write!(f, "awaiting-pairing"),
            LifecycleState::Open => write!(f, "open"),
            LifecycleState::Closing { reconnecting: true } => write!(f, "reconnecting"),
            LifecycleState::Closing { reconnecting: false } => write!(f, "closing"),
            LifecycleState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Caller-visible snapshot of a session
#[derive(Clone, Debug, Serialize)]
pub struct SessionProjection {
    /// Current lifecycle state
    pub state: LifecycleState,
    /// Pairing artifact, present only while awaiting pairing
    pub pairing_artifact: Option<String>,
    /// When the session last changed state
    pub last_transition: DateTime<Utc>,
}

struct SessionShared {
    lifecycle: LifecycleState,
    pairing_artifact: Option<String>,
    last_transition: DateTime<Utc>,
}

/// Shared session state: written by the driver task, read by projections.
///
/// Guarded by a std `RwLock`; critical sections never span an await.
pub(crate) struct SessionCell {
    user: UserId,
    inner: RwLock<SessionShared>,
    // Process shutdown: close the transport but keep credentials and the
    // persisted connected flag so a restart can restore the session
    draining: AtomicBool,
}

impl SessionCell {
    pub(crate) fn new(user: UserId) -> Self {
        Self {
            user,
            inner: RwLock::new(SessionShared {
                lifecycle: LifecycleState::Initializing,
                pairing_artifact: None,
                last_transition: Utc::now(),
            }),
            draining: AtomicBool::new(false),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SessionShared> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SessionShared> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `state`, clearing any pairing artifact
    pub(crate) fn transition(&self, state: LifecycleState) {
        let mut shared = self.write();
        debug!("session {}: {} -> {}", self.user, shared.lifecycle, state);
        shared.lifecycle = state;
        shared.pairing_artifact = None;
        shared.last_transition = Utc::now();
    }

    /// Move to AwaitingPairing holding the rendered artifact
    pub(crate) fn set_pairing(&self, artifact: String) {
        let mut shared = self.write();
        debug!("session {}: {} -> awaiting-pairing", self.user, shared.lifecycle);
        shared.lifecycle = LifecycleState::AwaitingPairing;
        shared.pairing_artifact = Some(artifact);
        shared.last_transition = Utc::now();
    }

    /// Snapshot for callers
    pub(crate) fn projection(&self) -> SessionProjection {
        let shared = self.read();
        SessionProjection {
            state: shared.lifecycle,
            pairing_artifact: shared.pairing_artifact.clone(),
            last_transition: shared.last_transition,
        }
    }

    pub(crate) fn set_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

/// How a driver task ended
pub(crate) enum SessionExit {
    /// Cancelled by an explicit stop or a process shutdown
    Stopped,
    /// The reconnection policy ruled the reason terminal
    Terminal(DisconnectReason),
}

/// Per-user session driver; owns the transport for the session's whole life
pub(crate) struct SessionDriver {
    pub(crate) user: UserId,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) auth: Arc<dyn AuthStore>,
    pub(crate) ingest: Arc<IngestPipeline>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) cell: Arc<SessionCell>,
    pub(crate) cancel: CancellationToken,
}

impl SessionDriver {
    /// Run the session until a terminal policy decision or cancellation
    pub(crate) async fn run(self) -> SessionExit {
        loop {
            self.cell.transition(LifecycleState::Initializing);

            let reason = match self.connect_once().await {
                Ok(Some(reason)) => reason,
                Ok(None) => {
                    // Cancelled: the transport was already logged out or
                    // closed inside the event loop
                    self.cell.transition(LifecycleState::Terminated);
                    return SessionExit::Stopped;
                }
                Err(ConnectorError::AuthRejected(detail)) => {
                    warn!("session {}: credentials rejected at connect: {}", self.user, detail);
                    DisconnectReason::AuthFailure
                }
                Err(e) => {
                    warn!("session {}: connect failed: {}", self.user, e);
                    DisconnectReason::ConnectionLost
                }
            };

            self.cell.transition(LifecycleState::Closing { reconnecting: false });
            if !self.cell.is_draining() {
                if let Err(e) = self.auth.set_connected(&self.user, false).await {
                    warn!("session {}: failed to clear connected flag: {}", self.user, e);
                }
            }

            let decision = self.policy.decide(&reason);
            if !decision.reconnect {
                info!("session {} ended for good: {}", self.user, reason);
                if reason.purges_credentials() {
                    if let Err(e) = self.auth.delete(&self.user).await {
                        warn!("session {}: failed to purge credentials: {}", self.user, e);
                    }
                }
                self.cell.transition(LifecycleState::Terminated);
                return SessionExit::Terminal(reason);
            }

            self.cell.transition(LifecycleState::Closing { reconnecting: true });
            info!(
                "session {} lost ({}); reconnecting in {:?}",
                self.user, reason, decision.delay
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.cell.transition(LifecycleState::Terminated);
                    return SessionExit::Stopped;
                }
                _ = tokio::time::sleep(decision.delay) => {}
            }
        }
    }

    /// One connection attempt: handshake plus the event loop.
    ///
    /// `Ok(Some(reason))` is a disconnect, `Ok(None)` a cancellation.
    async fn connect_once(&self) -> Result<Option<DisconnectReason>, ConnectorError> {
        let credentials = match self.auth.load(&self.user).await {
            Ok(record) => record,
            Err(e) => {
                error!("session {}: failed to load auth state: {}", self.user, e);
                return Ok(Some(DisconnectReason::Other(format!(
                    "credential load failed: {}",
                    e
                ))));
            }
        };

        let connection = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            result = self.connector.connect(&credentials) => result?,
        };

        Ok(self.drive(connection).await)
    }

    /// Reduce transport events until disconnect or cancellation
    async fn drive(&self, connection: Connection) -> Option<DisconnectReason> {
        let Connection { handle, mut events } = connection;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    if self.cell.is_draining() {
                        handle.close().await;
                    } else {
                        if let Err(e) = handle.logout().await {
                            warn!("session {}: logout failed: {}", self.user, e);
                        }
                        handle.close().await;
                    }
                    return None;
                }

                event = events.recv() => match event {
                    Some(TransportEvent::PairingChallenge { code }) => {
                        match pairing::render_pairing_artifact(&code) {
                            Ok(artifact) => {
                                info!("session {}: pairing challenge received", self.user);
                                self.cell.set_pairing(artifact);
                            }
                            Err(e) => {
                                warn!("session {}: failed to render pairing artifact: {}", self.user, e);
                            }
                        }
                    }

                    Some(TransportEvent::Opened) => {
                        info!("session {} open", self.user);
                        self.cell.transition(LifecycleState::Open);
                        if let Err(e) = self.auth.set_connected(&self.user, true).await {
                            warn!("session {}: failed to set connected flag: {}", self.user, e);
                        }
                    }

                    Some(TransportEvent::CredentialRotated { credentials, key_material }) => {
                        // Persisted per rotation, never batched; losing issued
                        // key material breaks decryption for historical peers
                        if let Err(e) = self.auth.save(&self.user, credentials, key_material).await {
                            error!("session {}: failed to persist credential rotation: {}", self.user, e);
                        }
                    }

                    Some(TransportEvent::MessageReceived { event }) => {
                        self.ingest.ingest(&self.user, event).await;
                    }

                    Some(TransportEvent::Disconnected { reason }) => {
                        handle.close().await;
                        return Some(reason);
                    }

                    None => {
                        // Event channel gone without a reason: the transport died
                        return Some(DisconnectReason::ConnectionLost);
                    }
                }
            }
        }
    }
}
