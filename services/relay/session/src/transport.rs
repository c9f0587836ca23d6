//! Transport seam between the session core and the external messaging
//! protocol.
//!
//! The live protocol connection is opaque to this crate: a [`Connector`]
//! performs the handshake and hands back a [`Connection`]: an exclusive
//! control handle plus a stream of [`TransportEvent`]s the session state
//! machine reduces over. Real protocol clients implement these traits
//! outside this repository; [`DevConnector`] is a development stand-in.

use crate::reconnect::DisconnectReason;
use async_trait::async_trait;
use bytes::Bytes;
use relay_ingest::RawMessageEvent;
use relay_storage::CredentialRecord;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// Events emitted by a live transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The server issued a pairing challenge; the user must authorize this
    /// device before the session can open
    PairingChallenge {
        /// Raw challenge string to render into a scannable artifact
        code: String,
    },
    /// The session is authenticated and open
    Opened,
    /// The server issued updated session credentials that must be persisted
    /// to allow reconnection without re-pairing
    CredentialRotated {
        /// Latest credential blob, replaces the stored one
        credentials: Bytes,
        /// Incremental key material to merge into the stored mapping
        key_material: HashMap<String, Bytes>,
    },
    /// An inbound message event arrived
    MessageReceived {
        /// Raw event envelope for the ingestion pipeline
        event: RawMessageEvent,
    },
    /// The connection ended
    Disconnected {
        /// Why, as reported by the transport
        reason: DisconnectReason,
    },
}

/// Connector errors
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// The protocol handshake failed
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The stored credentials were rejected during connect
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    /// Transport-level I/O failure
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive control handle over one live protocol connection
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Request a server-side sign-out of this device
    async fn logout(&self) -> Result<(), ConnectorError>;

    /// Tear down the connection without signing out
    async fn close(&self);
}

/// A live connection: control handle plus the inbound event stream
pub struct Connection {
    /// Control handle, owned exclusively by the session driver
    pub handle: Box<dyn TransportHandle>,
    /// Inbound events; the channel closing means the connection died
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens protocol connections for the session state machine
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform the handshake with the user's stored credentials.
    ///
    /// Fresh (empty) credentials lead to a [`TransportEvent::PairingChallenge`]
    /// on the returned stream; valid stored credentials resume silently with
    /// [`TransportEvent::Opened`].
    async fn connect(&self, credentials: &CredentialRecord) -> Result<Connection, ConnectorError>;
}

/// Development stand-in transport.
///
/// Resumes immediately when credentials exist; otherwise emits a pairing
/// challenge and auto-confirms it after a short delay, issuing a first
/// credential rotation the way a real pairing would. Dev/tests only.
pub struct DevConnector {
    confirm_delay: std::time::Duration,
}

impl DevConnector {
    /// Stand-in connector auto-confirming pairing after `confirm_delay`
    pub fn new(confirm_delay: std::time::Duration) -> Self {
        Self { confirm_delay }
    }
}

impl Default for DevConnector {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(2))
    }
}

struct DevHandle {
    // Keeps the event channel open until the driver drops the connection
    _event_tx: mpsc::Sender<TransportEvent>,
}

#[async_trait]
impl TransportHandle for DevHandle {
    async fn logout(&self) -> Result<(), ConnectorError> {
        info!("dev transport: logout requested");
        Ok(())
    }

    async fn close(&self) {}
}

#[async_trait]
impl Connector for DevConnector {
    async fn connect(&self, credentials: &CredentialRecord) -> Result<Connection, ConnectorError> {
        let (event_tx, events) = mpsc::channel(16);
        let user = credentials.user_id.clone();

        if credentials.has_credentials() {
            info!("dev transport: silent resume for user {}", user);
            event_tx
                .send(TransportEvent::Opened)
                .await
                .map_err(|_| ConnectorError::Handshake("event channel closed".to_string()))?;
        } else {
            let challenge = format!(
                "relay-pair://{}?issued={}",
                user,
                chrono::Utc::now().timestamp()
            );
            event_tx
                .send(TransportEvent::PairingChallenge { code: challenge })
                .await
                .map_err(|_| ConnectorError::Handshake("event channel closed".to_string()))?;

            let confirm_tx = event_tx.clone();
            let delay = self.confirm_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;

                let mut key_material = HashMap::new();
                key_material.insert(
                    "dev-signal-key".to_string(),
                    Bytes::from(format!("key-material-{}", user)),
                );
                let rotated = TransportEvent::CredentialRotated {
                    credentials: Bytes::from(format!("dev-session-{}", user)),
                    key_material,
                };
                if confirm_tx.send(rotated).await.is_err() {
                    return;
                }
                let _ = confirm_tx.send(TransportEvent::Opened).await;
                info!("dev transport: pairing auto-confirmed for user {}", user);
            });
        }

        Ok(Connection {
            handle: Box::new(DevHandle {
                _event_tx: event_tx,
            }),
            events,
        })
    }
}
