//! Session lifecycle for chat-relay.
//!
//! This crate owns the per-user connection lifecycle against the external
//! messaging network: the registry mapping users to live sessions, the
//! state machine driving pairing/open/closing transitions, the reconnection
//! policy, and the pairing-artifact rendering.
//!
//! ## Features
//!
//! - **Session Registry**: idempotent start, explicit stop, projections
//! - **State Machine**: a reducer over transport events per user
//! - **Reconnection**: fixed-delay retry, cancellable while pending
//! - **Pairing**: QR artifact rendering for device authorization
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_ingest::IngestPipeline;
//! use relay_session::{DevConnector, ReconnectPolicy, SessionRegistry};
//! use relay_storage::{MemoryAuthStore, MemoryMessageStore, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let auth = Arc::new(MemoryAuthStore::new());
//! let messages = Arc::new(MemoryMessageStore::with_default_sweep());
//! let ingest = Arc::new(IngestPipeline::with_default_retention(messages));
//!
//! let registry = SessionRegistry::new(
//!     Arc::new(DevConnector::default()),
//!     auth,
//!     ingest,
//!     ReconnectPolicy::default(),
//! );
//!
//! let projection = registry.start_session(&UserId::from("u1"));
//! println!("session state: {}", projection.state);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod pairing;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;

// Re-export main types
pub use pairing::{render_pairing_artifact, PairingError};
pub use reconnect::{DisconnectReason, ReconnectDecision, ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use registry::SessionRegistry;
pub use session::{LifecycleState, SessionProjection};
pub use transport::{
    Connection, Connector, ConnectorError, DevConnector, TransportEvent, TransportHandle,
};
