//! Credential and message persistence for chat-relay.
//!
//! This crate provides the storage layer backing the session core: per-user
//! credential records that survive process restarts, and short-retention
//! message records deduplicated on their transport-assigned message ID.
//! Backends are pluggable (in-memory, Redis).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Opaque stable user identifier
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// Per-user cryptographic session material needed to resume a protocol
/// session without re-pairing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Owning user
    pub user_id: UserId,
    /// Opaque credential blob, round-tripped byte-for-byte
    pub credentials: Bytes,
    /// Incremental key material, keyed by key identifier; grows over the
    /// session's life and is never wholesale-replaced after creation
    pub key_material: HashMap<String, Bytes>,
    /// Whether the user's session was open at last persistence
    pub connected: bool,
    /// Timestamp of the most recent credential save
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    /// A freshly materialized record for a user with no stored credentials.
    ///
    /// Every substructure is present and empty; the transport must never see
    /// a partially-shaped record.
    pub fn fresh(user_id: UserId) -> Self {
        Self {
            user_id,
            credentials: Bytes::new(),
            key_material: HashMap::new(),
            connected: false,
            last_connected_at: None,
        }
    }

    /// Whether this record has ever completed a pairing.
    pub fn has_credentials(&self) -> bool {
        !self.credentials.is_empty()
    }
}

/// One ingested text message, retained for a fixed window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Owning user
    pub user_id: UserId,
    /// Stable identifier of the chat this message belongs to
    pub conversation_id: String,
    /// Best-effort human-readable chat name
    pub conversation_name: Option<String>,
    /// Transport-assigned message ID; globally unique dedup key
    pub message_id: String,
    /// Message author
    pub sender: String,
    /// Extracted text content
    pub content: String,
    /// Original send time, unix seconds
    pub origin_timestamp: i64,
    /// Insertion time plus the retention window; the store drops the record
    /// once this passes
    pub expires_at: DateTime<Utc>,
}

/// Aggregate view of one conversation for listing and search.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Stable identifier of the chat
    pub conversation_id: String,
    /// Best-effort display name, from the newest message that carried one
    pub display_name: Option<String>,
    /// Number of retained messages in this conversation
    pub message_count: u64,
    /// Origin timestamp of the newest retained message, unix seconds
    pub last_message_at: Option<i64>,
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Backend-specific error
    #[error("backend error: {0}")]
    Backend(String),
    /// Invalid operation
    #[error("invalid operation: {0}")]
    Invalid(String),
}

/// Auth-state store: one credential record per user, with a lifetime
/// independent of any live session.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Return the user's record, synthesizing and persisting a fresh one if
    /// none exists. Never returns a record with absent substructures.
    async fn load(&self, user: &UserId) -> Result<CredentialRecord, StorageError>;

    /// Merge new key material into the existing mapping and overwrite the
    /// credential blob with the latest rotation. Stamps `last_connected_at`.
    async fn save(
        &self,
        user: &UserId,
        credentials: Bytes,
        key_material_delta: HashMap<String, Bytes>,
    ) -> Result<(), StorageError>;

    /// Persist the connection flag for status queries and the startup
    /// restoration sweep.
    async fn set_connected(&self, user: &UserId, connected: bool) -> Result<(), StorageError>;

    /// Remove the record entirely. Used on explicit logout or unrecoverable
    /// auth failure, never on transient disconnect.
    async fn delete(&self, user: &UserId) -> Result<(), StorageError>;

    /// Users whose connection flag is set; drives session restoration.
    async fn connected_users(&self) -> Result<Vec<UserId>, StorageError>;
}

/// Totals returned by [`MessageStore::counts`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageCounts {
    /// Distinct conversations with at least one retained message
    pub conversations: u64,
    /// Total retained messages
    pub messages: u64,
}

/// Message store: deduplicated, time-bounded message records.
///
/// Expiry is the store's job: reads never return records past `expires_at`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a record unless one with the same `message_id` already exists.
    /// Returns `false` for the duplicate no-op.
    async fn insert(&self, record: MessageRecord) -> Result<bool, StorageError>;

    /// Messages for one conversation, oldest first, up to `limit`.
    async fn conversation_messages(
        &self,
        user: &UserId,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// All of a user's conversations, ordered by message count descending.
    async fn conversations(&self, user: &UserId) -> Result<Vec<ConversationSummary>, StorageError>;

    /// Aggregate totals for status queries.
    async fn counts(&self, user: &UserId) -> Result<MessageCounts, StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug)]
pub enum StorageMode {
    /// In-memory storage with a periodic expiry sweep (dev/tests and
    /// single-node deployments)
    InMemory,
    /// Redis as primary storage, expiry via native key TTLs
    Redis {
        /// Redis connection URL
        url: String,
    },
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::InMemory
    }
}

/// Combined storage interface handed to the session core.
pub struct Storage {
    /// Credential persistence
    pub auth: Arc<dyn AuthStore>,
    /// Message persistence
    pub messages: Arc<dyn MessageStore>,
}

// Re-export backend implementations
pub use backend::mem::{MemoryAuthStore, MemoryMessageStore};
#[cfg(feature = "redis-backend")]
pub use backend::redis::{RedisAuthStore, RedisMessageStore};

impl Storage {
    /// Create storage from configuration
    pub async fn from_mode(mode: StorageMode) -> Result<Self, StorageError> {
        match mode {
            StorageMode::InMemory => Ok(Storage {
                auth: Arc::new(MemoryAuthStore::new()),
                messages: Arc::new(MemoryMessageStore::with_default_sweep()),
            }),
            #[cfg(feature = "redis-backend")]
            StorageMode::Redis { url } => {
                let auth = backend::redis::RedisAuthStore::connect(&url).await?;
                let messages = backend::redis::RedisMessageStore::connect(&url).await?;
                Ok(Storage {
                    auth: Arc::new(auth),
                    messages: Arc::new(messages),
                })
            }
            #[cfg(not(feature = "redis-backend"))]
            StorageMode::Redis { .. } => Err(StorageError::Invalid(
                "redis storage requires the redis-backend feature".to_string(),
            )),
        }
    }
}
