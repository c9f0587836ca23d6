//! Inbound event ingestion for chat-relay.
//!
//! Converts raw protocol events into deduplicated, time-bounded message
//! records. The transport can redeliver events after reconnects, so the
//! pipeline rejects anything whose message ID is already stored; non-text
//! events are discarded outright. A persistence failure is logged and
//! swallowed; a dropped message must never stall the session's event loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

use chrono::{Duration as ChronoDuration, Utc};
use relay_storage::{MessageRecord, MessageStore, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default retention window for ingested messages
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Payload carried by a raw inbound event.
///
/// Only text is ingested; media and system events are out of scope and
/// discarded by the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventContent {
    /// Plain text message body
    Text(String),
    /// Media attachment of some kind (image, audio, document, ...)
    Media {
        /// Transport-reported media kind, kept for logging only
        kind: String,
    },
    /// Protocol/system event with no user-visible body
    System,
}

impl EventContent {
    /// Extractable text, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            EventContent::Text(body) => Some(body),
            _ => None,
        }
    }
}

/// Raw inbound event envelope as handed over by the transport
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawMessageEvent {
    /// Transport-assigned message ID, globally unique per conversation
    pub message_id: String,
    /// Stable identifier of the chat
    pub conversation_id: String,
    /// Best-effort chat display name from the event envelope
    pub conversation_name: Option<String>,
    /// Message author
    pub sender: String,
    /// Original send time, unix seconds
    pub origin_timestamp: i64,
    /// Event payload
    pub content: EventContent,
}

/// Converts raw inbound events into persisted message records
pub struct IngestPipeline {
    store: Arc<dyn MessageStore>,
    retention: ChronoDuration,
}

impl IngestPipeline {
    /// Create a pipeline writing into `store` with the given retention window
    pub fn new(store: Arc<dyn MessageStore>, retention: Duration) -> Self {
        let retention = ChronoDuration::from_std(retention)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        Self { store, retention }
    }

    /// Create a pipeline with the default 24 h retention window
    pub fn with_default_retention(store: Arc<dyn MessageStore>) -> Self {
        Self::new(store, DEFAULT_RETENTION)
    }

    /// Ingest one raw event for `user`.
    ///
    /// Returns the stored record, or `None` when the event was discarded
    /// (no text), deduplicated, or lost to a persistence failure. Never
    /// errors back into the caller's event loop.
    pub async fn ingest(&self, user: &UserId, event: RawMessageEvent) -> Option<MessageRecord> {
        let Some(text) = event.content.text() else {
            debug!(
                "discarding non-text event {} in conversation {}",
                event.message_id, event.conversation_id
            );
            return None;
        };

        let record = MessageRecord {
            user_id: user.clone(),
            conversation_id: event.conversation_id,
            conversation_name: event.conversation_name,
            message_id: event.message_id,
            sender: event.sender,
            content: text.to_string(),
            origin_timestamp: event.origin_timestamp,
            expires_at: Utc::now() + self.retention,
        };

        match self.store.insert(record.clone()).await {
            Ok(true) => Some(record),
            Ok(false) => {
                debug!("duplicate delivery of message {} absorbed", record.message_id);
                None
            }
            Err(e) => {
                warn!(
                    "dropping message {} for user {}: persistence failed: {}",
                    record.message_id, user, e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_storage::{
        ConversationSummary, MemoryMessageStore, MessageCounts, StorageError,
    };

    fn text_event(msg_id: &str, conv: &str, body: &str) -> RawMessageEvent {
        RawMessageEvent {
            message_id: msg_id.to_string(),
            conversation_id: conv.to_string(),
            conversation_name: Some("Test Chat".to_string()),
            sender: "alice".to_string(),
            origin_timestamp: 1_700_000_000,
            content: EventContent::Text(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_ingest_persists_text_with_retention_stamp() {
        let store = Arc::new(MemoryMessageStore::with_default_sweep());
        let pipeline = IngestPipeline::new(store.clone(), Duration::from_secs(3600));
        let user = UserId::from("u1");

        let before = Utc::now();
        let record = pipeline
            .ingest(&user, text_event("m1", "c1", "hello"))
            .await
            .expect("text event should be stored");
        let after = Utc::now();

        assert_eq!(record.content, "hello");
        assert!(record.expires_at >= before + ChronoDuration::seconds(3600));
        assert!(record.expires_at <= after + ChronoDuration::seconds(3600));
        assert_eq!(store.counts(&user).await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_ingest_discards_non_text_events() {
        let store = Arc::new(MemoryMessageStore::with_default_sweep());
        let pipeline = IngestPipeline::with_default_retention(store.clone());
        let user = UserId::from("u1");

        let mut media = text_event("m1", "c1", "");
        media.content = EventContent::Media {
            kind: "image".to_string(),
        };
        assert!(pipeline.ingest(&user, media).await.is_none());

        let mut system = text_event("m2", "c1", "");
        system.content = EventContent::System;
        assert!(pipeline.ingest(&user, system).await.is_none());

        assert_eq!(store.counts(&user).await.unwrap(), MessageCounts::default());
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_silently_absorbed() {
        let store = Arc::new(MemoryMessageStore::with_default_sweep());
        let pipeline = IngestPipeline::with_default_retention(store.clone());
        let user = UserId::from("u1");

        assert!(pipeline
            .ingest(&user, text_event("m1", "c1", "first"))
            .await
            .is_some());
        assert!(pipeline
            .ingest(&user, text_event("m1", "c1", "redelivered"))
            .await
            .is_none());

        let messages = store.conversation_messages(&user, "c1", 500).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "first");
    }

    /// Store that fails every insert
    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn insert(&self, _record: MessageRecord) -> Result<bool, StorageError> {
            Err(StorageError::Backend("injected failure".to_string()))
        }

        async fn conversation_messages(
            &self,
            _user: &UserId,
            _conversation_id: &str,
            _limit: usize,
        ) -> Result<Vec<MessageRecord>, StorageError> {
            Ok(Vec::new())
        }

        async fn conversations(
            &self,
            _user: &UserId,
        ) -> Result<Vec<ConversationSummary>, StorageError> {
            Ok(Vec::new())
        }

        async fn counts(&self, _user: &UserId) -> Result<MessageCounts, StorageError> {
            Ok(MessageCounts::default())
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let pipeline = IngestPipeline::with_default_retention(Arc::new(FailingStore));
        let user = UserId::from("u1");

        // Logged and dropped, never an error
        assert!(pipeline
            .ingest(&user, text_event("m1", "c1", "hello"))
            .await
            .is_none());
    }
}
