//! In-memory storage backend with a periodic expiry sweep

use crate::{
    AuthStore, ConversationSummary, CredentialRecord, MessageCounts, MessageRecord, MessageStore,
    StorageError, UserId,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default interval between expiry sweeps
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory credential store
pub struct MemoryAuthStore {
    records: Arc<DashMap<UserId, CredentialRecord>>,
}

impl MemoryAuthStore {
    /// Create a new in-memory credential store
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
        }
    }
}

impl Default for MemoryAuthStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn load(&self, user: &UserId) -> Result<CredentialRecord, StorageError> {
        let record = self
            .records
            .entry(user.clone())
            .or_insert_with(|| CredentialRecord::fresh(user.clone()));
        Ok(record.clone())
    }

    async fn save(
        &self,
        user: &UserId,
        credentials: Bytes,
        key_material_delta: HashMap<String, Bytes>,
    ) -> Result<(), StorageError> {
        debug!(
            "auth save user={} keys_delta={} cred_len={}",
            user,
            key_material_delta.len(),
            credentials.len()
        );

        let mut record = self
            .records
            .entry(user.clone())
            .or_insert_with(|| CredentialRecord::fresh(user.clone()));
        record.key_material.extend(key_material_delta);
        record.credentials = credentials;
        record.last_connected_at = Some(Utc::now());

        Ok(())
    }

    async fn set_connected(&self, user: &UserId, connected: bool) -> Result<(), StorageError> {
        // Only flags existing records; a deleted user stays deleted
        if let Some(mut record) = self.records.get_mut(user) {
            record.connected = connected;
        }
        Ok(())
    }

    async fn delete(&self, user: &UserId) -> Result<(), StorageError> {
        if self.records.remove(user).is_some() {
            debug!("auth delete user={}", user);
        }
        Ok(())
    }

    async fn connected_users(&self) -> Result<Vec<UserId>, StorageError> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.value().connected)
            .map(|entry| entry.key().clone())
            .collect())
    }
}

/// In-memory message store keyed on the transport-assigned message ID.
///
/// Expired records are filtered from every read and physically removed by a
/// background sweep task.
pub struct MemoryMessageStore {
    records: Arc<DashMap<String, MessageRecord>>,
    sweep: tokio::task::JoinHandle<()>,
}

impl MemoryMessageStore {
    /// Create a store sweeping expired records at the given interval
    pub fn new(sweep_interval: Duration) -> Self {
        let records: Arc<DashMap<String, MessageRecord>> = Arc::new(DashMap::new());

        let sweep_records = Arc::clone(&records);
        let sweep = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let before = sweep_records.len();
                let now = Utc::now();
                sweep_records.retain(|_, record| record.expires_at > now);
                let removed = before.saturating_sub(sweep_records.len());
                if removed > 0 {
                    debug!("swept {} expired message records", removed);
                }
            }
        });

        Self { records, sweep }
    }

    /// Create a store with the default sweep interval
    pub fn with_default_sweep() -> Self {
        Self::new(DEFAULT_SWEEP_INTERVAL)
    }

    fn live_for_user<'a>(
        records: &'a DashMap<String, MessageRecord>,
        user: &'a UserId,
    ) -> impl Iterator<Item = MessageRecord> + 'a {
        let now = Utc::now();
        records.iter().filter_map(move |entry| {
            let record = entry.value();
            if record.user_id == *user && record.expires_at > now {
                Some(record.clone())
            } else {
                None
            }
        })
    }
}

impl Drop for MemoryMessageStore {
    fn drop(&mut self) {
        self.sweep.abort();
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn insert(&self, record: MessageRecord) -> Result<bool, StorageError> {
        use dashmap::mapref::entry::Entry;

        match self.records.entry(record.message_id.clone()) {
            Entry::Occupied(mut occupied) => {
                // An expired record the sweep has not reached yet counts as
                // absent; a live one makes this a duplicate no-op.
                if occupied.get().expires_at > Utc::now() {
                    debug!("duplicate message {} ignored", record.message_id);
                    Ok(false)
                } else {
                    occupied.insert(record);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn conversation_messages(
        &self,
        user: &UserId,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let mut messages: Vec<MessageRecord> = Self::live_for_user(&self.records, user)
            .filter(|record| record.conversation_id == conversation_id)
            .collect();

        messages.sort_by(|a, b| {
            a.origin_timestamp
                .cmp(&b.origin_timestamp)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        messages.truncate(limit);

        Ok(messages)
    }

    async fn conversations(&self, user: &UserId) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut grouped: HashMap<String, ConversationSummary> = HashMap::new();

        for record in Self::live_for_user(&self.records, user) {
            let summary = grouped
                .entry(record.conversation_id.clone())
                .or_insert_with(|| ConversationSummary {
                    conversation_id: record.conversation_id.clone(),
                    display_name: None,
                    message_count: 0,
                    last_message_at: None,
                });
            summary.message_count += 1;

            // Display name is best-effort from the newest message carrying one
            let is_newer = summary
                .last_message_at
                .map_or(true, |last| record.origin_timestamp >= last);
            if is_newer {
                summary.last_message_at = Some(record.origin_timestamp);
                if record.conversation_name.is_some() {
                    summary.display_name = record.conversation_name.clone();
                }
            } else if summary.display_name.is_none() {
                summary.display_name = record.conversation_name.clone();
            }
        }

        let mut summaries: Vec<ConversationSummary> = grouped.into_values().collect();
        summaries.sort_by(|a, b| {
            b.message_count
                .cmp(&a.message_count)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });

        Ok(summaries)
    }

    async fn counts(&self, user: &UserId) -> Result<MessageCounts, StorageError> {
        let mut counts = MessageCounts::default();
        let mut seen_conversations = std::collections::HashSet::new();

        for record in Self::live_for_user(&self.records, user) {
            counts.messages += 1;
            if seen_conversations.insert(record.conversation_id) {
                counts.conversations += 1;
            }
        }

        Ok(counts)
    }
}
