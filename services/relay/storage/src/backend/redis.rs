//! Redis storage backend, expiry via native key TTLs
//!
//! Key layout:
//! - `cred:{user}` JSON credential metadata, `credkeys:{user}` hash of key
//!   material (HSET gives the merge semantics credential rotation needs)
//! - `msg:{message_id}` JSON message record written with `SET NX EX`, which
//!   makes dedup and retention a single atomic command
//! - `convs:{user}` set of conversation IDs and `convidx:{user}:{conv}`
//!   sorted sets (score = origin timestamp) as read indexes; index members
//!   whose record key has expired are pruned lazily on read

use crate::{
    AuthStore, ConversationSummary, CredentialRecord, MessageCounts, MessageRecord, MessageStore,
    StorageError, UserId,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

fn backend_err(err: redis::RedisError) -> StorageError {
    StorageError::Backend(err.to_string())
}

async fn open(url: &str) -> Result<ConnectionManager, StorageError> {
    let client = redis::Client::open(url).map_err(backend_err)?;
    client.get_connection_manager().await.map_err(backend_err)
}

/// Credential metadata persisted alongside the key-material hash
#[derive(Serialize, Deserialize)]
struct CredMeta {
    user_id: UserId,
    credentials: Vec<u8>,
    connected: bool,
    last_connected_at: Option<DateTime<Utc>>,
}

fn cred_key(user: &UserId) -> String {
    format!("cred:{}", user)
}

fn cred_keys_key(user: &UserId) -> String {
    format!("credkeys:{}", user)
}

const CONNECTED_SET: &str = "cred:connected";

/// Redis credential store
pub struct RedisAuthStore {
    conn: ConnectionManager,
}

impl RedisAuthStore {
    /// Connect to Redis at the given URL
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Ok(Self { conn: open(url).await? })
    }

    async fn read_meta(&self, user: &UserId) -> Result<Option<CredMeta>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(cred_key(user)).await.map_err(backend_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_meta(&self, meta: &CredMeta) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(meta)?;
        conn.set::<_, _, ()>(cred_key(&meta.user_id), json)
            .await
            .map_err(backend_err)
    }
}

#[async_trait]
impl AuthStore for RedisAuthStore {
    async fn load(&self, user: &UserId) -> Result<CredentialRecord, StorageError> {
        if let Some(meta) = self.read_meta(user).await? {
            let mut conn = self.conn.clone();
            let raw_keys: HashMap<String, Vec<u8>> = conn
                .hgetall(cred_keys_key(user))
                .await
                .map_err(backend_err)?;
            let key_material = raw_keys
                .into_iter()
                .map(|(id, bytes)| (id, Bytes::from(bytes)))
                .collect();
            return Ok(CredentialRecord {
                user_id: meta.user_id,
                credentials: Bytes::from(meta.credentials),
                key_material,
                connected: meta.connected,
                last_connected_at: meta.last_connected_at,
            });
        }

        // Materialize and persist a fresh, fully-shaped record
        let meta = CredMeta {
            user_id: user.clone(),
            credentials: Vec::new(),
            connected: false,
            last_connected_at: None,
        };
        self.write_meta(&meta).await?;
        Ok(CredentialRecord::fresh(user.clone()))
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

        if !key_material_delta.is_empty() {
            let mut conn = self.conn.clone();
            let items: Vec<(String, Vec<u8>)> = key_material_delta
                .into_iter()
                .map(|(id, bytes)| (id, bytes.to_vec()))
                .collect();
            conn.hset_multiple::<_, _, _, ()>(cred_keys_key(user), &items)
                .await
                .map_err(backend_err)?;
        }

        let mut meta = match self.read_meta(user).await? {
            Some(meta) => meta,
            None => CredMeta {
                user_id: user.clone(),
                credentials: Vec::new(),
                connected: false,
                last_connected_at: None,
            },
        };
        meta.credentials = credentials.to_vec();
        meta.last_connected_at = Some(Utc::now());
        self.write_meta(&meta).await
    }

    async fn set_connected(&self, user: &UserId, connected: bool) -> Result<(), StorageError> {
        let Some(mut meta) = self.read_meta(user).await? else {
            // Only flags existing records; a deleted user stays deleted
            return Ok(());
        };
        meta.connected = connected;
        self.write_meta(&meta).await?;

        let mut conn = self.conn.clone();
        if connected {
            conn.sadd::<_, _, ()>(CONNECTED_SET, user.0.clone())
                .await
                .map_err(backend_err)
        } else {
            conn.srem::<_, _, ()>(CONNECTED_SET, user.0.clone())
                .await
                .map_err(backend_err)
        }
    }

    async fn delete(&self, user: &UserId) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>((cred_key(user), cred_keys_key(user)))
            .await
            .map_err(backend_err)?;
        conn.srem::<_, _, ()>(CONNECTED_SET, user.0.clone())
            .await
            .map_err(backend_err)?;
        debug!("auth delete user={}", user);
        Ok(())
    }

    async fn connected_users(&self) -> Result<Vec<UserId>, StorageError> {
        let mut conn = self.conn.clone();
        let users: Vec<String> = conn.smembers(CONNECTED_SET).await.map_err(backend_err)?;
        Ok(users.into_iter().map(UserId).collect())
    }
}

fn msg_key(message_id: &str) -> String {
    format!("msg:{}", message_id)
}

fn convs_key(user: &UserId) -> String {
    format!("convs:{}", user)
}

fn convidx_key(user: &UserId, conversation_id: &str) -> String {
    format!("convidx:{}:{}", user, conversation_id)
}

/// Redis message store
pub struct RedisMessageStore {
    conn: ConnectionManager,
}

impl RedisMessageStore {
    /// Connect to Redis at the given URL
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        Ok(Self { conn: open(url).await? })
    }

    /// Live records for one conversation, oldest first. Index members whose
    /// record key has already expired are removed as a side effect.
    async fn live_conversation(
        &self,
        user: &UserId,
        conversation_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let mut conn = self.conn.clone();
        let index = convidx_key(user, conversation_id);
        let ids: Vec<String> = conn.zrange(&index, 0, -1).await.map_err(backend_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| msg_key(id)).collect();
        let raw: Vec<Option<String>> = conn.mget(&keys).await.map_err(backend_err)?;

        let mut records = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for (id, value) in ids.into_iter().zip(raw) {
            match value {
                Some(json) => records.push(serde_json::from_str(&json)?),
                None => stale.push(id),
            }
        }
        if !stale.is_empty() {
            debug!("pruning {} expired index entries from {}", stale.len(), index);
            conn.zrem::<_, _, ()>(&index, stale).await.map_err(backend_err)?;
        }

        Ok(records)
    }
}

#[async_trait]
impl MessageStore for RedisMessageStore {
    async fn insert(&self, record: MessageRecord) -> Result<bool, StorageError> {
        let ttl_secs = (record.expires_at - Utc::now()).num_seconds().max(1);
        let json = serde_json::to_string(&record)?;

        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(msg_key(&record.message_id))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await
            .map_err(backend_err)?;
        if reply.is_none() {
            debug!("duplicate message {} ignored", record.message_id);
            return Ok(false);
        }

        let index = convidx_key(&record.user_id, &record.conversation_id);
        conn.zadd::<_, _, _, ()>(&index, record.message_id.clone(), record.origin_timestamp)
            .await
            .map_err(backend_err)?;
        conn.expire::<_, ()>(&index, ttl_secs).await.map_err(backend_err)?;

        let convs = convs_key(&record.user_id);
        conn.sadd::<_, _, ()>(&convs, record.conversation_id.clone())
            .await
            .map_err(backend_err)?;
        conn.expire::<_, ()>(&convs, ttl_secs).await.map_err(backend_err)?;

        Ok(true)
    }

    async fn conversation_messages(
        &self,
        user: &UserId,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let mut records = self.live_conversation(user, conversation_id).await?;
        records.truncate(limit);
        Ok(records)
    }

    async fn conversations(&self, user: &UserId) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut conn = self.conn.clone();
        let conversation_ids: Vec<String> =
            conn.smembers(convs_key(user)).await.map_err(backend_err)?;

        let mut summaries = Vec::new();
        for conversation_id in conversation_ids {
            let records = self.live_conversation(user, &conversation_id).await?;
            if records.is_empty() {
                conn.srem::<_, _, ()>(convs_key(user), conversation_id)
                    .await
                    .map_err(backend_err)?;
                continue;
            }

            let display_name = records
                .iter()
                .rev()
                .find_map(|record| record.conversation_name.clone());
            let last_message_at = records.last().map(|record| record.origin_timestamp);
            summaries.push(ConversationSummary {
                conversation_id,
                display_name,
                message_count: records.len() as u64,
                last_message_at,
            });
        }

        summaries.sort_by(|a, b| {
            b.message_count
                .cmp(&a.message_count)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        Ok(summaries)
    }

    async fn counts(&self, user: &UserId) -> Result<MessageCounts, StorageError> {
        let summaries = self.conversations(user).await?;
        Ok(MessageCounts {
            conversations: summaries.len() as u64,
            messages: summaries.iter().map(|summary| summary.message_count).sum(),
        })
    }
}
