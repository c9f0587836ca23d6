//! Operations facade for chat-relay.
//!
//! The contract the HTTP front door invokes on the session core. Responses
//! are serde-serializable value types; the front door owns the wire format.
//! Raw transport failures never cross this boundary; they collapse into a
//! `connected: false` somewhere upstream.

#![warn(missing_docs)]
#![warn(clippy::all)]

use relay_session::{LifecycleState, SessionRegistry};
use relay_storage::{ConversationSummary, MessageRecord, MessageStore, StorageError, UserId};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Hard cap on messages returned for one conversation
pub const MAX_CONVERSATION_MESSAGES: usize = 500;

/// Hard cap on conversation search results
pub const MAX_SEARCH_RESULTS: usize = 10;

/// Response to `connect` and `pairing_artifact`
#[derive(Clone, Debug, Serialize)]
pub struct ConnectResponse {
    /// Whether the user's session is open
    pub connected: bool,
    /// Pairing artifact, present only while a pairing is pending
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_artifact: Option<String>,
}

/// Response to `status`
#[derive(Clone, Debug, Serialize)]
pub struct StatusResponse {
    /// Whether the user's session is open
    pub connected: bool,
    /// Distinct conversations with retained messages
    pub total_conversations: u64,
    /// Total retained messages
    pub total_messages: u64,
}

/// Response to `disconnect`
#[derive(Clone, Debug, Serialize)]
pub struct DisconnectResponse {
    /// Whether a session existed and was stopped
    pub success: bool,
}

/// The operations the front door calls into
pub struct RelayApi {
    registry: Arc<SessionRegistry>,
    messages: Arc<dyn MessageStore>,
}

impl RelayApi {
    /// Facade over the given registry and message store
    pub fn new(registry: Arc<SessionRegistry>, messages: Arc<dyn MessageStore>) -> Self {
        Self { registry, messages }
    }

    /// Start (or reuse) the user's session. Idempotent: concurrent calls
    /// never surface a conflict and never open a second transport.
    pub fn connect(&self, user: &UserId) -> ConnectResponse {
        let projection = self.registry.start_session(user);
        ConnectResponse {
            connected: projection.state == LifecycleState::Open,
            pairing_artifact: projection.pairing_artifact,
        }
    }

    /// Current pairing artifact, if one is pending. An absent artifact is a
    /// not-found condition, not an error.
    pub fn pairing_artifact(&self, user: &UserId) -> ConnectResponse {
        match self.registry.get_session(user) {
            Some(projection) => ConnectResponse {
                connected: projection.state == LifecycleState::Open,
                pairing_artifact: projection.pairing_artifact,
            },
            None => ConnectResponse {
                connected: false,
                pairing_artifact: None,
            },
        }
    }

    /// Connection state and message totals
    pub async fn status(&self, user: &UserId) -> Result<StatusResponse, StorageError> {
        let counts = self.messages.counts(user).await?;
        Ok(StatusResponse {
            connected: self.registry.is_open(user),
            total_conversations: counts.conversations,
            total_messages: counts.messages,
        })
    }

    /// Stop the user's session and purge its credentials
    pub async fn disconnect(&self, user: &UserId) -> DisconnectResponse {
        DisconnectResponse {
            success: self.registry.stop_session(user).await,
        }
    }

    /// All conversations, busiest first
    pub async fn conversations(
        &self,
        user: &UserId,
    ) -> Result<Vec<ConversationSummary>, StorageError> {
        self.messages.conversations(user).await
    }

    /// Messages of one conversation, oldest first, capped
    pub async fn conversation_messages(
        &self,
        user: &UserId,
        conversation_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.messages
            .conversation_messages(user, conversation_id, MAX_CONVERSATION_MESSAGES)
            .await
    }

    /// Top conversations whose id or display name contains `term`,
    /// case-insensitively, busiest first. The summarization collaborator
    /// consumes the top match.
    pub async fn find_conversation(
        &self,
        user: &UserId,
        term: &str,
    ) -> Result<Vec<ConversationSummary>, StorageError> {
        let needle = term.to_lowercase();
        let mut matches: Vec<ConversationSummary> = self
            .messages
            .conversations(user)
            .await?
            .into_iter()
            .filter(|summary| {
                summary.conversation_id.to_lowercase().contains(&needle)
                    || summary
                        .display_name
                        .as_ref()
                        .map_or(false, |name| name.to_lowercase().contains(&needle))
            })
            .collect();
        matches.truncate(MAX_SEARCH_RESULTS);

        debug!(
            "find_conversation user={} term={:?} matches={}",
            user,
            term,
            matches.len()
        );
        Ok(matches)
    }
}
