use backend::{decode_row, decode_rows, BackendHandle, Filter, Query};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, NewConversation, Profile, ProfileSummary},
};
use tracing::{debug, error, warn};

use crate::{
    error::ChatError,
    tables::{CONVERSATIONS, PROFILES},
};

/// Conversations of a user and the counterpart in each of them.
pub struct ConversationDirectory {
    backend: BackendHandle,
}

impl ConversationDirectory {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    /// Existing conversation for the unordered pair, or a new one stored as
    /// `(user_a, user_b)`.
    ///
    /// Lookup and insert are separate requests, so two simultaneous callers can
    /// both create a row unless the backend enforces the pair constraint. When
    /// it does, the losing insert comes back as a conflict and the winner is
    /// read back.
    pub async fn get_or_create(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Conversation, ChatError> {
        if let Some(existing) = self.find_between(user_a, user_b).await? {
            return Ok(existing);
        }

        let draft = NewConversation {
            participant_1_id: user_a,
            participant_2_id: user_b,
        };
        let row = serde_json::to_value(&draft).map_err(|err| ChatError::Backend(err.into()))?;
        match self.backend.database.insert(CONVERSATIONS, row).await {
            Ok(row) => {
                let conversation: Conversation = decode_row(row)?;
                debug!(conversation_id = %conversation.id, %user_a, %user_b, "directory: conversation created");
                Ok(conversation)
            }
            Err(err) if err.is_conflict() => {
                debug!(%user_a, %user_b, "directory: pair already exists, re-reading");
                self.find_between(user_a, user_b)
                    .await?
                    .ok_or(ChatError::Backend(err))
            }
            Err(err) => {
                error!(%user_a, %user_b, error = %err, "directory: failed to create conversation");
                Err(err.into())
            }
        }
    }

    /// Oldest conversation between the two users in either participant order.
    pub async fn find_between(
        &self,
        user_a: UserId,
        user_b: UserId,
    ) -> Result<Option<Conversation>, ChatError> {
        let query = Query::table(CONVERSATIONS)
            .filter(Filter::or([
                Filter::and([
                    Filter::eq("participant_1_id", user_a.to_string()),
                    Filter::eq("participant_2_id", user_b.to_string()),
                ]),
                Filter::and([
                    Filter::eq("participant_1_id", user_b.to_string()),
                    Filter::eq("participant_2_id", user_a.to_string()),
                ]),
            ]))
            .order("created_at", true);
        match self.backend.database.select_single(&query).await? {
            Some(row) => Ok(Some(decode_row(row)?)),
            None => Ok(None),
        }
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<Conversation>, ChatError> {
        let query = Query::table(CONVERSATIONS).eq("id", conversation_id.to_string());
        match self.backend.database.select_single(&query).await? {
            Some(row) => Ok(Some(decode_row(row)?)),
            None => Ok(None),
        }
    }

    /// Conversations involving `user_id`, most recent activity first and
    /// conversations without messages last. Empty on failure.
    pub async fn list_for_user(&self, user_id: UserId) -> Vec<Conversation> {
        let query = Query::table(CONVERSATIONS)
            .filter(Filter::or([
                Filter::eq("participant_1_id", user_id.to_string()),
                Filter::eq("participant_2_id", user_id.to_string()),
            ]))
            .order("last_message_at", false)
            .order("created_at", false);
        let rows = match self.backend.database.select(&query).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%user_id, error = %err, "directory: failed to list conversations");
                return Vec::new();
            }
        };
        decode_rows(CONVERSATIONS, rows)
    }

    /// The participant of `conversation_id` that is not `self_id`.
    pub async fn other_participant_id(
        &self,
        conversation_id: ConversationId,
        self_id: UserId,
    ) -> Option<UserId> {
        match self.conversation(conversation_id).await {
            Ok(Some(conversation)) => conversation.other_participant(self_id),
            Ok(None) => None,
            Err(err) => {
                warn!(%conversation_id, error = %err, "directory: conversation lookup failed");
                None
            }
        }
    }

    pub async fn profile(&self, user_id: UserId) -> Option<Profile> {
        let query = Query::table(PROFILES).eq("id", user_id.to_string());
        let row = match self.backend.database.select_single(&query).await {
            Ok(row) => row?,
            Err(err) => {
                warn!(%user_id, error = %err, "directory: profile lookup failed");
                return None;
            }
        };
        match decode_row(row) {
            Ok(profile) => Some(profile),
            Err(err) => {
                warn!(%user_id, error = %err, "directory: undecodable profile row");
                None
            }
        }
    }

    /// Display data for the counterpart; the placeholder summary when either
    /// the conversation or the profile cannot be resolved.
    pub async fn resolve_other_participant(
        &self,
        conversation_id: ConversationId,
        self_id: UserId,
    ) -> ProfileSummary {
        let Some(other) = self.other_participant_id(conversation_id, self_id).await else {
            return ProfileSummary::unknown();
        };
        match self.profile(other).await {
            Some(profile) => ProfileSummary::from(profile),
            None => ProfileSummary::unknown(),
        }
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
