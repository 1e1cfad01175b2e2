use std::sync::Arc;

use backend::{decode_row, decode_rows, BackendError, BackendHandle, Filter, Query};
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use shared::{
    domain::{ConversationId, MediaKind, MessageId, UserId},
    protocol::{Message, NewMessage},
};
use tracing::{debug, error, warn};

use crate::{notifications::NotificationDispatcher, tables::MESSAGES};

/// Paginated reads and writes of the messages of one conversation.
pub struct MessageStore {
    backend: BackendHandle,
    notifier: Option<Arc<NotificationDispatcher>>,
}

impl MessageStore {
    pub fn new(backend: BackendHandle) -> Self {
        Self {
            backend,
            notifier: None,
        }
    }

    /// Every successful insert hands the stored message to `notifier` on a
    /// detached task.
    pub fn with_notifier(mut self, notifier: Arc<NotificationDispatcher>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// `limit` messages starting `offset` rows back from the newest, returned
    /// oldest first. Empty on failure.
    pub async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        limit: u64,
        offset: u64,
    ) -> Vec<Message> {
        if limit == 0 {
            return Vec::new();
        }
        let query = Query::table(MESSAGES)
            .eq("conversation_id", conversation_id.to_string())
            .order("created_at", false)
            .range(offset, offset.saturating_add(limit - 1));
        let rows = match self.backend.database.select(&query).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%conversation_id, error = %err, "messages: failed to fetch page");
                return Vec::new();
            }
        };
        let mut page: Vec<Message> = decode_rows(MESSAGES, rows);
        page.reverse();
        page
    }

    /// Stores a message with trimmed content. `None` when the backend refuses
    /// it; the cause is logged.
    pub async fn insert(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        media_url: Option<&str>,
        media_type: Option<MediaKind>,
    ) -> Option<Message> {
        match self
            .try_insert(conversation_id, sender_id, content, media_url, media_type)
            .await
        {
            Ok(message) => Some(message),
            Err(err) => {
                error!(%conversation_id, %sender_id, error = %err, "messages: insert failed");
                None
            }
        }
    }

    pub async fn try_insert(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        media_url: Option<&str>,
        media_type: Option<MediaKind>,
    ) -> Result<Message, BackendError> {
        let draft = NewMessage {
            conversation_id,
            sender_id,
            content: content.trim().to_string(),
            media_url: media_url.map(str::to_string),
            media_type,
        };
        let row = self
            .backend
            .database
            .insert(MESSAGES, serde_json::to_value(&draft)?)
            .await?;
        let message: Message = decode_row(row)?;
        debug!(%conversation_id, message_id = %message.id, "messages: stored");

        if let Some(notifier) = &self.notifier {
            notifier.spawn_for_message(message.clone());
        }
        Ok(message)
    }

    /// Sets `read_at` unless it is already set. Re-marking a read message
    /// still reports success.
    pub async fn mark_read(&self, message_id: MessageId) -> bool {
        let query = Query::table(MESSAGES)
            .eq("id", message_id.to_string())
            .filter(Filter::is_null("read_at"));
        match self.backend.database.update(&query, read_patch()).await {
            Ok(_) => true,
            Err(err) => {
                warn!(%message_id, error = %err, "messages: failed to mark read");
                false
            }
        }
    }

    /// Marks everything the counterpart sent in the conversation as read.
    /// Returns how many messages changed, 0 on failure.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> u64 {
        match self
            .backend
            .database
            .update(&unread_query(conversation_id, reader_id), read_patch())
            .await
        {
            Ok(rows) => rows.len() as u64,
            Err(err) => {
                warn!(%conversation_id, %reader_id, error = %err, "messages: failed to mark conversation read");
                0
            }
        }
    }

    pub async fn unread_count(&self, conversation_id: ConversationId, reader_id: UserId) -> u64 {
        match self
            .backend
            .database
            .select(&unread_query(conversation_id, reader_id))
            .await
        {
            Ok(rows) => rows.len() as u64,
            Err(err) => {
                warn!(%conversation_id, error = %err, "messages: failed to count unread");
                0
            }
        }
    }
}

fn unread_query(conversation_id: ConversationId, reader_id: UserId) -> Query {
    Query::table(MESSAGES)
        .eq("conversation_id", conversation_id.to_string())
        .filter(Filter::neq("sender_id", reader_id.to_string()))
        .filter(Filter::is_null("read_at"))
}

fn read_patch() -> serde_json::Value {
    json!({ "read_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true) })
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
