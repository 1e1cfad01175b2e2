use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use backend::{decode_rows, BackendHandle, Query};
use serde_json::{json, Value};
use shared::{
    domain::{ConversationId, MediaKind, UserId},
    protocol::{Message, PushMessage, PushPriority, PushToken},
};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::{directory::ConversationDirectory, tables::PUSH_TOKENS};

pub const PREVIEW_LIMIT: usize = 100;
pub const FALLBACK_SENDER_NAME: &str = "Alguien";
const NEW_MESSAGE_KIND: &str = "new_message";
const NOTIFICATION_SOUND: &str = "default";

/// First [`PREVIEW_LIMIT`] characters of `text`, with `...` appended when
/// anything was cut.
pub fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(PREVIEW_LIMIT).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

pub fn media_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Image => "📷 Imagen",
        MediaKind::Video => "🎥 Video",
        MediaKind::Audio => "🎤 Audio",
    }
}

/// Push alerts for new messages. Nothing here reports failure to the caller.
pub struct NotificationDispatcher {
    backend: BackendHandle,
    directory: Arc<ConversationDirectory>,
    in_flight: Mutex<JoinSet<()>>,
}

impl NotificationDispatcher {
    pub fn new(backend: BackendHandle, directory: Arc<ConversationDirectory>) -> Self {
        Self {
            backend,
            directory,
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Sends one alert per registered device of `recipient_id` in a single
    /// batch. Returns the number of alerts submitted.
    pub async fn notify_new_message(
        &self,
        recipient_id: UserId,
        sender_name: &str,
        text: &str,
        conversation_id: ConversationId,
    ) -> usize {
        let data = json!({
            "type": NEW_MESSAGE_KIND,
            "conversation_id": conversation_id,
        });
        self.deliver(recipient_id, sender_name, text, data).await
    }

    /// Works out recipient, sender name and body from a stored message.
    pub async fn notify_for_message(&self, message: &Message) -> usize {
        let Some(recipient_id) = self
            .directory
            .other_participant_id(message.conversation_id, message.sender_id)
            .await
        else {
            debug!(message_id = %message.id, "notifications: no recipient for message");
            return 0;
        };
        let sender_name = self
            .directory
            .profile(message.sender_id)
            .await
            .and_then(|profile| profile.full_name)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_SENDER_NAME.to_string());
        let body = match (message.content.trim().is_empty(), message.media_type) {
            (true, Some(kind)) => media_label(kind).to_string(),
            _ => message.content.clone(),
        };
        let data = json!({
            "type": NEW_MESSAGE_KIND,
            "conversation_id": message.conversation_id,
            "message_id": message.id,
        });
        self.deliver(recipient_id, &sender_name, &body, data).await
    }

    /// Runs [`Self::notify_for_message`] on a background task. The caller
    /// never waits for it; [`Self::flush`] does, before the runtime goes away.
    pub fn spawn_for_message(self: &Arc<Self>, message: Message) {
        let dispatcher = Arc::clone(self);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            dispatcher.notify_for_message(&message).await;
        });
    }

    /// Dispatches spawned but not yet finished.
    pub fn pending(&self) -> usize {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while in_flight.try_join_next().is_some() {}
        in_flight.len()
    }

    /// Waits up to `timeout` for spawned dispatches. Whatever is still running
    /// then is aborted; returns how many were.
    pub async fn flush(&self, timeout: Duration) -> usize {
        let mut in_flight = std::mem::take(
            &mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let drained = tokio::time::timeout(timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }
        let abandoned = in_flight.len();
        warn!(abandoned, "notifications: push dispatch still running at shutdown");
        in_flight.abort_all();
        abandoned
    }

    async fn deliver(&self, recipient_id: UserId, title: &str, text: &str, data: Value) -> usize {
        let tokens = self.tokens_for(recipient_id).await;
        if tokens.is_empty() {
            debug!(%recipient_id, "notifications: recipient has no push tokens");
            return 0;
        }

        let body = preview(text);
        let batch: Vec<PushMessage> = tokens
            .into_iter()
            .map(|token| PushMessage {
                to: token.push_token,
                title: title.to_string(),
                body: body.clone(),
                data: data.clone(),
                priority: PushPriority::High,
                sound: Some(NOTIFICATION_SOUND.to_string()),
            })
            .collect();

        match self.backend.push.send_batch(&batch).await {
            Ok(tickets) => {
                for ticket in tickets.iter().filter(|ticket| ticket.is_error()) {
                    warn!(
                        %recipient_id,
                        reason = ticket.message.as_deref().unwrap_or_default(),
                        "notifications: push ticket rejected"
                    );
                }
                debug!(%recipient_id, sent = batch.len(), "notifications: batch delivered");
                batch.len()
            }
            Err(err) => {
                error!(%recipient_id, error = %err, "notifications: push batch failed");
                0
            }
        }
    }

    async fn tokens_for(&self, user_id: UserId) -> Vec<PushToken> {
        let query = Query::table(PUSH_TOKENS).eq("user_id", user_id.to_string());
        match self.backend.database.select(&query).await {
            Ok(rows) => decode_rows(PUSH_TOKENS, rows),
            Err(err) => {
                warn!(%user_id, error = %err, "notifications: push token lookup failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
